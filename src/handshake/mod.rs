//! Handshake helpers
//!
//! Everything that goes into opening a carrier: the destination, the
//! connect/reconnect URLs, the auth and user-agent headers, and the
//! classification of failed upgrades.

mod target;
mod token;
mod url;

pub use self::url::{connect_url, handshake_headers, reconnect_url};
pub use target::{Destination, TunnelTarget};
pub use token::{StaticToken, TokenProvider};

use crate::transport::TransportError;
use thiserror::Error;

/// User agent sent when the caller does not supply one
pub const DEFAULT_USER_AGENT: &str = concat!("iap-tunnel/", env!("CARGO_PKG_VERSION"));

/// How a failed handshake should be treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeFailure {
    /// HTTP 400, usually a missing IAM permission
    MissingPermission,
    /// Any other 4xx
    Rejected,
    /// 5xx, worth retrying
    ServerError,
    /// No HTTP status: DNS, TCP, TLS or proxy trouble
    Network,
}

impl HandshakeFailure {
    /// Whether another attempt could succeed
    pub fn is_retryable(self) -> bool {
        matches!(self, HandshakeFailure::ServerError | HandshakeFailure::Network)
    }
}

/// Classify a dial failure
pub fn classify_handshake_error(err: &TransportError) -> HandshakeFailure {
    match err.handshake_status() {
        Some(400) => HandshakeFailure::MissingPermission,
        Some(401..=499) => HandshakeFailure::Rejected,
        Some(500..=599) => HandshakeFailure::ServerError,
        _ => HandshakeFailure::Network,
    }
}

/// The tunnel could not be created
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ConnectionCreationError {
    /// HTTP status of the failed upgrade, if there was one
    pub status: Option<u16>,
    pub kind: HandshakeFailure,
    message: String,
}

impl ConnectionCreationError {
    /// Wrap a dial failure
    pub fn from_transport(err: &TransportError) -> Self {
        let kind = classify_handshake_error(err);
        let mut message = format!("Error while connecting [{}].", err);
        if kind == HandshakeFailure::MissingPermission {
            message.push_str(" (May be due to missing permissions)");
        }
        Self {
            status: err.handshake_status(),
            kind,
            message,
        }
    }

    /// The carrier closed cleanly before the session was established
    pub fn unexpected() -> Self {
        Self {
            status: None,
            kind: HandshakeFailure::Network,
            message: "Unexpected error while connecting. Check logs for more details."
                .to_string(),
        }
    }

    /// Prefix the message with some context
    pub fn with_context(mut self, context: &str) -> Self {
        self.message = format!("{}{}", context, self.message);
        self
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(status: u16) -> TransportError {
        TransportError::Handshake {
            status,
            message: String::new(),
        }
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify_handshake_error(&status(400)), HandshakeFailure::MissingPermission);
        assert_eq!(classify_handshake_error(&status(403)), HandshakeFailure::Rejected);
        assert_eq!(classify_handshake_error(&status(503)), HandshakeFailure::ServerError);
        assert_eq!(
            classify_handshake_error(&TransportError::ConnectionFailed("refused".into())),
            HandshakeFailure::Network
        );
        assert!(!HandshakeFailure::Rejected.is_retryable());
        assert!(HandshakeFailure::Network.is_retryable());
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(
            ConnectionCreationError::from_transport(&status(500)).to_string(),
            "Error while connecting [Handshake status 500]."
        );
        let err = ConnectionCreationError::from_transport(&status(400));
        assert_eq!(
            err.to_string(),
            "Error while connecting [Handshake status 400]. (May be due to missing permissions)"
        );
        assert_eq!(err.status, Some(400));
        assert_eq!(
            ConnectionCreationError::unexpected().to_string(),
            "Unexpected error while connecting. Check logs for more details."
        );
    }

    #[test]
    fn test_with_context() {
        let err = ConnectionCreationError::from_transport(&status(500))
            .with_context("While checking if a connection can be made: ");
        assert_eq!(
            err.message(),
            "While checking if a connection can be made: Error while connecting [Handshake status 500]."
        );
    }

    #[test]
    fn test_default_user_agent() {
        assert!(DEFAULT_USER_AGENT.starts_with("iap-tunnel/"));
    }
}
