//! Tunnel layer - one logical byte stream over a sequence of carriers
//!
//! Provides:
//! - Frame encoding/decoding
//! - Flow control and replay bookkeeping
//! - Reconnect policy
//! - The session that ties them together

mod frame;
mod handler;
mod ledger;
mod reconnect;
mod session;

pub use frame::{
    decode, encode_ack, encode_data, parse_ack_count, parse_data_payload, parse_sid, Frame,
    FrameType,
};
pub use handler::{handler_fn, FnHandler, TunnelHandler};
pub use ledger::{AckDue, FlowLedger};
pub use reconnect::{Decision, ReconnectController, ReconnectMode, ReconnectPolicy};
pub use session::{SessionBuilder, SessionPhase, SessionStats, TunnelSession};

use crate::handshake::ConnectionCreationError;
use crate::protocol::SubprotocolError;
use crate::transport::TransportError;
use thiserror::Error;

/// Tunnel layer errors
#[derive(Debug, Clone, Error)]
pub enum TunnelError {
    #[error(transparent)]
    ConnectionCreation(#[from] ConnectionCreationError),

    #[error("Subprotocol error: {0}")]
    Subprotocol(#[from] SubprotocolError),

    #[error("Incomplete frame")]
    IncompleteFrame,

    #[error("Frame too large: {0} > {1}")]
    FrameTooLarge(usize, usize),

    #[error("Session closed")]
    SessionClosed,

    #[error("Local input already finished")]
    LocalEof,

    #[error("Timeout")]
    Timeout,

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Could not obtain access token: {0}")]
    Token(String),

    #[error("Unable to reconnect: {0}")]
    ReconnectExhausted(String),

    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    #[error("Illegal state")]
    IllegalState,
}

impl TunnelError {
    /// Whether this error ends the session when it surfaces from a carrier
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            TunnelError::IncompleteFrame | TunnelError::Transport(_) | TunnelError::Timeout
        )
    }
}
