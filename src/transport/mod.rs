//! Transport layer implementations
//!
//! A carrier is one WebSocket connection to the gateway. The session only
//! sees it through the [`Dialer`], [`FrameSink`] and [`FrameSource`] traits,
//! so the backend is pluggable:
//! - WebSocket over TLS (production, [`WebSocketDialer`])
//! - In-process memory pipes (tests and loopback, [`MemoryDialer`])

mod carrier;
mod memory;
mod tls;
mod websocket;

pub use carrier::{Carrier, CarrierHandler};
pub use memory::{DialOutcome, MemoryDialer, MemoryListener, MemoryPeer};
pub use tls::{build_tls_config, TlsPolicy};
pub use websocket::WebSocketDialer;

use crate::proxy::ProxyInfo;
use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use std::sync::Arc;
use thiserror::Error;
use url::Url;

/// Transport layer errors
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(Arc<io::Error>),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Handshake status {status}")]
    Handshake { status: u16, message: String },

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Proxy error: {0}")]
    Proxy(String),

    #[error("Connection closed")]
    Closed,

    #[error("Timeout")]
    Timeout,
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        TransportError::Io(Arc::new(err))
    }
}

impl TransportError {
    /// HTTP status of a failed upgrade, if that is what this is
    pub fn handshake_status(&self) -> Option<u16> {
        match self {
            TransportError::Handshake { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Everything needed to open one WebSocket to the gateway
#[derive(Debug, Clone)]
pub struct HandshakeRequest {
    /// `wss://` upgrade URL including the query
    pub url: Url,
    /// Extra request headers, in order
    pub headers: Vec<(String, String)>,
    /// Server certificate policy
    pub tls: TlsPolicy,
    /// Optional outbound proxy
    pub proxy: Option<ProxyInfo>,
}

impl HandshakeRequest {
    /// Value of the first header with this name (case insensitive)
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Write half of a WebSocket. Every call sends one binary message.
#[async_trait]
pub trait FrameSink: Send {
    /// Send a complete frame
    async fn send(&mut self, frame: Bytes) -> Result<(), TransportError>;

    /// Start the close handshake
    async fn send_close(&mut self) -> Result<(), TransportError>;

    /// Release the connection
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Read half of a WebSocket
#[async_trait]
pub trait FrameSource: Send {
    /// Next binary message. `Ok(None)` means the peer closed cleanly.
    async fn recv(&mut self) -> Result<Option<Bytes>, TransportError>;
}

/// An upgraded WebSocket, split in two halves
pub struct WsConnection {
    pub sink: Box<dyn FrameSink>,
    pub source: Box<dyn FrameSource>,
    /// HTTP status of the upgrade response
    pub status: Option<u16>,
}

impl std::fmt::Debug for WsConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsConnection")
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

/// Opens WebSockets to the gateway
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Perform the upgrade. Failed upgrades return
    /// [`TransportError::Handshake`] carrying the HTTP status.
    async fn dial(&self, request: &HandshakeRequest) -> Result<WsConnection, TransportError>;
}

/// Transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Connection timeout in seconds, covering TCP, TLS and the upgrade
    pub connect_timeout: u64,
    /// Enable TCP_NODELAY on the socket
    pub nodelay: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: 30,
            nodelay: true,
        }
    }
}
