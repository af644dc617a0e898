//! # IAP Tunnel
//!
//! Client side of the IAP WebSocket tunnel: a reconnecting, flow-controlled
//! byte stream (typically SSH) carried over a WebSocket to a gateway that
//! proxies it to a private VM.
//!
//! ## Features
//!
//! - **Binary subprotocol** with cumulative acknowledgements
//! - **Session resumption** after a dropped WebSocket, replaying
//!   unacknowledged data
//! - **Pluggable transport**: tokio-tungstenite over rustls, or in-memory
//! - **HTTP CONNECT and SOCKS5** outbound proxy support
//! - **Local forwarding** from a TCP listener or stdio
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                   Forward Layer                      │
//! │          (TCP listener, stdio, any stream)           │
//! ├─────────────────────────────────────────────────────┤
//! │                   Tunnel Session                     │
//! │     (send loop, dispatch, reconnect, callbacks)      │
//! ├─────────────────────────────────────────────────────┤
//! │          Frame Codec  │  Flow Ledger  │  Backoff     │
//! ├─────────────────────────────────────────────────────┤
//! │                 Handshake Helpers                    │
//! │        (connect/reconnect URLs, auth headers)        │
//! ├─────────────────────────────────────────────────────┤
//! │                  Transport Layer                     │
//! │        (WebSocket carriers, TLS, proxies)            │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod forward;
pub mod handshake;
pub mod protocol;
pub mod proxy;
pub mod transport;
pub mod tunnel;

pub use config::Config;
pub use handshake::{ConnectionCreationError, TokenProvider, TunnelTarget};
pub use tunnel::{SessionBuilder, TunnelHandler, TunnelSession};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Subprotocol error: {0}")]
    Subprotocol(#[from] protocol::SubprotocolError),

    #[error(transparent)]
    ConnectionCreation(#[from] handshake::ConnectionCreationError),

    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] tunnel::TunnelError),

    #[error("Proxy error: {0}")]
    Proxy(#[from] proxy::ProxyError),

    #[error("Configuration error: {0}")]
    Config(String),
}
