//! Subprotocol definitions and constants
//!
//! The tunnel speaks a small binary subprotocol on top of WebSocket binary
//! messages. Every message carries exactly one frame:
//!
//! ```text
//! +--------+--------+--------...
//! |   Tag (u16 BE)  |  Body (tag specific)
//! +--------+--------+--------...
//! ```

use std::time::Duration;
use thiserror::Error;

/// Subprotocol violations. All of these are fatal to the session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubprotocolError {
    #[error("Received out-of-order Ack for [{0}] bytes")]
    OutOfOrderAck(u64),

    #[error("Bytes confirmed [{confirmed}] were larger than bytes sent [{sent}]")]
    InvalidAck { confirmed: u64, sent: u64 },

    #[error("Received DATA before CONNECT_SUCCESS")]
    EarlyData,

    #[error("Received ACK before CONNECT_SUCCESS")]
    EarlyAck,

    #[error("Received CONNECT_SUCCESS on an already connected carrier")]
    ExtraConnectSuccess,

    #[error("Received RECONNECT_SUCCESS on an already connected carrier")]
    ExtraReconnectSuccess,

    #[error("Received RECONNECT_SUCCESS before a session was established")]
    ReconnectWithoutSession,

    #[error("Received CONNECT_SUCCESS with a different session id")]
    SessionIdMismatch,
}

/// CONNECT_SUCCESS_SID: u32 length, then the session id
pub const TAG_CONNECT_SUCCESS_SID: u16 = 0x0001;

/// RECONNECT_SUCCESS_ACK: u64 cumulative bytes received by the peer
pub const TAG_RECONNECT_SUCCESS_ACK: u16 = 0x0002;

/// DATA: u32 length, then the payload
pub const TAG_DATA: u16 = 0x0004;

/// ACK: u64 cumulative bytes received
pub const TAG_ACK: u16 = 0x0007;

/// Size of the tag that prefixes every frame
pub const TAG_LEN: usize = 2;

/// Size of a u32 length prefix
pub const LEN_PREFIX_LEN: usize = 4;

/// Size of a u64 counter body
pub const COUNTER_LEN: usize = 8;

/// Maximum DATA payload carried by one frame (16 KiB)
pub const MAX_DATA_FRAME: usize = 16 * 1024;

/// Send an ACK once this many unacknowledged bytes were received
pub const DEFAULT_ACK_INTERVAL: u64 = 2 * MAX_DATA_FRAME as u64;

/// Send an ACK after this much inbound silence if any bytes are unacknowledged
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_millis(100);

/// Give up reconnecting after this long without a successful carrier
pub const MAX_RECONNECT_WINDOW: Duration = Duration::from_secs(60);

/// Gateway host
pub const TUNNEL_HOST: &str = "tunnel.cloudproxy.app";

/// URL scheme used for the gateway
pub const URL_SCHEME: &str = "wss";

/// Path prefix shared by the connect and reconnect endpoints
pub const URL_PATH_ROOT: &str = "/v4";

/// Endpoint opening a fresh session
pub const CONNECT_ENDPOINT: &str = "connect";

/// Endpoint resuming an existing session
pub const RECONNECT_ENDPOINT: &str = "reconnect";
