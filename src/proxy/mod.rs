//! Outbound proxy support
//!
//! Provides client-side handshakes for reaching the gateway through:
//! - an HTTP CONNECT proxy
//! - a SOCKS5 proxy
//!
//! Both hand back the raw TCP stream once the tunnel through the proxy is
//! up; TLS and the WebSocket upgrade run on top of it.

#[cfg(feature = "socks5")]
mod socks5;

#[cfg(feature = "http-proxy")]
mod http;

#[cfg(feature = "http-proxy")]
pub use http::http_connect;

#[cfg(feature = "socks5")]
pub use socks5::socks5_connect;

use crate::transport::TransportError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tracing::debug;

/// Proxy errors
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid SOCKS version: {0}")]
    InvalidSocksVersion(u8),

    #[error("No acceptable authentication method")]
    NoAcceptableAuth,

    #[error("Address type not supported: {0}")]
    UnsupportedAddressType(u8),

    #[error("Authentication failed")]
    AuthenticationFailed,

    #[error("Proxy refused the connection: {0}")]
    Refused(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid proxy response: {0}")]
    InvalidResponse(String),

    #[error("Proxy type not enabled: {0}")]
    Disabled(&'static str),

    #[error("Timeout")]
    Timeout,
}

impl From<ProxyError> for TransportError {
    fn from(err: ProxyError) -> Self {
        match err {
            ProxyError::Io(e) => TransportError::from(e),
            ProxyError::Timeout => TransportError::Timeout,
            other => TransportError::Proxy(other.to_string()),
        }
    }
}

/// Kind of outbound proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyKind {
    Http,
    Socks5,
}

/// Outbound proxy descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyInfo {
    pub kind: ProxyKind,
    pub host: String,
    pub port: u16,
    /// Optional username and password
    #[serde(default)]
    pub credentials: Option<(String, String)>,
}

impl ProxyInfo {
    /// HTTP CONNECT proxy without credentials
    pub fn http(host: impl Into<String>, port: u16) -> Self {
        Self {
            kind: ProxyKind::Http,
            host: host.into(),
            port,
            credentials: None,
        }
    }

    /// SOCKS5 proxy without credentials
    pub fn socks5(host: impl Into<String>, port: u16) -> Self {
        Self {
            kind: ProxyKind::Socks5,
            host: host.into(),
            port,
            credentials: None,
        }
    }

    /// Attach username/password authentication
    pub fn with_credentials(mut self, username: String, password: String) -> Self {
        self.credentials = Some((username, password));
        self
    }

    /// `host:port` of the proxy itself
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Proxy target address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// IPv4 address and port
    Ipv4([u8; 4], u16),
    /// IPv6 address and port
    Ipv6([u8; 16], u16),
    /// Domain name and port
    Domain(String, u16),
}

impl Address {
    /// Classify a host name or literal address
    pub fn new(host: &str, port: u16) -> Self {
        let bare = host.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = bare.parse::<std::net::Ipv4Addr>() {
            Address::Ipv4(ip.octets(), port)
        } else if let Ok(ip) = bare.parse::<std::net::Ipv6Addr>() {
            Address::Ipv6(ip.octets(), port)
        } else {
            Address::Domain(host.to_string(), port)
        }
    }

    /// Get the port
    pub fn port(&self) -> u16 {
        match self {
            Address::Ipv4(_, port) => *port,
            Address::Ipv6(_, port) => *port,
            Address::Domain(_, port) => *port,
        }
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Address::Ipv4(ip, port) => {
                write!(f, "{}.{}.{}.{}:{}", ip[0], ip[1], ip[2], ip[3], port)
            }
            Address::Ipv6(ip, port) => {
                write!(f, "[{}]:{}", std::net::Ipv6Addr::from(*ip), port)
            }
            Address::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

/// Open a TCP stream to `target` through the proxy
pub async fn connect_through(
    proxy: &ProxyInfo,
    target: &Address,
    timeout: Duration,
) -> Result<TcpStream, ProxyError> {
    debug!("Connecting to {} via {:?} proxy {}", target, proxy.kind, proxy.addr());

    let handshake = async {
        let stream = TcpStream::connect(proxy.addr()).await?;
        stream.set_nodelay(true).ok();
        match proxy.kind {
            ProxyKind::Http => connect_http(stream, target, proxy).await,
            ProxyKind::Socks5 => connect_socks5(stream, target, proxy).await,
        }
    };

    tokio::time::timeout(timeout, handshake)
        .await
        .map_err(|_| ProxyError::Timeout)?
}

#[cfg(feature = "http-proxy")]
async fn connect_http(
    stream: TcpStream,
    target: &Address,
    proxy: &ProxyInfo,
) -> Result<TcpStream, ProxyError> {
    http_connect(stream, target, proxy.credentials.as_ref()).await
}

#[cfg(not(feature = "http-proxy"))]
async fn connect_http(
    _stream: TcpStream,
    _target: &Address,
    _proxy: &ProxyInfo,
) -> Result<TcpStream, ProxyError> {
    Err(ProxyError::Disabled("http"))
}

#[cfg(feature = "socks5")]
async fn connect_socks5(
    mut stream: TcpStream,
    target: &Address,
    proxy: &ProxyInfo,
) -> Result<TcpStream, ProxyError> {
    socks5_connect(&mut stream, target, proxy.credentials.as_ref()).await?;
    Ok(stream)
}

#[cfg(not(feature = "socks5"))]
async fn connect_socks5(
    _stream: TcpStream,
    _target: &Address,
    _proxy: &ProxyInfo,
) -> Result<TcpStream, ProxyError> {
    Err(ProxyError::Disabled("socks5"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_classification() {
        assert_eq!(Address::new("10.0.0.1", 22), Address::Ipv4([10, 0, 0, 1], 22));
        assert!(matches!(Address::new("[::1]", 443), Address::Ipv6(_, 443)));
        assert_eq!(
            Address::new("tunnel.cloudproxy.app", 443),
            Address::Domain("tunnel.cloudproxy.app".into(), 443)
        );
    }

    #[test]
    fn test_address_display() {
        assert_eq!(Address::Ipv4([127, 0, 0, 1], 80).to_string(), "127.0.0.1:80");
        assert_eq!(Address::new("::1", 80).to_string(), "[::1]:80");
        assert_eq!(Address::Domain("a.b".into(), 1).to_string(), "a.b:1");
    }

    #[test]
    fn test_proxy_error_into_transport() {
        let err: TransportError = ProxyError::AuthenticationFailed.into();
        assert!(matches!(err, TransportError::Proxy(_)));
        let err: TransportError = ProxyError::Timeout.into();
        assert!(matches!(err, TransportError::Timeout));
    }
}
