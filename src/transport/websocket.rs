//! WebSocket transport over TLS
//!
//! Dials the gateway with tokio-tungstenite, optionally through an HTTP
//! CONNECT or SOCKS5 proxy, and splits the stream into a [`FrameSink`] and
//! a [`FrameSource`]. Failed upgrades surface as
//! [`TransportError::Handshake`] with the HTTP status.

use super::{
    build_tls_config, Dialer, FrameSink, FrameSource, HandshakeRequest, TransportConfig,
    TransportError, WsConnection,
};
use crate::proxy::{connect_through, Address};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{
    client_async_tls_with_config, connect_async_tls_with_config, Connector, MaybeTlsStream,
    WebSocketStream,
};
use tracing::{debug, info, trace};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Close codes at or above this value are gateway errors
const GATEWAY_CLOSE_CODE_BASE: u16 = 4000;

/// Production [`Dialer`]
#[derive(Debug, Clone, Default)]
pub struct WebSocketDialer {
    config: TransportConfig,
}

impl WebSocketDialer {
    pub fn new(config: TransportConfig) -> Self {
        Self { config }
    }

    async fn connect(&self, request: &HandshakeRequest) -> Result<(WsStream, u16), TransportError> {
        let mut ws_request = request
            .url
            .as_str()
            .into_client_request()
            .map_err(map_ws_error)?;
        for (name, value) in &request.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| TransportError::WebSocket(format!("bad header {}: {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| TransportError::WebSocket(format!("bad header value: {}", e)))?;
            ws_request.headers_mut().insert(name, value);
        }

        let connector = match request.url.scheme() {
            "wss" => Connector::Rustls(Arc::new(build_tls_config(request.tls)?)),
            _ => Connector::Plain,
        };

        let (stream, response) = match &request.proxy {
            None => {
                connect_async_tls_with_config(ws_request, None, self.config.nodelay, Some(connector))
                    .await
                    .map_err(map_ws_error)?
            }
            Some(proxy) => {
                let host = request
                    .url
                    .host_str()
                    .ok_or_else(|| TransportError::ConnectionFailed("URL has no host".to_string()))?;
                let port = request.url.port_or_known_default().unwrap_or(443);
                let target = Address::new(host, port);
                let timeout = Duration::from_secs(self.config.connect_timeout);
                let tcp = connect_through(proxy, &target, timeout).await?;
                client_async_tls_with_config(ws_request, tcp, None, Some(connector))
                    .await
                    .map_err(map_ws_error)?
            }
        };

        Ok((stream, response.status().as_u16()))
    }
}

#[async_trait]
impl Dialer for WebSocketDialer {
    async fn dial(&self, request: &HandshakeRequest) -> Result<WsConnection, TransportError> {
        debug!(
            "Opening WebSocket to {}{}",
            request.url.host_str().unwrap_or_default(),
            request.url.path()
        );

        let timeout = Duration::from_secs(self.config.connect_timeout);
        let (stream, status) = tokio::time::timeout(timeout, self.connect(request))
            .await
            .map_err(|_| TransportError::Timeout)??;

        info!("WebSocket connected to {}", request.url.host_str().unwrap_or_default());
        let (sink, source) = stream.split();
        Ok(WsConnection {
            sink: Box::new(WsSink { sink }),
            source: Box::new(WsSource { stream: source }),
            status: Some(status),
        })
    }
}

struct WsSink {
    sink: SplitSink<WsStream, Message>,
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send(&mut self, frame: Bytes) -> Result<(), TransportError> {
        self.sink
            .send(Message::Binary(frame.to_vec()))
            .await
            .map_err(map_ws_error)
    }

    async fn send_close(&mut self) -> Result<(), TransportError> {
        match self.sink.send(Message::Close(None)).await {
            Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(map_ws_error(e)),
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        match self.sink.close().await {
            Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(map_ws_error(e)),
        }
    }
}

struct WsSource {
    stream: SplitStream<WsStream>,
}

#[async_trait]
impl FrameSource for WsSource {
    async fn recv(&mut self) -> Result<Option<Bytes>, TransportError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Binary(data))) => return Ok(Some(Bytes::from(data))),
                Some(Ok(Message::Close(frame))) => {
                    return match frame {
                        Some(frame) if u16::from(frame.code) >= GATEWAY_CLOSE_CODE_BASE => {
                            Err(TransportError::WebSocket(format!(
                                "closed by gateway [{}]: {}",
                                u16::from(frame.code),
                                frame.reason
                            )))
                        }
                        Some(frame) if frame.code != CloseCode::Normal => {
                            debug!("WebSocket closed with {:?}: {}", frame.code, frame.reason);
                            Ok(None)
                        }
                        _ => Ok(None),
                    };
                }
                Some(Ok(Message::Text(text))) => {
                    trace!("Ignoring text message of {} bytes", text.len());
                }
                // Ping replies are queued by tungstenite itself
                Some(Ok(_)) => {}
                Some(Err(WsError::ConnectionClosed)) | None => return Ok(None),
                Some(Err(e)) => return Err(map_ws_error(e)),
            }
        }
    }
}

fn map_ws_error(err: WsError) -> TransportError {
    match err {
        WsError::Http(response) => {
            let status = response.status();
            TransportError::Handshake {
                status: status.as_u16(),
                message: status.canonical_reason().unwrap_or_default().to_string(),
            }
        }
        WsError::Io(e) => TransportError::from(e),
        WsError::Tls(e) => TransportError::Tls(e.to_string()),
        WsError::ConnectionClosed | WsError::AlreadyClosed => TransportError::Closed,
        other => TransportError::WebSocket(other.to_string()),
    }
}
