//! Local TCP listener that bridges each accepted connection to its own
//! tunnel session

use super::bridge;
use crate::tunnel::{handler_fn, SessionBuilder, TunnelError};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

const CHECK_CONTEXT: &str = "While checking if a connection can be made: ";

pub struct LocalListener {
    listener: TcpListener,
    builder: SessionBuilder,
}

impl LocalListener {
    pub async fn bind<A: ToSocketAddrs>(addr: A, builder: SessionBuilder) -> crate::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("Listening on {}", listener.local_addr()?);
        Ok(Self { listener, builder })
    }

    pub fn local_addr(&self) -> crate::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Open and close one session to make sure the gateway accepts us
    pub async fn check_connection(&self) -> crate::Result<()> {
        let session = self.builder.build(Arc::new(handler_fn(|_| {}, |_| {})));
        let timeout = self.builder.tunnel_config().connect_timeout();
        let result = session.initiate_connection(timeout).await;
        session.close().await;

        match result {
            Ok(()) => {
                debug!("Test connection succeeded");
                Ok(())
            }
            Err(TunnelError::ConnectionCreation(e)) => {
                Err(TunnelError::ConnectionCreation(e.with_context(CHECK_CONTEXT)).into())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Accept connections until `shutdown` resolves, then close every
    /// live bridge.
    pub async fn run<F>(self, shutdown: F) -> crate::Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut bridges = JoinSet::new();

        let result = loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Listener shutting down with {} live connections", bridges.len());
                    break Ok(());
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            error!("Accept failed: {}", e);
                            break Err(e.into());
                        }
                    };
                    debug!("Accepted connection from {}", peer);
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
                    }

                    let builder = self.builder.clone();
                    bridges.spawn(async move {
                        let (reader, writer) = stream.into_split();
                        match bridge(reader, writer, &builder).await {
                            Ok(()) => debug!("Connection from {} finished", peer),
                            Err(e) => warn!("Connection from {} failed: {}", peer, e),
                        }
                    });
                }
                Some(joined) = bridges.join_next(), if !bridges.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            error!("Bridge task panicked: {}", e);
                        }
                    }
                }
            }
        };

        // Dropping a session asks its send loop to close the carrier
        bridges.shutdown().await;
        result
    }
}

impl std::fmt::Debug for LocalListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalListener")
            .field("addr", &self.listener.local_addr().ok())
            .field("builder", &self.builder)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::{StaticToken, TunnelTarget};
    use crate::transport::{DialOutcome, MemoryDialer, TransportError};
    use crate::tunnel::{encode_data, Frame};
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::sync::oneshot;

    fn builder(dialer: MemoryDialer) -> SessionBuilder {
        SessionBuilder::new(
            TunnelTarget::instance("p", "z", "vm", "nic0", 22),
            Arc::new(StaticToken::new("token")),
        )
        .dialer(Arc::new(dialer))
    }

    #[tokio::test]
    async fn test_check_connection_failure_has_context() {
        let (dialer, _peers) = MemoryDialer::new();
        dialer.push_outcome(DialOutcome::Reject(TransportError::Handshake {
            status: 403,
            message: "Forbidden".into(),
        }));
        let listener = LocalListener::bind("127.0.0.1:0", builder(dialer)).await.unwrap();

        let err = listener.check_connection().await.unwrap_err();
        assert!(err
            .to_string()
            .contains("While checking if a connection can be made: Error while connecting"));
    }

    #[tokio::test]
    async fn test_check_connection_success() {
        let (dialer, mut peers) = MemoryDialer::new();
        let listener = LocalListener::bind("127.0.0.1:0", builder(dialer)).await.unwrap();

        let gateway = tokio::spawn(async move {
            let mut peer = peers.accept().await.unwrap();
            peer.send_frame(Frame::ConnectSuccessSid(Bytes::from_static(b"s")).encode().unwrap());
            while peer.recv_frame().await.is_some() {}
            peer.close_requests()
        });

        listener.check_connection().await.unwrap();
        assert_eq!(gateway.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_forwards_tcp_connection() {
        let (dialer, mut peers) = MemoryDialer::new();
        let listener = LocalListener::bind("127.0.0.1:0", builder(dialer)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(listener.run(async {
            let _ = stop_rx.await;
        }));

        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut peer = peers.accept().await.unwrap();
        assert!(peer.request().url.query().unwrap_or_default().contains("instance=vm"));
        peer.send_frame(Frame::ConnectSuccessSid(Bytes::from_static(b"s")).encode().unwrap());
        peer.send_frame(encode_data(b"SSH-2.0-gateway\r\n").unwrap());

        let mut banner = [0u8; 17];
        client.read_exact(&mut banner).await.unwrap();
        assert_eq!(&banner, b"SSH-2.0-gateway\r\n");

        client.write_all(b"SSH-2.0-client\r\n").await.unwrap();
        let payload = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let frame = peer.recv_frame().await.unwrap();
                // ACKs for the banner may come first
                if let Some(Frame::Data(payload)) = Frame::parse(&frame).unwrap() {
                    return payload;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(&payload[..], b"SSH-2.0-client\r\n");

        stop_tx.send(()).unwrap();
        server.await.unwrap().unwrap();

        // The bridged session tears its carrier down
        let closed = tokio::time::timeout(Duration::from_secs(5), async {
            while peer.recv_frame().await.is_some() {}
        })
        .await;
        assert!(closed.is_ok());
    }
}
