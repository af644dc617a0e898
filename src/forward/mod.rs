//! Local byte-stream forwarding
//!
//! Glue between something local that produces and consumes bytes (a TCP
//! connection, the process's stdio, any `AsyncRead`/`AsyncWrite` pair) and
//! one [`TunnelSession`]. Every local connection gets its own session.

mod listener;
mod stdio;

pub use listener::LocalListener;
pub use stdio::run_stdio;

use crate::protocol::MAX_DATA_FRAME;
use crate::tunnel::{SessionBuilder, TunnelError, TunnelHandler, TunnelSession};
use bytes::Bytes;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Session events handed to the local writer
#[derive(Debug)]
enum Inbound {
    Data(Bytes),
    Closed(Option<TunnelError>),
}

/// Forwards session callbacks into a channel
struct ChannelHandler {
    tx: mpsc::UnboundedSender<Inbound>,
}

impl TunnelHandler for ChannelHandler {
    fn on_data(&self, data: Bytes) {
        let _ = self.tx.send(Inbound::Data(data));
    }

    fn on_close(&self, error: Option<TunnelError>) {
        let _ = self.tx.send(Inbound::Closed(error));
    }
}

/// Bridge a local reader/writer pair through a fresh tunnel session.
///
/// Returns when either side is done. A local EOF waits for queued data to
/// reach the gateway before the session is closed; a session that ends
/// first stops the local reader.
pub async fn bridge<R, W>(mut reader: R, writer: W, builder: &SessionBuilder) -> crate::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let config = builder.tunnel_config();
    let (tx, rx) = mpsc::unbounded_channel();
    let session = builder.build(Arc::new(ChannelHandler { tx }));

    if let Err(e) = session.initiate_connection(config.connect_timeout()).await {
        session.close().await;
        return Err(e.into());
    }

    let all_sent_timeout = config.all_sent_timeout();
    let outbound = async {
        let sent = read_local(&mut reader, &session).await;
        session.local_eof();
        if !session.wait_for_all_sent(all_sent_timeout).await {
            warn!("Closing tunnel with data still queued");
        }
        session.close().await;
        sent
    };
    let inbound = write_local(rx, writer);
    tokio::pin!(outbound);
    tokio::pin!(inbound);

    let (sent, received) = tokio::select! {
        sent = &mut outbound => (sent, inbound.await),
        received = &mut inbound => {
            session.close().await;
            (Ok(()), received)
        }
    };

    if let Some(err) = received? {
        return Err(err.into());
    }
    match sent {
        // Remote side ended the session while we were still reading
        Err(crate::Error::Tunnel(TunnelError::SessionClosed)) => Ok(()),
        other => other,
    }
}

async fn read_local<R>(reader: &mut R, session: &TunnelSession) -> crate::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; MAX_DATA_FRAME];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            debug!("Local input finished");
            return Ok(());
        }
        session.send(&buf[..n])?;
    }
}

/// Write inbound data until the session ends; returns its terminal error
async fn write_local<W>(
    mut events: mpsc::UnboundedReceiver<Inbound>,
    mut writer: W,
) -> io::Result<Option<TunnelError>>
where
    W: AsyncWrite + Unpin,
{
    while let Some(event) = events.recv().await {
        match event {
            Inbound::Data(data) => writer.write_all(&data).await?,
            Inbound::Closed(error) => {
                writer.flush().await?;
                if let Err(e) = writer.shutdown().await {
                    debug!("Local shutdown: {}", e);
                }
                return Ok(error);
            }
        }
    }
    Ok(None)
}
