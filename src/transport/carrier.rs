//! One live WebSocket to the gateway
//!
//! A carrier owns both halves of an upgraded connection. Writes are
//! serialised through an async mutex; reads run on a background task that
//! hands every message to the [`CarrierHandler`]. Many carriers are created
//! over the life of one session, each tagged with a generation number so
//! the session can ignore stragglers from retired ones.

use super::{FrameSink, FrameSource, TransportError, WsConnection};
use crate::tunnel::TunnelError;
use bytes::Bytes;
use parking_lot::Mutex;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Receiver of carrier events. Both methods run on the carrier's receive
/// task (or on whoever calls [`Carrier::close`]) and must not block.
pub trait CarrierHandler: Send + Sync {
    /// One complete inbound message. `Break` closes the carrier with the
    /// given error.
    fn on_frame(&self, generation: u64, frame: Bytes) -> ControlFlow<String>;

    /// The carrier is gone. An empty `error` means it closed cleanly.
    fn on_close(&self, generation: u64, error: String);
}

/// A started or startable WebSocket connection
pub struct Carrier {
    generation: u64,
    sink: tokio::sync::Mutex<Box<dyn FrameSink>>,
    source: Mutex<Option<Box<dyn FrameSource>>>,
    handler: Arc<dyn CarrierHandler>,
    handshake_status: Option<u16>,
    started: AtomicBool,
    closed: AtomicBool,
    close_sent: AtomicBool,
    shutting_down: AtomicBool,
    close_reported: AtomicBool,
    error: Mutex<Option<String>>,
    recv_task: Mutex<Option<JoinHandle<()>>>,
}

impl Carrier {
    pub fn new(conn: WsConnection, generation: u64, handler: Arc<dyn CarrierHandler>) -> Arc<Self> {
        Arc::new(Self {
            generation,
            sink: tokio::sync::Mutex::new(conn.sink),
            source: Mutex::new(Some(conn.source)),
            handler,
            handshake_status: conn.status,
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            close_sent: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            close_reported: AtomicBool::new(false),
            error: Mutex::new(None),
            recv_task: Mutex::new(None),
        })
    }

    /// Start the receive task. Only the first call on an open carrier
    /// succeeds.
    pub fn start(self: &Arc<Self>) -> Result<(), TunnelError> {
        if self.shutting_down.load(Ordering::SeqCst) || self.started.swap(true, Ordering::SeqCst) {
            return Err(TunnelError::IllegalState);
        }
        let source = self.source.lock().take().ok_or(TunnelError::IllegalState)?;

        let carrier = Arc::clone(self);
        let handle = tokio::spawn(async move {
            carrier.receive_loop(source).await;
        });
        *self.recv_task.lock() = Some(handle);
        Ok(())
    }

    async fn receive_loop(&self, mut source: Box<dyn FrameSource>) {
        loop {
            match source.recv().await {
                Ok(Some(frame)) => {
                    trace!("Carrier {} received {} bytes", self.generation, frame.len());
                    if let ControlFlow::Break(reason) = self.handler.on_frame(self.generation, frame)
                    {
                        debug!("Carrier {} dropped: {}", self.generation, reason);
                        self.mark_closed(reason);
                        break;
                    }
                }
                Ok(None) => {
                    debug!("Carrier {} closed by peer", self.generation);
                    self.mark_closed(String::new());
                    break;
                }
                Err(e) => {
                    debug!("Carrier {} receive error: {}", self.generation, e);
                    self.mark_closed(e.to_string());
                    break;
                }
            }
        }
        self.report_close();
    }

    /// Hand one encoded frame to the WebSocket
    pub async fn send(&self, frame: Bytes) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let mut sink = self.sink.lock().await;
        if let Err(e) = sink.send(frame).await {
            debug!("Carrier {} send error: {}", self.generation, e);
            self.mark_closed(e.to_string());
            return Err(e);
        }
        Ok(())
    }

    /// Start the close handshake. Idempotent.
    pub async fn send_close(&self) {
        if self.close_sent.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut sink = self.sink.lock().await;
        if let Err(e) = sink.send_close().await {
            debug!("Carrier {} close handshake failed: {}", self.generation, e);
        }
    }

    /// Tear the connection down and stop the receive task. Idempotent;
    /// reports `on_close` if the receive task has not already done so.
    pub async fn close(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.mark_closed(String::new());

        let task = self.recv_task.lock().take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }

        let mut sink = self.sink.lock().await;
        if let Err(e) = sink.close().await {
            trace!("Carrier {} close: {}", self.generation, e);
        }
        drop(sink);

        if self.started.load(Ordering::SeqCst) {
            self.report_close();
        }
    }

    fn mark_closed(&self, error: String) {
        self.closed.store(true, Ordering::SeqCst);
        let mut slot = self.error.lock();
        if slot.is_none() {
            *slot = Some(error);
        }
    }

    fn report_close(&self) {
        if self.close_reported.swap(true, Ordering::SeqCst) {
            return;
        }
        let error = self.error.lock().clone().unwrap_or_default();
        self.handler.on_close(self.generation, error);
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Why the carrier closed. `Some("")` means it closed cleanly, `None`
    /// that it is still open.
    pub fn error(&self) -> Option<String> {
        self.error.lock().clone()
    }

    /// HTTP status of the upgrade response
    pub fn handshake_status(&self) -> Option<u16> {
        self.handshake_status
    }
}

impl std::fmt::Debug for Carrier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Carrier")
            .field("generation", &self.generation)
            .field("closed", &self.is_closed())
            .field("error", &self.error())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{HandshakeRequest, MemoryDialer, TlsPolicy};
    use crate::transport::Dialer;
    use std::time::Duration;
    use url::Url;

    #[derive(Default)]
    struct Recorder {
        frames: Mutex<Vec<Bytes>>,
        closes: Mutex<Vec<String>>,
        break_on: Option<&'static [u8]>,
    }

    impl CarrierHandler for Recorder {
        fn on_frame(&self, _generation: u64, frame: Bytes) -> ControlFlow<String> {
            if self.break_on == Some(&frame[..]) {
                return ControlFlow::Break("bad frame".to_string());
            }
            self.frames.lock().push(frame);
            ControlFlow::Continue(())
        }

        fn on_close(&self, _generation: u64, error: String) {
            self.closes.lock().push(error);
        }
    }

    fn request() -> HandshakeRequest {
        HandshakeRequest {
            url: Url::parse("wss://localhost/v4/connect").unwrap(),
            headers: Vec::new(),
            tls: TlsPolicy::Verify,
            proxy: None,
        }
    }

    async fn wait_for<F: Fn() -> bool>(check: F) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_start_twice() {
        let (dialer, _listener) = MemoryDialer::new();
        let conn = dialer.dial(&request()).await.unwrap();
        let carrier = Carrier::new(conn, 1, Arc::new(Recorder::default()));
        carrier.start().unwrap();
        assert!(matches!(carrier.start(), Err(TunnelError::IllegalState)));
        carrier.close().await;
    }

    #[tokio::test]
    async fn test_frames_and_clean_close() {
        let (dialer, mut listener) = MemoryDialer::new();
        let conn = dialer.dial(&request()).await.unwrap();
        let mut peer = listener.accept().await.unwrap();
        let recorder = Arc::new(Recorder::default());
        let carrier = Carrier::new(conn, 7, recorder.clone());
        carrier.start().unwrap();

        carrier.send(Bytes::from_static(b"out")).await.unwrap();
        assert_eq!(peer.recv_frame().await.as_deref(), Some(&b"out"[..]));

        peer.send_frame(Bytes::from_static(b"in"));
        peer.close();
        wait_for(|| !recorder.closes.lock().is_empty()).await;

        assert_eq!(recorder.frames.lock().as_slice(), &[Bytes::from_static(b"in")]);
        assert_eq!(recorder.closes.lock().as_slice(), &[String::new()]);
        assert!(carrier.is_closed());
        assert_eq!(carrier.error().as_deref(), Some(""));

        carrier.close().await;
        assert_eq!(recorder.closes.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_error_reported_once() {
        let (dialer, mut listener) = MemoryDialer::new();
        let conn = dialer.dial(&request()).await.unwrap();
        let peer = listener.accept().await.unwrap();
        let recorder = Arc::new(Recorder::default());
        let carrier = Carrier::new(conn, 1, recorder.clone());
        carrier.start().unwrap();

        peer.fail("connection reset");
        wait_for(|| !recorder.closes.lock().is_empty()).await;
        carrier.close().await;

        let closes = recorder.closes.lock();
        assert_eq!(closes.len(), 1);
        assert!(closes[0].contains("connection reset"));
    }

    #[tokio::test]
    async fn test_handler_break_closes() {
        let (dialer, mut listener) = MemoryDialer::new();
        let conn = dialer.dial(&request()).await.unwrap();
        let peer = listener.accept().await.unwrap();
        let recorder = Arc::new(Recorder {
            break_on: Some(b"\x00"),
            ..Recorder::default()
        });
        let carrier = Carrier::new(conn, 1, recorder.clone());
        carrier.start().unwrap();

        peer.send_frame(Bytes::from_static(b"\x00"));
        wait_for(|| carrier.is_closed()).await;
        wait_for(|| !recorder.closes.lock().is_empty()).await;
        assert_eq!(carrier.error().as_deref(), Some("bad frame"));
    }

    #[tokio::test]
    async fn test_close_idempotent() {
        let (dialer, mut listener) = MemoryDialer::new();
        let conn = dialer.dial(&request()).await.unwrap();
        let mut peer = listener.accept().await.unwrap();
        let recorder = Arc::new(Recorder::default());
        let carrier = Carrier::new(conn, 1, recorder.clone());
        carrier.start().unwrap();

        carrier.send_close().await;
        carrier.send_close().await;
        carrier.close().await;
        carrier.close().await;

        assert_eq!(recorder.closes.lock().len(), 1);
        assert!(carrier.send(Bytes::from_static(b"late")).await.is_err());
        assert_eq!(peer.close_requests(), 1);
        assert!(peer.recv_frame().await.is_none());
    }
}
