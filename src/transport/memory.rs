//! In-process transport
//!
//! [`MemoryDialer`] stands in for the gateway: every accepted dial hands a
//! [`MemoryPeer`] to the paired [`MemoryListener`], which plays the server
//! side of the subprotocol. Dial outcomes can be scripted to simulate
//! rejected upgrades and network failures.

use super::{Dialer, FrameSink, FrameSource, HandshakeRequest, TransportError, WsConnection};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// What the next dial does
#[derive(Debug, Clone)]
pub enum DialOutcome {
    /// Complete the upgrade and hand a peer to the listener
    Accept,
    /// Fail the dial with this error
    Reject(TransportError),
}

/// Messages from the peer to the client
#[derive(Debug)]
enum PeerEvent {
    Frame(Bytes),
    Close,
    Fail(String),
}

/// Messages from the client to the peer
#[derive(Debug)]
enum ClientEvent {
    Frame(Bytes),
    Close,
}

struct DialerState {
    script: VecDeque<DialOutcome>,
    requests: Vec<HandshakeRequest>,
}

/// Dialer connecting to a [`MemoryListener`]
#[derive(Clone)]
pub struct MemoryDialer {
    state: Arc<Mutex<DialerState>>,
    peers: mpsc::UnboundedSender<MemoryPeer>,
}

/// Server side of a [`MemoryDialer`]
pub struct MemoryListener {
    peers: mpsc::UnboundedReceiver<MemoryPeer>,
}

impl MemoryDialer {
    /// Create a dialer and the listener that receives its connections
    pub fn new() -> (Self, MemoryListener) {
        let (tx, rx) = mpsc::unbounded_channel();
        let dialer = Self {
            state: Arc::new(Mutex::new(DialerState {
                script: VecDeque::new(),
                requests: Vec::new(),
            })),
            peers: tx,
        };
        (dialer, MemoryListener { peers: rx })
    }

    /// Queue the outcome of a future dial. Dials past the script accept.
    pub fn push_outcome(&self, outcome: DialOutcome) {
        self.state.lock().script.push_back(outcome);
    }

    /// Every handshake request seen so far, accepted or not
    pub fn requests(&self) -> Vec<HandshakeRequest> {
        self.state.lock().requests.clone()
    }

    pub fn dial_count(&self) -> usize {
        self.state.lock().requests.len()
    }
}

#[async_trait]
impl Dialer for MemoryDialer {
    async fn dial(&self, request: &HandshakeRequest) -> Result<WsConnection, TransportError> {
        let outcome = {
            let mut state = self.state.lock();
            state.requests.push(request.clone());
            state.script.pop_front().unwrap_or(DialOutcome::Accept)
        };
        if let DialOutcome::Reject(err) = outcome {
            return Err(err);
        }

        let (to_client, from_peer) = mpsc::unbounded_channel();
        let (to_peer, from_client) = mpsc::unbounded_channel();
        let close_requests = Arc::new(AtomicUsize::new(0));

        let peer = MemoryPeer {
            request: request.clone(),
            to_client,
            from_client,
            close_requests: close_requests.clone(),
        };
        self.peers
            .send(peer)
            .map_err(|_| TransportError::ConnectionFailed("listener closed".to_string()))?;

        Ok(WsConnection {
            sink: Box::new(MemorySink {
                tx: Some(to_peer),
                close_requests,
            }),
            source: Box::new(MemorySource { rx: from_peer }),
            status: Some(101),
        })
    }
}

impl MemoryListener {
    /// Next accepted connection, `None` once every dialer is gone
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.peers.recv().await
    }

    /// Accepted connection if one is already waiting
    pub fn try_accept(&mut self) -> Option<MemoryPeer> {
        self.peers.try_recv().ok()
    }
}

/// Gateway end of one in-process WebSocket
pub struct MemoryPeer {
    request: HandshakeRequest,
    to_client: mpsc::UnboundedSender<PeerEvent>,
    from_client: mpsc::UnboundedReceiver<ClientEvent>,
    close_requests: Arc<AtomicUsize>,
}

impl MemoryPeer {
    /// The upgrade request that created this connection
    pub fn request(&self) -> &HandshakeRequest {
        &self.request
    }

    /// Deliver one binary message to the client
    pub fn send_frame(&self, frame: Bytes) -> bool {
        self.to_client.send(PeerEvent::Frame(frame)).is_ok()
    }

    /// Close cleanly
    pub fn close(&self) {
        let _ = self.to_client.send(PeerEvent::Close);
    }

    /// Drop the connection with an error
    pub fn fail(&self, reason: &str) {
        let _ = self.to_client.send(PeerEvent::Fail(reason.to_string()));
    }

    /// Next frame sent by the client; `None` once the client closed
    pub async fn recv_frame(&mut self) -> Option<Bytes> {
        match self.from_client.recv().await? {
            ClientEvent::Frame(frame) => Some(frame),
            ClientEvent::Close => None,
        }
    }

    /// Frame already sent by the client, without waiting
    pub fn try_recv_frame(&mut self) -> Option<Bytes> {
        match self.from_client.try_recv().ok()? {
            ClientEvent::Frame(frame) => Some(frame),
            ClientEvent::Close => None,
        }
    }

    /// Close handshakes the client started
    pub fn close_requests(&self) -> usize {
        self.close_requests.load(Ordering::SeqCst)
    }
}

struct MemorySink {
    tx: Option<mpsc::UnboundedSender<ClientEvent>>,
    close_requests: Arc<AtomicUsize>,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send(&mut self, frame: Bytes) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::Closed)?;
        tx.send(ClientEvent::Frame(frame))
            .map_err(|_| TransportError::Closed)
    }

    async fn send_close(&mut self) -> Result<(), TransportError> {
        self.close_requests.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(ClientEvent::Close);
        }
        Ok(())
    }
}

struct MemorySource {
    rx: mpsc::UnboundedReceiver<PeerEvent>,
}

#[async_trait]
impl FrameSource for MemorySource {
    async fn recv(&mut self) -> Result<Option<Bytes>, TransportError> {
        match self.rx.recv().await {
            Some(PeerEvent::Frame(frame)) => Ok(Some(frame)),
            Some(PeerEvent::Close) => Ok(None),
            Some(PeerEvent::Fail(reason)) => Err(TransportError::ConnectionFailed(reason)),
            None => Err(TransportError::Closed),
        }
    }
}
