//! Tunnel session
//!
//! One logical byte stream carried over a sequence of carriers. The
//! session owns:
//! - the flow ledger (unsent queue, unconfirmed buffer, counters)
//! - the current carrier, tagged with a generation number
//! - a send loop task that drains the unsent queue, sends ACKs, and
//!   replaces dead carriers
//!
//! All mutable state sits behind one lock. Critical sections never await
//! and never call into the handler; `on_data` and `on_close` run with the
//! lock released.

use super::frame::{encode_ack, encode_data, Frame};
use super::handler::TunnelHandler;
use super::ledger::{AckDue, FlowLedger};
use super::reconnect::{Decision, ReconnectController, ReconnectMode, ReconnectPolicy};
use super::TunnelError;
use crate::config::TunnelConfig;
use crate::handshake::{
    connect_url, handshake_headers, reconnect_url, ConnectionCreationError, TokenProvider,
    TunnelTarget,
};
use crate::protocol::SubprotocolError;
use crate::transport::{
    Carrier, CarrierHandler, Dialer, HandshakeRequest, TransportConfig, TransportError,
    WebSocketDialer,
};
use bytes::Bytes;
use parking_lot::Mutex;
use std::ops::ControlFlow;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, trace, warn};

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Created, nothing on the network yet
    Init,
    /// Waiting for the first CONNECT_SUCCESS
    Connecting,
    /// A carrier is connected
    Open,
    /// Carrier lost, resuming the session
    Reconnecting,
    /// Closed or failed; never leaves this phase
    Terminal,
}

/// Snapshot of a session's counters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStats {
    pub phase: SessionPhase,
    pub session_id: Option<Bytes>,
    pub total_bytes_sent: u64,
    pub total_bytes_confirmed: u64,
    pub total_bytes_received: u64,
    pub last_ack_sent: u64,
    pub unsent_chunks: usize,
    pub unconfirmed_bytes: u64,
    /// Carriers dialed so far, successful or not
    pub carriers_opened: u64,
}

/// Everything needed to create sessions to one target
#[derive(Clone)]
pub struct SessionBuilder {
    target: TunnelTarget,
    token_provider: Arc<dyn TokenProvider>,
    dialer: Option<Arc<dyn Dialer>>,
    config: TunnelConfig,
}

impl SessionBuilder {
    pub fn new(target: TunnelTarget, token_provider: Arc<dyn TokenProvider>) -> Self {
        Self {
            target,
            token_provider,
            dialer: None,
            config: TunnelConfig::default(),
        }
    }

    /// Use a specific dialer instead of the WebSocket one
    pub fn dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = Some(dialer);
        self
    }

    /// Replace the tunnel settings. Rejects values `validate` refuses.
    pub fn config(mut self, config: TunnelConfig) -> crate::Result<Self> {
        config.validate()?;
        self.config = config;
        Ok(self)
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.user_agent = user_agent.into();
        self
    }

    pub fn target(&self) -> &TunnelTarget {
        &self.target
    }

    pub fn tunnel_config(&self) -> &TunnelConfig {
        &self.config
    }

    /// Create a session. No network I/O happens until it is opened.
    pub fn build(&self, handler: Arc<dyn TunnelHandler>) -> TunnelSession {
        let dialer = self.dialer.clone().unwrap_or_else(|| {
            Arc::new(WebSocketDialer::new(TransportConfig {
                connect_timeout: self.config.connect_timeout_secs,
                ..TransportConfig::default()
            }))
        });
        let (phase_tx, _) = watch::channel(SessionPhase::Init);
        let (drained_tx, _) = watch::channel(true);
        let (closed_tx, _) = watch::channel(false);

        let shared = Shared {
            target: self.target.clone(),
            token_provider: Arc::clone(&self.token_provider),
            dialer,
            handler,
            state: Mutex::new(SessionState::new(self.config.reconnect.policy())),
            config: self.config.clone(),
            wake: Notify::new(),
            phase_tx,
            drained_tx,
            closed_tx,
        };
        TunnelSession {
            shared: Arc::new(shared),
        }
    }
}

impl std::fmt::Debug for SessionBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionBuilder")
            .field("target", &self.target)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Handle to a tunnel session.
///
/// Dropping the handle without calling [`TunnelSession::close`] asks the
/// send loop to shut down; `on_close` still fires once.
pub struct TunnelSession {
    shared: Arc<Shared>,
}

impl TunnelSession {
    /// Session to `target` using the WebSocket dialer and default config
    pub fn new(
        target: TunnelTarget,
        token_provider: Arc<dyn TokenProvider>,
        handler: Arc<dyn TunnelHandler>,
    ) -> Self {
        SessionBuilder::new(target, token_provider).build(handler)
    }

    /// Start the send loop, which opens the first carrier. Idempotent.
    pub fn open(&self) -> Result<(), TunnelError> {
        let mut state = self.shared.state.lock();
        if state.is_stopping() {
            return Err(TunnelError::SessionClosed);
        }
        if state.loop_started {
            return Ok(());
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| TunnelError::IllegalState)?;
        state.loop_started = true;
        self.shared.set_phase(&mut state, SessionPhase::Connecting);
        drop(state);

        runtime.spawn(Arc::clone(&self.shared).run());
        Ok(())
    }

    /// Queue bytes for transmission. Returns once they are queued.
    pub fn send(&self, data: &[u8]) -> Result<(), TunnelError> {
        {
            let mut state = self.shared.state.lock();
            if state.is_stopping() {
                return Err(TunnelError::SessionClosed);
            }
            if state.local_eof {
                return Err(TunnelError::LocalEof);
            }
            if data.is_empty() {
                return Ok(());
            }
            let chunks = state.ledger.enqueue(data);
            trace!("Queued {} bytes in {} chunks", data.len(), chunks);
            self.shared.drained_tx.send_replace(false);
        }
        self.open()?;
        self.shared.wake.notify_one();
        Ok(())
    }

    /// Wait until the session is open. A timeout leaves the session alone.
    pub async fn wait_for_open(&self, timeout: Duration) -> Result<(), TunnelError> {
        let mut phase = self.shared.phase_tx.subscribe();
        let wait = async {
            loop {
                let current = *phase.borrow_and_update();
                match current {
                    SessionPhase::Open => return Ok(()),
                    SessionPhase::Terminal => return Err(self.terminal_error()),
                    _ => {}
                }
                if phase.changed().await.is_err() {
                    return Err(TunnelError::SessionClosed);
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| TunnelError::Timeout)?
    }

    /// Open the session and wait for the first CONNECT_SUCCESS
    pub async fn initiate_connection(&self, timeout: Duration) -> Result<(), TunnelError> {
        self.open()?;
        self.wait_for_open(timeout).await
    }

    /// Close the session. Idempotent; returns after `on_close` ran.
    pub async fn close(&self) {
        let carrier = {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            self.shared.set_phase(&mut state, SessionPhase::Terminal);
            state.carrier.take()
        };
        self.shared.wake.notify_one();

        if let Some(carrier) = carrier {
            carrier.send_close().await;
            carrier.close().await;
        }
        self.shared.notify_closed();

        // The send loop may have claimed the notification first
        let mut closed = self.shared.closed_tx.subscribe();
        while !*closed.borrow_and_update() {
            if closed.changed().await.is_err() {
                return;
            }
        }
    }

    /// No more local data will be sent
    pub fn local_eof(&self) {
        self.shared.state.lock().local_eof = true;
        debug!("Local EOF");
    }

    /// Wait until every queued byte has been handed to a carrier.
    /// Returns `false` on timeout or if the session ended first.
    pub async fn wait_for_all_sent(&self, timeout: Duration) -> bool {
        let mut drained = self.shared.drained_tx.subscribe();
        let mut phase = self.shared.phase_tx.subscribe();
        let wait = async {
            loop {
                if *drained.borrow_and_update() {
                    return true;
                }
                if *phase.borrow_and_update() == SessionPhase::Terminal {
                    return false;
                }
                tokio::select! {
                    changed = drained.changed() => if changed.is_err() { return false },
                    changed = phase.changed() => if changed.is_err() { return false },
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.unwrap_or(false)
    }

    pub fn phase(&self) -> SessionPhase {
        self.shared.state.lock().phase
    }

    pub fn is_terminal(&self) -> bool {
        self.phase() == SessionPhase::Terminal
    }

    pub fn stats(&self) -> SessionStats {
        let state = self.shared.state.lock();
        SessionStats {
            phase: state.phase,
            session_id: state.session_id.clone(),
            total_bytes_sent: state.ledger.total_bytes_sent(),
            total_bytes_confirmed: state.ledger.total_bytes_confirmed(),
            total_bytes_received: state.ledger.total_bytes_received(),
            last_ack_sent: state.ledger.last_ack_sent(),
            unsent_chunks: state.ledger.unsent_chunks(),
            unconfirmed_bytes: state.ledger.unconfirmed_len(),
            carriers_opened: state.generation,
        }
    }

    fn terminal_error(&self) -> TunnelError {
        self.shared
            .state
            .lock()
            .terminal_error
            .clone()
            .unwrap_or(TunnelError::SessionClosed)
    }
}

impl Drop for TunnelSession {
    fn drop(&mut self) {
        self.shared.state.lock().shutdown = true;
        self.shared.wake.notify_one();
    }
}

impl std::fmt::Debug for TunnelSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelSession")
            .field("stats", &self.stats())
            .finish()
    }
}

/// Result of dispatching one inbound frame
#[derive(Debug, PartialEq, Eq)]
enum Inbound {
    Ignored,
    Connected,
    Acked,
    Data(Bytes),
}

/// Mutable session state, guarded by the session lock
#[derive(Debug)]
struct SessionState {
    phase: SessionPhase,
    session_id: Option<Bytes>,
    /// Current carrier saw CONNECT_SUCCESS or RECONNECT_SUCCESS
    connected: bool,
    ledger: FlowLedger,
    reconnect: ReconnectController,
    carrier: Option<Arc<Carrier>>,
    /// Generation of the newest carrier
    generation: u64,
    /// Current carrier reported its close
    carrier_down: bool,
    terminal_error: Option<TunnelError>,
    close_notified: bool,
    local_eof: bool,
    loop_started: bool,
    /// Close was called or the handle dropped
    shutdown: bool,
}

impl SessionState {
    fn new(policy: ReconnectPolicy) -> Self {
        Self {
            phase: SessionPhase::Init,
            session_id: None,
            connected: false,
            ledger: FlowLedger::new(),
            reconnect: ReconnectController::new(policy),
            carrier: None,
            generation: 0,
            carrier_down: false,
            terminal_error: None,
            close_notified: false,
            local_eof: false,
            loop_started: false,
            shutdown: false,
        }
    }

    fn is_stopping(&self) -> bool {
        self.shutdown || self.phase == SessionPhase::Terminal
    }

    /// Apply one inbound message to the session state
    fn dispatch(&mut self, raw: &[u8], now: Instant) -> Result<Inbound, TunnelError> {
        let Some(frame) = Frame::parse(raw)? else {
            debug!("Ignoring frame with unknown tag");
            return Ok(Inbound::Ignored);
        };

        match frame {
            Frame::ConnectSuccessSid(sid) => {
                if self.connected {
                    return Err(SubprotocolError::ExtraConnectSuccess.into());
                }
                match &self.session_id {
                    None => self.session_id = Some(sid),
                    Some(existing) if *existing == sid => {
                        // Gateway restarted the stream from zero on the same session
                        self.ledger.prepare_replay();
                    }
                    Some(_) => return Err(SubprotocolError::SessionIdMismatch.into()),
                }
                self.connected = true;
                Ok(Inbound::Connected)
            }
            Frame::ReconnectSuccessAck(ack) => {
                if self.session_id.is_none() {
                    return Err(SubprotocolError::ReconnectWithoutSession.into());
                }
                if self.connected {
                    return Err(SubprotocolError::ExtraReconnectSuccess.into());
                }
                self.ledger.confirm(ack)?;
                let replayed = self.ledger.prepare_replay();
                debug!("Session resumed at {} bytes, replaying {} chunks", ack, replayed);
                self.connected = true;
                Ok(Inbound::Connected)
            }
            Frame::Ack(count) => {
                if !self.connected {
                    return Err(SubprotocolError::EarlyAck.into());
                }
                self.ledger.confirm(count)?;
                Ok(Inbound::Acked)
            }
            Frame::Data(payload) => {
                if !self.connected {
                    return Err(SubprotocolError::EarlyData.into());
                }
                self.ledger.record_received(payload.len(), now);
                Ok(Inbound::Data(payload))
            }
        }
    }
}

/// What the send loop does next
enum Step {
    Stop(Option<Arc<Carrier>>),
    Open,
    Retire {
        carrier: Arc<Carrier>,
        was_connected: bool,
    },
    SendAck(Arc<Carrier>, u64),
    SendData(Arc<Carrier>, Bytes),
    Wait(Option<Instant>),
}

struct Shared {
    target: TunnelTarget,
    token_provider: Arc<dyn TokenProvider>,
    dialer: Arc<dyn Dialer>,
    handler: Arc<dyn TunnelHandler>,
    config: TunnelConfig,
    state: Mutex<SessionState>,
    /// Wakes the send loop
    wake: Notify,
    phase_tx: watch::Sender<SessionPhase>,
    /// True while the unsent queue is empty
    drained_tx: watch::Sender<bool>,
    /// True once `on_close` has returned
    closed_tx: watch::Sender<bool>,
}

impl Shared {
    /// Move to `phase`. Terminal is never left.
    fn set_phase(&self, state: &mut SessionState, phase: SessionPhase) {
        if state.phase == phase || state.phase == SessionPhase::Terminal {
            return;
        }
        debug!("Session phase {:?} -> {:?}", state.phase, phase);
        state.phase = phase;
        self.phase_tx.send_replace(phase);
    }

    /// End the session with an error
    fn fail(&self, err: TunnelError) {
        {
            let mut state = self.state.lock();
            if state.phase == SessionPhase::Terminal {
                return;
            }
            error!("Tunnel session failed: {}", err);
            state.terminal_error = Some(err);
            self.set_phase(&mut state, SessionPhase::Terminal);
        }
        self.wake.notify_one();
    }

    /// Invoke `on_close` the first time the session is seen terminal
    fn notify_closed(&self) {
        let error = {
            let mut state = self.state.lock();
            if state.close_notified || state.phase != SessionPhase::Terminal {
                return;
            }
            state.close_notified = true;
            state.terminal_error.clone()
        };
        info!("Tunnel session closed");
        self.handler.on_close(error);
        self.closed_tx.send_replace(true);
    }

    async fn run(self: Arc<Self>) {
        debug!("Send loop started");
        loop {
            match self.next_step() {
                Step::Stop(carrier) => {
                    if let Some(carrier) = carrier {
                        let clean = self.state.lock().terminal_error.is_none();
                        if clean {
                            carrier.send_close().await;
                        }
                        carrier.close().await;
                    }
                    self.notify_closed();
                    break;
                }
                Step::Open => self.open_carrier().await,
                Step::Retire {
                    carrier,
                    was_connected,
                } => self.retire(carrier, was_connected).await,
                Step::SendAck(carrier, count) => {
                    if carrier.send(encode_ack(count)).await.is_ok() {
                        trace!("Sent ACK for {} bytes", count);
                        self.state.lock().ledger.mark_ack_sent(count);
                    }
                }
                Step::SendData(carrier, chunk) => {
                    let frame = match encode_data(&chunk) {
                        Ok(frame) => frame,
                        Err(e) => {
                            self.fail(e);
                            continue;
                        }
                    };
                    if carrier.send(frame).await.is_ok() {
                        let mut state = self.state.lock();
                        state.ledger.commit_front();
                        if !state.ledger.has_unsent() {
                            self.drained_tx.send_replace(true);
                        }
                    }
                }
                Step::Wait(deadline) => self.wait(deadline).await,
            }
        }
        debug!("Send loop stopped");
    }

    fn next_step(&self) -> Step {
        let mut state = self.state.lock();
        if state.is_stopping() {
            self.set_phase(&mut state, SessionPhase::Terminal);
            return Step::Stop(state.carrier.take());
        }

        let carrier = match &state.carrier {
            Some(carrier) => Arc::clone(carrier),
            None => return Step::Open,
        };

        if state.carrier_down || carrier.is_closed() {
            let was_connected = state.connected;
            state.carrier = None;
            state.carrier_down = false;
            state.connected = false;
            let phase = if state.session_id.is_some() {
                SessionPhase::Reconnecting
            } else {
                SessionPhase::Connecting
            };
            self.set_phase(&mut state, phase);
            return Step::Retire {
                carrier,
                was_connected,
            };
        }

        if !state.connected {
            return Step::Wait(None);
        }

        // ACKs go out ahead of queued data
        let mut deadline = None;
        match state.ledger.ack_due(
            Instant::now(),
            self.config.ack_interval,
            self.config.ack_timeout(),
        ) {
            AckDue::Now(count) => return Step::SendAck(carrier, count),
            AckDue::At(at) => deadline = Some(at),
            AckDue::Idle => {}
        }

        match state.ledger.front_unsent() {
            Some(chunk) => Step::SendData(carrier, chunk),
            None => Step::Wait(deadline),
        }
    }

    async fn wait(&self, deadline: Option<Instant>) {
        match deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.wake.notified() => {}
                    _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {}
                }
            }
            None => self.wake.notified().await,
        }
    }

    async fn open_carrier(self: &Arc<Self>) {
        let (mode, generation) = {
            let mut state = self.state.lock();
            let mode = ReconnectMode::for_session(
                state.session_id.as_ref(),
                state.ledger.total_bytes_received(),
            );
            state.generation += 1;
            let phase = match mode {
                ReconnectMode::Connect => SessionPhase::Connecting,
                ReconnectMode::Reconnect { .. } => SessionPhase::Reconnecting,
            };
            self.set_phase(&mut state, phase);
            (mode, state.generation)
        };
        let resuming = matches!(mode, ReconnectMode::Reconnect { .. });

        let request = match self.handshake_request(&mode).await {
            Ok(request) => request,
            Err(e) => {
                self.fail(e);
                return;
            }
        };

        debug!("Dialing carrier {} ({})", generation, request.url.path());
        let dialed = tokio::time::timeout(self.config.connect_timeout(), self.dialer.dial(&request))
            .await
            .unwrap_or(Err(TransportError::Timeout));

        let conn = match dialed {
            Ok(conn) => conn,
            Err(err) => {
                warn!("Carrier {} handshake failed: {}", generation, err);
                let decision = self
                    .state
                    .lock()
                    .reconnect
                    .record_failure(&err, resuming, Instant::now());
                self.apply(decision).await;
                return;
            }
        };

        let link: Arc<dyn CarrierHandler> = Arc::new(CarrierLink {
            shared: Arc::downgrade(self),
        });
        let carrier = Carrier::new(conn, generation, link);
        let installed = {
            let mut state = self.state.lock();
            if state.is_stopping() || state.generation != generation {
                false
            } else {
                state.carrier = Some(Arc::clone(&carrier));
                state.carrier_down = false;
                state.connected = false;
                true
            }
        };
        if !installed {
            carrier.close().await;
            return;
        }

        if let Err(e) = carrier.start() {
            self.fail(e);
        }
    }

    async fn handshake_request(&self, mode: &ReconnectMode) -> Result<HandshakeRequest, TunnelError> {
        let url = match mode {
            ReconnectMode::Connect => connect_url(&self.target)?,
            ReconnectMode::Reconnect { sid, ack } => reconnect_url(&self.target, sid, *ack)?,
        };
        let token = self.token_provider.access_token().await?;
        Ok(HandshakeRequest {
            url,
            headers: handshake_headers(&self.config.user_agent, &token),
            tls: self.target.tls,
            proxy: self.target.proxy.clone(),
        })
    }

    async fn retire(&self, carrier: Arc<Carrier>, was_connected: bool) {
        carrier.close().await;
        let error = carrier.error().unwrap_or_default();

        let decision = {
            let mut state = self.state.lock();
            let now = Instant::now();
            if was_connected {
                if error.is_empty() {
                    info!("Carrier {} closed, reconnecting", carrier.generation());
                } else {
                    info!("Carrier {} lost ({}), reconnecting", carrier.generation(), error);
                }
                state.reconnect.note_disconnect(now);
                None
            } else if error.is_empty() && state.session_id.is_none() {
                Some(Decision::GiveUp(ConnectionCreationError::unexpected().into()))
            } else {
                let resuming = state.session_id.is_some();
                let err = if error.is_empty() {
                    TransportError::Closed
                } else {
                    TransportError::ConnectionFailed(error)
                };
                Some(state.reconnect.record_failure(&err, resuming, now))
            }
        };

        if let Some(decision) = decision {
            self.apply(decision).await;
        }
    }

    async fn apply(&self, decision: Decision) {
        match decision {
            Decision::Retry(delay) => self.backoff(delay).await,
            Decision::GiveUp(err) => self.fail(err),
        }
    }

    /// Sleep before the next dial, cut short only by shutdown
    async fn backoff(&self, delay: Duration) {
        let deadline = tokio::time::Instant::now() + delay;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return,
                _ = self.wake.notified() => {
                    if self.state.lock().is_stopping() {
                        return;
                    }
                }
            }
        }
    }

    fn handle_frame(&self, generation: u64, frame: Bytes) -> ControlFlow<String> {
        let outcome = {
            let mut state = self.state.lock();
            if state.generation != generation || state.phase == SessionPhase::Terminal {
                return ControlFlow::Continue(());
            }
            let outcome = state.dispatch(&frame, Instant::now());
            if let Ok(Inbound::Connected) = outcome {
                state.reconnect.reset();
                self.set_phase(&mut state, SessionPhase::Open);
                if state.ledger.has_unsent() {
                    self.drained_tx.send_replace(false);
                }
            }
            outcome
        };

        match outcome {
            Ok(Inbound::Data(payload)) => {
                self.handler.on_data(payload);
                self.wake.notify_one();
                ControlFlow::Continue(())
            }
            Ok(Inbound::Connected) => {
                info!("Tunnel connected on carrier {}", generation);
                self.wake.notify_one();
                ControlFlow::Continue(())
            }
            Ok(Inbound::Acked) | Ok(Inbound::Ignored) => ControlFlow::Continue(()),
            Err(TunnelError::IncompleteFrame) => {
                warn!("Incomplete frame on carrier {}", generation);
                ControlFlow::Break(TunnelError::IncompleteFrame.to_string())
            }
            Err(e) => {
                let reason = e.to_string();
                self.fail(e);
                ControlFlow::Break(reason)
            }
        }
    }

    fn handle_carrier_close(&self, generation: u64, error: String) {
        {
            let mut state = self.state.lock();
            if state.generation != generation || state.carrier.is_none() {
                return;
            }
            state.carrier_down = true;
        }
        if error.is_empty() {
            debug!("Carrier {} closed", generation);
        } else {
            debug!("Carrier {} closed: {}", generation, error);
        }
        self.wake.notify_one();
    }
}

/// Routes carrier events to the session without keeping it alive
struct CarrierLink {
    shared: Weak<Shared>,
}

impl CarrierHandler for CarrierLink {
    fn on_frame(&self, generation: u64, frame: Bytes) -> ControlFlow<String> {
        match self.shared.upgrade() {
            Some(shared) => shared.handle_frame(generation, frame),
            None => ControlFlow::Break("session dropped".to_string()),
        }
    }

    fn on_close(&self, generation: u64, error: String) {
        if let Some(shared) = self.shared.upgrade() {
            shared.handle_carrier_close(generation, error);
        }
    }
}
