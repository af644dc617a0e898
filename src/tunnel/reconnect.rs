//! Reconnect policy
//!
//! Decides whether a failed or lost carrier is replaced and how long to
//! wait first. Exponential backoff with bounded jitter, all inside a
//! fixed wall-clock window that opens at the first trouble after the last
//! successful (re)connect.

use super::TunnelError;
use crate::handshake::{classify_handshake_error, ConnectionCreationError};
use crate::protocol::MAX_RECONNECT_WINDOW;
use crate::transport::TransportError;
use bytes::Bytes;
use rand::Rng;
use std::time::{Duration, Instant};
use tracing::debug;

/// Backoff parameters
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    /// Upper bound of the random delay added to every backoff
    pub jitter: Duration,
    /// Total time allowed without a working carrier
    pub max_window: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: Duration::from_millis(250),
            max_window: MAX_RECONNECT_WINDOW,
        }
    }
}

/// Which handshake the next carrier performs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectMode {
    /// Fresh session
    Connect,
    /// Resume `sid`, telling the peer we received `ack` bytes
    Reconnect { sid: Bytes, ack: u64 },
}

impl ReconnectMode {
    /// Mode for the current session state
    pub fn for_session(session_id: Option<&Bytes>, total_bytes_received: u64) -> Self {
        match session_id {
            Some(sid) => ReconnectMode::Reconnect {
                sid: sid.clone(),
                ack: total_bytes_received,
            },
            None => ReconnectMode::Connect,
        }
    }
}

/// Outcome of a failure
#[derive(Debug, Clone)]
pub enum Decision {
    /// Try again after this delay
    Retry(Duration),
    /// Stop; the session ends with this error
    GiveUp(TunnelError),
}

/// Tracks consecutive failures for one session
#[derive(Debug)]
pub struct ReconnectController {
    policy: ReconnectPolicy,
    attempts: u32,
    window_start: Option<Instant>,
}

impl ReconnectController {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
            window_start: None,
        }
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// Failures since the last successful (re)connect
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// An established carrier went away
    pub fn note_disconnect(&mut self, now: Instant) {
        self.window_start.get_or_insert(now);
    }

    /// A carrier reached CONNECT_SUCCESS or RECONNECT_SUCCESS
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.window_start = None;
    }

    /// Backoff before attempt `attempt + 1`, without jitter
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self.policy.initial_backoff.as_secs_f64()
            * self.policy.multiplier.powi(attempt.min(64) as i32);
        let capped = base.min(self.policy.max_backoff.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    /// Record a failed attempt and decide what happens next
    pub fn record_failure(&mut self, err: &TransportError, resuming: bool, now: Instant) -> Decision {
        let kind = classify_handshake_error(err);
        if !kind.is_retryable() {
            debug!("Handshake failure {:?} is not retryable", kind);
            return Decision::GiveUp(ConnectionCreationError::from_transport(err).into());
        }

        let start = *self.window_start.get_or_insert(now);
        let elapsed = now.saturating_duration_since(start);
        if elapsed >= self.policy.max_window {
            return Decision::GiveUp(self.exhausted(err, resuming));
        }

        let mut delay = self.backoff(self.attempts);
        let jitter_ms = self.policy.jitter.as_millis() as u64;
        if jitter_ms > 0 {
            delay += Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms));
        }
        delay = delay.min(self.policy.max_window - elapsed);
        self.attempts += 1;

        debug!(
            "Connection attempt {} failed ({}), retrying in {:?}",
            self.attempts, err, delay
        );
        Decision::Retry(delay)
    }

    fn exhausted(&self, err: &TransportError, resuming: bool) -> TunnelError {
        if resuming {
            TunnelError::ReconnectExhausted(err.to_string())
        } else {
            ConnectionCreationError::from_transport(err).into()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> ReconnectPolicy {
        ReconnectPolicy {
            jitter: Duration::ZERO,
            ..ReconnectPolicy::default()
        }
    }

    fn network() -> TransportError {
        TransportError::ConnectionFailed("refused".to_string())
    }

    #[test]
    fn test_mode_for_session() {
        assert_eq!(ReconnectMode::for_session(None, 5), ReconnectMode::Connect);
        let sid = Bytes::from_static(b"sid");
        assert_eq!(
            ReconnectMode::for_session(Some(&sid), 7),
            ReconnectMode::Reconnect { sid, ack: 7 }
        );
    }

    #[test]
    fn test_backoff_curve() {
        let controller = ReconnectController::new(no_jitter());
        assert_eq!(controller.backoff(0), Duration::from_millis(100));
        assert_eq!(controller.backoff(1), Duration::from_millis(200));
        assert_eq!(controller.backoff(3), Duration::from_millis(800));
        assert_eq!(controller.backoff(10), Duration::from_secs(5));
        assert_eq!(controller.backoff(1000), Duration::from_secs(5));
    }

    #[test]
    fn test_retry_then_reset() {
        let mut controller = ReconnectController::new(no_jitter());
        let now = Instant::now();
        assert!(matches!(
            controller.record_failure(&network(), false, now),
            Decision::Retry(d) if d == Duration::from_millis(100)
        ));
        assert!(matches!(
            controller.record_failure(&network(), false, now),
            Decision::Retry(d) if d == Duration::from_millis(200)
        ));
        assert_eq!(controller.attempts(), 2);

        controller.reset();
        assert_eq!(controller.attempts(), 0);
        assert!(matches!(
            controller.record_failure(&network(), true, now),
            Decision::Retry(d) if d == Duration::from_millis(100)
        ));
    }

    #[test]
    fn test_jitter_bounded() {
        let mut controller = ReconnectController::new(ReconnectPolicy::default());
        let now = Instant::now();
        match controller.record_failure(&network(), false, now) {
            Decision::Retry(d) => {
                assert!(d >= Duration::from_millis(100));
                assert!(d <= Duration::from_millis(350));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_fatal_status_gives_up() {
        let mut controller = ReconnectController::new(no_jitter());
        let err = TransportError::Handshake {
            status: 400,
            message: "Bad Request".to_string(),
        };
        match controller.record_failure(&err, false, Instant::now()) {
            Decision::GiveUp(TunnelError::ConnectionCreation(e)) => {
                assert!(e.message().contains("missing permissions"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_server_error_retries() {
        let mut controller = ReconnectController::new(no_jitter());
        let err = TransportError::Handshake {
            status: 503,
            message: String::new(),
        };
        assert!(matches!(
            controller.record_failure(&err, false, Instant::now()),
            Decision::Retry(_)
        ));
    }

    #[test]
    fn test_window_expiry() {
        let mut controller = ReconnectController::new(no_jitter());
        let start = Instant::now();
        controller.note_disconnect(start);

        // Delay is capped by what is left of the window
        let late = start + Duration::from_millis(59_950);
        assert!(matches!(
            controller.record_failure(&network(), true, late),
            Decision::Retry(d) if d == Duration::from_millis(50)
        ));

        let expired = start + MAX_RECONNECT_WINDOW;
        assert!(matches!(
            controller.record_failure(&network(), true, expired),
            Decision::GiveUp(TunnelError::ReconnectExhausted(_))
        ));
        assert!(matches!(
            controller.record_failure(&network(), false, expired),
            Decision::GiveUp(TunnelError::ConnectionCreation(_))
        ));
    }
}
