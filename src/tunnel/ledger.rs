//! Flow control bookkeeping for one tunnel session
//!
//! Tracks what was queued, what was handed to a carrier, what the peer has
//! confirmed and what we received. Holds the unconfirmed suffix so it can be
//! replayed after a reconnect.
//!
//! No locking in here; the session serialises access.

use crate::protocol::{SubprotocolError, MAX_DATA_FRAME};
use bytes::Bytes;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// When the next ACK has to go out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckDue {
    /// Nothing to acknowledge
    Idle,
    /// Send an ACK for this cumulative count now
    Now(u64),
    /// Send an ACK at this instant unless more data shows up
    At(Instant),
}

/// Byte accounting for both directions of the tunnel
#[derive(Debug, Default)]
pub struct FlowLedger {
    /// Chunks waiting for their first (or replayed) transmission
    unsent: VecDeque<Bytes>,
    /// Chunks handed to a carrier but not yet covered by an ACK
    unconfirmed: VecDeque<Bytes>,
    /// Sum of chunk lengths in `unconfirmed`
    unconfirmed_len: u64,
    total_bytes_sent: u64,
    total_bytes_confirmed: u64,
    total_bytes_received: u64,
    /// Received count carried by the last ACK we sent
    last_ack_sent: u64,
    /// Arrival time of the last DATA frame
    last_data_at: Option<Instant>,
}

impl FlowLedger {
    /// Create an empty ledger
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue outbound data, split into chunks of at most [`MAX_DATA_FRAME`].
    ///
    /// Returns the number of chunks added; empty input adds nothing.
    pub fn enqueue(&mut self, data: &[u8]) -> usize {
        let mut count = 0;
        for chunk in data.chunks(MAX_DATA_FRAME) {
            self.unsent.push_back(Bytes::copy_from_slice(chunk));
            count += 1;
        }
        count
    }

    /// Next chunk to transmit, left in place until [`Self::commit_front`]
    pub fn front_unsent(&self) -> Option<Bytes> {
        self.unsent.front().cloned()
    }

    /// The front chunk was accepted by the carrier: move it to `unconfirmed`
    pub fn commit_front(&mut self) -> Option<usize> {
        let chunk = self.unsent.pop_front()?;
        let len = chunk.len();
        self.record_sent(chunk);
        Some(len)
    }

    /// Append a transmitted chunk to the unconfirmed buffer
    pub fn record_sent(&mut self, chunk: Bytes) {
        let len = chunk.len() as u64;
        self.total_bytes_sent += len;
        self.unconfirmed_len += len;
        self.unconfirmed.push_back(chunk);
    }

    /// Apply the peer's cumulative confirmed byte count
    pub fn confirm(&mut self, confirmed: u64) -> Result<(), SubprotocolError> {
        if confirmed < self.total_bytes_confirmed {
            return Err(SubprotocolError::OutOfOrderAck(confirmed));
        }
        if confirmed > self.total_bytes_sent {
            return Err(SubprotocolError::InvalidAck {
                confirmed,
                sent: self.total_bytes_sent,
            });
        }

        let mut remaining = confirmed - self.total_bytes_confirmed;
        while remaining > 0 {
            let Some(front) = self.unconfirmed.front_mut() else {
                break;
            };
            let len = front.len() as u64;
            if len <= remaining {
                self.unconfirmed.pop_front();
                self.unconfirmed_len -= len;
                remaining -= len;
            } else {
                // Boundary falls inside this chunk; keep the unconfirmed tail
                *front = front.slice(remaining as usize..);
                self.unconfirmed_len -= remaining;
                remaining = 0;
            }
        }

        self.total_bytes_confirmed = confirmed;
        Ok(())
    }

    /// Count inbound DATA payload bytes
    pub fn record_received(&mut self, len: usize, now: Instant) {
        self.total_bytes_received += len as u64;
        self.last_data_at = Some(now);
    }

    /// Put the unconfirmed buffer back in front of the unsent queue and
    /// rewind the sent counter so it gets transmitted again.
    pub fn prepare_replay(&mut self) -> usize {
        let replayed = self.unconfirmed.len();
        while let Some(chunk) = self.unconfirmed.pop_back() {
            self.unsent.push_front(chunk);
        }
        self.unconfirmed_len = 0;
        self.total_bytes_sent = self.total_bytes_confirmed;
        replayed
    }

    /// Work out whether an ACK should be sent
    pub fn ack_due(&self, now: Instant, interval: u64, timeout: Duration) -> AckDue {
        let pending = self.total_bytes_received - self.last_ack_sent;
        if pending == 0 {
            return AckDue::Idle;
        }
        if pending >= interval {
            return AckDue::Now(self.total_bytes_received);
        }
        let deadline = self.last_data_at.unwrap_or(now) + timeout;
        if deadline <= now {
            AckDue::Now(self.total_bytes_received)
        } else {
            AckDue::At(deadline)
        }
    }

    /// An ACK carrying `count` went out
    pub fn mark_ack_sent(&mut self, count: u64) {
        self.last_ack_sent = self.last_ack_sent.max(count);
    }

    pub fn total_bytes_sent(&self) -> u64 {
        self.total_bytes_sent
    }

    pub fn total_bytes_confirmed(&self) -> u64 {
        self.total_bytes_confirmed
    }

    pub fn total_bytes_received(&self) -> u64 {
        self.total_bytes_received
    }

    pub fn last_ack_sent(&self) -> u64 {
        self.last_ack_sent
    }

    /// Bytes sent but not yet confirmed
    pub fn unconfirmed_len(&self) -> u64 {
        self.unconfirmed_len
    }

    /// Unconfirmed chunks, oldest first
    pub fn unconfirmed(&self) -> impl Iterator<Item = &Bytes> {
        self.unconfirmed.iter()
    }

    /// Queued chunks, oldest first
    pub fn unsent(&self) -> impl Iterator<Item = &Bytes> {
        self.unsent.iter()
    }

    pub fn unsent_chunks(&self) -> usize {
        self.unsent.len()
    }

    pub fn has_unsent(&self) -> bool {
        !self.unsent.is_empty()
    }
}
