/// Delivery tracker - acknowledgment and retransmission state machine
///
/// Owns every outstanding DATA packet of a session and drives each one
/// through `Pending -> Acked` or `Pending -> Exhausted`. The tracker performs
/// no I/O: it tells the caller what to put on the wire and resolves the
/// waiting sender's completion when an entry reaches a terminal state.
use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::errors::{Result, SqaError};

/// Outcome of a successful send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Sequence number the payload was sent with
    pub sequence: u32,

    /// Number of retransmissions before the ACK arrived
    pub retransmissions: u32,

    /// Time between the last transmission and the ACK
    pub rtt: Duration,
}

/// Handle used to resolve the caller waiting on a send
pub type Completion = oneshot::Sender<Result<DeliveryReport>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Pending,
    Acked,
    Exhausted,
}

/// A sent packet that has not been acknowledged yet
#[derive(Debug)]
pub struct OutstandingEntry {
    pub sequence: u32,

    /// Encoded datagram, resent byte for byte on retransmission
    pub bytes: Bytes,

    pub retries_used: u32,
    pub first_sent_at: Instant,
    pub last_sent_at: Instant,
    pub deadline: Instant,
    pub state: EntryState,
    completion: Option<Completion>,
}

impl OutstandingEntry {
    fn resolve(&mut self, state: EntryState, outcome: Result<DeliveryReport>) {
        self.state = state;
        if let Some(completion) = self.completion.take() {
            // the sender may have stopped waiting
            let _ = completion.send(outcome);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckOutcome {
    Acked(DeliveryReport),
    /// Duplicate or late ACK for an unknown sequence number
    Ignored,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerOutcome {
    /// Put these bytes on the wire again and re-arm the timer at `deadline`
    Retransmit { bytes: Bytes, deadline: Instant },
    /// Retries used up, the sender was failed
    Exhausted,
    /// Entry already resolved or re-armed to a later deadline
    Stale,
}

pub struct DeliveryTracker {
    entries: HashMap<u32, OutstandingEntry>,
    retransmit_timeout: Duration,
    max_retries: u32,
}

impl DeliveryTracker {
    pub fn new(retransmit_timeout: Duration, max_retries: u32) -> Self {
        Self {
            entries: HashMap::new(),
            retransmit_timeout,
            max_retries,
        }
    }

    /// Track a packet that was just transmitted for the first time
    ///
    /// # Returns
    /// The deadline at which the retransmission timer must fire for it
    pub fn register(
        &mut self,
        sequence: u32,
        bytes: Bytes,
        now: Instant,
        completion: Completion,
    ) -> Instant {
        let deadline = now + self.retransmit_timeout;
        let entry = OutstandingEntry {
            sequence,
            bytes,
            retries_used: 0,
            first_sent_at: now,
            last_sent_at: now,
            deadline,
            state: EntryState::Pending,
            completion: Some(completion),
        };

        if let Some(mut previous) = self.entries.insert(sequence, entry) {
            warn!("sequence number {} reused while still outstanding - failing the older send", sequence);
            let retries = previous.retries_used;
            previous.resolve(EntryState::Exhausted, Err(SqaError::DeliveryExhausted { sequence, retries }));
        }

        trace!("registered packet {} - deadline in {:?}", sequence, self.retransmit_timeout);
        deadline
    }

    /// Inbound ACK for `sequence`
    pub fn on_ack(&mut self, sequence: u32, now: Instant) -> AckOutcome {
        let Some(mut entry) = self.entries.remove(&sequence) else {
            trace!("ignoring ACK for unknown packet {}", sequence);
            return AckOutcome::Ignored;
        };

        let report = DeliveryReport {
            sequence,
            retransmissions: entry.retries_used,
            rtt: now.saturating_duration_since(entry.last_sent_at),
        };
        debug!(
            "packet {} acknowledged after {} retransmissions, {:?} since first send",
            sequence,
            entry.retries_used,
            now.saturating_duration_since(entry.first_sent_at)
        );
        entry.resolve(EntryState::Acked, Ok(report.clone()));
        AckOutcome::Acked(report)
    }

    /// Retransmission timer fired for `sequence`
    pub fn on_timer(&mut self, sequence: u32, now: Instant) -> TimerOutcome {
        let Some(entry) = self.entries.get_mut(&sequence) else {
            return TimerOutcome::Stale;
        };
        if now < entry.deadline {
            return TimerOutcome::Stale;
        }

        if entry.retries_used < self.max_retries {
            entry.retries_used += 1;
            entry.last_sent_at = now;
            entry.deadline = now + self.retransmit_timeout;
            debug!("retransmitting packet {} (attempt {} of {})", sequence, entry.retries_used, self.max_retries);
            return TimerOutcome::Retransmit {
                bytes: entry.bytes.clone(),
                deadline: entry.deadline,
            };
        }

        if let Some(mut entry) = self.entries.remove(&sequence) {
            let retries = entry.retries_used;
            debug!("packet {} exhausted after {} retransmissions", sequence, retries);
            entry.resolve(EntryState::Exhausted, Err(SqaError::DeliveryExhausted { sequence, retries }));
        }
        TimerOutcome::Exhausted
    }

    /// Fail every pending send, used when the session closes
    ///
    /// # Returns
    /// Number of sends that were still pending
    pub fn close_all(&mut self) -> usize {
        let count = self.entries.len();
        for (_, mut entry) in self.entries.drain() {
            entry.resolve(EntryState::Exhausted, Err(SqaError::SessionClosed));
        }
        if count > 0 {
            debug!("failed {} pending sends on close", count);
        }
        count
    }

    pub fn state(&self, sequence: u32) -> Option<EntryState> {
        self.entries.get(&sequence).map(|entry| entry.state)
    }

    pub fn retries_used(&self, sequence: u32) -> Option<u32> {
        self.entries.get(&sequence).map(|entry| entry.retries_used)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
