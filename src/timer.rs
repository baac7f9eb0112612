/// Retransmission timer - independent deadlines per outstanding packet
///
/// Every outstanding sequence number gets its own deadline in a min-heap, so
/// re-arming one packet never shifts another packet's schedule. The timer only
/// answers "which sequence numbers are due"; whether a due packet is resent or
/// given up is decided by [`crate::tracker::DeliveryTracker`].
///
/// Cancellation is lazy: acknowledged packets keep their heap slot until it
/// fires, and the tracker reports such fires as stale.
use std::cmp::Reverse;
use std::collections::BinaryHeap;

use tokio::time::Instant;

#[derive(Debug, Default)]
pub struct RetransmitTimer {
    deadlines: BinaryHeap<Reverse<(Instant, u32)>>,
}

impl RetransmitTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a deadline for `sequence`
    pub fn schedule(&mut self, sequence: u32, deadline: Instant) {
        self.deadlines.push(Reverse((deadline, sequence)));
    }

    /// Earliest armed deadline, if any
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.peek().map(|Reverse((deadline, _))| *deadline)
    }

    /// Remove and return every sequence number whose deadline is at or before `now`,
    /// earliest first
    pub fn pop_expired(&mut self, now: Instant) -> Vec<u32> {
        let mut expired = Vec::new();
        while let Some(Reverse((deadline, sequence))) = self.deadlines.peek().copied() {
            if deadline > now {
                break;
            }
            self.deadlines.pop();
            expired.push(sequence);
        }
        expired
    }

    /// Cancel every armed deadline
    pub fn clear(&mut self) {
        self.deadlines.clear();
    }

    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }
}
