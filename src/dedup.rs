/// Dedup module - optional suppression of redelivered DATA packets
use std::collections::{HashSet, VecDeque};

/// Remembers the sequence numbers of the most recently received DATA packets.
///
/// A peer retransmits when our ACK is lost, so the same packet can arrive
/// more than once. With deduplication enabled the session still ACKs such a
/// packet but hands it to the application only the first time. Eviction is by
/// arrival order, since packets are not reordered.
pub struct DuplicateFilter {
    seen: HashSet<u32>,
    arrival_order: VecDeque<u32>,
    capacity: usize,
}

impl DuplicateFilter {
    pub fn new(capacity: usize) -> Self {
        Self {
            seen: HashSet::with_capacity(capacity),
            arrival_order: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Record `sequence`, returning `true` if it was not seen within the window
    pub fn first_arrival(&mut self, sequence: u32) -> bool {
        if self.capacity == 0 {
            return true;
        }
        if !self.seen.insert(sequence) {
            return false;
        }

        self.arrival_order.push_back(sequence);
        if self.arrival_order.len() > self.capacity {
            if let Some(oldest) = self.arrival_order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.arrival_order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arrival_order.is_empty()
    }
}
