/// Metrics module - traffic counters of a session
///
/// One atomic counter per [`DataPoint`]. The driver task increments them,
/// callers read them through [`crate::Session::metrics`] at any time.
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters a session keeps about its traffic
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DataPoint {
    DataSent = 0,
    Retransmissions = 1,
    AcksReceived = 2,
    DuplicateAcks = 3,
    DataReceived = 4,
    DuplicatesSuppressed = 5,
    MalformedDropped = 6,
    Delivered = 7,
    SendsExhausted = 8,
    OversizeRejected = 9,
    Length = 10,
}

const DATA_POINTS: [DataPoint; DataPoint::Length as usize] = [
    DataPoint::DataSent,
    DataPoint::Retransmissions,
    DataPoint::AcksReceived,
    DataPoint::DuplicateAcks,
    DataPoint::DataReceived,
    DataPoint::DuplicatesSuppressed,
    DataPoint::MalformedDropped,
    DataPoint::Delivered,
    DataPoint::SendsExhausted,
    DataPoint::OversizeRejected,
];

/// Shared between the session handle and its driver task
#[derive(Debug, Default)]
pub struct SessionMetrics {
    counters: [AtomicU64; DataPoint::Length as usize],
}

impl SessionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_count(&self, data_point: DataPoint) -> u64 {
        self.counters[data_point as usize].load(Ordering::Relaxed)
    }

    pub(crate) fn increment(&self, data_point: DataPoint) {
        self.add(data_point, 1);
    }

    pub(crate) fn add(&self, data_point: DataPoint, amount: u64) {
        self.counters[data_point as usize].fetch_add(amount, Ordering::Relaxed);
    }
}

impl fmt::Display for SessionMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, data_point) in DATA_POINTS.iter().enumerate() {
            if idx > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{:?}={}", data_point, self.get_count(*data_point))?;
        }
        Ok(())
    }
}
