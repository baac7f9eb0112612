/// Error types for SQA protocol operations
///
/// Every failure of the reliable-delivery pipeline maps to one variant here.
/// Inbound decode failures are logged and dropped by the session, everything
/// else reaches the caller.
use std::fmt;
use std::io;

/// Result type alias for SQA operations
pub type Result<T> = std::result::Result<T, SqaError>;

/// SQA protocol error enumeration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqaError {
    /// I/O error (socket send/receive failure)
    Io(String),

    /// Peer speaks a different protocol version - fatal to session establishment
    VersionMismatch { expected: u8, actual: u8 },

    /// Encoded packet would exceed the maximum packet size
    Oversize { size: usize, max: usize },

    /// Payload does not fit into a single framed packet
    PayloadTooLarge { len: usize, max: usize },

    /// Inbound datagram could not be parsed (short, inconsistent length, bad checksum)
    MalformedPacket(String),

    /// No ACK arrived after all retransmissions
    DeliveryExhausted { sequence: u32, retries: u32 },

    /// Peer never answered the version handshake
    HandshakeTimeout { attempts: u32 },

    /// Session is closed or closing
    SessionClosed,

    /// Configuration rejected by validation
    InvalidConfig(String),
}

impl fmt::Display for SqaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(msg) => write!(f, "I/O error: {}", msg),
            Self::VersionMismatch { expected, actual } => {
                write!(f, "Protocol version mismatch: expected {}, peer sent {}", expected, actual)
            }
            Self::Oversize { size, max } => {
                write!(f, "Encoded packet of {} bytes exceeds maximum of {} bytes", size, max)
            }
            Self::PayloadTooLarge { len, max } => {
                write!(f, "Payload of {} bytes exceeds maximum payload of {} bytes", len, max)
            }
            Self::MalformedPacket(msg) => write!(f, "Malformed packet: {}", msg),
            Self::DeliveryExhausted { sequence, retries } => {
                write!(f, "Delivery of packet {} failed after {} retransmissions", sequence, retries)
            }
            Self::HandshakeTimeout { attempts } => {
                write!(f, "Handshake timed out after {} attempts", attempts)
            }
            Self::SessionClosed => write!(f, "Session closed"),
            Self::InvalidConfig(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for SqaError {}

/// Convert from io::Error to SqaError
impl From<io::Error> for SqaError {
    fn from(err: io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
