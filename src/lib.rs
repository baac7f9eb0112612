//! SQA Core - Reliable datagram delivery over UDP
//!
//! This library implements the core of the SQA protocol: a reliable-delivery
//! layer on top of an unreliable, unordered datagram transport. Every packet
//! fits a single Ethernet MTU, unacknowledged packets are retransmitted on a
//! fixed timeout, and a send is reported as failed once its retries run out.
//!
//! # Design Principles
//! - One immutable configuration per session, seeded from the protocol constants
//! - Explicit per-packet state machine driven by timer fires and inbound ACKs
//! - Transport agnostic: any datagram primitive implementing [`transport::Transport`]
//! - At-least-once delivery, no reordering

pub mod config;
pub mod dedup;
pub mod errors;
pub mod metrics;
pub mod packet;
pub mod session;
pub mod timer;
pub mod tracker;
pub mod transport;

pub use config::{SessionConfig, SessionConfigBuilder};
pub use errors::{Result, SqaError};
pub use packet::{Packet, PacketCodec, PacketKind, HEADER_SIZE, MAX_PAYLOAD_SIZE};
pub use session::Session;
pub use tracker::DeliveryReport;

/// Protocol version
pub const SQA_VERSION: u8 = 1;

/// Default UDP port, chosen to stay clear of common services
pub const SQA_DEFAULT_PORT: u16 = 7946;

/// Maximum encoded packet size (in bytes) - matches the Ethernet MTU
pub const MAX_PACKET_SIZE: usize = 1500;

/// Retransmit timeout in milliseconds
pub const RETRANSMIT_TIMEOUT_MS: u64 = 500;

/// Maximum retransmissions of a single packet
pub const MAX_RETRIES: u32 = 3;
