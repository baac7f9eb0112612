/// Packet codec - framing of a single SQA datagram
///
/// Every datagram carries a fixed 12 byte big-endian header followed by the
/// raw payload. The encoded size never exceeds [`MAX_PACKET_SIZE`], so a
/// packet always fits a single Ethernet frame and is never IP-fragmented.
///
/// # Wire Layout
/// - version: 1 byte (u8)
/// - flags: 1 byte (bit 0 = ACK, bit 1 = HELLO)
/// - sequence: 4 bytes (u32)
/// - payload_len: 2 bytes (u16)
/// - checksum: 4 bytes (CRC32 over header with zeroed checksum + payload)
/// - payload: payload_len bytes
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::errors::{Result, SqaError};
use crate::MAX_PACKET_SIZE;

/// Size of the fixed packet header in bytes
pub const HEADER_SIZE: usize = 12;

/// Largest payload that fits into a single packet
pub const MAX_PAYLOAD_SIZE: usize = MAX_PACKET_SIZE - HEADER_SIZE;

const CHECKSUM_OFFSET: usize = 8;

/// Flag bits of the second header byte
pub mod flags {
    pub const ACK: u8 = 0x01;
    pub const HELLO: u8 = 0x02;

    pub(crate) const KNOWN: u8 = ACK | HELLO;
}

/// What a packet means to the receiving endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    /// Application payload, must be acknowledged
    Data,
    /// Acknowledgment of the DATA packet with the same sequence number
    Ack,
    /// Handshake announcement of the sender's protocol version
    Hello,
    /// Handshake answer, the peer accepted our version
    HelloAck,
}

impl PacketKind {
    pub fn flags(self) -> u8 {
        match self {
            Self::Data => 0,
            Self::Ack => flags::ACK,
            Self::Hello => flags::HELLO,
            Self::HelloAck => flags::HELLO | flags::ACK,
        }
    }

    pub fn from_flags(raw: u8) -> Result<Self> {
        if raw & !flags::KNOWN != 0 {
            return Err(SqaError::MalformedPacket(format!("unknown flag bits {:#04x}", raw)));
        }
        Ok(match (raw & flags::HELLO != 0, raw & flags::ACK != 0) {
            (false, false) => Self::Data,
            (false, true) => Self::Ack,
            (true, false) => Self::Hello,
            (true, true) => Self::HelloAck,
        })
    }

    pub fn is_handshake(self) -> bool {
        matches!(self, Self::Hello | Self::HelloAck)
    }
}

/// A single decoded SQA datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub version: u8,
    pub kind: PacketKind,
    pub sequence: u32,
    pub payload: Bytes,
}

impl Packet {
    pub fn data(version: u8, sequence: u32, payload: Bytes) -> Self {
        Self { version, kind: PacketKind::Data, sequence, payload }
    }

    pub fn ack(version: u8, sequence: u32) -> Self {
        Self { version, kind: PacketKind::Ack, sequence, payload: Bytes::new() }
    }

    pub fn hello(version: u8, sequence: u32) -> Self {
        Self { version, kind: PacketKind::Hello, sequence, payload: Bytes::new() }
    }

    pub fn hello_ack(version: u8, sequence: u32) -> Self {
        Self { version, kind: PacketKind::HelloAck, sequence, payload: Bytes::new() }
    }

    /// Size of this packet on the wire
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}

/// Codec bound to the negotiated protocol version of a session
#[derive(Debug, Clone, Copy)]
pub struct PacketCodec {
    version: u8,
}

impl PacketCodec {
    pub fn new(version: u8) -> Self {
        Self { version }
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    /// Serialize a packet into its wire representation
    ///
    /// # Errors
    /// `Oversize` if the framed packet would exceed [`MAX_PACKET_SIZE`].
    pub fn encode(&self, packet: &Packet) -> Result<Bytes> {
        let size = packet.encoded_len();
        if size > MAX_PACKET_SIZE {
            return Err(SqaError::Oversize { size, max: MAX_PACKET_SIZE });
        }

        let mut buf = BytesMut::with_capacity(size);
        buf.put_u8(packet.version);
        buf.put_u8(packet.kind.flags());
        buf.put_u32(packet.sequence);
        buf.put_u16(packet.payload.len() as u16);
        buf.put_u32(0);
        buf.put_slice(&packet.payload);

        let checksum = compute_checksum(&buf);
        buf[CHECKSUM_OFFSET..HEADER_SIZE].copy_from_slice(&checksum.to_be_bytes());
        Ok(buf.freeze())
    }

    /// Parse a received datagram
    ///
    /// Pure: the input is never modified and nothing is retained on failure.
    ///
    /// # Errors
    /// - `MalformedPacket` if the datagram is shorter than the header, its
    ///   length field disagrees with the datagram, flags are unknown or the
    ///   checksum does not match
    /// - `VersionMismatch` if an otherwise intact packet carries a version
    ///   other than this codec's
    pub fn decode(&self, datagram: &[u8]) -> Result<Packet> {
        if datagram.len() < HEADER_SIZE {
            return Err(SqaError::MalformedPacket(format!(
                "datagram of {} bytes is shorter than the {} byte header",
                datagram.len(),
                HEADER_SIZE
            )));
        }
        if datagram.len() > MAX_PACKET_SIZE {
            return Err(SqaError::MalformedPacket(format!(
                "datagram of {} bytes exceeds maximum packet size",
                datagram.len()
            )));
        }

        let mut header = &datagram[..HEADER_SIZE];
        let version = header.get_u8();
        let raw_flags = header.get_u8();
        let sequence = header.get_u32();
        let payload_len = header.get_u16() as usize;
        let checksum = header.get_u32();

        if HEADER_SIZE + payload_len != datagram.len() {
            return Err(SqaError::MalformedPacket(format!(
                "length field says {} payload bytes, datagram carries {}",
                payload_len,
                datagram.len() - HEADER_SIZE
            )));
        }

        let actual = compute_checksum(datagram);
        if actual != checksum {
            return Err(SqaError::MalformedPacket(format!(
                "checksum mismatch: expected {:#x}, got {:#x}",
                checksum, actual
            )));
        }

        // only an intact packet can tell us the peer's version
        if version != self.version {
            return Err(SqaError::VersionMismatch { expected: self.version, actual: version });
        }
        let kind = PacketKind::from_flags(raw_flags)?;

        Ok(Packet {
            version,
            kind,
            sequence,
            payload: Bytes::copy_from_slice(&datagram[HEADER_SIZE..]),
        })
    }
}

/// CRC32 over the whole datagram with the checksum field treated as zero
fn compute_checksum(datagram: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&datagram[..CHECKSUM_OFFSET]);
    hasher.update(&[0u8; HEADER_SIZE - CHECKSUM_OFFSET]);
    hasher.update(&datagram[HEADER_SIZE..]);
    hasher.finalize()
}
