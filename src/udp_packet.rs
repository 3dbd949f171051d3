//! Probe datagram format with sequence numbers and send timestamps.
//!
//! Every probe is a fixed-size datagram:
//!
//! ```text
//! ┌──────────────┬──────────────┬──────────────────────┐
//! │  Sequence    │  Timestamp   │   Padding (zeros)    │
//! │  (8 bytes)   │  (8 bytes)   │   (payload_size)     │
//! └──────────────┴──────────────┴──────────────────────┘
//! ```
//!
//! - **Sequence**: 64-bit probe number, starting at 0 per session (big-endian)
//! - **Timestamp**: send time in nanoseconds of the sender's monotonic clock (big-endian)
//! - **Padding**: zero bytes filling the datagram up to the configured packet size
//!
//! In round-trip mode the peer answers each probe with an echo reply that keeps
//! the probe layout, echoes the original timestamp unchanged and appends its
//! own timestamp:
//!
//! ```text
//! ┌──────────────┬──────────────┬──────────────┬──────────────────────┐
//! │  Sequence    │  Sent at     │ Reflected at │   Padding (zeros)    │
//! │  (8 bytes)   │  (8 bytes)   │  (8 bytes)   │   (payload_size)     │
//! └──────────────┴──────────────┴──────────────┴──────────────────────┘
//! ```
//!
//! Decoding never allocates: it only reads the fixed header and scans the
//! padding of the buffer that was actually received.
//!
//! # Examples
//!
//! ```
//! use udpq::udp_packet::{decode, encode, ProbePacket};
//!
//! let probe = ProbePacket::new(42, 1_000, 16);
//! let bytes = encode(&probe);
//! assert_eq!(bytes.len(), 32);
//!
//! let decoded = decode(&bytes).expect("valid probe");
//! assert_eq!(decoded, probe);
//! ```

use crate::error::DecodeError;

/// Size of the probe header (sequence + timestamp).
pub const PROBE_HEADER_SIZE: usize = 16;

/// Size of the echo reply header (sequence + echoed timestamp + reflector timestamp).
pub const REPLY_HEADER_SIZE: usize = 24;

/// Smallest datagram that can carry a probe.
pub const MIN_PACKET_SIZE: usize = PROBE_HEADER_SIZE;

/// Largest UDP payload over IPv4.
pub const MAX_PACKET_SIZE: usize = 65_507;

/// A single timestamped, sequenced probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbePacket {
    /// Probe number, unique and strictly increasing per session
    pub sequence: u64,
    /// Send time in nanoseconds of the sender's monotonic clock
    pub send_timestamp: u64,
    /// Number of zero bytes after the header
    pub payload_size: u32,
}

impl ProbePacket {
    pub fn new(sequence: u64, send_timestamp: u64, payload_size: u32) -> Self {
        Self {
            sequence,
            send_timestamp,
            payload_size,
        }
    }

    /// Builds a probe whose encoded length is exactly `packet_size` bytes.
    ///
    /// `packet_size` below the header size is clamped to the header size.
    pub fn sized(sequence: u64, send_timestamp: u64, packet_size: usize) -> Self {
        let payload = packet_size.saturating_sub(PROBE_HEADER_SIZE);
        Self::new(sequence, send_timestamp, payload as u32)
    }

    /// Total datagram length for this probe.
    pub fn encoded_len(&self) -> usize {
        PROBE_HEADER_SIZE + self.payload_size as usize
    }
}

/// A probe echoed back by the peer in round-trip mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EchoReply {
    /// Sequence of the probe being answered
    pub sequence: u64,
    /// The probe's original send timestamp, unchanged
    pub send_timestamp: u64,
    /// Reflector's clock when the reply was built (not comparable to ours)
    pub reflect_timestamp: u64,
    /// Number of zero bytes after the header
    pub payload_size: u32,
}

impl EchoReply {
    /// Builds the reply to `probe`, keeping the datagram at least as long as the probe.
    pub fn answer(probe: &ProbePacket, reflect_timestamp: u64) -> Self {
        let len = probe.encoded_len().max(REPLY_HEADER_SIZE);
        Self {
            sequence: probe.sequence,
            send_timestamp: probe.send_timestamp,
            reflect_timestamp,
            payload_size: (len - REPLY_HEADER_SIZE) as u32,
        }
    }

    pub fn encoded_len(&self) -> usize {
        REPLY_HEADER_SIZE + self.payload_size as usize
    }

    /// Serializes the reply into `buf`, replacing its contents.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.clear();
        buf.extend_from_slice(&self.sequence.to_be_bytes());
        buf.extend_from_slice(&self.send_timestamp.to_be_bytes());
        buf.extend_from_slice(&self.reflect_timestamp.to_be_bytes());
        buf.resize(self.encoded_len(), 0);
    }

    /// Parses an echo reply.
    ///
    /// # Errors
    ///
    /// `MalformedPacket` when the buffer is shorter than [`REPLY_HEADER_SIZE`],
    /// `CorruptPadding` when the padding is not all zeros.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() < REPLY_HEADER_SIZE {
            return Err(DecodeError::MalformedPacket {
                len: bytes.len(),
                min: REPLY_HEADER_SIZE,
            });
        }
        check_padding(bytes, REPLY_HEADER_SIZE)?;

        Ok(Self {
            sequence: read_u64(bytes, 0),
            send_timestamp: read_u64(bytes, 8),
            reflect_timestamp: read_u64(bytes, 16),
            payload_size: (bytes.len() - REPLY_HEADER_SIZE) as u32,
        })
    }
}

/// Serializes a probe into a new buffer.
pub fn encode(packet: &ProbePacket) -> Vec<u8> {
    let mut buf = Vec::with_capacity(packet.encoded_len());
    encode_into(packet, &mut buf);
    buf
}

/// Serializes a probe into `buf`, replacing its contents.
///
/// Lets the sender reuse one allocation for the whole session.
pub fn encode_into(packet: &ProbePacket, buf: &mut Vec<u8>) {
    buf.clear();
    buf.extend_from_slice(&packet.sequence.to_be_bytes());
    buf.extend_from_slice(&packet.send_timestamp.to_be_bytes());
    buf.resize(packet.encoded_len(), 0);
}

/// Overwrites the timestamp field of an already encoded probe.
///
/// The sender encodes first and stamps last, right before handing the buffer
/// to the channel, so encoding time does not show up as latency.
pub fn stamp_timestamp(buf: &mut [u8], send_timestamp: u64) {
    if buf.len() >= PROBE_HEADER_SIZE {
        buf[8..16].copy_from_slice(&send_timestamp.to_be_bytes());
    }
}

/// Parses a probe, taking the payload size from the buffer length.
///
/// # Errors
///
/// `MalformedPacket` when the buffer is shorter than the header,
/// `CorruptPadding` when the padding is not all zeros.
pub fn decode(bytes: &[u8]) -> Result<ProbePacket, DecodeError> {
    if bytes.len() < PROBE_HEADER_SIZE {
        return Err(DecodeError::MalformedPacket {
            len: bytes.len(),
            min: PROBE_HEADER_SIZE,
        });
    }
    check_padding(bytes, PROBE_HEADER_SIZE)?;

    Ok(ProbePacket {
        sequence: read_u64(bytes, 0),
        send_timestamp: read_u64(bytes, 8),
        payload_size: (bytes.len() - PROBE_HEADER_SIZE) as u32,
    })
}

/// Parses a probe that must be exactly as long as the session's packet size.
///
/// # Errors
///
/// Everything [`decode`] rejects, plus `TruncatedPayload` when fewer than
/// `packet_size` bytes arrived.
pub fn decode_sized(bytes: &[u8], packet_size: usize) -> Result<ProbePacket, DecodeError> {
    if bytes.len() < PROBE_HEADER_SIZE {
        return Err(DecodeError::MalformedPacket {
            len: bytes.len(),
            min: PROBE_HEADER_SIZE,
        });
    }
    if bytes.len() < packet_size {
        return Err(DecodeError::TruncatedPayload {
            expected: packet_size,
            actual: bytes.len(),
        });
    }
    decode(bytes)
}

/// Reads the sequence number without validating the rest of the datagram.
pub fn peek_sequence(bytes: &[u8]) -> Option<u64> {
    (bytes.len() >= 8).then(|| read_u64(bytes, 0))
}

fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_be_bytes(raw)
}

fn check_padding(bytes: &[u8], header: usize) -> Result<(), DecodeError> {
    match bytes[header..].iter().position(|&b| b != 0) {
        Some(pos) => Err(DecodeError::CorruptPadding {
            offset: header + pos,
        }),
        None => Ok(()),
    }
}
