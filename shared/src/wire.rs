//! Wire format for every datagram exchanged between server and clients.
//!
//! A datagram is a fixed 28-byte [`Header`] followed by `header.length`
//! payload bytes. All multi-byte integers are big-endian.
//!
//! ```text
//!  0       4   5   6       8      10              14              18
//!  +-------+---+---+-------+-------+---------------+---------------+
//!  | "GSSP"|ver|typ|  len  | snap  |   sequence    |    ack num    |
//!  +-------+---+---+-------+-------+---------------+---------------+
//!  |           timestamp (ms since epoch)          | csum  | payload...
//!  +-----------------------------------------------+-------+
//!  18                                              26      28
//! ```
//!
//! The header is serialized with `bincode` configured for big-endian,
//! fixed-width integers, which produces exactly the layout above. The
//! checksum is the RFC 1071 Internet checksum over the header (checksum
//! field zeroed) followed by the payload.
//!
//! Decoding fails closed: [`decode`] never panics and reports `valid ==
//! false` for anything truncated, foreign or corrupted.

use bincode::Options;
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Protocol tag carried in the first four bytes of every datagram.
pub const PROTOCOL_TAG: [u8; 4] = *b"GSSP";

/// Wire format version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Serialized header size in bytes.
pub const HEADER_LEN: usize = 28;

/// Largest payload the `length` field can describe.
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

/// Receive buffer size that never truncates a datagram this codec produces.
pub const MAX_DATAGRAM_LEN: usize = HEADER_LEN + MAX_PAYLOAD_LEN;

const OFF_CHECKSUM: usize = 26;

/// Message kinds. The discriminant is the on-wire code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    JoinRequest = 0,
    JoinResponse = 1,
    ClaimRequest = 2,
    BoardSnapshot = 3,
    GameOver = 4,
    Leave = 5,
    GameStart = 6,
    Ack = 7,
    WaitingRoom = 8,
    Leaderboard = 9,
    Heartbeat = 10,
}

impl MessageType {
    /// Control packets are not sequenced and never acknowledged.
    pub fn is_control(self) -> bool {
        matches!(self, MessageType::Ack | MessageType::Heartbeat)
    }

    pub fn code(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for MessageType {
    type Error = u8;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Ok(match code {
            0 => MessageType::JoinRequest,
            1 => MessageType::JoinResponse,
            2 => MessageType::ClaimRequest,
            3 => MessageType::BoardSnapshot,
            4 => MessageType::GameOver,
            5 => MessageType::Leave,
            6 => MessageType::GameStart,
            7 => MessageType::Ack,
            8 => MessageType::WaitingRoom,
            9 => MessageType::Leaderboard,
            10 => MessageType::Heartbeat,
            other => return Err(other),
        })
    }
}

/// Fixed-size packet header, in host representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Header {
    pub protocol: [u8; 4],
    pub version: u8,
    /// Raw message code; see [`Header::kind`].
    pub msg_type: u8,
    /// Number of payload bytes following the header.
    pub length: u16,
    /// Low 16 bits of the snapshot id for `BoardSnapshot`, else 0.
    pub snapshot_id: u16,
    pub seq: u32,
    pub ack: u32,
    /// Sender wall clock in milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub checksum: u16,
}

impl Header {
    /// Interprets the raw message code. Unknown codes are returned as `Err`.
    pub fn kind(&self) -> Result<MessageType, u8> {
        MessageType::try_from(self.msg_type)
    }

    /// True for ACK / HEARTBEAT packets, which carry no sequence number.
    pub fn is_control(&self) -> bool {
        self.kind().map(MessageType::is_control).unwrap_or(false)
    }
}

/// A validated datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: Header,
    pub payload: Vec<u8>,
}

/// Outcome of [`decode`]. When `valid` is false the header and payload are
/// meaningless and the datagram must be discarded.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DecodeResult {
    pub header: Header,
    pub payload: Vec<u8>,
    pub valid: bool,
}

impl DecodeResult {
    /// Converts a valid result into a [`Packet`].
    pub fn into_packet(self) -> Option<Packet> {
        if self.valid {
            Some(Packet {
                header: self.header,
                payload: self.payload,
            })
        } else {
            None
        }
    }
}

/// Reasons a datagram cannot be encoded or is rejected on decode.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("datagram of {0} bytes is shorter than the 28-byte header")]
    Truncated(usize),
    #[error("length field says {declared} payload bytes but {actual} are present")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("foreign protocol tag {0:?}")]
    BadProtocol([u8; 4]),
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),
    #[error("checksum mismatch (carried {carried:#06x}, computed {computed:#06x})")]
    ChecksumMismatch { carried: u16, computed: u16 },
    #[error("payload of {0} bytes does not fit the length field")]
    PayloadTooLarge(usize),
    #[error("header serialization failed: {0}")]
    Serialization(#[from] bincode::Error),
}

fn header_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_big_endian()
        .with_fixint_encoding()
}

/// Current wall clock in milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}

/// Encodes a datagram stamped with the current wall clock.
pub fn encode(
    msg_type: MessageType,
    seq: u32,
    ack: u32,
    snapshot_id: u16,
    payload: &[u8],
) -> Result<Vec<u8>, WireError> {
    encode_at(msg_type, seq, ack, snapshot_id, payload, now_millis())
}

/// Encodes a datagram with an explicit timestamp.
pub fn encode_at(
    msg_type: MessageType,
    seq: u32,
    ack: u32,
    snapshot_id: u16,
    payload: &[u8],
    timestamp: u64,
) -> Result<Vec<u8>, WireError> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(WireError::PayloadTooLarge(payload.len()));
    }

    let header = Header {
        protocol: PROTOCOL_TAG,
        version: PROTOCOL_VERSION,
        msg_type: msg_type.code(),
        length: payload.len() as u16,
        snapshot_id,
        seq,
        ack,
        timestamp,
        checksum: 0,
    };

    let mut buf = vec![0u8; HEADER_LEN + payload.len()];
    header_options().serialize_into(&mut buf[..HEADER_LEN], &header)?;
    buf[HEADER_LEN..].copy_from_slice(payload);

    let checksum = internet_checksum(&buf);
    buf[OFF_CHECKSUM..OFF_CHECKSUM + 2].copy_from_slice(&checksum.to_be_bytes());
    Ok(buf)
}

/// Parses and validates a datagram, reporting why it was rejected.
pub fn try_decode(buf: &[u8]) -> Result<Packet, WireError> {
    if buf.len() < HEADER_LEN {
        return Err(WireError::Truncated(buf.len()));
    }

    let header: Header = header_options().deserialize(&buf[..HEADER_LEN])?;

    if header.protocol != PROTOCOL_TAG {
        return Err(WireError::BadProtocol(header.protocol));
    }
    if header.version != PROTOCOL_VERSION {
        return Err(WireError::UnsupportedVersion(header.version));
    }

    let actual = buf.len() - HEADER_LEN;
    if header.length as usize != actual {
        return Err(WireError::LengthMismatch {
            declared: header.length as usize,
            actual,
        });
    }

    let mut scratch = buf.to_vec();
    scratch[OFF_CHECKSUM..OFF_CHECKSUM + 2].copy_from_slice(&[0, 0]);
    let computed = internet_checksum(&scratch);
    if computed != header.checksum {
        return Err(WireError::ChecksumMismatch {
            carried: header.checksum,
            computed,
        });
    }

    Ok(Packet {
        header,
        payload: buf[HEADER_LEN..].to_vec(),
    })
}

/// Parses a datagram, failing closed.
pub fn decode(buf: &[u8]) -> DecodeResult {
    match try_decode(buf) {
        Ok(packet) => DecodeResult {
            header: packet.header,
            payload: packet.payload,
            valid: true,
        },
        Err(_) => DecodeResult::default(),
    }
}

/// One's-complement sum of 16-bit big-endian words, odd byte zero-padded.
pub fn internet_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);

    for word in &mut chunks {
        sum += u32::from(u16::from_be_bytes([word[0], word[1]]));
        // Fold early so long payloads cannot overflow the accumulator.
        if sum > 0xffff {
            sum = (sum & 0xffff) + (sum >> 16);
        }
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(*last) << 8;
    }

    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }

    !(sum as u16)
}
