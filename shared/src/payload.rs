//! Payload codecs for each message kind.
//!
//! The payload shape is fixed per [`MessageType`]. [`Message::parse`] turns a
//! delivered payload into a typed message and [`Message::to_payload`] is its
//! inverse. Malformed payloads are protocol-level errors: the datagram is
//! dropped and counted but the peer is not disconnected.

use crate::wire::MessageType;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Bytes per leaderboard record: player id, score (u16), rank.
pub const LEADERBOARD_RECORD_LEN: usize = 4;

/// Largest value a packed cell can hold.
pub const MAX_CELL_VALUE: u8 = 0x0F;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PayloadError {
    #[error("unknown message type {0}")]
    UnknownType(u8),
    #[error("{kind:?} payload is {actual} bytes, expected {expected}")]
    Malformed {
        kind: MessageType,
        expected: usize,
        actual: usize,
    },
    #[error("{0:?} is a control message and carries no payload")]
    Control(MessageType),
}

/// Body of a CLAIM_REQUEST.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimRequest {
    pub row: u8,
    pub col: u8,
    /// Low 16 bits of the sender's piggybacked ack.
    pub ack_hint: u16,
}

/// One row of the end-of-match leaderboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    pub player_id: u8,
    pub score: u16,
    pub rank: u8,
}

/// Typed view of a reliable message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    JoinRequest,
    /// `player_id == 0` means the join was refused.
    JoinResponse { player_id: u8 },
    ClaimRequest(ClaimRequest),
    /// Grid stays packed here; unpacking needs the grid dimensions.
    BoardSnapshot { snapshot_id: u32, packed: Vec<u8> },
    GameOver,
    Leave,
    GameStart { duration_secs: u16 },
    WaitingRoom { players: Vec<u8>, required: u8 },
    Leaderboard(Vec<LeaderboardEntry>),
}

impl Message {
    pub fn kind(&self) -> MessageType {
        match self {
            Message::JoinRequest => MessageType::JoinRequest,
            Message::JoinResponse { .. } => MessageType::JoinResponse,
            Message::ClaimRequest(_) => MessageType::ClaimRequest,
            Message::BoardSnapshot { .. } => MessageType::BoardSnapshot,
            Message::GameOver => MessageType::GameOver,
            Message::Leave => MessageType::Leave,
            Message::GameStart { .. } => MessageType::GameStart,
            Message::WaitingRoom { .. } => MessageType::WaitingRoom,
            Message::Leaderboard(_) => MessageType::Leaderboard,
        }
    }

    /// Parses the payload of a delivered packet with raw type `code`.
    pub fn parse(code: u8, payload: &[u8]) -> Result<Message, PayloadError> {
        let kind = MessageType::try_from(code).map_err(PayloadError::UnknownType)?;
        let expect = |expected: usize| {
            if payload.len() == expected {
                Ok(())
            } else {
                Err(PayloadError::Malformed {
                    kind,
                    expected,
                    actual: payload.len(),
                })
            }
        };

        match kind {
            MessageType::JoinRequest => expect(0).map(|_| Message::JoinRequest),
            MessageType::GameOver => expect(0).map(|_| Message::GameOver),
            MessageType::Leave => expect(0).map(|_| Message::Leave),
            MessageType::JoinResponse => {
                expect(1)?;
                Ok(Message::JoinResponse {
                    player_id: payload[0],
                })
            }
            MessageType::ClaimRequest => {
                expect(4)?;
                Ok(Message::ClaimRequest(ClaimRequest {
                    row: payload[0],
                    col: payload[1],
                    ack_hint: u16::from_be_bytes([payload[2], payload[3]]),
                }))
            }
            MessageType::GameStart => {
                expect(2)?;
                Ok(Message::GameStart {
                    duration_secs: u16::from_be_bytes([payload[0], payload[1]]),
                })
            }
            MessageType::BoardSnapshot => {
                if payload.len() < 4 {
                    return Err(PayloadError::Malformed {
                        kind,
                        expected: 4,
                        actual: payload.len(),
                    });
                }
                Ok(Message::BoardSnapshot {
                    snapshot_id: u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]),
                    packed: payload[4..].to_vec(),
                })
            }
            MessageType::WaitingRoom => {
                let count = payload.first().copied().unwrap_or(0) as usize;
                expect(count + 2)?;
                Ok(Message::WaitingRoom {
                    players: payload[1..=count].to_vec(),
                    required: payload[count + 1],
                })
            }
            MessageType::Leaderboard => Ok(Message::Leaderboard(decode_leaderboard(payload))),
            MessageType::Ack | MessageType::Heartbeat => Err(PayloadError::Control(kind)),
        }
    }

    pub fn to_payload(&self) -> Vec<u8> {
        match self {
            Message::JoinRequest | Message::GameOver | Message::Leave => Vec::new(),
            Message::JoinResponse { player_id } => vec![*player_id],
            Message::ClaimRequest(claim) => {
                let mut buf = vec![claim.row, claim.col];
                buf.extend_from_slice(&claim.ack_hint.to_be_bytes());
                buf
            }
            Message::GameStart { duration_secs } => duration_secs.to_be_bytes().to_vec(),
            Message::BoardSnapshot {
                snapshot_id,
                packed,
            } => {
                let mut buf = Vec::with_capacity(4 + packed.len());
                buf.extend_from_slice(&snapshot_id.to_be_bytes());
                buf.extend_from_slice(packed);
                buf
            }
            Message::WaitingRoom { players, required } => {
                let players = &players[..players.len().min(u8::MAX as usize)];
                let mut buf = Vec::with_capacity(players.len() + 2);
                buf.push(players.len() as u8);
                buf.extend_from_slice(players);
                buf.push(*required);
                buf
            }
            Message::Leaderboard(entries) => encode_leaderboard(entries),
        }
    }
}

/// Number of bytes a packed `rows × cols` grid occupies.
pub fn packed_len(rows: usize, cols: usize) -> usize {
    (rows * cols + 1) / 2
}

/// Packs row-major cell values two per byte, high nibble first.
pub fn pack_cells(cells: &[u8]) -> Vec<u8> {
    cells
        .chunks(2)
        .map(|pair| {
            debug_assert!(pair.iter().all(|v| *v <= MAX_CELL_VALUE));
            let high = pair[0] & MAX_CELL_VALUE;
            let low = pair.get(1).copied().unwrap_or(0) & MAX_CELL_VALUE;
            (high << 4) | low
        })
        .collect()
}

/// Inverse of [`pack_cells`]. Returns `None` when `packed` has the wrong size.
pub fn unpack_cells(packed: &[u8], rows: usize, cols: usize) -> Option<Vec<u8>> {
    if packed.len() != packed_len(rows, cols) {
        return None;
    }

    let mut cells = Vec::with_capacity(rows * cols);
    for byte in packed {
        cells.push(byte >> 4);
        cells.push(byte & MAX_CELL_VALUE);
    }
    cells.truncate(rows * cols);
    Some(cells)
}

/// Count byte followed by fixed 4-byte records. At most 255 entries are kept.
pub fn encode_leaderboard(entries: &[LeaderboardEntry]) -> Vec<u8> {
    let entries = &entries[..entries.len().min(u8::MAX as usize)];
    let mut buf = Vec::with_capacity(1 + entries.len() * LEADERBOARD_RECORD_LEN);
    buf.push(entries.len() as u8);
    for entry in entries {
        buf.push(entry.player_id);
        buf.extend_from_slice(&entry.score.to_be_bytes());
        buf.push(entry.rank);
    }
    buf
}

/// Reads up to `count` records, stopping early when the buffer runs out.
pub fn decode_leaderboard(buf: &[u8]) -> Vec<LeaderboardEntry> {
    let Some((&count, records)) = buf.split_first() else {
        return Vec::new();
    };

    records
        .chunks_exact(LEADERBOARD_RECORD_LEN)
        .take(count as usize)
        .map(|record| LeaderboardEntry {
            player_id: record[0],
            score: u16::from_be_bytes([record[1], record[2]]),
            rank: record[3],
        })
        .collect()
}
