//! Protocol pieces shared by the grid server and its clients: the datagram
//! format, payload codecs, the Selective-Repeat ARQ link, the claim grid and
//! the session events both sides publish.

pub mod arq;
pub mod grid;
pub mod payload;
pub mod rtt;
pub mod wire;

pub use arq::{ArqLink, LinkStats, SendOutcome};
pub use grid::{ClaimOutcome, Grid, GridSnapshot};
pub use payload::{LeaderboardEntry, Message, PayloadError};
pub use wire::{decode, encode, DecodeResult, Header, MessageType, Packet, WireError};

use serde::{Deserialize, Serialize};

/// Player ids are stored in 4-bit grid cells and 0 means unclaimed.
pub const MAX_PLAYER_ID: u8 = 15;

pub const DEFAULT_PORT: u16 = 5005;

/// Match lifecycle as seen by both server and client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    Waiting,
    Active,
    Ended,
}

/// What the core reports to presentation and statistics collaborators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionEvent {
    PeerJoined(u8),
    PeerLeft(u8),
    GridChanged(GridSnapshot),
    PhaseChanged(Phase),
    LeaderboardReady(Vec<LeaderboardEntry>),
}

/// Orders `(player_id, score)` pairs by score descending, then id ascending,
/// and assigns 1-based ranks by position.
pub fn rank_leaderboard(scores: &[(u8, u16)]) -> Vec<LeaderboardEntry> {
    let mut sorted = scores.to_vec();
    sorted.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    sorted
        .into_iter()
        .enumerate()
        .map(|(i, (player_id, score))| LeaderboardEntry {
            player_id,
            score,
            rank: (i + 1).min(u8::MAX as usize) as u8,
        })
        .collect()
}
