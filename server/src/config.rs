//! Server configuration.

use serde::{Deserialize, Serialize};
use shared::arq::DEFAULT_WINDOW_SIZE;
use shared::grid::{DEFAULT_COLS, DEFAULT_ROWS};
use shared::MAX_PLAYER_ID;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the listening socket binds to.
    pub bind_addr: String,
    pub rows: usize,
    pub cols: usize,
    /// ARQ window size N for every peer link.
    pub window_size: u32,
    pub match_duration: Duration,
    /// Players needed to start a match, and to keep one running.
    pub min_players: usize,
    pub max_players: usize,
    /// A peer not heard from for this long is removed.
    pub idle_timeout: Duration,
    /// How long the leaderboard is held before the next waiting room.
    pub end_hold: Duration,
    pub poll_interval: Duration,
    pub retransmit_interval: Duration,
    pub stats_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: format!("127.0.0.1:{}", shared::DEFAULT_PORT),
            rows: DEFAULT_ROWS,
            cols: DEFAULT_COLS,
            window_size: DEFAULT_WINDOW_SIZE,
            match_duration: Duration::from_secs(60),
            min_players: 2,
            max_players: 4,
            idle_timeout: Duration::from_secs(10),
            end_hold: Duration::from_secs(3),
            poll_interval: Duration::from_millis(20),
            retransmit_interval: Duration::from_millis(10),
            stats_interval: Duration::from_secs(5),
        }
    }
}

impl ServerConfig {
    /// Brings out-of-range values back into what the protocol can carry.
    ///
    /// Player ids live in 4-bit cells, so at most 15 players fit; rows and
    /// columns are sent as single bytes.
    pub fn normalized(mut self) -> Self {
        self.max_players = self.max_players.clamp(1, MAX_PLAYER_ID as usize);
        self.min_players = self.min_players.clamp(1, self.max_players);
        self.rows = self.rows.clamp(1, u8::MAX as usize);
        self.cols = self.cols.clamp(1, u8::MAX as usize);
        self.window_size = self.window_size.max(1);
        self
    }

    /// Match length as carried in GAME_START.
    pub fn match_duration_secs(&self) -> u16 {
        self.match_duration.as_secs().min(u16::MAX as u64) as u16
    }
}
