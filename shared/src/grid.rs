//! The authoritative ownership grid.
//!
//! Each cell stores its owner (0 = unclaimed) and the timestamp of the claim
//! that won it. A claim only wins if its timestamp is strictly greater than
//! the cell's, so the final owner is independent of arrival order.

use crate::payload::{pack_cells, unpack_cells, MAX_CELL_VALUE};
use serde::{Deserialize, Serialize};

pub const DEFAULT_ROWS: usize = 20;
pub const DEFAULT_COLS: usize = 20;

/// Owner value of an unclaimed cell.
pub const UNCLAIMED: u8 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClaimOutcome {
    Accepted { previous_owner: u8 },
    OutOfRange,
    /// The cell already holds a claim at least as recent.
    Outdated { cell_timestamp: u64 },
    /// Claimant is not an active player in an active match.
    NotActive,
}

impl ClaimOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, ClaimOutcome::Accepted { .. })
    }
}

/// Immutable copy of the grid at one snapshot id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridSnapshot {
    pub id: u32,
    pub rows: usize,
    pub cols: usize,
    /// Row-major owners.
    pub cells: Vec<u8>,
}

impl GridSnapshot {
    pub fn owner(&self, row: usize, col: usize) -> Option<u8> {
        if row < self.rows && col < self.cols {
            self.cells.get(row * self.cols + col).copied()
        } else {
            None
        }
    }

    pub fn count_owned_by(&self, player_id: u8) -> usize {
        self.cells.iter().filter(|owner| **owner == player_id).count()
    }

    pub fn packed(&self) -> Vec<u8> {
        pack_cells(&self.cells)
    }

    pub fn unpack(id: u32, packed: &[u8], rows: usize, cols: usize) -> Option<Self> {
        unpack_cells(packed, rows, cols).map(|cells| Self {
            id,
            rows,
            cols,
            cells,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Grid {
    rows: usize,
    cols: usize,
    owners: Vec<u8>,
    timestamps: Vec<u64>,
}

impl Default for Grid {
    fn default() -> Self {
        Self::new(DEFAULT_ROWS, DEFAULT_COLS)
    }
}

impl Grid {
    pub fn new(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            owners: vec![UNCLAIMED; rows * cols],
            timestamps: vec![0; rows * cols],
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    fn index(&self, row: usize, col: usize) -> Option<usize> {
        (row < self.rows && col < self.cols).then(|| row * self.cols + col)
    }

    pub fn owner(&self, row: usize, col: usize) -> Option<u8> {
        self.index(row, col).map(|i| self.owners[i])
    }

    pub fn cell_timestamp(&self, row: usize, col: usize) -> Option<u64> {
        self.index(row, col).map(|i| self.timestamps[i])
    }

    /// Applies the last-writer-wins rule for a claim stamped `timestamp`.
    pub fn apply_claim(&mut self, row: usize, col: usize, player_id: u8, timestamp: u64) -> ClaimOutcome {
        debug_assert!(player_id != UNCLAIMED && player_id <= MAX_CELL_VALUE);
        let Some(i) = self.index(row, col) else {
            return ClaimOutcome::OutOfRange;
        };

        if timestamp <= self.timestamps[i] {
            return ClaimOutcome::Outdated {
                cell_timestamp: self.timestamps[i],
            };
        }

        let previous_owner = self.owners[i];
        self.owners[i] = player_id;
        self.timestamps[i] = timestamp;
        ClaimOutcome::Accepted { previous_owner }
    }

    /// Frees every cell owned by `player_id`. Returns how many were freed.
    pub fn release(&mut self, player_id: u8) -> usize {
        let mut freed = 0;
        for (owner, timestamp) in self.owners.iter_mut().zip(self.timestamps.iter_mut()) {
            if *owner == player_id {
                *owner = UNCLAIMED;
                *timestamp = 0;
                freed += 1;
            }
        }
        freed
    }

    pub fn count_owned_by(&self, player_id: u8) -> usize {
        self.owners.iter().filter(|owner| **owner == player_id).count()
    }

    pub fn reset(&mut self) {
        self.owners.fill(UNCLAIMED);
        self.timestamps.fill(0);
    }

    pub fn snapshot(&self, id: u32) -> GridSnapshot {
        GridSnapshot {
            id,
            rows: self.rows,
            cols: self.cols,
            cells: self.owners.clone(),
        }
    }
}
