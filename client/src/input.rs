//! Automatic claim input for headless players

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use shared::GridSnapshot;

/// Picks random cells the local player does not own yet
pub struct AutoClaimer {
    rng: StdRng,
    rows: usize,
    cols: usize,
}

impl AutoClaimer {
    pub fn new(rows: usize, cols: usize) -> Self {
        Self {
            rng: StdRng::from_entropy(),
            rows,
            cols,
        }
    }

    /// Deterministic picks, for reproducible bots and tests.
    pub fn with_seed(rows: usize, cols: usize, seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            rows,
            cols,
        }
    }

    /// Chooses the next (row, col) to claim for `player_id`.
    ///
    /// Without a snapshot every cell is a candidate. Returns `None` once the
    /// player owns the whole grid.
    pub fn pick(&mut self, grid: Option<&GridSnapshot>, player_id: u8) -> Option<(u8, u8)> {
        let rows = self.rows.min(u8::MAX as usize + 1);
        let cols = self.cols.min(u8::MAX as usize + 1);

        let candidates: Vec<(u8, u8)> = (0..rows)
            .flat_map(|row| (0..cols).map(move |col| (row, col)))
            .filter(|(row, col)| {
                grid.and_then(|g| g.owner(*row, *col))
                    .map_or(true, |owner| owner != player_id)
            })
            .map(|(row, col)| (row as u8, col as u8))
            .collect();

        candidates.choose(&mut self.rng).copied()
    }
}
