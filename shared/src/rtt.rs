//! Round-trip time estimation and the retransmission timeout derived from it.
//!
//! `estimated = (1 - α)·estimated + α·sample`, then
//! `dev = (1 - β)·dev + β·|sample - estimated|` using the freshly updated
//! estimate, and `RTO = estimated + 4·dev` clamped to
//! [`MIN_RTO_MS`, `MAX_RTO_MS`].

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const INITIAL_ESTIMATED_RTT_MS: f64 = 100.0;
pub const INITIAL_DEV_RTT_MS: f64 = 50.0;
pub const ALPHA: f64 = 0.125;
pub const BETA: f64 = 0.25;
pub const MIN_RTO_MS: f64 = 50.0;
pub const MAX_RTO_MS: f64 = 2000.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RttEstimator {
    estimated_ms: f64,
    dev_ms: f64,
    samples: u64,
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl RttEstimator {
    pub fn new() -> Self {
        Self {
            estimated_ms: INITIAL_ESTIMATED_RTT_MS,
            dev_ms: INITIAL_DEV_RTT_MS,
            samples: 0,
        }
    }

    /// Feeds one RTT measurement. Callers must skip retransmitted packets.
    pub fn record_sample(&mut self, sample: Duration) {
        let sample_ms = sample.as_secs_f64() * 1000.0;
        self.estimated_ms = (1.0 - ALPHA) * self.estimated_ms + ALPHA * sample_ms;
        self.dev_ms = (1.0 - BETA) * self.dev_ms + BETA * (sample_ms - self.estimated_ms).abs();
        self.samples += 1;
    }

    pub fn estimated_ms(&self) -> f64 {
        self.estimated_ms
    }

    pub fn dev_ms(&self) -> f64 {
        self.dev_ms
    }

    pub fn samples(&self) -> u64 {
        self.samples
    }

    pub fn rto_ms(&self) -> f64 {
        (self.estimated_ms + 4.0 * self.dev_ms).clamp(MIN_RTO_MS, MAX_RTO_MS)
    }

    pub fn rto(&self) -> Duration {
        Duration::from_secs_f64(self.rto_ms() / 1000.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_initial_rto() {
        let rtt = RttEstimator::new();
        assert_approx_eq!(rtt.rto_ms(), 300.0);
        assert_eq!(rtt.samples(), 0);
    }

    #[test]
    fn test_single_sample_update() {
        let mut rtt = RttEstimator::new();
        rtt.record_sample(Duration::from_millis(20));

        // 0.875 * 100 + 0.125 * 20
        assert_approx_eq!(rtt.estimated_ms(), 90.0);
        // 0.75 * 50 + 0.25 * |20 - 90|
        assert_approx_eq!(rtt.dev_ms(), 55.0);
        assert_approx_eq!(rtt.rto_ms(), 310.0);
        assert_eq!(rtt.samples(), 1);
    }

    #[test]
    fn test_rto_converges_and_clamps_low() {
        let mut rtt = RttEstimator::new();
        for _ in 0..200 {
            rtt.record_sample(Duration::from_millis(1));
        }
        assert!(rtt.estimated_ms() < 2.0);
        assert_approx_eq!(rtt.rto_ms(), MIN_RTO_MS);
        assert_eq!(rtt.rto(), Duration::from_millis(50));
    }

    #[test]
    fn test_rto_clamps_high() {
        let mut rtt = RttEstimator::new();
        for _ in 0..100 {
            rtt.record_sample(Duration::from_secs(10));
        }
        assert_approx_eq!(rtt.rto_ms(), MAX_RTO_MS);
    }
}
