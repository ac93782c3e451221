use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::ScrollSection;

/// Randomized scroll cadence: increment sizes and pauses drawn uniformly
/// from the configured envelopes.
#[derive(Debug)]
pub struct ScrollPacer {
    increment_px: [u32; 2],
    pause_ms: [u32; 2],
    rng: StdRng,
}

impl ScrollPacer {
    pub fn new(config: &ScrollSection) -> Self {
        Self::with_rng(config, StdRng::from_entropy())
    }

    /// Deterministic pacing for reproducible runs.
    pub fn seeded(config: &ScrollSection, seed: u64) -> Self {
        Self::with_rng(config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: &ScrollSection, rng: StdRng) -> Self {
        Self {
            increment_px: config.increment_px,
            pause_ms: config.pause_ms,
            rng,
        }
    }

    pub fn next_increment(&mut self) -> f64 {
        self.sample(self.increment_px) as f64
    }

    pub fn next_pause(&mut self) -> Duration {
        Duration::from_millis(self.sample(self.pause_ms) as u64)
    }

    fn sample(&mut self, bounds: [u32; 2]) -> u32 {
        let low = bounds[0].min(bounds[1]);
        let high = bounds[0].max(bounds[1]);
        self.rng.gen_range(low..=high)
    }
}
