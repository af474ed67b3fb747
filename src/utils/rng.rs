//! Deterministic random number generation for weight initialisation and
//! dropout masks.
//!
//! A small xorshift generator keeps every experiment reproducible from a
//! single seed without pulling a full RNG stack into the numerical core.

use std::time::{SystemTime, UNIX_EPOCH};

const FALLBACK_SEED: u64 = 0x9e3779b97f4a7c15;

/// Xorshift64 generator.
#[derive(Debug, Clone)]
pub struct SimpleRng {
    state: u64,
}

impl SimpleRng {
    /// Create a generator from an explicit seed (zero maps to a fixed value).
    pub fn new(seed: u64) -> Self {
        let state = if seed == 0 { FALLBACK_SEED } else { seed };
        Self { state }
    }

    /// Create a generator seeded from the wall clock.
    pub fn from_time() -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;
        Self::new(nanos)
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }

    /// Uniform sample in [0, 1).
    pub fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }

    /// Uniform sample in [low, high).
    pub fn gen_range_f64(&mut self, low: f64, high: f64) -> f64 {
        low + (high - low) * self.next_f64()
    }

    /// Standard normal sample (Box-Muller).
    pub fn next_gaussian(&mut self) -> f64 {
        // 1 - u keeps the argument of ln strictly positive
        let u1 = 1.0 - self.next_f64();
        let u2 = self.next_f64();
        (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
    }

    /// Bernoulli draw that succeeds with probability `p`.
    pub fn bernoulli(&mut self, p: f64) -> bool {
        self.next_f64() < p
    }
}
