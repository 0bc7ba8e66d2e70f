//! Jitter strategies to keep pollers and retries from moving in lockstep
//!
//! - `None`: exact delays; the retry wrapper's default, so its delays stay non-decreasing.
//! - `Equal`: uniform in `[delay/2, delay]`, never below 1ms for a delay of at least 1ms;
//!   the gate's default for poll intervals, so a poll loop never spins on a zero delay.
//!
//! RNG: `rand`'s thread-local RNG by default; deterministic RNGs can be injected via
//! `apply_with_rng`.

use rand::{rng, Rng};
use std::time::Duration;

/// Jitter strategy for randomizing delays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Jitter {
    /// No jitter - use the exact delay
    #[default]
    None,
    /// Equal jitter: random between delay/2 and delay
    Equal,
}

impl Jitter {
    /// Apply jitter to a delay duration
    pub fn apply(&self, delay: Duration) -> Duration {
        let mut rng = rng();
        self.apply_with_rng(delay, &mut rng)
    }

    /// Apply jitter with a caller-supplied RNG
    pub fn apply_with_rng<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        let millis: u64 = delay.as_millis().try_into().unwrap_or(u64::MAX);
        match self {
            Jitter::None => delay,
            Jitter::Equal if millis == 0 => delay,
            Jitter::Equal => Duration::from_millis(rng.random_range((millis / 2).max(1)..=millis)),
        }
    }
}
