//! Backoff strategies for the retry wrapper.
//!
//! Attempt semantics: attempt index `0` is the initial call (no delay); retries start at
//! `attempt = 1`. Exponential delays follow `min(base * 2^(attempt-1), cap)`.
//!
//! Example
//! ```rust
//! use std::time::Duration;
//! use turnstile::Backoff;
//!
//! let backoff = Backoff::exponential(Duration::from_millis(100))
//!     .with_max(Duration::from_secs(2))
//!     .unwrap();
//! assert_eq!(backoff.delay(0), Duration::ZERO); // initial call
//! assert_eq!(backoff.delay(1), Duration::from_millis(100));
//! assert_eq!(backoff.delay(2), Duration::from_millis(200));
//! assert_eq!(backoff.delay(6), Duration::from_secs(2)); // capped
//! ```
//!
//! Computations that would overflow saturate to `MAX_BACKOFF` (1 day).

use std::time::Duration;

/// Maximum delay used when calculations overflow (1 day).
pub const MAX_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);

/// Errors returned by backoff configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackoffError {
    #[error("max must be greater than zero")]
    MaxMustBePositive,
    #[error("max ({max:?}) must be >= base ({base:?})")]
    MaxLessThanBase { base: Duration, max: Duration },
}

/// Doubling delay schedule between retry attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Option<Duration>,
}

impl Backoff {
    /// Doubling delay starting at `base`, uncapped until `with_max`.
    pub fn exponential(base: Duration) -> Self {
        Self { base, max: None }
    }

    /// Cap the delay. Rejects zero caps and caps below `base`.
    pub fn with_max(mut self, max: Duration) -> Result<Self, BackoffError> {
        if max.is_zero() {
            return Err(BackoffError::MaxMustBePositive);
        }
        if max < self.base {
            return Err(BackoffError::MaxLessThanBase { base: self.base, max });
        }
        self.max = Some(max);
        Ok(self)
    }

    /// Delay before `attempt` (0 = initial call, no delay).
    pub fn delay(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = attempt.saturating_sub(1).min(u32::MAX as usize) as u32;
        let multiplier = 2u128.saturating_pow(exponent);
        let nanos = self.base.as_nanos().saturating_mul(multiplier);
        let exp_delay = Duration::from_nanos(nanos.min(MAX_BACKOFF.as_nanos()) as u64);
        let capped = self.max.map(|m| exp_delay.min(m)).unwrap_or(exp_delay);
        capped.min(MAX_BACKOFF)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_doubles_until_cap() {
        let backoff = Backoff::exponential(Duration::from_secs(2))
            .with_max(Duration::from_secs(10))
            .unwrap();
        let delays: Vec<_> = (1..=5).map(|a| backoff.delay(a).as_secs()).collect();
        assert_eq!(delays, vec![2, 4, 8, 10, 10]);
    }

    #[test]
    fn exponential_saturates_on_huge_attempts() {
        let backoff = Backoff::exponential(Duration::from_secs(1));
        assert_eq!(backoff.delay(10_000), MAX_BACKOFF);
        assert_eq!(backoff.delay(usize::MAX), MAX_BACKOFF);
    }

    #[test]
    fn with_max_validates_inputs() {
        assert_eq!(
            Backoff::exponential(Duration::from_secs(1)).with_max(Duration::ZERO),
            Err(BackoffError::MaxMustBePositive)
        );
        assert_eq!(
            Backoff::exponential(Duration::from_secs(2)).with_max(Duration::from_secs(1)),
            Err(BackoffError::MaxLessThanBase {
                base: Duration::from_secs(2),
                max: Duration::from_secs(1)
            })
        );
    }

    #[test]
    fn delays_are_non_decreasing() {
        let backoff = Backoff::exponential(Duration::from_millis(3))
            .with_max(Duration::from_millis(50))
            .unwrap();
        let delays: Vec<_> = (1..20).map(|a| backoff.delay(a)).collect();
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert!(delays.iter().all(|d| *d <= Duration::from_millis(50)));
    }
}
