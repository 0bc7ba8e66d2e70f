//! Retry policy for guarded calls
//!
//! Semantics:
//! - `max_attempts` counts total attempts (initial try + retries).
//! - Only `CallError::Inner(E)` values are eligible for retry, and only when the predicate
//!   (by default [`Transient::is_transient`]) accepts them. Gate errors and
//!   non-transient failures return immediately.
//! - Before retry `n` (1-based) the policy sleeps `backoff.delay(n)` passed through the
//!   jitter strategy. With the default `Jitter::None` and an exponential backoff the delays
//!   are non-decreasing and bounded by the cap.
//! - After `max_attempts` transient failures the call ends in `CallError::RetriesExhausted`
//!   carrying the most recent failures.
//!
//! Every attempt is a fresh call of the operation, so when the operation goes through an
//! [`AdmissionGate`](crate::AdmissionGate) each retry is admitted separately and no slot is
//! held while backing off.
//!
//! Example
//! ```rust
//! use std::time::Duration;
//! use turnstile::{Backoff, CallError, RetryPolicy, TransportError};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let policy = RetryPolicy::<TransportError>::builder()
//!     .max_attempts(3)
//!     .backoff(Backoff::exponential(Duration::from_millis(10)))
//!     .build()
//!     .unwrap();
//! let result: Result<(), CallError<TransportError>> =
//!     policy.execute(|| async { Err(CallError::Inner(TransportError::Status(404))) }).await;
//! assert!(result.unwrap_err().is_inner());
//! # });
//! ```

use crate::backoff::Backoff;
use crate::config::{ConfigError, RetryConfig};
use crate::endpoint::Transient;
use crate::error::{CallError, MAX_RETRY_FAILURES};
use crate::jitter::Jitter;
use crate::sleeper::{Sleeper, TokioSleeper};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Retry policy combining backoff, jitter, predicate, and sleeper.
pub struct RetryPolicy<E> {
    max_attempts: usize,
    backoff: Backoff,
    jitter: Jitter,
    should_retry: Arc<dyn Fn(&E) -> bool + Send + Sync>,
    sleeper: Arc<dyn Sleeper>,
}

impl<E> Clone for RetryPolicy<E> {
    fn clone(&self) -> Self {
        Self {
            max_attempts: self.max_attempts,
            backoff: self.backoff.clone(),
            jitter: self.jitter,
            should_retry: Arc::clone(&self.should_retry),
            sleeper: Arc::clone(&self.sleeper),
        }
    }
}

impl<E> std::fmt::Debug for RetryPolicy<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .field("jitter", &self.jitter)
            .field("sleeper", &self.sleeper)
            .field("should_retry", &"<predicate>")
            .finish()
    }
}

impl<E> RetryPolicy<E>
where
    E: std::error::Error + Transient + Send + Sync + 'static,
{
    /// Construct a new builder with defaults.
    pub fn builder() -> RetryPolicyBuilder<E> {
        RetryPolicyBuilder::new()
    }

    /// Policy from named configuration: `attempts` total, `min(base * 2^(n-1), cap)` delays.
    pub fn from_config(config: &RetryConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Self::builder()
            .max_attempts(config.attempts)
            .backoff(config.backoff()?)
            .build()
            .map_err(|_| ConfigError::Zero("retry_attempts"))
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    /// Execute an async operation with retry semantics.
    pub async fn execute<T, Fut, Op>(&self, mut operation: Op) -> Result<T, CallError<E>>
    where
        Fut: Future<Output = Result<T, CallError<E>>>,
        Op: FnMut() -> Fut,
    {
        let mut failures: VecDeque<E> = VecDeque::new();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let err = match operation().await {
                Ok(value) => return Ok(value),
                Err(CallError::Inner(e)) => e,
                // Gate failures and nested exhaustion are not ours to retry.
                Err(other) => return Err(other),
            };

            if !(self.should_retry)(&err) {
                tracing::debug!(target: "turnstile::retry", attempt, error = %err, "permanent failure");
                return Err(CallError::Inner(err));
            }

            if attempt >= self.max_attempts {
                tracing::warn!(target: "turnstile::retry", attempts = attempt, error = %err, "retries exhausted");
                failures.push_back(err);
                return Err(CallError::retries_exhausted(attempt, failures.into_iter().collect()));
            }

            let delay = self.jitter.apply(self.backoff.delay(attempt));
            tracing::info!(
                target: "turnstile::retry",
                attempt,
                max_attempts = self.max_attempts,
                ?delay,
                error = %err,
                "transient failure, retrying"
            );
            failures.push_back(err);
            while failures.len() > MAX_RETRY_FAILURES {
                failures.pop_front();
            }
            self.sleeper.sleep(delay).await;
        }
    }
}

/// Builder for `RetryPolicy`.
pub struct RetryPolicyBuilder<E> {
    max_attempts: usize,
    backoff: Backoff,
    jitter: Jitter,
    should_retry: Arc<dyn Fn(&E) -> bool + Send + Sync>,
    sleeper: Arc<dyn Sleeper>,
}

/// Errors produced while building a retry policy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BuildError {
    #[error("max_attempts must be > 0 (got {0})")]
    InvalidMaxAttempts(usize),
}

impl<E> RetryPolicyBuilder<E>
where
    E: std::error::Error + Transient + Send + Sync + 'static,
{
    /// Defaults: 5 attempts, exponential backoff from 2 s capped at 10 s, no jitter,
    /// retry transient errors only.
    pub fn new() -> Self {
        let defaults = RetryConfig::default();
        let backoff = Backoff::exponential(defaults.backoff_base)
            .with_max(defaults.backoff_cap)
            .unwrap_or_else(|_| Backoff::exponential(defaults.backoff_base));
        Self {
            max_attempts: defaults.attempts,
            backoff,
            jitter: Jitter::None,
            should_retry: Arc::new(|e: &E| e.is_transient()),
            sleeper: Arc::new(TokioSleeper),
        }
    }

    /// Set total attempts (initial + retries). Must be > 0.
    pub fn max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// Replace the transient classification with a custom predicate.
    pub fn should_retry<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Arc::new(predicate);
        self
    }

    pub fn with_sleeper<S>(mut self, sleeper: S) -> Self
    where
        S: Sleeper + 'static,
    {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn build(self) -> Result<RetryPolicy<E>, BuildError> {
        if self.max_attempts == 0 {
            return Err(BuildError::InvalidMaxAttempts(0));
        }
        Ok(RetryPolicy {
            max_attempts: self.max_attempts,
            backoff: self.backoff.clone(),
            jitter: self.jitter,
            should_retry: self.should_retry,
            sleeper: self.sleeper,
        })
    }
}

impl<E> Default for RetryPolicyBuilder<E>
where
    E: std::error::Error + Transient + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Sum of the delays a policy with `backoff` sleeps through when every attempt fails.
pub fn worst_case_delay(backoff: &Backoff, max_attempts: usize) -> Duration {
    (1..max_attempts).map(|attempt| backoff.delay(attempt)).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::TransportError;
    use crate::error::GateError;
    use crate::sleeper::{InstantSleeper, TrackingSleeper};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn policy(attempts: usize, sleeper: TrackingSleeper) -> RetryPolicy<TransportError> {
        RetryPolicy::builder()
            .max_attempts(attempts)
            .backoff(
                Backoff::exponential(Duration::from_secs(2))
                    .with_max(Duration::from_secs(10))
                    .unwrap(),
            )
            .with_sleeper(sleeper)
            .build()
            .expect("builder")
    }

    #[tokio::test]
    async fn success_first_attempt_does_not_sleep() {
        let sleeper = TrackingSleeper::new();
        let calls = AtomicUsize::new(0);
        let result = policy(3, sleeper.clone())
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, CallError<TransportError>>(42) }
            })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(sleeper.calls().is_empty());
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let sleeper = TrackingSleeper::new();
        let calls = AtomicUsize::new(0);
        let result = policy(5, sleeper.clone())
            .execute(|| {
                let attempt = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 2 {
                        Err(CallError::Inner(TransportError::Status(503)))
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(sleeper.calls(), vec![Duration::from_secs(2), Duration::from_secs(4)]);
    }

    #[tokio::test]
    async fn exhaustion_reports_attempts_and_capped_nondecreasing_delays() {
        let sleeper = TrackingSleeper::new();
        let calls = AtomicUsize::new(0);
        let result: Result<(), _> = policy(5, sleeper.clone())
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(CallError::Inner(TransportError::Timeout)) }
            })
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.retries_exhausted_info(), Some((5, 5)));
        assert_eq!(err.last_failure(), Some(&TransportError::Timeout));
        assert_eq!(calls.load(Ordering::SeqCst), 5);

        let delays = sleeper.calls();
        assert_eq!(delays.len(), 4);
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert!(delays.iter().all(|d| *d <= Duration::from_secs(10)));
        assert_eq!(
            sleeper.total(),
            worst_case_delay(
                &Backoff::exponential(Duration::from_secs(2))
                    .with_max(Duration::from_secs(10))
                    .unwrap(),
                5
            )
        );
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), _> = policy(5, TrackingSleeper::new())
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(CallError::Inner(TransportError::Status(404))) }
            })
            .await;
        assert_eq!(result.unwrap_err().into_inner(), Some(TransportError::Status(404)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn gate_errors_propagate_unchanged() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), CallError<TransportError>> = policy(5, TrackingSleeper::new())
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(CallError::Admission(GateError::AdmissionTimeout {
                        waited: Duration::from_secs(1),
                        window_spent: false,
                    }))
                }
            })
            .await;
        assert!(result.unwrap_err().gate_error().is_some_and(GateError::is_admission_timeout));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn custom_predicate_overrides_classification() {
        let calls = AtomicUsize::new(0);
        let policy = RetryPolicy::<TransportError>::builder()
            .max_attempts(3)
            .should_retry(|e| matches!(e, TransportError::Status(404)))
            .with_sleeper(InstantSleeper)
            .build()
            .unwrap();
        let result: Result<(), _> = policy
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(CallError::Inner(TransportError::Status(404))) }
            })
            .await;
        assert!(result.unwrap_err().is_retries_exhausted());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn zero_attempts_rejected() {
        let err = RetryPolicy::<TransportError>::builder().max_attempts(0).build().unwrap_err();
        assert_eq!(err, BuildError::InvalidMaxAttempts(0));
    }

    #[test]
    fn from_config_uses_named_defaults() {
        let policy = RetryPolicy::<TransportError>::from_config(&RetryConfig::default()).unwrap();
        assert_eq!(policy.max_attempts(), 5);
        assert_eq!(policy.backoff.delay(3), Duration::from_secs(8));
        assert_eq!(policy.backoff.delay(4), Duration::from_secs(10));
    }
}
