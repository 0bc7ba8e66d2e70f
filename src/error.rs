//! Error taxonomy for the counter store, the admission gate and guarded calls.
//!
//! - [`StoreError`]: a counter store round trip failed.
//! - [`GateError`]: admission or release could not be completed.
//! - [`CallError`]: everything a guarded endpoint call can end with, including the
//!   endpoint's own error type `E` and retry exhaustion.
use crate::gate::TicketId;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Cap the number of stored failures inside `RetriesExhausted` to avoid unbounded growth.
pub const MAX_RETRY_FAILURES: usize = 10;

/// Failure talking to the shared counter store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The store could not be reached (connection refused, dropped, I/O error).
    #[error("counter store unavailable: {0}")]
    Unavailable(String),
    /// A single store operation exceeded its time budget.
    #[error("counter store operation timed out after {0:?}")]
    Timeout(Duration),
    /// The store answered with something the client did not expect.
    #[error("counter store protocol error: {0}")]
    Protocol(String),
}

/// Failure of the admission protocol itself.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GateError {
    /// The store stayed unreachable for longer than the configured patience.
    #[error("counter store unavailable for {waited:?}: {source}")]
    StoreUnavailable {
        /// Last store failure observed.
        source: StoreError,
        /// How long the gate kept trying.
        waited: Duration,
    },
    /// The caller's wait budget expired before admission was granted.
    ///
    /// `window_spent` reports whether one unit of window budget had already been consumed
    /// when the wait gave up; under the default spend policy that unit is not refunded.
    #[error("admission not granted within {waited:?} (window budget spent: {window_spent})")]
    AdmissionTimeout {
        /// Time spent waiting.
        waited: Duration,
        /// Whether window budget was consumed before giving up.
        window_spent: bool,
    },
    /// The ticket was already released, or was issued by a different gate.
    #[error("ticket {ticket} was already released or does not belong to this gate")]
    DoubleRelease {
        /// The offending ticket.
        ticket: TicketId,
    },
}

impl GateError {
    /// True for [`GateError::AdmissionTimeout`].
    pub fn is_admission_timeout(&self) -> bool {
        matches!(self, Self::AdmissionTimeout { .. })
    }

    /// True for [`GateError::StoreUnavailable`].
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, Self::StoreUnavailable { .. })
    }

    /// True for [`GateError::DoubleRelease`].
    pub fn is_double_release(&self) -> bool {
        matches!(self, Self::DoubleRelease { .. })
    }
}

/// Outcome error of one guarded call.
#[derive(Debug, Clone)]
pub enum CallError<E> {
    /// Admission could not be obtained (or the release protocol was violated).
    Admission(GateError),
    /// The endpoint failed; not retried further.
    Inner(E),
    /// Every attempt failed transiently.
    RetriesExhausted { attempts: usize, failures: Arc<Vec<E>> },
    /// The call panicked. Only produced where a panic is contained to one call, as in a
    /// batch.
    Panicked(String),
}

impl<E: fmt::Display> fmt::Display for CallError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Admission(e) => write!(f, "admission failed: {}", e),
            Self::Inner(e) => write!(f, "{}", e),
            Self::Panicked(message) => write!(f, "call panicked: {}", message),
            Self::RetriesExhausted { attempts, failures } => {
                let recorded = failures.len();
                let truncated_note = if recorded < *attempts {
                    format!(" (recorded last {} failures)", recorded)
                } else {
                    String::new()
                };
                match failures.last() {
                    Some(last) => write!(
                        f,
                        "retries exhausted after {} attempts{}; last error: {}",
                        attempts, truncated_note, last
                    ),
                    None => write!(
                        f,
                        "retries exhausted after {} attempts{}; no recorded failures",
                        attempts, truncated_note
                    ),
                }
            }
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for CallError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Admission(e) => Some(e),
            Self::Inner(e) => Some(e),
            Self::RetriesExhausted { failures, .. } => {
                failures.last().map(|e| e as &dyn std::error::Error)
            }
            Self::Panicked(_) => None,
        }
    }
}

impl<E> From<GateError> for CallError<E> {
    fn from(err: GateError) -> Self {
        Self::Admission(err)
    }
}

impl<E> CallError<E> {
    /// Build `RetriesExhausted`, keeping only the most recent `MAX_RETRY_FAILURES` failures.
    pub fn retries_exhausted(attempts: usize, failures: Vec<E>) -> Self {
        let trimmed = if failures.len() > MAX_RETRY_FAILURES {
            failures.into_iter().rev().take(MAX_RETRY_FAILURES).rev().collect()
        } else {
            failures
        };
        Self::RetriesExhausted { attempts, failures: Arc::new(trimmed) }
    }

    pub fn is_admission(&self) -> bool {
        matches!(self, Self::Admission(_))
    }

    pub fn is_inner(&self) -> bool {
        matches!(self, Self::Inner(_))
    }

    pub fn is_retries_exhausted(&self) -> bool {
        matches!(self, Self::RetriesExhausted { .. })
    }

    pub fn is_panicked(&self) -> bool {
        matches!(self, Self::Panicked(_))
    }

    /// Borrow the gate error, if admission failed.
    pub fn gate_error(&self) -> Option<&GateError> {
        match self {
            Self::Admission(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_inner(&self) -> Option<&E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    /// Recorded failures of `RetriesExhausted`, oldest first.
    pub fn failures(&self) -> Option<&[E]> {
        match self {
            Self::RetriesExhausted { failures, .. } => Some(failures.as_slice()),
            _ => None,
        }
    }

    /// The failure that ended the call: the inner error, or the last recorded retry failure.
    pub fn last_failure(&self) -> Option<&E> {
        match self {
            Self::Inner(e) => Some(e),
            Self::RetriesExhausted { failures, .. } => failures.last(),
            Self::Admission(_) | Self::Panicked(_) => None,
        }
    }

    /// `(attempts, recorded_failures)` for `RetriesExhausted`.
    pub fn retries_exhausted_info(&self) -> Option<(usize, usize)> {
        match self {
            Self::RetriesExhausted { attempts, failures } => Some((*attempts, failures.len())),
            _ => None,
        }
    }
}
