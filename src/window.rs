//! Fixed-window call counter.
//!
//! Each rate key owns one counter under `<prefix>:<key>:window`. The increment that moves
//! it from 0 to 1 arms a TTL of one window in the same atomic step; the counter is never
//! decremented on the normal path, it simply disappears when the window elapses.

use crate::error::StoreError;
use crate::key::{KeySpace, RateKey};
use crate::store::CounterStore;
use std::sync::Arc;
use std::time::Duration;

/// Compare-and-swap conflicts tolerated per operation before reporting "not now".
const MAX_CAS_CONFLICTS: usize = 8;

/// Counts calls started within the current window of a rate key.
#[derive(Debug)]
pub struct RateWindow<S> {
    store: Arc<S>,
    keys: KeySpace,
}

impl<S> RateWindow<S>
where
    S: CounterStore,
{
    pub fn new(store: Arc<S>, keys: KeySpace) -> Self {
        Self { store, keys }
    }

    /// Take one unit of window budget if fewer than `max` were taken in this window.
    ///
    /// Never blocks and never retries a rejection; heavy contention on the counter is
    /// reported as `false` for this attempt rather than risking a lost update.
    pub async fn try_consume(
        &self,
        key: &RateKey,
        max: u32,
        window: Duration,
    ) -> Result<bool, StoreError> {
        let store_key = self.keys.window_key(key);
        for _ in 0..MAX_CAS_CONFLICTS {
            let current = self.store.get(&store_key).await?;
            if current >= i64::from(max) {
                return Ok(false);
            }
            let opens_window = current <= 0;
            let ttl = opens_window.then_some(window);
            if self.store.compare_and_swap(&store_key, current, current + 1, ttl).await? {
                if opens_window {
                    tracing::debug!(target: "turnstile::window", key = %key, ?window, "window opened");
                }
                return Ok(true);
            }
        }
        tracing::debug!(target: "turnstile::window", key = %key, "window counter contended");
        Ok(false)
    }

    /// Calls counted in the current window.
    pub async fn count(&self, key: &RateKey) -> Result<i64, StoreError> {
        self.store.get(&self.keys.window_key(key)).await
    }

    /// Return one unit taken `spent_ago` to the window it was taken from.
    ///
    /// The charged window expires at most `window - spent_ago` from now; any live window
    /// expiring later was opened after the charge and is left alone. Returns whether a unit
    /// was returned.
    pub async fn refund(
        &self,
        key: &RateKey,
        spent_ago: Duration,
        window: Duration,
    ) -> Result<bool, StoreError> {
        let Some(bound) = window.checked_sub(spent_ago) else {
            return Ok(false);
        };
        // Store expiry is tracked in whole milliseconds.
        let bound = if bound.subsec_nanos() % 1_000_000 == 0 {
            bound
        } else {
            Duration::from_millis(u64::try_from(bound.as_millis()).unwrap_or(u64::MAX).saturating_add(1))
        };
        self.store.decrement_if_expiring_within(&self.keys.window_key(key), bound).await
    }
}
