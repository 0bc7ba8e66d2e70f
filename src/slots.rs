//! In-flight call tracking for concurrency ceilings.
//!
//! Unlike a process-local semaphore, the occupied slots live in the counter store under
//! `<prefix>:<key>:inflight`, so the ceiling holds across every process sharing the store.
//! Each slot is recorded under the id of the call holding it. Claiming a slot the holder
//! already has, or freeing one it no longer has, changes nothing, so a store call whose
//! reply was lost can simply be repeated. Slots have no notion of time.

use crate::error::StoreError;
use crate::key::{KeySpace, RateKey};
use crate::store::CounterStore;
use std::sync::Arc;

/// Tracks calls admitted but not yet completed.
#[derive(Debug)]
pub struct SlotTracker<S> {
    store: Arc<S>,
    keys: KeySpace,
}

impl<S> SlotTracker<S>
where
    S: CounterStore,
{
    pub fn new(store: Arc<S>, keys: KeySpace) -> Self {
        Self { store, keys }
    }

    /// Occupy one slot for `holder` if fewer than `max` are occupied.
    ///
    /// The claim is conditional, so a full tracker is never pushed past `max`, not even
    /// momentarily. Returns `true` if `holder` holds a slot afterwards, including when it
    /// already held one.
    pub async fn try_acquire_slot(
        &self,
        key: &RateKey,
        holder: &str,
        max: u32,
    ) -> Result<bool, StoreError> {
        self.store.add_member_capped(&self.keys.inflight_key(key), holder, i64::from(max)).await
    }

    /// Free `holder`'s slot. Returns `false` when `holder` held none, which leaves the count
    /// untouched.
    pub async fn release_slot(&self, key: &RateKey, holder: &str) -> Result<bool, StoreError> {
        self.store.remove_member(&self.keys.inflight_key(key), holder).await
    }

    /// Slots currently occupied.
    pub async fn in_flight(&self, key: &RateKey) -> Result<i64, StoreError> {
        self.store.member_count(&self.keys.inflight_key(key)).await
    }
}
