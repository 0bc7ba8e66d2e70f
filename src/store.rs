//! Shared counter store interface and an in-process implementation.
//!
//! The gate keeps no counter state of its own: every count lives in a [`CounterStore`], so
//! callers in different processes see each other's admissions. Every mutation the gate
//! performs is a single atomic store operation; conditional updates go through
//! [`CounterStore::compare_and_swap`] so there is never a read-modify-write spread across
//! two round trips.
//!
//! In-flight slots are kept as a set of holder ids rather than a bare counter. Adding or
//! removing a holder is idempotent, so an operation whose reply was lost can be repeated
//! without counting twice.

use crate::clock::{Clock, MonotonicClock};
use crate::error::StoreError;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Result of a floored decrement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decremented {
    /// Counter value after the decrement.
    pub value: i64,
    /// The counter was already at (or below) zero and was clamped instead of decremented.
    pub clamped: bool,
}

/// Minimal operations the gate needs from a shared key-value counter service.
///
/// Missing keys read as `0`. Values are signed so a corrupted store can be detected, but
/// none of the operations here ever produce a negative value.
#[async_trait]
pub trait CounterStore: Send + Sync + std::fmt::Debug {
    /// Atomically add one, creating the key at `1` when missing. Returns the new value.
    async fn increment(&self, key: &str) -> Result<i64, StoreError>;

    /// Current value, `0` when missing or expired.
    async fn get(&self, key: &str) -> Result<i64, StoreError>;

    /// Arm a time-to-live on an existing key. Returns `false` if the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Atomically subtract one, floored at zero.
    async fn decrement(&self, key: &str) -> Result<Decremented, StoreError>;

    /// Atomically replace `expected` with `new`.
    ///
    /// A missing key matches `expected == 0`. With `ttl = Some(_)` the expiry is armed in
    /// the same atomic step; with `None` any existing expiry is preserved. Returns `false`
    /// (and changes nothing) when the current value differs from `expected`.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: i64,
        new: i64,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError>;

    /// Remaining time-to-live; `None` when the key is missing or never expires.
    async fn time_to_live(&self, key: &str) -> Result<Option<Duration>, StoreError>;

    /// Atomically subtract one if the key is positive and expires within `bound`.
    ///
    /// Used to return budget to a window that is provably the one that was charged.
    async fn decrement_if_expiring_within(
        &self,
        key: &str,
        bound: Duration,
    ) -> Result<bool, StoreError>;

    /// Atomically add `member` to the set at `key` if the set has fewer than `max` members.
    ///
    /// A member already present counts as added and is not counted twice. Returns whether
    /// `member` is in the set afterwards.
    async fn add_member_capped(
        &self,
        key: &str,
        member: &str,
        max: i64,
    ) -> Result<bool, StoreError>;

    /// Remove `member` from the set at `key`. Returns whether it was present.
    async fn remove_member(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    /// Number of members in the set at `key`, `0` when missing.
    async fn member_count(&self, key: &str) -> Result<i64, StoreError>;
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    value: i64,
    expires_at: Option<u64>,
}

#[derive(Debug, Default)]
struct State {
    counters: HashMap<String, Entry>,
    sets: HashMap<String, HashSet<String>>,
}

/// In-process counter store with TTL support.
///
/// Clones share state, so several gates built on clones of one `MemoryStore` behave like
/// separate processes pointed at the same server.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::with_clock(MonotonicClock::default())
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store whose expiry follows `clock`.
    pub fn with_clock<C: Clock + 'static>(clock: C) -> Self {
        Self { state: Arc::new(Mutex::new(State::default())), clock: Arc::new(clock) }
    }

    fn lock(&self) -> Result<(MutexGuard<'_, State>, u64), StoreError> {
        let now = self.clock.now_millis();
        let mut guard = self
            .state
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))?;
        guard.counters.retain(|_, entry| entry.expires_at.map_or(true, |at| at > now));
        Ok((guard, now))
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn increment(&self, key: &str) -> Result<i64, StoreError> {
        let (mut state, _) = self.lock()?;
        let entries = &mut state.counters;
        let entry = entries.entry(key.to_string()).or_insert(Entry { value: 0, expires_at: None });
        entry.value += 1;
        Ok(entry.value)
    }

    async fn get(&self, key: &str) -> Result<i64, StoreError> {
        let (state, _) = self.lock()?;
        let entries = &state.counters;
        Ok(entries.get(key).map_or(0, |e| e.value))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let (mut state, now) = self.lock()?;
        let entries = &mut state.counters;
        match entries.get_mut(key) {
            Some(entry) => {
                entry.expires_at = Some(now.saturating_add(millis(ttl)));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn decrement(&self, key: &str) -> Result<Decremented, StoreError> {
        let (mut state, _) = self.lock()?;
        let entries = &mut state.counters;
        match entries.get_mut(key) {
            Some(entry) if entry.value > 0 => {
                entry.value -= 1;
                Ok(Decremented { value: entry.value, clamped: false })
            }
            Some(entry) => {
                entry.value = 0;
                Ok(Decremented { value: 0, clamped: true })
            }
            None => Ok(Decremented { value: 0, clamped: true }),
        }
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: i64,
        new: i64,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        let (mut state, now) = self.lock()?;
        let entries = &mut state.counters;
        let current = entries.get(key).copied();
        if current.map_or(0, |e| e.value) != expected {
            return Ok(false);
        }
        let expires_at = match ttl {
            Some(ttl) => Some(now.saturating_add(millis(ttl))),
            None => current.and_then(|e| e.expires_at),
        };
        entries.insert(key.to_string(), Entry { value: new, expires_at });
        Ok(true)
    }

    async fn time_to_live(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        let (state, now) = self.lock()?;
        let entries = &state.counters;
        Ok(entries
            .get(key)
            .and_then(|e| e.expires_at)
            .map(|at| Duration::from_millis(at.saturating_sub(now))))
    }

    async fn decrement_if_expiring_within(
        &self,
        key: &str,
        bound: Duration,
    ) -> Result<bool, StoreError> {
        let (mut state, now) = self.lock()?;
        let entries = &mut state.counters;
        let Some(entry) = entries.get_mut(key) else {
            return Ok(false);
        };
        let within = entry.expires_at.is_some_and(|at| at.saturating_sub(now) <= millis(bound));
        if within && entry.value > 0 {
            entry.value -= 1;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn add_member_capped(
        &self,
        key: &str,
        member: &str,
        max: i64,
    ) -> Result<bool, StoreError> {
        let (mut state, _) = self.lock()?;
        let set = state.sets.entry(key.to_string()).or_default();
        if set.contains(member) {
            return Ok(true);
        }
        if i64::try_from(set.len()).unwrap_or(i64::MAX) >= max {
            return Ok(false);
        }
        set.insert(member.to_string());
        Ok(true)
    }

    async fn remove_member(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let (mut state, _) = self.lock()?;
        let Some(set) = state.sets.get_mut(key) else {
            return Ok(false);
        };
        let removed = set.remove(member);
        if set.is_empty() {
            state.sets.remove(key);
        }
        Ok(removed)
    }

    async fn member_count(&self, key: &str) -> Result<i64, StoreError> {
        let (state, _) = self.lock()?;
        Ok(state.sets.get(key).map_or(0, |set| i64::try_from(set.len()).unwrap_or(i64::MAX)))
    }
}
