#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use turnstile::{CounterStore, Decremented, MemoryStore, StoreError};

/// Route `turnstile` events to the test writer. `RUST_LOG` overrides the filter.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("turnstile=debug")),
        )
        .with_test_writer()
        .try_init();
}

/// A `MemoryStore` that can be taken down, slowed down, or made to lose replies at will.
#[derive(Debug, Clone, Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    down: Arc<AtomicBool>,
    latency_ms: Arc<AtomicU64>,
    lost_slot_replies: Arc<AtomicU64>,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    /// Delay applied before every operation.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms.store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// The next `n` slot claims and releases are applied, then reported as timed out, like
    /// a server that committed the change before the client gave up on the reply.
    pub fn lose_slot_replies(&self, n: u64) {
        self.lost_slot_replies.store(n, Ordering::SeqCst);
    }

    fn reply<T>(&self, applied: Result<T, StoreError>) -> Result<T, StoreError> {
        let lost = self
            .lost_slot_replies
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        match applied {
            Ok(_) if lost => Err(StoreError::Timeout(Duration::from_millis(500))),
            other => other,
        }
    }

    async fn enter(&self) -> Result<(), StoreError> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.down.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("connection refused".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl CounterStore for FlakyStore {
    async fn increment(&self, key: &str) -> Result<i64, StoreError> {
        self.enter().await?;
        self.inner.increment(key).await
    }

    async fn get(&self, key: &str) -> Result<i64, StoreError> {
        self.enter().await?;
        self.inner.get(key).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.enter().await?;
        self.inner.expire(key, ttl).await
    }

    async fn decrement(&self, key: &str) -> Result<Decremented, StoreError> {
        self.enter().await?;
        self.inner.decrement(key).await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: i64,
        new: i64,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        self.enter().await?;
        self.inner.compare_and_swap(key, expected, new, ttl).await
    }

    async fn time_to_live(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        self.enter().await?;
        self.inner.time_to_live(key).await
    }

    async fn decrement_if_expiring_within(
        &self,
        key: &str,
        bound: Duration,
    ) -> Result<bool, StoreError> {
        self.enter().await?;
        self.inner.decrement_if_expiring_within(key, bound).await
    }

    async fn add_member_capped(
        &self,
        key: &str,
        member: &str,
        max: i64,
    ) -> Result<bool, StoreError> {
        self.enter().await?;
        self.reply(self.inner.add_member_capped(key, member, max).await)
    }

    async fn remove_member(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        self.enter().await?;
        self.reply(self.inner.remove_member(key, member).await)
    }

    async fn member_count(&self, key: &str) -> Result<i64, StoreError> {
        self.enter().await?;
        self.inner.member_count(key).await
    }
}
