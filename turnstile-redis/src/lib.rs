//! Redis-backed [`CounterStore`] for turnstile.
//!
//! Every conditional mutation runs as a single Lua script, so it is atomic with respect to
//! every other client of the same Redis. Each round trip is bounded by `op_timeout`;
//! exceeding it surfaces as [`StoreError::Timeout`] and the gate treats it like any other
//! outage. A timed-out script may still have run on the server; in-flight slots are a set
//! of holder ids (`SADD`/`SREM`/`SCARD`), so the gate can repeat such a call safely.
//!
//! Requires Redis 6.0 or newer (`SET ... KEEPTTL`).

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{RedisError, RedisResult, Script};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use turnstile::{CounterStore, Decremented, StoreError};

/// Default bound on a single Redis round trip.
pub const DEFAULT_OP_TIMEOUT: Duration = Duration::from_millis(500);

const DECREMENT_FLOORED: &str = r#"
    local current = tonumber(redis.call("GET", KEYS[1]) or "0")
    if current <= 0 then
        if current < 0 then
            redis.call("SET", KEYS[1], 0, "KEEPTTL")
        end
        return {0, 1}
    end
    return {redis.call("DECR", KEYS[1]), 0}
"#;

const COMPARE_AND_SWAP: &str = r#"
    local current = tonumber(redis.call("GET", KEYS[1]) or "0")
    if current ~= tonumber(ARGV[1]) then
        return 0
    end
    local ttl_ms = tonumber(ARGV[3])
    if ttl_ms > 0 then
        redis.call("SET", KEYS[1], ARGV[2], "PX", ttl_ms)
    else
        redis.call("SET", KEYS[1], ARGV[2], "KEEPTTL")
    end
    return 1
"#;

const DECREMENT_IF_EXPIRING_WITHIN: &str = r#"
    local current = tonumber(redis.call("GET", KEYS[1]) or "0")
    if current <= 0 then
        return 0
    end
    local remaining = redis.call("PTTL", KEYS[1])
    if remaining < 0 or remaining > tonumber(ARGV[1]) then
        return 0
    end
    redis.call("DECR", KEYS[1])
    return 1
"#;

const ADD_MEMBER_CAPPED: &str = r#"
    if redis.call("SISMEMBER", KEYS[1], ARGV[1]) == 1 then
        return 1
    end
    if redis.call("SCARD", KEYS[1]) >= tonumber(ARGV[2]) then
        return 0
    end
    redis.call("SADD", KEYS[1], ARGV[1])
    return 1
"#;

struct Scripts {
    decrement: Script,
    compare_and_swap: Script,
    decrement_if_expiring_within: Script,
    add_member_capped: Script,
}

impl Scripts {
    fn load() -> Self {
        Self {
            decrement: Script::new(DECREMENT_FLOORED),
            compare_and_swap: Script::new(COMPARE_AND_SWAP),
            decrement_if_expiring_within: Script::new(DECREMENT_IF_EXPIRING_WITHIN),
            add_member_capped: Script::new(ADD_MEMBER_CAPPED),
        }
    }
}

/// Counter store backed by a Redis server.
///
/// Cheap to clone; clones share the multiplexed connection.
#[derive(Clone)]
pub struct RedisCounterStore {
    connection: ConnectionManager,
    op_timeout: Duration,
    scripts: Arc<Scripts>,
}

impl std::fmt::Debug for RedisCounterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCounterStore")
            .field("op_timeout", &self.op_timeout)
            .finish_non_exhaustive()
    }
}

impl RedisCounterStore {
    /// Wrap an existing connection manager.
    pub fn new(connection: ConnectionManager) -> Self {
        Self { connection, op_timeout: DEFAULT_OP_TIMEOUT, scripts: Arc::new(Scripts::load()) }
    }

    /// Connect to `url` (e.g. `redis://127.0.0.1:6379`).
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(map_error)?;
        let connection = ConnectionManager::new(client).await.map_err(map_error)?;
        tracing::info!(target: "turnstile::redis", url, "connected");
        Ok(Self::new(connection))
    }

    pub fn with_op_timeout(mut self, op_timeout: Duration) -> Self {
        self.op_timeout = op_timeout;
        self
    }

    pub fn op_timeout(&self) -> Duration {
        self.op_timeout
    }

    async fn bounded<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        F: Future<Output = RedisResult<T>>,
    {
        match tokio::time::timeout(self.op_timeout, op).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(map_error(err)),
            Err(_) => {
                tracing::warn!(target: "turnstile::redis", timeout = ?self.op_timeout, "redis operation timed out");
                Err(StoreError::Timeout(self.op_timeout))
            }
        }
    }
}

/// Connection-level failures are outages; everything else is a protocol problem.
fn map_error(err: RedisError) -> StoreError {
    if err.is_io_error()
        || err.is_connection_dropped()
        || err.is_connection_refusal()
        || err.is_timeout()
    {
        StoreError::Unavailable(err.to_string())
    } else {
        StoreError::Protocol(err.to_string())
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn increment(&self, key: &str) -> Result<i64, StoreError> {
        let mut connection = self.connection.clone();
        self.bounded(async move {
            let value: RedisResult<i64> =
                redis::cmd("INCR").arg(key).query_async(&mut connection).await;
            value
        })
        .await
    }

    async fn get(&self, key: &str) -> Result<i64, StoreError> {
        let mut connection = self.connection.clone();
        let value = self
            .bounded(async move {
                let value: RedisResult<Option<i64>> =
                    redis::cmd("GET").arg(key).query_async(&mut connection).await;
                value
            })
            .await?;
        Ok(value.unwrap_or(0))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut connection = self.connection.clone();
        let armed = self
            .bounded(async move {
                let armed: RedisResult<i64> = redis::cmd("PEXPIRE")
                    .arg(key)
                    .arg(millis(ttl))
                    .query_async(&mut connection)
                    .await;
                armed
            })
            .await?;
        Ok(armed == 1)
    }

    async fn decrement(&self, key: &str) -> Result<Decremented, StoreError> {
        let mut connection = self.connection.clone();
        let script = &self.scripts.decrement;
        let reply = self
            .bounded(async move {
                let reply: RedisResult<Vec<i64>> =
                    script.key(key).invoke_async(&mut connection).await;
                reply
            })
            .await?;
        match reply.as_slice() {
            [value, clamped] => Ok(Decremented { value: *value, clamped: *clamped == 1 }),
            other => Err(StoreError::Protocol(format!("unexpected decrement reply {other:?}"))),
        }
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: i64,
        new: i64,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        let mut connection = self.connection.clone();
        let script = &self.scripts.compare_and_swap;
        // Zero means "keep the current expiry".
        let ttl_ms = ttl.map(|t| millis(t).max(1)).unwrap_or(0);
        let swapped = self
            .bounded(async move {
                let swapped: RedisResult<i64> = script
                    .key(key)
                    .arg(expected)
                    .arg(new)
                    .arg(ttl_ms)
                    .invoke_async(&mut connection)
                    .await;
                swapped
            })
            .await?;
        Ok(swapped == 1)
    }

    async fn time_to_live(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        let mut connection = self.connection.clone();
        let remaining = self
            .bounded(async move {
                let remaining: RedisResult<i64> =
                    redis::cmd("PTTL").arg(key).query_async(&mut connection).await;
                remaining
            })
            .await?;
        // -2: no key, -1: no expiry.
        Ok(u64::try_from(remaining).ok().map(Duration::from_millis))
    }

    async fn decrement_if_expiring_within(
        &self,
        key: &str,
        bound: Duration,
    ) -> Result<bool, StoreError> {
        let mut connection = self.connection.clone();
        let script = &self.scripts.decrement_if_expiring_within;
        let applied = self
            .bounded(async move {
                let applied: RedisResult<i64> =
                    script.key(key).arg(millis(bound)).invoke_async(&mut connection).await;
                applied
            })
            .await?;
        Ok(applied == 1)
    }

    async fn add_member_capped(
        &self,
        key: &str,
        member: &str,
        max: i64,
    ) -> Result<bool, StoreError> {
        let mut connection = self.connection.clone();
        let script = &self.scripts.add_member_capped;
        let added = self
            .bounded(async move {
                let added: RedisResult<i64> =
                    script.key(key).arg(member).arg(max).invoke_async(&mut connection).await;
                added
            })
            .await?;
        Ok(added == 1)
    }

    async fn remove_member(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut connection = self.connection.clone();
        let removed = self
            .bounded(async move {
                let removed: RedisResult<i64> =
                    redis::cmd("SREM").arg(key).arg(member).query_async(&mut connection).await;
                removed
            })
            .await?;
        Ok(removed == 1)
    }

    async fn member_count(&self, key: &str) -> Result<i64, StoreError> {
        let mut connection = self.connection.clone();
        self.bounded(async move {
            let count: RedisResult<i64> =
                redis::cmd("SCARD").arg(key).query_async(&mut connection).await;
            count
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_failures_are_outages() {
        let refused = RedisError::from(std::io::Error::from(std::io::ErrorKind::ConnectionRefused));
        assert!(matches!(map_error(refused), StoreError::Unavailable(_)));

        let parse = RedisError::from((redis::ErrorKind::TypeError, "not an integer"));
        assert!(matches!(map_error(parse), StoreError::Protocol(_)));
    }

    #[test]
    fn millis_saturates() {
        assert_eq!(millis(Duration::from_millis(1500)), 1500);
        assert_eq!(millis(Duration::MAX), u64::MAX);
    }
}
