//! Named configuration for the gate, the retry wrapper and the batch orchestrator.
//!
//! Every numeric policy is a field here; the `DEFAULT_*` constants mirror the limits the
//! gate was first deployed with (100 calls per 1 s window, 40 concurrent) and exist only
//! to seed the builders. Tests shrink them freely.

use crate::backoff::{Backoff, BackoffError};
use crate::key::{KeyError, KeySpace, RateKey};
use std::time::Duration;

pub const DEFAULT_MAX_CALLS_PER_WINDOW: u32 = 100;
pub const DEFAULT_WINDOW_DURATION: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_CONCURRENT: u32 = 40;
pub const DEFAULT_WINDOW_POLL_INTERVAL: Duration = Duration::from_millis(20);
pub const DEFAULT_SLOT_POLL_INTERVAL: Duration = Duration::from_millis(10);
pub const DEFAULT_STORE_PATIENCE: Duration = Duration::from_secs(5);
pub const DEFAULT_RETRY_ATTEMPTS: usize = 5;
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(2);
pub const DEFAULT_BACKOFF_CAP: Duration = Duration::from_secs(10);
pub const DEFAULT_WORKER_POOL_SIZE: usize = 5;

/// Invalid configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("invalid backoff: {0}")]
    Backoff(#[from] BackoffError),
    #[error("invalid key: {0}")]
    Key(#[from] KeyError),
    #[error("could not parse configuration: {0}")]
    Parse(String),
}

/// What happens to window budget already spent when admission is abandoned while waiting
/// for a slot, either on timeout or because the waiter was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum WindowSpendPolicy {
    /// Keep the unit spent. A caller that got through the window but timed out waiting for
    /// a slot has still used its share of the rate budget.
    #[default]
    Forfeit,
    /// Return the unit, provided the window it was taken from is still live. Store outages
    /// that outlast `store_patience` still forfeit.
    RefundOnTimeout,
}

/// Admission gate configuration. Build with [`GateConfig::builder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateConfig {
    max_calls_per_window: u32,
    window_duration: Duration,
    max_concurrent: u32,
    window_poll_interval: Duration,
    slot_poll_interval: Duration,
    acquire_timeout: Option<Duration>,
    store_patience: Duration,
    window_spend_policy: WindowSpendPolicy,
    key_space: KeySpace,
}

impl GateConfig {
    pub fn builder() -> GateConfigBuilder {
        GateConfigBuilder::new()
    }

    pub fn max_calls_per_window(&self) -> u32 {
        self.max_calls_per_window
    }

    pub fn window_duration(&self) -> Duration {
        self.window_duration
    }

    pub fn max_concurrent(&self) -> u32 {
        self.max_concurrent
    }

    pub fn window_poll_interval(&self) -> Duration {
        self.window_poll_interval
    }

    pub fn slot_poll_interval(&self) -> Duration {
        self.slot_poll_interval
    }

    /// Default wait budget for `acquire`; `None` waits indefinitely.
    pub fn acquire_timeout(&self) -> Option<Duration> {
        self.acquire_timeout
    }

    /// How long store outages are ridden out before `StoreUnavailable` is surfaced.
    pub fn store_patience(&self) -> Duration {
        self.store_patience
    }

    pub fn window_spend_policy(&self) -> WindowSpendPolicy {
        self.window_spend_policy
    }

    pub fn key_space(&self) -> &KeySpace {
        &self.key_space
    }
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            max_calls_per_window: DEFAULT_MAX_CALLS_PER_WINDOW,
            window_duration: DEFAULT_WINDOW_DURATION,
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            window_poll_interval: DEFAULT_WINDOW_POLL_INTERVAL,
            slot_poll_interval: DEFAULT_SLOT_POLL_INTERVAL,
            acquire_timeout: None,
            store_patience: DEFAULT_STORE_PATIENCE,
            window_spend_policy: WindowSpendPolicy::Forfeit,
            key_space: KeySpace::default(),
        }
    }
}

/// Builder for [`GateConfig`].
#[derive(Debug, Clone)]
pub struct GateConfigBuilder {
    config: GateConfig,
    key_prefix: Option<String>,
}

impl GateConfigBuilder {
    pub fn new() -> Self {
        Self { config: GateConfig::default(), key_prefix: None }
    }

    pub fn max_calls_per_window(mut self, max: u32) -> Self {
        self.config.max_calls_per_window = max;
        self
    }

    pub fn window_duration(mut self, window: Duration) -> Self {
        self.config.window_duration = window;
        self
    }

    pub fn max_concurrent(mut self, max: u32) -> Self {
        self.config.max_concurrent = max;
        self
    }

    pub fn window_poll_interval(mut self, interval: Duration) -> Self {
        self.config.window_poll_interval = interval;
        self
    }

    pub fn slot_poll_interval(mut self, interval: Duration) -> Self {
        self.config.slot_poll_interval = interval;
        self
    }

    pub fn acquire_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.acquire_timeout = timeout;
        self
    }

    pub fn store_patience(mut self, patience: Duration) -> Self {
        self.config.store_patience = patience;
        self
    }

    pub fn window_spend_policy(mut self, policy: WindowSpendPolicy) -> Self {
        self.config.window_spend_policy = policy;
        self
    }

    /// Namespace prefix for store keys (default `rate`).
    pub fn key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(prefix.into());
        self
    }

    pub fn build(self) -> Result<GateConfig, ConfigError> {
        let mut config = self.config;
        if config.max_calls_per_window == 0 {
            return Err(ConfigError::Zero("max_calls_per_window"));
        }
        if config.window_duration < Duration::from_millis(1) {
            return Err(ConfigError::Zero("window_duration"));
        }
        if config.max_concurrent == 0 {
            return Err(ConfigError::Zero("max_concurrent"));
        }
        if config.window_poll_interval.is_zero() {
            return Err(ConfigError::Zero("window_poll_interval"));
        }
        if config.slot_poll_interval.is_zero() {
            return Err(ConfigError::Zero("slot_poll_interval"));
        }
        if let Some(prefix) = self.key_prefix {
            config.key_space = KeySpace::new(prefix)?;
        }
        Ok(config)
    }
}

impl Default for GateConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Retry wrapper configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Total attempts, initial call included.
    pub attempts: usize,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl RetryConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.attempts == 0 {
            return Err(ConfigError::Zero("retry_attempts"));
        }
        self.backoff().map(|_| ())
    }

    /// `min(base * 2^(attempt-1), cap)`.
    pub fn backoff(&self) -> Result<Backoff, ConfigError> {
        if self.backoff_base.is_zero() {
            return Err(ConfigError::Zero("backoff_base"));
        }
        Ok(Backoff::exponential(self.backoff_base).with_max(self.backoff_cap)?)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_RETRY_ATTEMPTS,
            backoff_base: DEFAULT_BACKOFF_BASE,
            backoff_cap: DEFAULT_BACKOFF_CAP,
        }
    }
}

/// Batch orchestrator configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchConfig {
    pub worker_pool_size: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self { worker_pool_size: DEFAULT_WORKER_POOL_SIZE }
    }
}

/// Everything a guarded batch needs, including the rate key the budget is shared under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnstileConfig {
    pub rate_key: RateKey,
    pub gate: GateConfig,
    pub retry: RetryConfig,
    pub batch: BatchConfig,
}

impl TurnstileConfig {
    pub fn new(rate_key: RateKey) -> Self {
        Self {
            rate_key,
            gate: GateConfig::default(),
            retry: RetryConfig::default(),
            batch: BatchConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.retry.validate()?;
        if self.batch.worker_pool_size == 0 {
            return Err(ConfigError::Zero("worker_pool_size"));
        }
        Ok(())
    }
}

#[cfg(feature = "config-json")]
mod json {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    #[serde(deny_unknown_fields)]
    struct RawConfig {
        rate_key: String,
        #[serde(default)]
        key_prefix: Option<String>,
        #[serde(default = "defaults::max_calls_per_window")]
        max_calls_per_window: u32,
        #[serde(default = "defaults::window_duration_ms")]
        window_duration_ms: u64,
        #[serde(default = "defaults::max_concurrent")]
        max_concurrent: u32,
        #[serde(default = "defaults::window_poll_interval_ms")]
        window_poll_interval_ms: u64,
        #[serde(default = "defaults::slot_poll_interval_ms")]
        slot_poll_interval_ms: u64,
        #[serde(default)]
        acquire_timeout_ms: Option<u64>,
        #[serde(default = "defaults::store_patience_ms")]
        store_patience_ms: u64,
        #[serde(default)]
        window_spend_policy: WindowSpendPolicy,
        #[serde(default = "defaults::retry_attempts")]
        retry_attempts: usize,
        #[serde(default = "defaults::backoff_base_ms")]
        backoff_base_ms: u64,
        #[serde(default = "defaults::backoff_cap_ms")]
        backoff_cap_ms: u64,
        #[serde(default = "defaults::worker_pool_size")]
        worker_pool_size: usize,
    }

    mod defaults {
        use super::super::*;

        fn ms(d: Duration) -> u64 {
            d.as_millis() as u64
        }

        pub fn max_calls_per_window() -> u32 {
            DEFAULT_MAX_CALLS_PER_WINDOW
        }
        pub fn window_duration_ms() -> u64 {
            ms(DEFAULT_WINDOW_DURATION)
        }
        pub fn max_concurrent() -> u32 {
            DEFAULT_MAX_CONCURRENT
        }
        pub fn window_poll_interval_ms() -> u64 {
            ms(DEFAULT_WINDOW_POLL_INTERVAL)
        }
        pub fn slot_poll_interval_ms() -> u64 {
            ms(DEFAULT_SLOT_POLL_INTERVAL)
        }
        pub fn store_patience_ms() -> u64 {
            ms(DEFAULT_STORE_PATIENCE)
        }
        pub fn retry_attempts() -> usize {
            DEFAULT_RETRY_ATTEMPTS
        }
        pub fn backoff_base_ms() -> u64 {
            ms(DEFAULT_BACKOFF_BASE)
        }
        pub fn backoff_cap_ms() -> u64 {
            ms(DEFAULT_BACKOFF_CAP)
        }
        pub fn worker_pool_size() -> usize {
            DEFAULT_WORKER_POOL_SIZE
        }
    }

    impl TurnstileConfig {
        /// Parse and validate a JSON document. Durations are given in milliseconds
        /// (`window_duration_ms`, ...); omitted fields take the `DEFAULT_*` values.
        pub fn from_json_str(input: &str) -> Result<Self, ConfigError> {
            let raw: RawConfig =
                serde_json::from_str(input).map_err(|e| ConfigError::Parse(e.to_string()))?;
            let mut gate = GateConfig::builder()
                .max_calls_per_window(raw.max_calls_per_window)
                .window_duration(Duration::from_millis(raw.window_duration_ms))
                .max_concurrent(raw.max_concurrent)
                .window_poll_interval(Duration::from_millis(raw.window_poll_interval_ms))
                .slot_poll_interval(Duration::from_millis(raw.slot_poll_interval_ms))
                .acquire_timeout(raw.acquire_timeout_ms.map(Duration::from_millis))
                .store_patience(Duration::from_millis(raw.store_patience_ms))
                .window_spend_policy(raw.window_spend_policy);
            if let Some(prefix) = raw.key_prefix {
                gate = gate.key_prefix(prefix);
            }
            let config = TurnstileConfig {
                rate_key: RateKey::new(raw.rate_key)?,
                gate: gate.build()?,
                retry: RetryConfig {
                    attempts: raw.retry_attempts,
                    backoff_base: Duration::from_millis(raw.backoff_base_ms),
                    backoff_cap: Duration::from_millis(raw.backoff_cap_ms),
                },
                batch: BatchConfig { worker_pool_size: raw.worker_pool_size },
            };
            config.validate()?;
            Ok(config)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_mirror_first_deployment() {
        let config = GateConfig::default();
        assert_eq!(config.max_calls_per_window(), 100);
        assert_eq!(config.window_duration(), Duration::from_secs(1));
        assert_eq!(config.max_concurrent(), 40);
        assert_eq!(config.acquire_timeout(), None);
        assert_eq!(config.window_spend_policy(), WindowSpendPolicy::Forfeit);
        assert_eq!(config.key_space().prefix(), "rate");
    }

    #[test]
    fn builder_rejects_zero_ceilings() {
        assert_eq!(
            GateConfig::builder().max_calls_per_window(0).build(),
            Err(ConfigError::Zero("max_calls_per_window"))
        );
        assert_eq!(
            GateConfig::builder().max_concurrent(0).build(),
            Err(ConfigError::Zero("max_concurrent"))
        );
        assert_eq!(
            GateConfig::builder().window_duration(Duration::ZERO).build(),
            Err(ConfigError::Zero("window_duration"))
        );
        assert!(matches!(
            GateConfig::builder().key_prefix("a:b").build(),
            Err(ConfigError::Key(KeyError::Separator))
        ));
    }

    #[test]
    fn builder_applies_overrides() {
        let config = GateConfig::builder()
            .max_calls_per_window(2)
            .max_concurrent(1)
            .window_duration(Duration::from_millis(250))
            .acquire_timeout(Some(Duration::from_secs(3)))
            .window_spend_policy(WindowSpendPolicy::RefundOnTimeout)
            .key_prefix("tests")
            .build()
            .unwrap();
        assert_eq!(config.max_calls_per_window(), 2);
        assert_eq!(config.max_concurrent(), 1);
        assert_eq!(config.window_duration(), Duration::from_millis(250));
        assert_eq!(config.acquire_timeout(), Some(Duration::from_secs(3)));
        assert_eq!(config.window_spend_policy(), WindowSpendPolicy::RefundOnTimeout);
        assert_eq!(config.key_space().prefix(), "tests");
    }

    #[test]
    fn retry_config_validates_backoff() {
        assert!(RetryConfig::default().validate().is_ok());
        let bad = RetryConfig {
            attempts: 3,
            backoff_base: Duration::from_secs(5),
            backoff_cap: Duration::from_secs(1),
        };
        assert!(matches!(bad.validate(), Err(ConfigError::Backoff(_))));
        let zero = RetryConfig { attempts: 0, ..RetryConfig::default() };
        assert_eq!(zero.validate(), Err(ConfigError::Zero("retry_attempts")));
    }

    #[test]
    fn turnstile_config_rejects_empty_pool() {
        let mut config = TurnstileConfig::new(RateKey::new("posts").unwrap());
        assert!(config.validate().is_ok());
        config.batch.worker_pool_size = 0;
        assert_eq!(config.validate(), Err(ConfigError::Zero("worker_pool_size")));
    }

    #[cfg(feature = "config-json")]
    #[test]
    fn loads_json_with_defaults() {
        let config = TurnstileConfig::from_json_str(
            r#"{
                "rate_key": "my_api_limit_key",
                "max_calls_per_window": 10,
                "acquire_timeout_ms": 1500,
                "window_spend_policy": "refund_on_timeout"
            }"#,
        )
        .unwrap();
        assert_eq!(config.rate_key.as_str(), "my_api_limit_key");
        assert_eq!(config.gate.max_calls_per_window(), 10);
        assert_eq!(config.gate.max_concurrent(), DEFAULT_MAX_CONCURRENT);
        assert_eq!(config.gate.acquire_timeout(), Some(Duration::from_millis(1500)));
        assert_eq!(config.gate.window_spend_policy(), WindowSpendPolicy::RefundOnTimeout);
        assert_eq!(config.batch.worker_pool_size, DEFAULT_WORKER_POOL_SIZE);

        assert!(matches!(
            TurnstileConfig::from_json_str(r#"{"rate_key": "x", "bogus": 1}"#),
            Err(ConfigError::Parse(_))
        ));
    }
}
