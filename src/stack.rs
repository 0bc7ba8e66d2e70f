//! Composition of the retry policy, the admission gate and an endpoint.
//!
//! Order: Retry → Gate → Endpoint. Each attempt acquires its own admission and releases it
//! before the retry policy backs off, so a waiting retry never occupies a slot.

use crate::config::{ConfigError, TurnstileConfig};
use crate::endpoint::Endpoint;
use crate::error::CallError;
use crate::gate::AdmissionGate;
use crate::key::RateKey;
use crate::retry::RetryPolicy;
use crate::store::CounterStore;
use std::sync::Arc;

/// An endpoint whose every call is retried, rate limited and concurrency limited.
pub struct GuardedEndpoint<S, P, E> {
    gate: AdmissionGate<S>,
    retry: RetryPolicy<E>,
    key: RateKey,
    endpoint: Arc<P>,
}

impl<S, P, E> Clone for GuardedEndpoint<S, P, E> {
    fn clone(&self) -> Self {
        Self {
            gate: self.gate.clone(),
            retry: self.retry.clone(),
            key: self.key.clone(),
            endpoint: Arc::clone(&self.endpoint),
        }
    }
}

impl<S, P, E> std::fmt::Debug for GuardedEndpoint<S, P, E>
where
    S: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardedEndpoint")
            .field("gate", &self.gate)
            .field("retry", &self.retry)
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

impl<S, P, E> GuardedEndpoint<S, P, E>
where
    S: CounterStore + 'static,
    E: std::error::Error + crate::endpoint::Transient + Send + Sync + 'static,
{
    pub fn new(gate: AdmissionGate<S>, retry: RetryPolicy<E>, key: RateKey, endpoint: P) -> Self {
        Self { gate, retry, key, endpoint: Arc::new(endpoint) }
    }

    /// Wire a gate and retry policy over `store` from named configuration.
    pub fn from_config(
        store: Arc<S>,
        config: &TurnstileConfig,
        endpoint: P,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::new(
            AdmissionGate::new(store, config.gate.clone()),
            RetryPolicy::from_config(&config.retry)?,
            config.rate_key.clone(),
            endpoint,
        ))
    }

    pub fn gate(&self) -> &AdmissionGate<S> {
        &self.gate
    }

    pub fn key(&self) -> &RateKey {
        &self.key
    }

    pub fn endpoint(&self) -> &P {
        &self.endpoint
    }

    /// Call the endpoint with `descriptor` under admission, retrying transient failures.
    pub async fn call<D>(&self, descriptor: &D) -> Result<P::Output, CallError<E>>
    where
        D: Send + Sync,
        P: Endpoint<D, Error = E>,
    {
        self.retry
            .execute(|| self.gate.run(&self.key, || self.endpoint.call(descriptor)))
            .await
    }
}
