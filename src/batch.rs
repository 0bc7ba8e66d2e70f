//! Fan a set of request descriptors out over a bounded pool of concurrent calls.
//!
//! Each descriptor yields exactly one outcome. A failing descriptor never affects the others,
//! not even when its call panics, and outcomes are collected in completion order.

use crate::config::{BatchConfig, ConfigError};
use crate::endpoint::Endpoint;
use crate::error::CallError;
use crate::stack::GuardedEndpoint;
use crate::store::CounterStore;
use futures::stream::{self, StreamExt};
use futures::FutureExt;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use tokio::time::Instant;

/// Outcomes of a batch, split by success.
#[derive(Debug)]
pub struct BatchResult<D, T, E> {
    /// `(descriptor, value)` in completion order.
    pub successes: Vec<(D, T)>,
    /// `(descriptor, error)` in completion order.
    pub failures: Vec<(D, CallError<E>)>,
}

impl<D, T, E> BatchResult<D, T, E> {
    fn with_capacity(n: usize) -> Self {
        Self { successes: Vec::with_capacity(n), failures: Vec::new() }
    }

    /// Number of descriptors that produced an outcome.
    pub fn len(&self) -> usize {
        self.successes.len() + self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_complete_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// Successful values in the current order, dropping descriptors and failures.
    pub fn into_values(self) -> Vec<T> {
        self.successes.into_iter().map(|(_, value)| value).collect()
    }
}

impl<D: Ord, T, E> BatchResult<D, T, E> {
    /// Reorder both lists by descriptor, e.g. to restore page order.
    pub fn sort_by_descriptor(&mut self) {
        self.successes.sort_by(|a, b| a.0.cmp(&b.0));
        self.failures.sort_by(|a, b| a.0.cmp(&b.0));
    }
}

/// Runs batches with at most `pool_size` calls outstanding.
#[derive(Debug, Clone, Copy)]
pub struct BatchOrchestrator {
    pool_size: usize,
}

impl BatchOrchestrator {
    pub fn new(pool_size: usize) -> Result<Self, ConfigError> {
        if pool_size == 0 {
            return Err(ConfigError::Zero("worker_pool_size"));
        }
        Ok(Self { pool_size })
    }

    pub fn from_config(config: &BatchConfig) -> Result<Self, ConfigError> {
        Self::new(config.worker_pool_size)
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Drive every descriptor through `call` and wait for all outcomes.
    ///
    /// A call that panics is recorded as [`CallError::Panicked`] for its descriptor.
    pub async fn run<D, T, E, F, Fut>(
        &self,
        descriptors: impl IntoIterator<Item = D>,
        call: F,
    ) -> BatchResult<D, T, E>
    where
        D: Clone + fmt::Debug,
        E: fmt::Display,
        F: Fn(D) -> Fut,
        Fut: Future<Output = Result<T, CallError<E>>>,
    {
        let descriptors: Vec<D> = descriptors.into_iter().collect();
        let total = descriptors.len();
        let started = Instant::now();
        let mut result = BatchResult::with_capacity(total);

        tracing::info!(target: "turnstile::batch", total, pool_size = self.pool_size, "batch started");

        let mut outcomes = stream::iter(descriptors)
            .map(|descriptor| {
                let pending = AssertUnwindSafe(call(descriptor.clone())).catch_unwind();
                async move {
                    let outcome = pending.await.unwrap_or_else(|panic| {
                        Err(CallError::Panicked(panic_message(panic.as_ref())))
                    });
                    (descriptor, outcome)
                }
            })
            .buffer_unordered(self.pool_size);

        while let Some((descriptor, outcome)) = outcomes.next().await {
            match outcome {
                Ok(value) => {
                    result.successes.push((descriptor, value));
                    tracing::info!(
                        target: "turnstile::batch",
                        descriptor = ?result.successes.last().map(|(d, _)| d),
                        completed = result.len(),
                        total,
                        elapsed = ?started.elapsed(),
                        "descriptor completed"
                    );
                }
                Err(err) => {
                    tracing::warn!(
                        target: "turnstile::batch",
                        descriptor = ?descriptor,
                        error = %err,
                        completed = result.len() + 1,
                        total,
                        elapsed = ?started.elapsed(),
                        "descriptor failed"
                    );
                    result.failures.push((descriptor, err));
                }
            }
        }

        tracing::info!(
            target: "turnstile::batch",
            succeeded = result.successes.len(),
            failed = result.failures.len(),
            elapsed = ?started.elapsed(),
            "batch finished"
        );
        result
    }

    /// Run a batch through a guarded endpoint.
    pub async fn run_endpoint<S, P, D>(
        &self,
        guarded: &GuardedEndpoint<S, P, P::Error>,
        descriptors: impl IntoIterator<Item = D>,
    ) -> BatchResult<D, P::Output, P::Error>
    where
        S: CounterStore + 'static,
        P: Endpoint<D>,
        D: Clone + fmt::Debug + Send + Sync,
    {
        self.run(descriptors, move |descriptor| async move { guarded.call(&descriptor).await })
            .await
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
