//! Tower middleware that puts an [`AdmissionGate`] in front of any service.
//!
//! Every request is admitted under the layer's rate key before it reaches the inner
//! service, and the slot is released when the inner future completes or is dropped.

use crate::error::CallError;
use crate::gate::AdmissionGate;
use crate::key::RateKey;
use crate::store::CounterStore;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;

/// A layer that admits requests through an [`AdmissionGate`].
#[derive(Debug)]
pub struct AdmissionLayer<S> {
    gate: AdmissionGate<S>,
    key: RateKey,
}

impl<S> Clone for AdmissionLayer<S> {
    fn clone(&self) -> Self {
        Self { gate: self.gate.clone(), key: self.key.clone() }
    }
}

impl<S> AdmissionLayer<S> {
    pub fn new(gate: AdmissionGate<S>, key: RateKey) -> Self {
        Self { gate, key }
    }
}

impl<Svc, S> Layer<Svc> for AdmissionLayer<S> {
    type Service = AdmissionService<Svc, S>;

    fn layer(&self, service: Svc) -> Self::Service {
        AdmissionService { inner: service, gate: self.gate.clone(), key: self.key.clone() }
    }
}

/// Middleware service produced by [`AdmissionLayer`].
#[derive(Debug)]
pub struct AdmissionService<Svc, S> {
    inner: Svc,
    gate: AdmissionGate<S>,
    key: RateKey,
}

impl<Svc: Clone, S> Clone for AdmissionService<Svc, S> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone(), gate: self.gate.clone(), key: self.key.clone() }
    }
}

impl<Svc, S, Req> Service<Req> for AdmissionService<Svc, S>
where
    Svc: Service<Req> + Clone + Send + 'static,
    Svc::Future: Send + 'static,
    Svc::Response: Send + 'static,
    Svc::Error: Send + 'static,
    S: CounterStore + 'static,
    Req: Send + 'static,
{
    type Response = Svc::Response;
    type Error = CallError<Svc::Error>;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(CallError::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        // Keep the instance that was driven to readiness, leave a fresh clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let gate = self.gate.clone();
        let key = self.key.clone();

        Box::pin(async move { gate.run(&key, move || inner.call(req)).await })
    }
}
