#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # Turnstile
//!
//! Distributed call admission for async Rust. Many callers, possibly in many processes,
//! share one rate budget and one concurrency ceiling per [`RateKey`] through a
//! [`CounterStore`] (Redis in production, [`MemoryStore`] in tests).
//!
//! ## Pieces
//!
//! - [`RateWindow`]: at most N calls started per fixed window
//! - [`SlotTracker`]: at most M calls in flight
//! - [`AdmissionGate`]: waits for both, hands out tickets, releases exactly once
//! - [`RetryPolicy`]: exponential backoff over transient endpoint failures
//! - [`GuardedEndpoint`]: Retry → Gate → Endpoint
//! - [`BatchOrchestrator`]: bounded fan-out with per-descriptor failure isolation
//! - [`AdmissionLayer`]: the gate as tower middleware
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use turnstile::{AdmissionGate, GateConfig, MemoryStore, RateKey};
//!
//! #[tokio::main]
//! async fn main() {
//!     let gate = AdmissionGate::new(Arc::new(MemoryStore::new()), GateConfig::default());
//!     let key = RateKey::new("my_api_limit_key").unwrap();
//!
//!     let result = gate
//!         .run(&key, || async {
//!             // Your call here; the slot is released however it ends.
//!             Ok::<_, std::io::Error>(())
//!         })
//!         .await;
//!     assert!(result.is_ok());
//! }
//! ```

pub mod backoff;
pub mod batch;
pub mod clock;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod gate;
pub mod jitter;
pub mod key;
pub mod layer;
pub mod retry;
pub mod sleeper;
pub mod slots;
pub mod stack;
pub mod store;
pub mod window;

// Re-exports
pub use backoff::{Backoff, BackoffError};
pub use batch::{BatchOrchestrator, BatchResult};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::{
    BatchConfig, ConfigError, GateConfig, GateConfigBuilder, RetryConfig, TurnstileConfig,
    WindowSpendPolicy,
};
pub use endpoint::{page_requests, Endpoint, PageRequest, Transient, TransportError};
pub use error::{CallError, GateError, StoreError};
pub use gate::{AdmissionGate, AdmissionGuard, AdmissionTicket, TicketId};
pub use jitter::Jitter;
pub use key::{KeyError, KeySpace, RateKey};
pub use layer::{AdmissionLayer, AdmissionService};
pub use retry::{BuildError, RetryPolicy, RetryPolicyBuilder};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use slots::SlotTracker;
pub use stack::GuardedEndpoint;
pub use store::{CounterStore, Decremented, MemoryStore};
pub use window::RateWindow;
