//! Fetch 100 posts in pages of 5 through a guarded endpoint.
//!
//! The endpoint is simulated: it sleeps a little and fails transiently now and then, so the
//! output shows admissions, retries and completion-order progress.
//!
//! Run with `RUST_LOG=turnstile=debug cargo run --example paginate` for gate-level events.

use async_trait::async_trait;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use turnstile::{
    page_requests, BatchOrchestrator, Endpoint, GateConfig, GuardedEndpoint, MemoryStore,
    PageRequest, RateKey, RetryConfig, TransportError, TurnstileConfig,
};

const TOTAL_POSTS: u64 = 100;
const PAGE_SIZE: u64 = 5;

#[derive(Debug, Clone)]
struct Post {
    id: u64,
    title: String,
}

#[derive(Debug)]
struct SimulatedPosts;

#[async_trait]
impl Endpoint<PageRequest> for SimulatedPosts {
    type Output = Vec<Post>;
    type Error = TransportError;

    async fn call(&self, page: &PageRequest) -> Result<Vec<Post>, TransportError> {
        let (latency, roll) = {
            let mut rng = rand::rng();
            (rng.random_range(20..120), rng.random_range(0..10u8))
        };
        tokio::time::sleep(Duration::from_millis(latency)).await;
        match roll {
            0 => Err(TransportError::Status(503)),
            1 => Err(TransportError::Timeout),
            _ => Ok((page.start..page.start + page.limit)
                .map(|id| Post { id: id + 1, title: format!("post #{}", id + 1) })
                .collect()),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut config = TurnstileConfig::new(RateKey::new("my_api_limit_key")?);
    config.gate = GateConfig::builder()
        .max_calls_per_window(10)
        .window_duration(Duration::from_secs(1))
        .max_concurrent(4)
        .build()?;
    config.retry = RetryConfig {
        attempts: 5,
        backoff_base: Duration::from_millis(200),
        backoff_cap: Duration::from_secs(1),
    };

    let store = Arc::new(MemoryStore::new());
    let guarded = GuardedEndpoint::from_config(store, &config, SimulatedPosts)?;
    let batch = BatchOrchestrator::from_config(&config.batch)?;

    let mut result = batch.run_endpoint(&guarded, page_requests(TOTAL_POSTS, PAGE_SIZE)).await;
    for (page, err) in &result.failures {
        tracing::error!(start = page.start, error = %err, "page failed");
    }
    result.sort_by_descriptor();
    let posts: Vec<Post> = result.into_values().into_iter().flatten().collect();
    if let Some(last) = posts.last() {
        tracing::info!(id = last.id, title = %last.title, "last post");
    }
    println!("Total posts fetched: {}", posts.len());
    Ok(())
}
