mod common;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use turnstile::{
    page_requests, AdmissionGate, BatchOrchestrator, Endpoint, GateConfig, GuardedEndpoint,
    MemoryStore, PageRequest, RateKey, RetryPolicy, TrackingSleeper, TransportError,
};

/// Serves pages of numbers. Page index 5 is permanently missing; pages listed in `flaky`
/// fail once with a 503 before succeeding, and pages in `broken` panic.
#[derive(Debug, Default)]
struct Listing {
    flaky: Vec<u64>,
    broken: Vec<u64>,
    attempts: Mutex<HashMap<u64, usize>>,
    running: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl Endpoint<PageRequest> for Listing {
    type Output = Vec<u64>;
    type Error = TransportError;

    async fn call(&self, page: &PageRequest) -> Result<Vec<u64>, TransportError> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(5)).await;
        self.running.fetch_sub(1, Ordering::SeqCst);

        let index = page.start / page.limit.max(1);
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            let n = attempts.entry(index).or_default();
            *n += 1;
            *n
        };
        if self.broken.contains(&index) {
            panic!("page {index} is corrupt");
        }
        if index == 5 {
            return Err(TransportError::Status(404));
        }
        if self.flaky.contains(&index) && attempt == 1 {
            return Err(TransportError::Status(503));
        }
        Ok((page.start..page.start + page.limit).collect())
    }
}

fn guarded(
    listing: Listing,
    max_concurrent: u32,
) -> GuardedEndpoint<MemoryStore, Listing, TransportError> {
    let gate = AdmissionGate::new(
        Arc::new(MemoryStore::new()),
        GateConfig::builder().max_calls_per_window(1_000).max_concurrent(max_concurrent).build().unwrap(),
    );
    let retry = RetryPolicy::builder()
        .max_attempts(3)
        .with_sleeper(TrackingSleeper::new())
        .build()
        .unwrap();
    GuardedEndpoint::new(gate, retry, RateKey::new("listing").unwrap(), listing)
}

#[tokio::test(start_paused = true)]
async fn one_permanent_failure_does_not_sink_the_batch() {
    common::init_tracing();
    let guarded = guarded(Listing { flaky: vec![2, 7], ..Listing::default() }, 4);
    let pages = page_requests(1_000, 100);
    assert_eq!(pages.len(), 10);

    let mut result = BatchOrchestrator::new(5).unwrap().run_endpoint(&guarded, pages).await;

    assert_eq!(result.len(), 10);
    assert_eq!(result.successes.len(), 9);
    assert_eq!(result.failures.len(), 1);
    let (failed_page, err) = &result.failures[0];
    assert_eq!(failed_page.start, 500);
    assert_eq!(err.as_inner(), Some(&TransportError::Status(404)));

    // Flaky pages were retried once each; the missing page was not retried.
    let attempts = guarded.endpoint().attempts.lock().unwrap().clone();
    assert_eq!(attempts[&2], 2);
    assert_eq!(attempts[&7], 2);
    assert_eq!(attempts[&5], 1);

    result.sort_by_descriptor();
    let items: Vec<u64> = result.into_values().into_iter().flatten().collect();
    assert_eq!(items.len(), 900);
    assert_eq!(items[0], 0);
    assert_eq!(items[500], 600);
    assert_eq!(guarded.gate().in_flight(guarded.key()).await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn gate_ceiling_binds_tighter_than_the_pool() {
    let guarded = guarded(Listing::default(), 2);
    let pages: Vec<PageRequest> =
        page_requests(4_000, 100).into_iter().filter(|p| p.start != 500).collect();

    let result = BatchOrchestrator::new(8).unwrap().run_endpoint(&guarded, pages).await;

    assert!(result.is_complete_success());
    assert_eq!(result.len(), 39);
    assert!(guarded.endpoint().peak.load(Ordering::SeqCst) <= 2);
}

#[tokio::test(start_paused = true)]
async fn panicking_page_is_recorded_and_its_slot_returned() {
    let guarded = guarded(Listing { broken: vec![3], ..Listing::default() }, 2);
    let pages: Vec<PageRequest> =
        page_requests(800, 100).into_iter().filter(|p| p.start != 500).collect();

    let result = BatchOrchestrator::new(4).unwrap().run_endpoint(&guarded, pages).await;

    assert_eq!(result.successes.len(), 6);
    assert_eq!(result.failures.len(), 1);
    let (page, err) = &result.failures[0];
    assert_eq!(page.start, 300);
    assert!(err.is_panicked());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(guarded.gate().in_flight(guarded.key()).await.unwrap(), 0);
}
