//! Every admitted slot comes back, however the protected section ends.

mod common;

use common::FlakyStore;
use std::sync::Arc;
use std::time::Duration;
use turnstile::{AdmissionGate, CallError, GateConfig, MemoryStore, RateKey};

fn gate<S: turnstile::CounterStore + 'static>(store: S) -> AdmissionGate<S> {
    AdmissionGate::new(
        Arc::new(store),
        GateConfig::builder().max_calls_per_window(10_000).max_concurrent(2).build().unwrap(),
    )
}

fn key() -> RateKey {
    RateKey::new("leak").unwrap()
}

async fn explode() -> Result<(), std::io::Error> {
    tokio::time::sleep(Duration::from_millis(5)).await;
    panic!("endpoint blew up")
}

/// Give background releases a chance to run.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test(start_paused = true)]
async fn error_in_protected_section() {
    let gate = gate(MemoryStore::new());
    for _ in 0..5 {
        let result: Result<(), CallError<std::io::Error>> =
            gate.run(&key(), || async { Err(std::io::Error::other("boom")) }).await;
        assert!(result.unwrap_err().is_inner());
    }
    assert_eq!(gate.in_flight(&key()).await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn panic_in_protected_section() {
    let gate = gate(MemoryStore::new());
    for _ in 0..3 {
        let worker = gate.clone();
        let joined = tokio::spawn(async move {
            worker.run(&key(), explode).await
        })
        .await;
        assert!(joined.unwrap_err().is_panic());
    }
    settle().await;
    assert_eq!(gate.in_flight(&key()).await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn cancellation_inside_protected_section() {
    let gate = gate(MemoryStore::new());
    for _ in 0..3 {
        let outcome = tokio::time::timeout(
            Duration::from_millis(10),
            gate.run(&key(), || async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok::<_, std::io::Error>(())
            }),
        )
        .await;
        assert!(outcome.is_err());
    }
    settle().await;
    assert_eq!(gate.in_flight(&key()).await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn cancellation_at_every_point_of_acquire() {
    // Slow store so every store round trip is a distinct cancellation point.
    let store = FlakyStore::new();
    store.set_latency(Duration::from_millis(3));
    let gate = gate(store);

    for cancel_after in 0..30u64 {
        let outcome =
            tokio::time::timeout(Duration::from_millis(cancel_after), gate.acquire(&key())).await;
        if let Ok(ticket) = outcome {
            gate.release(&ticket.unwrap()).await.unwrap();
        }
        settle().await;
        assert_eq!(
            gate.in_flight(&key()).await.unwrap(),
            0,
            "slot leaked when cancelled after {cancel_after}ms"
        );
    }
}

#[tokio::test(start_paused = true)]
async fn cancelled_waiter_does_not_take_a_slot() {
    let gate = gate(MemoryStore::new());
    let a = gate.acquire(&key()).await.unwrap();
    let b = gate.acquire(&key()).await.unwrap();

    let waiter = {
        let gate = gate.clone();
        tokio::spawn(async move { gate.acquire(&key()).await })
    };
    tokio::time::sleep(Duration::from_millis(40)).await;
    waiter.abort();
    assert!(waiter.await.unwrap_err().is_cancelled());

    gate.release(&a).await.unwrap();
    gate.release(&b).await.unwrap();
    settle().await;
    assert_eq!(gate.in_flight(&key()).await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn dropped_guard_outside_run_is_released() {
    let gate = gate(MemoryStore::new());
    let guards = vec![gate.admit(&key()).await.unwrap(), gate.admit(&key()).await.unwrap()];
    assert_eq!(gate.in_flight(&key()).await.unwrap(), 2);
    drop(guards);
    settle().await;
    assert_eq!(gate.in_flight(&key()).await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn lost_claim_reply_does_not_leak_a_slot() {
    let store = FlakyStore::new();
    let gate = gate(store.clone());

    store.lose_slot_replies(1);
    let ticket = gate.acquire(&key()).await.unwrap();
    assert_eq!(gate.in_flight(&key()).await.unwrap(), 1);

    gate.release(&ticket).await.unwrap();
    assert_eq!(gate.in_flight(&key()).await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn lost_release_reply_cannot_free_another_holders_slot() {
    let store = FlakyStore::new();
    let gate = gate(store.clone());
    let a = gate.acquire(&key()).await.unwrap();
    let b = gate.acquire(&key()).await.unwrap();

    store.lose_slot_replies(1);
    gate.release(&a).await.unwrap();
    assert_eq!(gate.in_flight(&key()).await.unwrap(), 1);

    let c = gate.acquire(&key()).await.unwrap();
    let extra = gate.acquire_timeout(&key(), Duration::from_millis(100)).await;
    assert!(extra.unwrap_err().is_admission_timeout(), "ceiling of 2 exceeded while b is held");

    gate.release(&b).await.unwrap();
    gate.release(&c).await.unwrap();
    assert_eq!(gate.in_flight(&key()).await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn timed_out_acquire_withdraws_a_claim_of_unknown_outcome() {
    let store = FlakyStore::new();
    let gate = gate(store.clone());

    store.lose_slot_replies(u64::MAX);
    let err = gate.acquire_timeout(&key(), Duration::from_millis(50)).await.unwrap_err();
    assert!(err.is_admission_timeout());

    store.lose_slot_replies(0);
    settle().await;
    assert_eq!(gate.in_flight(&key()).await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn dropped_acquire_withdraws_a_claim_of_unknown_outcome() {
    let store = FlakyStore::new();
    let gate = gate(store.clone());

    store.lose_slot_replies(u64::MAX);
    let outcome = tokio::time::timeout(Duration::from_millis(50), gate.acquire(&key())).await;
    assert!(outcome.is_err());

    store.lose_slot_replies(0);
    settle().await;
    assert_eq!(gate.in_flight(&key()).await.unwrap(), 0);

    let a = gate.acquire(&key()).await.unwrap();
    let b = gate.acquire(&key()).await.unwrap();
    gate.release(&a).await.unwrap();
    gate.release(&b).await.unwrap();
}
