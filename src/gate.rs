//! Admission gate: rate window plus concurrency slots, shared through a counter store.
//!
//! A caller is admitted once it has taken one unit of window budget *and* one in-flight
//! slot for its [`RateKey`]. Admission yields an [`AdmissionTicket`] that must be released
//! exactly once; [`AdmissionGate::admit`] and [`AdmissionGate::run`] wrap that in a guard
//! that releases on every exit path, including panics and cancelled futures.
//!
//! ```text
//! Waiting ──window + slot──▶ Admitted ──release──▶ Released
//!    │
//!    └─ deadline / store outage ─▶ error (no slot held)
//! ```
//!
//! Polling is plain sleep-and-retry with jittered intervals. There is no fairness queue;
//! under sustained overload a waiter can starve.

use crate::config::{GateConfig, WindowSpendPolicy};
use crate::error::{CallError, GateError, StoreError};
use crate::jitter::Jitter;
use crate::key::RateKey;
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::slots::SlotTracker;
use crate::store::CounterStore;
use crate::window::RateWindow;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use uuid::Uuid;

static NEXT_GATE_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier of an admission ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TicketId(Uuid);

impl TicketId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for TicketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Proof of admission. Holds one in-flight slot until released.
#[derive(Debug)]
pub struct AdmissionTicket {
    id: TicketId,
    key: RateKey,
    gate_id: u64,
    admitted_at: Instant,
    waited: Duration,
    released: AtomicBool,
    release_attempted: AtomicBool,
}

impl AdmissionTicket {
    pub fn id(&self) -> TicketId {
        self.id
    }

    pub fn key(&self) -> &RateKey {
        &self.key
    }

    pub fn admitted_at(&self) -> Instant {
        self.admitted_at
    }

    /// Time spent waiting for admission.
    pub fn waited(&self) -> Duration {
        self.waited
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

#[derive(Debug)]
struct GateInner<S> {
    id: u64,
    config: GateConfig,
    window: RateWindow<S>,
    slots: SlotTracker<S>,
    sleeper: Arc<dyn Sleeper>,
    jitter: Jitter,
}

/// Consecutive store failures, measured from the first one.
#[derive(Debug, Default)]
struct Outage {
    since: Option<Instant>,
}

impl Outage {
    fn clear(&mut self) {
        self.since = None;
    }

    fn record(&mut self, err: StoreError, patience: Duration) -> Result<(), GateError> {
        let since = *self.since.get_or_insert_with(Instant::now);
        let waited = since.elapsed();
        if waited >= patience {
            tracing::error!(
                target: "turnstile::gate",
                error = %err,
                ?waited,
                "counter store unavailable, giving up"
            );
            return Err(GateError::StoreUnavailable { source: err, waited });
        }
        tracing::warn!(target: "turnstile::gate", error = %err, ?waited, "counter store error, retrying");
        Ok(())
    }
}

impl<S> GateInner<S>
where
    S: CounterStore + 'static,
{
    /// Free `holder`'s slot, riding out store errors for up to `store_patience`.
    ///
    /// With `expect_held`, finding no slot on the first attempt is a caller bug and logged as
    /// an error. After a failed attempt an empty result means that attempt landed.
    async fn release_slot_patiently(
        &self,
        key: &RateKey,
        holder: TicketId,
        expect_held: bool,
    ) -> Result<(), GateError> {
        let member = holder.to_string();
        let mut outage = Outage::default();
        let mut attempted = false;
        loop {
            match self.slots.release_slot(key, &member).await {
                Ok(true) => return Ok(()),
                Ok(false) if expect_held && !attempted => {
                    tracing::error!(
                        target: "turnstile::gate",
                        key = %key,
                        ticket = %holder,
                        "released a slot that was not held; count left unchanged"
                    );
                    return Ok(());
                }
                Ok(false) => return Ok(()),
                Err(err) => outage.record(err, self.config.store_patience())?,
            }
            attempted = true;
            self.sleeper.sleep(self.jitter.apply(self.config.slot_poll_interval())).await;
        }
    }

    /// Apply the spend policy to window budget taken by an acquire that never got a slot.
    async fn settle_spent_window(&self, key: &RateKey, spent_at: Instant) {
        match self.config.window_spend_policy() {
            WindowSpendPolicy::Forfeit => {
                tracing::debug!(target: "turnstile::gate", key = %key, "window budget forfeited");
            }
            WindowSpendPolicy::RefundOnTimeout => {
                match self.window.refund(key, spent_at.elapsed(), self.config.window_duration()).await
                {
                    Ok(refunded) => {
                        tracing::debug!(target: "turnstile::gate", key = %key, refunded, "window refund")
                    }
                    Err(err) => {
                        tracing::warn!(target: "turnstile::gate", key = %key, error = %err, "window refund failed")
                    }
                }
            }
        }
    }
}

/// Finish store work from a context that cannot await, such as `Drop`.
fn spawn_detached<F>(key: &RateKey, reason: &'static str, work: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            tracing::debug!(target: "turnstile::gate", key = %key, reason, "finishing in background");
            handle.spawn(work);
        }
        Err(_) => {
            tracing::error!(
                target: "turnstile::gate",
                key = %key,
                reason,
                "no tokio runtime to finish on; counters left as they are"
            );
        }
    }
}

fn spawn_release<S>(
    inner: Arc<GateInner<S>>,
    key: RateKey,
    holder: TicketId,
    expect_held: bool,
    reason: &'static str,
) where
    S: CounterStore + 'static,
{
    let label = key.clone();
    spawn_detached(&label, reason, async move {
        if let Err(err) = inner.release_slot_patiently(&key, holder, expect_held).await {
            tracing::error!(
                target: "turnstile::gate",
                key = %key,
                ticket = %holder,
                error = %err,
                "background release failed; in-flight slot leaked"
            );
        }
    });
}

/// A slot taken by the claim task. Gives the slot back when dropped unless kept.
struct ClaimedSlot<S>
where
    S: CounterStore + 'static,
{
    held: Option<(Arc<GateInner<S>>, RateKey, TicketId)>,
}

impl<S> ClaimedSlot<S>
where
    S: CounterStore + 'static,
{
    fn keep(mut self) {
        self.held = None;
    }
}

impl<S> Drop for ClaimedSlot<S>
where
    S: CounterStore + 'static,
{
    fn drop(&mut self) {
        if let Some((inner, key, holder)) = self.held.take() {
            spawn_release(inner, key, holder, true, "waiter gone after slot claim");
        }
    }
}

/// An acquire in progress.
///
/// Tracks what the waiter has changed in the store so that an acquire which ends without a
/// ticket, whether by error or by being dropped, leaves nothing behind: a slot claim whose
/// reply was lost is withdrawn, and under [`WindowSpendPolicy::RefundOnTimeout`] spent
/// window budget is returned.
struct PendingAdmission<S>
where
    S: CounterStore + 'static,
{
    inner: Arc<GateInner<S>>,
    key: RateKey,
    holder: TicketId,
    spent_at: Option<Instant>,
    claim_unknown: bool,
    settled: bool,
}

impl<S> PendingAdmission<S>
where
    S: CounterStore + 'static,
{
    fn new(inner: Arc<GateInner<S>>, key: RateKey) -> Self {
        Self {
            inner,
            key,
            holder: TicketId::new(),
            spent_at: None,
            claim_unknown: false,
            settled: false,
        }
    }

    fn admitted(mut self) -> TicketId {
        self.settled = true;
        self.holder
    }

    fn withdraw_unknown_claim(&self, reason: &'static str) {
        if self.claim_unknown {
            spawn_release(Arc::clone(&self.inner), self.key.clone(), self.holder, false, reason);
        }
    }

    /// Settle an acquire that failed with `err`.
    async fn abandon(mut self, err: &GateError) {
        self.settled = true;
        self.withdraw_unknown_claim("acquire failed with slot claim outcome unknown");
        if let (Some(spent_at), true) = (self.spent_at, err.is_admission_timeout()) {
            self.inner.settle_spent_window(&self.key, spent_at).await;
        }
    }
}

impl<S> Drop for PendingAdmission<S>
where
    S: CounterStore + 'static,
{
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        self.withdraw_unknown_claim("waiter gone with slot claim outcome unknown");
        if let Some(spent_at) = self.spent_at {
            if self.inner.config.window_spend_policy() == WindowSpendPolicy::RefundOnTimeout {
                let inner = Arc::clone(&self.inner);
                let key = self.key.clone();
                spawn_detached(&self.key, "waiter gone after window spend", async move {
                    inner.settle_spent_window(&key, spent_at).await;
                });
            }
        }
    }
}

/// Distributed admission gate.
///
/// Cheap to clone; clones share configuration and identity. Gates in different processes
/// built over the same store enforce one combined budget per key.
#[derive(Debug)]
pub struct AdmissionGate<S> {
    inner: Arc<GateInner<S>>,
}

impl<S> Clone for AdmissionGate<S> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<S> AdmissionGate<S>
where
    S: CounterStore + 'static,
{
    pub fn new(store: Arc<S>, config: GateConfig) -> Self {
        Self::with_sleeper(store, config, Arc::new(TokioSleeper))
    }

    /// Build a gate that waits between polls through `sleeper`.
    pub fn with_sleeper(store: Arc<S>, config: GateConfig, sleeper: Arc<dyn Sleeper>) -> Self {
        let keys = config.key_space().clone();
        Self {
            inner: Arc::new(GateInner {
                id: NEXT_GATE_ID.fetch_add(1, Ordering::Relaxed),
                window: RateWindow::new(Arc::clone(&store), keys.clone()),
                slots: SlotTracker::new(store, keys),
                config,
                sleeper,
                jitter: Jitter::Equal,
            }),
        }
    }

    pub fn config(&self) -> &GateConfig {
        &self.inner.config
    }

    /// Calls currently admitted and not yet released, across every gate sharing the store.
    pub async fn in_flight(&self, key: &RateKey) -> Result<i64, StoreError> {
        self.inner.slots.in_flight(key).await
    }

    /// Window budget consumed in the current window.
    pub async fn window_count(&self, key: &RateKey) -> Result<i64, StoreError> {
        self.inner.window.count(key).await
    }

    /// Wait for admission, bounded by the configured `acquire_timeout` if any.
    ///
    /// Dropping the returned future is safe at any point: a slot won for it is given back,
    /// and under [`WindowSpendPolicy::RefundOnTimeout`] window budget it spent is returned.
    pub async fn acquire(&self, key: &RateKey) -> Result<AdmissionTicket, GateError> {
        self.acquire_inner(key, self.inner.config.acquire_timeout()).await
    }

    /// Wait for admission for at most `budget`.
    ///
    /// On expiry no slot is held. Whether window budget was consumed is reported in
    /// [`GateError::AdmissionTimeout`] and handled per the configured
    /// [`WindowSpendPolicy`].
    pub async fn acquire_timeout(
        &self,
        key: &RateKey,
        budget: Duration,
    ) -> Result<AdmissionTicket, GateError> {
        self.acquire_inner(key, Some(budget)).await
    }

    async fn acquire_inner(
        &self,
        key: &RateKey,
        budget: Option<Duration>,
    ) -> Result<AdmissionTicket, GateError> {
        let started = Instant::now();
        let deadline = budget.map(|b| started + b);
        let config = &self.inner.config;
        let mut pending = PendingAdmission::new(Arc::clone(&self.inner), key.clone());
        let mut outage = Outage::default();

        loop {
            match self
                .inner
                .window
                .try_consume(key, config.max_calls_per_window(), config.window_duration())
                .await
            {
                Ok(true) => break,
                Ok(false) => outage.clear(),
                Err(err) => outage.record(err, config.store_patience())?,
            }
            self.pause(config.window_poll_interval(), started, deadline, false).await?;
        }
        pending.spent_at = Some(Instant::now());

        if let Err(err) = self.wait_for_slot(&mut pending, started, deadline).await {
            pending.abandon(&err).await;
            return Err(err);
        }

        let ticket = AdmissionTicket {
            id: pending.admitted(),
            key: key.clone(),
            gate_id: self.inner.id,
            admitted_at: Instant::now(),
            waited: started.elapsed(),
            released: AtomicBool::new(false),
            release_attempted: AtomicBool::new(false),
        };
        tracing::debug!(
            target: "turnstile::gate",
            key = %key,
            ticket = %ticket.id,
            waited = ?ticket.waited,
            "admitted"
        );
        Ok(ticket)
    }

    async fn wait_for_slot(
        &self,
        pending: &mut PendingAdmission<S>,
        started: Instant,
        deadline: Option<Instant>,
    ) -> Result<(), GateError> {
        let config = &self.inner.config;
        let mut outage = Outage::default();
        loop {
            match self.claim_slot(&pending.key, pending.holder).await {
                Ok(Some(slot)) => {
                    slot.keep();
                    return Ok(());
                }
                Ok(None) => {
                    // A rejected claim proves no earlier attempt of ours landed.
                    pending.claim_unknown = false;
                    outage.clear();
                }
                Err(err) => {
                    pending.claim_unknown = true;
                    outage.record(err, config.store_patience())?;
                }
            }
            self.pause(config.slot_poll_interval(), started, deadline, true).await?;
        }
    }

    /// One slot attempt for `holder`, run to completion on its own task.
    ///
    /// If the waiter is dropped while the claim is in flight, the claim cleans up after
    /// itself: a won slot is returned, and a failed attempt that may have landed is
    /// withdrawn.
    async fn claim_slot(
        &self,
        key: &RateKey,
        holder: TicketId,
    ) -> Result<Option<ClaimedSlot<S>>, StoreError> {
        let (tx, rx) = oneshot::channel();
        let inner = Arc::clone(&self.inner);
        let key = key.clone();
        tokio::spawn(async move {
            let outcome = inner
                .slots
                .try_acquire_slot(&key, &holder.to_string(), inner.config.max_concurrent())
                .await
                .map(|won| {
                    won.then(|| ClaimedSlot {
                        held: Some((Arc::clone(&inner), key.clone(), holder)),
                    })
                });
            // A returned `Ok` drops the claim, which releases it.
            if let Err(Err(_)) = tx.send(outcome) {
                let reason = "waiter gone with slot claim outcome unknown";
                spawn_release(inner, key, holder, false, reason);
            }
        });
        rx.await.map_err(|_| StoreError::Unavailable("slot claim task aborted".into()))?
    }

    async fn pause(
        &self,
        interval: Duration,
        started: Instant,
        deadline: Option<Instant>,
        window_spent: bool,
    ) -> Result<(), GateError> {
        let timed_out = || GateError::AdmissionTimeout { waited: started.elapsed(), window_spent };
        let mut delay = self.inner.jitter.apply(interval);
        if let Some(deadline) = deadline {
            let now = Instant::now();
            if now >= deadline {
                return Err(timed_out());
            }
            delay = delay.min(deadline - now);
        }
        self.inner.sleeper.sleep(delay).await;
        if deadline.is_some_and(|d| Instant::now() >= d) {
            tracing::debug!(target: "turnstile::gate", waited = ?started.elapsed(), window_spent, "admission timed out");
            return Err(timed_out());
        }
        Ok(())
    }

    /// Give back the ticket's slot.
    ///
    /// A ticket is released at most once: a second call, or a ticket issued by another
    /// gate, fails with [`GateError::DoubleRelease`] without touching any counter. If the
    /// store stays unavailable the ticket remains unreleased so the call can be repeated;
    /// repeating it never frees a slot held by another ticket.
    pub async fn release(&self, ticket: &AdmissionTicket) -> Result<(), GateError> {
        if ticket.gate_id != self.inner.id || ticket.released.swap(true, Ordering::AcqRel) {
            tracing::warn!(target: "turnstile::gate", ticket = %ticket.id, "rejected double release");
            return Err(GateError::DoubleRelease { ticket: ticket.id });
        }
        let expect_held = !ticket.release_attempted.swap(true, Ordering::AcqRel);

        // Spawned so the release completes even if this future is dropped.
        let inner = Arc::clone(&self.inner);
        let key = ticket.key.clone();
        let holder = ticket.id;
        let outcome =
            tokio::spawn(async move { inner.release_slot_patiently(&key, holder, expect_held).await })
                .await
                .unwrap_or_else(|join| {
                    Err(GateError::StoreUnavailable {
                        source: StoreError::Unavailable(format!("release task failed: {join}")),
                        waited: Duration::ZERO,
                    })
                });

        match outcome {
            Ok(()) => {
                tracing::debug!(
                    target: "turnstile::gate",
                    key = %ticket.key,
                    ticket = %ticket.id,
                    held = ?ticket.admitted_at.elapsed(),
                    "released"
                );
                Ok(())
            }
            Err(err) => {
                ticket.released.store(false, Ordering::Release);
                Err(err)
            }
        }
    }

    /// Acquire and wrap the ticket in a guard that releases on drop.
    pub async fn admit(&self, key: &RateKey) -> Result<AdmissionGuard<S>, GateError> {
        let ticket = self.acquire(key).await?;
        Ok(AdmissionGuard { gate: self.clone(), ticket })
    }

    /// Run `op` under admission.
    ///
    /// The slot is released whether `op` succeeds, fails, panics or is cancelled. A release
    /// failure after `op` completed does not replace its outcome; the guard keeps retrying
    /// in the background.
    pub async fn run<T, E, F, Fut>(&self, key: &RateKey, op: F) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let guard = self.admit(key).await?;
        let outcome = op().await;
        if let Err(err) = guard.release().await {
            tracing::warn!(target: "turnstile::gate", key = %key, error = %err, "release after call failed");
        }
        outcome.map_err(CallError::Inner)
    }
}

/// Scoped admission. Releases its slot when dropped unless released explicitly.
///
/// Dropping spawns the release onto the current tokio runtime; outside a runtime the slot
/// cannot be returned and an error is logged.
#[derive(Debug)]
pub struct AdmissionGuard<S>
where
    S: CounterStore + 'static,
{
    gate: AdmissionGate<S>,
    ticket: AdmissionTicket,
}

impl<S> AdmissionGuard<S>
where
    S: CounterStore + 'static,
{
    pub fn ticket(&self) -> &AdmissionTicket {
        &self.ticket
    }

    /// Release now and observe the result. On failure the release is retried in the
    /// background when the guard drops.
    pub async fn release(self) -> Result<(), GateError> {
        self.gate.release(&self.ticket).await
    }
}

impl<S> Drop for AdmissionGuard<S>
where
    S: CounterStore + 'static,
{
    fn drop(&mut self) {
        if self.ticket.released.swap(true, Ordering::AcqRel) {
            return;
        }
        let expect_held = !self.ticket.release_attempted.swap(true, Ordering::AcqRel);
        spawn_release(
            Arc::clone(&self.gate.inner),
            self.ticket.key.clone(),
            self.ticket.id,
            expect_held,
            "guard dropped",
        );
    }
}
