//! The DLQ processing loop: backoff retries, poison quarantine, escalation,
//! and bulk replay.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::interval;
use tracing::{debug, error, info, instrument, warn};

use common::shutdown::ShutdownChannel;
use common::task::LxTask;

use crate::amount::MicroDollars;
use crate::config::Config;
use crate::dlq::stream::{DlqEntry, DlqStream, PoisonedEntry};
use crate::ids::{BillingEntryId, CorrelationId, TenantId};

/// Up to this many ready entries are dispatched per processing-loop tick.
pub const DLQ_BATCH_SIZE: usize = 10;
/// How often the processing loop ticks.
pub const DLQ_TICK_INTERVAL: Duration = Duration::from_secs(5);
/// Upper bound on how many poisoned entries a single `bulk_replay` call
/// drains, so an administrator invocation can't runaway over an unbounded
/// poison stream.
pub const DLQ_BULK_REPLAY_MAX: usize = 500;
/// Default bounded concurrency for `bulk_replay`.
pub const DLQ_BULK_REPLAY_CONCURRENCY: usize = 5;

/// The outcome of one finalize attempt, as observed by the DLQ processor.
/// Distinct from [`crate::error::FinalizeOutcome`], which classifies a raw
/// transport response: by the time the DLQ sees an attempt, idempotent and
/// genuine successes are already collapsed into `Success`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FinalizeAttempt {
    Success,
    Failure(String),
}

/// Re-invoked by the processing loop for each ready entry, and by
/// `bulk_replay` for each drained poison entry.
#[async_trait]
pub trait FinalizeCallback: Send + Sync {
    async fn call(&self, entry: &DlqEntry) -> FinalizeAttempt;
}

/// Invoked exactly once when an entry is first quarantined.
#[async_trait]
pub trait PoisonCallback: Send + Sync {
    async fn on_poison(&self, entry: &PoisonedEntry);
}

/// Invoked exactly once per scan for each poisoned entry that has aged past
/// the escalation window.
#[async_trait]
pub trait EscalationCallback: Send + Sync {
    async fn on_escalation(&self, entry: &PoisonedEntry);
}

/// Owns the pending/poison streams and drives retries, poisoning,
/// escalation, and bulk replay.
pub struct DlqProcessor {
    stream: Arc<dyn DlqStream>,
    config: Arc<Config>,
    /// Poisoned entries that have already fired an escalation callback, so a
    /// later scan doesn't re-fire for the same entry. Keyed by billing entry
    /// id; an entry is removed from this set if it's ever un-poisoned (bulk
    /// replay success), so a future re-poisoning re-escalates from scratch.
    escalated: Mutex<HashSet<BillingEntryId>>,
}

impl DlqProcessor {
    pub fn new(stream: Arc<dyn DlqStream>, config: Arc<Config>) -> Self {
        Self {
            stream,
            config,
            escalated: Mutex::new(HashSet::new()),
        }
    }

    #[instrument(skip_all, fields(entry_id = %entry_id, tenant = %tenant))]
    pub async fn enqueue(
        &self,
        entry_id: BillingEntryId,
        tenant: TenantId,
        actual_cost: MicroDollars,
        correlation_id: CorrelationId,
        reason: String,
        now: common::time::TimestampMillis,
    ) {
        let attempt = 1;
        let next_retry_at = add_millis(now, self.config.backoff_for_attempt(attempt));
        let entry = DlqEntry {
            billing_entry_id: entry_id,
            tenant,
            actual_cost,
            correlation_id,
            attempt,
            reason,
            created_at: now,
            next_retry_at,
        };
        self.stream.enqueue(entry).await;
    }

    /// Process up to [`DLQ_BATCH_SIZE`] ready entries: poison anything that's
    /// exhausted its retry budget, otherwise re-invoke `callback` and either
    /// remove (success) or re-enqueue with incremented attempt (failure).
    #[instrument(skip_all)]
    pub async fn tick(
        &self,
        callback: &dyn FinalizeCallback,
        poison_callback: Option<&dyn PoisonCallback>,
        now: common::time::TimestampMillis,
    ) {
        let ready = self.stream.read_ready(now, DLQ_BATCH_SIZE).await;
        for entry in ready {
            if entry.attempt >= self.config.max_dlq_retries {
                error!(
                    entry_id = %entry.billing_entry_id,
                    attempts = entry.attempt,
                    "billing_finalize_poison"
                );
                self.stream.move_to_poison(entry.clone(), now).await;
                if let Some(cb) = poison_callback {
                    cb.on_poison(&PoisonedEntry { entry, poisoned_at: now }).await;
                }
                continue;
            }

            match callback.call(&entry).await {
                FinalizeAttempt::Success => {
                    debug!(entry_id = %entry.billing_entry_id, "finalize retry succeeded");
                    self.stream.ack_remove(&entry.billing_entry_id).await;
                }
                FinalizeAttempt::Failure(reason) => {
                    let new_attempt = entry.attempt + 1;
                    let next_retry_at = add_millis(now, self.config.backoff_for_attempt(new_attempt));
                    warn!(
                        entry_id = %entry.billing_entry_id,
                        attempt = new_attempt,
                        reason = %reason,
                        "finalize retry failed, re-enqueueing"
                    );
                    self.stream
                        .ack_requeue(DlqEntry {
                            attempt: new_attempt,
                            reason,
                            next_retry_at,
                            ..entry
                        })
                        .await;
                }
            }
        }
    }

    /// Scan the poison stream for entries older than
    /// `config.escalation_window_ms` and fire `callback` exactly once per
    /// entry (across all scans, until the entry leaves the poison stream).
    pub async fn check_escalations(&self, callback: &dyn EscalationCallback, now: common::time::TimestampMillis) {
        let window = self.config.escalation_window();
        let mut escalated = self.escalated.lock().await;
        for poisoned in self.stream.poison_entries().await {
            let age = now.as_i64().saturating_sub(poisoned.poisoned_at.as_i64());
            if age < window.as_millis() as i64 {
                continue;
            }
            let id = poisoned.entry.billing_entry_id.clone();
            if escalated.insert(id) {
                callback.on_escalation(&poisoned).await;
            }
        }
    }

    /// Drain up to [`DLQ_BULK_REPLAY_MAX`] poisoned entries, re-invoking
    /// `callback` under `concurrency`-bounded parallelism. Entries that
    /// succeed are removed from the poison stream and their escalation
    /// marker cleared; entries that fail are left in place.
    pub async fn bulk_replay(&self, callback: Arc<dyn FinalizeCallback>, concurrency: usize) {
        let poisoned = self.stream.poison_entries().await;
        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
        let mut tasks = Vec::new();
        for poisoned_entry in poisoned.into_iter().take(DLQ_BULK_REPLAY_MAX) {
            let semaphore = semaphore.clone();
            let callback = callback.clone();
            tasks.push(tokio::spawn(async move {
                let _permit = semaphore.acquire().await.expect("semaphore never closed");
                let outcome = callback.call(&poisoned_entry.entry).await;
                (poisoned_entry, outcome)
            }));
        }
        for task in tasks {
            let (poisoned_entry, outcome) = task.await.expect("bulk replay task panicked");
            if outcome == FinalizeAttempt::Success {
                self.stream.remove_poison(&poisoned_entry.entry.billing_entry_id).await;
                self.escalated.lock().await.remove(&poisoned_entry.entry.billing_entry_id);
                info!(entry_id = %poisoned_entry.entry.billing_entry_id, "bulk replay succeeded");
            } else {
                warn!(entry_id = %poisoned_entry.entry.billing_entry_id, "bulk replay attempt failed, left in poison stream");
            }
        }
    }

    /// Whether a new reserve should be admitted for `tenant` given
    /// `pending_cost` (the new request's estimated cost): the combined value
    /// of everything already at risk for this tenant (pending finalize
    /// retries plus quarantined poison entries) plus `pending_cost` must not
    /// exceed `config.max_pending_risk_cu`.
    pub async fn check_capped_risk(&self, tenant: &TenantId, pending_cost: MicroDollars) -> bool {
        let pending = self.stream.pending_for_tenant(tenant).await;
        let poison = self.stream.poison_entries().await;
        let mut total = pending_cost;
        for entry in pending {
            total = total.checked_add(entry.actual_cost).unwrap_or(MicroDollars::from_micros(u128::MAX));
        }
        for poisoned in poison.iter().filter(|p| &p.entry.tenant == tenant) {
            total = total
                .checked_add(poisoned.entry.actual_cost)
                .unwrap_or(MicroDollars::from_micros(u128::MAX));
        }
        total.as_micros() <= self.config.max_pending_risk_cu as u128
    }

    pub async fn pending_count(&self) -> usize {
        self.stream.pending_count().await
    }

    /// Spawn the periodic processing loop: each tick drains ready entries via
    /// `callback` and scans for newly-escalatable poison entries. Shares
    /// `shutdown` with the process's other supervised loops so one signal
    /// stops all of them. Mirrors the same `tokio::time`/`LxTask` loop shape
    /// as [`crate::reconciliation::ReconciliationClient::start`].
    pub fn start(
        self: Arc<Self>,
        callback: Arc<dyn FinalizeCallback>,
        poison_callback: Option<Arc<dyn PoisonCallback>>,
        escalation_callback: Option<Arc<dyn EscalationCallback>>,
        shutdown: ShutdownChannel,
    ) -> LxTask<()> {
        LxTask::spawn(async move {
            let mut timer = interval(DLQ_TICK_INTERVAL);
            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        let now = common::time::TimestampMillis::now();
                        self.tick(callback.as_ref(), poison_callback.as_deref(), now).await;
                        if let Some(escalation_callback) = &escalation_callback {
                            self.check_escalations(escalation_callback.as_ref(), now).await;
                        }
                    }
                    () = shutdown.recv() => {
                        info!("dlq processor shutting down");
                        break;
                    }
                }
            }
        })
    }
}

fn add_millis(ts: common::time::TimestampMillis, duration: Duration) -> common::time::TimestampMillis {
    common::time::TimestampMillis::try_from(std::time::SystemTime::from(ts) + duration)
        .expect("retry timestamp overflowed Unix epoch bounds")
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::dlq::stream::InMemoryDlqStream;

    struct AlwaysFail;
    #[async_trait]
    impl FinalizeCallback for AlwaysFail {
        async fn call(&self, _entry: &DlqEntry) -> FinalizeAttempt {
            FinalizeAttempt::Failure("http_500".to_owned())
        }
    }

    struct CountingPoisonCallback {
        count: AtomicU32,
    }
    #[async_trait]
    impl PoisonCallback for CountingPoisonCallback {
        async fn on_poison(&self, _entry: &PoisonedEntry) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn config() -> Arc<Config> {
        let mut c = Config::default();
        c.challenge_secret = vec![0u8; 32];
        Arc::new(c)
    }

    #[tokio::test(start_paused = true)]
    async fn five_consecutive_failures_poison_the_entry() {
        let stream = Arc::new(InMemoryDlqStream::new());
        let processor = DlqProcessor::new(stream.clone(), config());
        let poison_cb = CountingPoisonCallback { count: AtomicU32::new(0) };
        let now = common::time::TimestampMillis::now();

        processor
            .enqueue(
                BillingEntryId::from_raw("01ABCDEFGHJKMNPQRSTVWXYZ0"),
                TenantId::new("tenant-1"),
                MicroDollars::from_micros(95_000),
                CorrelationId::new("corr-1"),
                "http_500".to_owned(),
                now,
            )
            .await;

        let callback = AlwaysFail;
        // Tick far enough forward each time to clear the backoff schedule.
        let mut t = now;
        for _ in 0..6 {
            t = add_millis(t, Duration::from_secs(20));
            processor.tick(&callback, Some(&poison_cb), t).await;
        }

        assert_eq!(stream.pending_count().await, 0);
        assert_eq!(stream.poison_entries().await.len(), 1);
        assert_eq!(poison_cb.count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn check_capped_risk_refuses_above_threshold() {
        let stream = Arc::new(InMemoryDlqStream::new());
        let mut cfg = Config::default();
        cfg.challenge_secret = vec![0u8; 32];
        cfg.max_pending_risk_cu = 500;
        let processor = DlqProcessor::new(stream.clone(), Arc::new(cfg));
        let tenant = TenantId::new("tenant-1");
        let now = common::time::TimestampMillis::now();

        processor
            .enqueue(
                BillingEntryId::from_raw("01ABCDEFGHJKMNPQRSTVWXYZ0"),
                tenant.clone(),
                MicroDollars::from_micros(400),
                CorrelationId::new("corr-1"),
                "http_500".to_owned(),
                now,
            )
            .await;

        assert!(processor.check_capped_risk(&tenant, MicroDollars::from_micros(50)).await);
        assert!(!processor.check_capped_risk(&tenant, MicroDollars::from_micros(200)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn escalation_fires_exactly_once_per_entry() {
        let stream = Arc::new(InMemoryDlqStream::new());
        let now = common::time::TimestampMillis::now();
        let entry = DlqEntry {
            billing_entry_id: BillingEntryId::from_raw("01ABCDEFGHJKMNPQRSTVWXYZ0"),
            tenant: TenantId::new("tenant-1"),
            actual_cost: MicroDollars::from_micros(1),
            correlation_id: CorrelationId::new("corr-1"),
            attempt: 5,
            reason: "http_500".to_owned(),
            created_at: now,
            next_retry_at: now,
        };
        stream.move_to_poison(entry, now).await;
        let processor = DlqProcessor::new(stream, config());

        struct Counter(AtomicU32);
        #[async_trait]
        impl EscalationCallback for Counter {
            async fn on_escalation(&self, _entry: &PoisonedEntry) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
        let counter = Counter(AtomicU32::new(0));

        let later = add_millis(now, Duration::from_secs(25 * 60 * 60));
        processor.check_escalations(&counter, later).await;
        processor.check_escalations(&counter, later).await;
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }

    struct AlwaysSucceed;
    #[async_trait]
    impl FinalizeCallback for AlwaysSucceed {
        async fn call(&self, _entry: &DlqEntry) -> FinalizeAttempt {
            FinalizeAttempt::Success
        }
    }

    #[tokio::test(start_paused = true)]
    async fn start_drains_entries_on_its_own_timer_until_shutdown() {
        let stream = Arc::new(InMemoryDlqStream::new());
        let processor = Arc::new(DlqProcessor::new(stream.clone(), config()));
        let now = common::time::TimestampMillis::now();
        processor
            .enqueue(
                BillingEntryId::from_raw("01ABCDEFGHJKMNPQRSTVWXYZ0"),
                TenantId::new("tenant-1"),
                MicroDollars::from_micros(95_000),
                CorrelationId::new("corr-1"),
                "http_500".to_owned(),
                now,
            )
            .await;

        let shutdown = common::shutdown::ShutdownChannel::new();
        let task = processor.clone().start(Arc::new(AlwaysSucceed), None, None, shutdown.clone());

        tokio::time::advance(DLQ_TICK_INTERVAL + Duration::from_millis(1)).await;
        tokio::task::yield_now().await;
        assert_eq!(stream.pending_count().await, 0);

        shutdown.send();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("loop did not stop after shutdown")
            .expect("task panicked");
    }
}
