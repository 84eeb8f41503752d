//! The durable, consumer-group-addressable stream backing the DLQ
//! ("billing:dlq") and its poison counterpart ("billing:dlq:poison").
//!
//! Modeled as a trait so a real broker-backed implementation (Redis streams,
//! SQS, etc.) can be substituted in production; this crate ships an
//! in-process durable-enough implementation for single-node deployments and
//! tests, matching the "injected abstraction with an in-process default"
//! pattern this crate uses for the challenge store and chain RPC pool.

use std::collections::VecDeque;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::amount::MicroDollars;
use crate::ids::{BillingEntryId, CorrelationId, TenantId};

/// A single finalize-attempt descriptor living on the pending stream.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DlqEntry {
    pub billing_entry_id: BillingEntryId,
    pub tenant: TenantId,
    pub actual_cost: MicroDollars,
    pub correlation_id: CorrelationId,
    pub attempt: u32,
    pub reason: String,
    pub created_at: common::time::TimestampMillis,
    pub next_retry_at: common::time::TimestampMillis,
}

/// A [`DlqEntry`] that exhausted its retry budget and was quarantined.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PoisonedEntry {
    pub entry: DlqEntry,
    pub poisoned_at: common::time::TimestampMillis,
}

/// The DLQ's storage boundary: a pending stream plus a poison stream.
#[async_trait]
pub trait DlqStream: Send + Sync {
    async fn enqueue(&self, entry: DlqEntry);

    /// Read up to `limit` entries whose `next_retry_at` has elapsed,
    /// oldest-enqueued first.
    async fn read_ready(&self, now: common::time::TimestampMillis, limit: usize) -> Vec<DlqEntry>;

    /// Remove an entry from the pending stream (acknowledge).
    async fn ack_remove(&self, id: &BillingEntryId);

    /// Acknowledge the current attempt and re-enqueue with updated retry
    /// bookkeeping (acknowledge-and-re-enqueue, matching how a real
    /// consumer-group stream would model a retried message).
    async fn ack_requeue(&self, entry: DlqEntry);

    async fn move_to_poison(&self, entry: DlqEntry, poisoned_at: common::time::TimestampMillis);

    async fn poison_entries(&self) -> Vec<PoisonedEntry>;

    async fn remove_poison(&self, id: &BillingEntryId);

    /// All entries currently on the pending stream for `tenant`, used by
    /// capped-risk admission checks.
    async fn pending_for_tenant(&self, tenant: &TenantId) -> Vec<DlqEntry>;

    async fn pending_count(&self) -> usize;
}

struct Inner {
    pending: VecDeque<DlqEntry>,
    poison: Vec<PoisonedEntry>,
}

/// An in-process, mutex-guarded [`DlqStream`]. A single service instance's
/// consumer group; not shared across processes.
pub struct InMemoryDlqStream {
    inner: Mutex<Inner>,
}

impl Default for InMemoryDlqStream {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryDlqStream {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                pending: VecDeque::new(),
                poison: Vec::new(),
            }),
        }
    }
}

#[async_trait]
impl DlqStream for InMemoryDlqStream {
    async fn enqueue(&self, entry: DlqEntry) {
        self.inner.lock().await.pending.push_back(entry);
    }

    async fn read_ready(&self, now: common::time::TimestampMillis, limit: usize) -> Vec<DlqEntry> {
        self.inner
            .lock()
            .await
            .pending
            .iter()
            .filter(|e| e.next_retry_at.as_i64() <= now.as_i64())
            .take(limit)
            .cloned()
            .collect()
    }

    async fn ack_remove(&self, id: &BillingEntryId) {
        let mut inner = self.inner.lock().await;
        inner.pending.retain(|e| &e.billing_entry_id != id);
    }

    async fn ack_requeue(&self, entry: DlqEntry) {
        let mut inner = self.inner.lock().await;
        inner.pending.retain(|e| e.billing_entry_id != entry.billing_entry_id);
        inner.pending.push_back(entry);
    }

    async fn move_to_poison(&self, entry: DlqEntry, poisoned_at: common::time::TimestampMillis) {
        let mut inner = self.inner.lock().await;
        inner.pending.retain(|e| e.billing_entry_id != entry.billing_entry_id);
        inner.poison.push(PoisonedEntry { entry, poisoned_at });
    }

    async fn poison_entries(&self) -> Vec<PoisonedEntry> {
        self.inner.lock().await.poison.clone()
    }

    async fn remove_poison(&self, id: &BillingEntryId) {
        let mut inner = self.inner.lock().await;
        inner.poison.retain(|p| &p.entry.billing_entry_id != id);
    }

    async fn pending_for_tenant(&self, tenant: &TenantId) -> Vec<DlqEntry> {
        self.inner
            .lock()
            .await
            .pending
            .iter()
            .filter(|e| &e.tenant == tenant)
            .cloned()
            .collect()
    }

    async fn pending_count(&self) -> usize {
        self.inner.lock().await.pending.len()
    }
}
