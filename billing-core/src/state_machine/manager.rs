//! The billing manager: owns the derived in-memory store and drives every
//! state transition through the check-persist-commit protocol.
//!
//! This mirrors `PaymentsManager::new_payment`'s structure directly: hold a
//! lock across the whole operation, validate the transition ("check"),
//! append to the WAL and await durability ("persist"), then mutate the
//! derived store ("commit"). A failure between "check" and "persist" means
//! the transition never happened; a failure after "persist" is safe because
//! replay will re-derive the same state from the durable record.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;
use tokio::time::interval;
use tracing::{debug, info, instrument, warn};

use common::shutdown::ShutdownChannel;
use common::task::LxTask;

use crate::amount::{ExchangeRateSnapshot, MicroDollars};
use crate::error::IllegalTransitionError;
use crate::ids::{BillingEntryId, CorrelationId, TenantId};
use crate::state_machine::{BillingEntry, BillingState};
use crate::wal::{EventType, Reducer, WalEnvelope, WalWriter};

type EntryMap = HashMap<BillingEntryId, BillingEntry>;

/// How often the reserve-TTL scheduler scans for overdue holds. Independent
/// of `reserve_ttl` itself so a long TTL doesn't also mean coarse-grained
/// expiry checks.
const RESERVE_TTL_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Owns the derived billing state and the WAL writer that backs it.
///
/// `entries` is a plain [`std::sync::Mutex`]: every critical section over it
/// is a short, non-blocking map lookup or insert, never held across an
/// `.await`. Ordering between concurrent transitions on the *same* entry is
/// instead enforced by `write_lock`, a single [`tokio::sync::Mutex`] held for
/// the full duration of a check-persist-commit sequence (including the WAL
/// append), exactly the way `PaymentsManager` holds its data lock across the
/// persist step. This crate does not attempt finer-grained (per-entry)
/// locking: the WAL writer itself serializes all appends behind one mutex
/// regardless, so a single global write lock here costs nothing in practice
/// while keeping the commit step trivially consistent with the log.
#[derive(Clone)]
pub struct BillingManager {
    entries: Arc<StdMutex<EntryMap>>,
    write_lock: Arc<AsyncMutex<()>>,
    wal: Arc<WalWriter>,
    pending_count: Arc<AtomicI64>,
}

impl BillingManager {
    pub fn new(wal: Arc<WalWriter>) -> Self {
        Self {
            entries: Arc::new(StdMutex::new(HashMap::new())),
            write_lock: Arc::new(AsyncMutex::new(())),
            wal,
            pending_count: Arc::new(AtomicI64::new(0)),
        }
    }

    /// The number of entries currently in `FINALIZE_PENDING` or
    /// `FINALIZE_FAILED`. Maintained incrementally at every commit rather
    /// than recomputed, so it stays cheap to read from a background loop.
    pub fn pending_count(&self) -> i64 {
        self.pending_count.load(Ordering::SeqCst)
    }

    pub fn get(&self, id: &BillingEntryId) -> Option<BillingEntry> {
        self.entries.lock().unwrap().get(id).cloned()
    }

    #[instrument(skip_all, fields(entry_id = %entry_id, tenant = %tenant))]
    pub async fn reserve(
        &self,
        entry_id: BillingEntryId,
        tenant: TenantId,
        correlation_id: CorrelationId,
        estimated_cost: MicroDollars,
        exchange_rate: ExchangeRateSnapshot,
        now: common::time::TimestampMillis,
    ) -> Result<(), IllegalTransitionError> {
        let _permit = self.write_lock.lock().await;
        if let Some(existing) = self.entries.lock().unwrap().get(&entry_id) {
            return Err(IllegalTransitionError {
                entry_id,
                from: existing.state,
                attempted: BillingState::ReserveHeld,
            });
        }

        let payload = serde_json::json!({
            "tenant": tenant.clone(),
            "estimated_cost": estimated_cost,
            "exchange_rate": exchange_rate,
        });
        let sequence = self
            .wal
            .append(
                EventType::BillingReserve,
                now.as_i64(),
                entry_id.clone(),
                correlation_id.clone(),
                payload,
            )
            .await
            .map_err(|_| IllegalTransitionError {
                entry_id: entry_id.clone(),
                from: BillingState::ReserveHeld,
                attempted: BillingState::ReserveHeld,
            })?;

        let entry = BillingEntry {
            id: entry_id.clone(),
            tenant,
            state: BillingState::ReserveHeld,
            estimated_cost,
            actual_cost: None,
            exchange_rate,
            created_at: now,
            updated_at: now,
            last_wal_sequence: sequence,
            correlation_id,
            finalize_attempts: 0,
        };
        self.commit_entry(entry);
        Ok(())
    }

    #[instrument(skip_all, fields(entry_id = %entry_id))]
    pub async fn commit(
        &self,
        entry_id: &BillingEntryId,
        actual_cost: MicroDollars,
        now: common::time::TimestampMillis,
    ) -> Result<(), IllegalTransitionError> {
        self.transition(
            entry_id,
            BillingState::Committed,
            EventType::BillingCommit,
            serde_json::json!({ "actual_cost": actual_cost }),
            now,
            |entry| entry.actual_cost = Some(actual_cost),
        )
        .await
    }

    pub async fn release(
        &self,
        entry_id: &BillingEntryId,
        now: common::time::TimestampMillis,
    ) -> Result<(), IllegalTransitionError> {
        self.transition(
            entry_id,
            BillingState::Released,
            EventType::BillingRelease,
            serde_json::json!({}),
            now,
            |_| {},
        )
        .await
    }

    pub async fn reserve_expired(
        &self,
        entry_id: &BillingEntryId,
        now: common::time::TimestampMillis,
    ) -> Result<(), IllegalTransitionError> {
        self.transition(
            entry_id,
            BillingState::Released,
            EventType::BillingReserveExpired,
            serde_json::json!({}),
            now,
            |_| {},
        )
        .await
    }

    pub async fn void(
        &self,
        entry_id: &BillingEntryId,
        now: common::time::TimestampMillis,
    ) -> Result<(), IllegalTransitionError> {
        self.transition(
            entry_id,
            BillingState::Voided,
            EventType::BillingVoid,
            serde_json::json!({}),
            now,
            |_| {},
        )
        .await
    }

    /// Move a committed entry into `FINALIZE_PENDING`, typically right after
    /// it's been enqueued onto the dead-letter stream for its first
    /// finalize attempt. Recorded under the same wire event as the initial
    /// commit, distinguished by the `finalize_pending` payload flag, since
    /// no dedicated event type exists for this sub-transition.
    pub async fn finalize_pending(
        &self,
        entry_id: &BillingEntryId,
        now: common::time::TimestampMillis,
    ) -> Result<(), IllegalTransitionError> {
        self.transition(
            entry_id,
            BillingState::FinalizePending,
            EventType::BillingCommit,
            serde_json::json!({ "finalize_pending": true }),
            now,
            |_| {},
        )
        .await
    }

    pub async fn finalize_ack(
        &self,
        entry_id: &BillingEntryId,
        now: common::time::TimestampMillis,
    ) -> Result<(), IllegalTransitionError> {
        self.transition(
            entry_id,
            BillingState::FinalizeAcked,
            EventType::BillingFinalizeAck,
            serde_json::json!({}),
            now,
            |_| {},
        )
        .await
    }

    pub async fn finalize_fail(
        &self,
        entry_id: &BillingEntryId,
        reason: &str,
        now: common::time::TimestampMillis,
    ) -> Result<(), IllegalTransitionError> {
        self.transition(
            entry_id,
            BillingState::FinalizeFailed,
            EventType::BillingFinalizeFail,
            serde_json::json!({ "reason": reason }),
            now,
            |entry| entry.finalize_attempts += 1,
        )
        .await
    }

    async fn transition(
        &self,
        entry_id: &BillingEntryId,
        to: BillingState,
        event_type: EventType,
        payload: serde_json::Value,
        now: common::time::TimestampMillis,
        mutate: impl FnOnce(&mut BillingEntry),
    ) -> Result<(), IllegalTransitionError> {
        let _permit = self.write_lock.lock().await;
        let mut next = {
            let entries = self.entries.lock().unwrap();
            let entry = entries
                .get(entry_id)
                .unwrap_or_else(|| panic!("transition requested for unknown entry {entry_id}"));
            if !entry.state.can_transition_to(to) {
                return Err(IllegalTransitionError {
                    entry_id: entry_id.clone(),
                    from: entry.state,
                    attempted: to,
                });
            }
            let mut next = entry.clone();
            next.state = to;
            next
        };
        mutate(&mut next);
        next.updated_at = now;

        let sequence = self
            .wal
            .append(
                event_type,
                now.as_i64(),
                entry_id.clone(),
                next.correlation_id.clone(),
                payload,
            )
            .await
            .map_err(|_| IllegalTransitionError {
                entry_id: entry_id.clone(),
                from: next.state,
                attempted: to,
            })?;
        next.last_wal_sequence = sequence;
        self.commit_entry(next);
        Ok(())
    }

    fn commit_entry(&self, entry: BillingEntry) {
        let mut entries = self.entries.lock().unwrap();
        let was_pending = entries.get(&entry.id).is_some_and(BillingEntry::counts_as_pending);
        let is_pending = entry.counts_as_pending();
        if is_pending && !was_pending {
            self.pending_count.fetch_add(1, Ordering::SeqCst);
        } else if was_pending && !is_pending {
            self.pending_count.fetch_sub(1, Ordering::SeqCst);
        }
        entries.insert(entry.id.clone(), entry);
    }

    /// Ids of every entry still `RESERVE_HELD` whose hold has outlived
    /// `reserve_ttl` as of `now`.
    fn expired_reserve_ids(&self, reserve_ttl: Duration, now: common::time::TimestampMillis) -> Vec<BillingEntryId> {
        let entries = self.entries.lock().unwrap();
        entries
            .values()
            .filter(|e| e.state == BillingState::ReserveHeld)
            .filter(|e| {
                let age_ms = now.as_i64().saturating_sub(e.created_at.as_i64());
                age_ms >= reserve_ttl.as_millis() as i64
            })
            .map(|e| e.id.clone())
            .collect()
    }

    /// Write `billing_reserve_expired` for every `RESERVE_HELD` entry whose
    /// hold has outlived `reserve_ttl`, releasing it. Returns the number
    /// expired. A concurrent `commit` racing this scan is resolved by the
    /// normal `transition` check: whichever write lands first wins, and the
    /// loser's illegal-transition error is swallowed as a benign race.
    #[instrument(skip_all)]
    pub async fn expire_overdue_reserves(&self, reserve_ttl: Duration, now: common::time::TimestampMillis) -> usize {
        let mut expired = 0;
        for entry_id in self.expired_reserve_ids(reserve_ttl, now) {
            match self.reserve_expired(&entry_id, now).await {
                Ok(()) => {
                    info!(entry_id = %entry_id, "reserve expired, hold released");
                    expired += 1;
                }
                Err(e) => {
                    debug!(entry_id = %entry_id, from = ?e.from, "reserve already left RESERVE_HELD before expiry ran");
                }
            }
        }
        expired
    }

    /// Spawn the reserve-TTL scheduler: periodically scans for entries still
    /// `RESERVE_HELD` past `reserve_ttl` and expires them. Same
    /// `tokio::time`/`LxTask`/[`ShutdownChannel`] loop shape as
    /// [`crate::reconciliation::ReconciliationClient::start`]; shares
    /// `shutdown` with the process's other supervised loops.
    pub fn start_reserve_ttl_scheduler(self: Arc<Self>, reserve_ttl: Duration, shutdown: ShutdownChannel) -> LxTask<()> {
        LxTask::spawn(async move {
            let mut timer = interval(RESERVE_TTL_CHECK_INTERVAL);
            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        let now = common::time::TimestampMillis::now();
                        self.expire_overdue_reserves(reserve_ttl, now).await;
                    }
                    () = shutdown.recv() => {
                        info!("reserve TTL scheduler shutting down");
                        break;
                    }
                }
            }
        })
    }

    /// Operator-invokable garbage collection: drops terminal entries
    /// (`FINALIZE_ACKED`, `VOIDED`, `RELEASED`) last updated more than
    /// `older_than` ago from the derived in-memory store. Not run on a
    /// background timer; a deployment calls this from whatever periodic
    /// maintenance hook or admin endpoint it already has, so the sweep's
    /// effect is always observable at the call site rather than silently
    /// racing a live read. Terminal entries are never referenced again once
    /// GC'd: the WAL segments that produced them remain the durable record.
    #[instrument(skip_all)]
    pub fn sweep_terminal_entries(&self, older_than: Duration, now: common::time::TimestampMillis) -> usize {
        let mut entries = self.entries.lock().unwrap();
        let to_remove: Vec<BillingEntryId> = entries
            .values()
            .filter(|e| e.state.is_terminal())
            .filter(|e| {
                let age_ms = now.as_i64().saturating_sub(e.updated_at.as_i64());
                age_ms >= older_than.as_millis() as i64
            })
            .map(|e| e.id.clone())
            .collect();
        for id in &to_remove {
            entries.remove(id);
        }
        if !to_remove.is_empty() {
            info!(count = to_remove.len(), "garbage collected terminal billing entries");
        }
        to_remove.len()
    }
}

/// Drives a [`BillingManager`] from WAL records during replay.
///
/// Unlike the live transition methods above, this never appends to the WAL
/// (the record is already durable) and never takes `write_lock`: replay runs
/// single-threaded, before the service accepts traffic, so there is no
/// concurrent writer to serialize against.
impl Reducer for BillingManager {
    fn apply(&mut self, envelope: &WalEnvelope) {
        let entry_id = &envelope.billing_entry_id;
        let mut entries = self.entries.lock().unwrap();

        match &envelope.event_type {
            EventType::BillingReserve => {
                if entries.contains_key(entry_id) {
                    return;
                }
                let tenant: TenantId = envelope
                    .payload
                    .get("tenant")
                    .and_then(|v| serde_json::from_value(v.clone()).ok())
                    .unwrap_or_else(|| TenantId::new(""));
                let estimated_cost: MicroDollars = envelope
                    .payload
                    .get("estimated_cost")
                    .and_then(|v| serde_json::from_value(v.clone()).ok())
                    .unwrap_or(MicroDollars::ZERO);
                let exchange_rate: ExchangeRateSnapshot = envelope
                    .payload
                    .get("exchange_rate")
                    .and_then(|v| serde_json::from_value(v.clone()).ok())
                    .unwrap_or(ExchangeRateSnapshot {
                        credit_units_per_usd: rust_decimal::Decimal::ONE,
                        usd_per_settlement_token: rust_decimal::Decimal::ONE,
                        frozen_at: common::time::TimestampMillis::now(),
                    });
                let now = common::time::TimestampMillis::now();
                let entry = BillingEntry {
                    id: entry_id.clone(),
                    tenant,
                    state: BillingState::ReserveHeld,
                    estimated_cost,
                    actual_cost: None,
                    exchange_rate,
                    created_at: now,
                    updated_at: now,
                    last_wal_sequence: envelope.wal_sequence.unwrap_or(0),
                    correlation_id: envelope.correlation_id.clone(),
                    finalize_attempts: 0,
                };
                entries.insert(entry_id.clone(), entry);
            }
            EventType::BillingCommit => {
                let to = if envelope
                    .payload
                    .get("finalize_pending")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false)
                {
                    BillingState::FinalizePending
                } else {
                    BillingState::Committed
                };
                apply_simple_transition(&mut entries, entry_id, to, envelope, |entry| {
                    if to == BillingState::Committed {
                        let actual_cost: MicroDollars = envelope
                            .payload
                            .get("actual_cost")
                            .and_then(|v| serde_json::from_value(v.clone()).ok())
                            .unwrap_or(MicroDollars::ZERO);
                        entry.actual_cost = Some(actual_cost);
                    }
                });
            }
            EventType::BillingRelease => {
                apply_simple_transition(&mut entries, entry_id, BillingState::Released, envelope, |_| {});
            }
            EventType::BillingReserveExpired => {
                apply_simple_transition(&mut entries, entry_id, BillingState::Released, envelope, |_| {});
            }
            EventType::BillingVoid => {
                apply_simple_transition(&mut entries, entry_id, BillingState::Voided, envelope, |_| {});
            }
            EventType::BillingFinalizeAck => {
                apply_simple_transition(&mut entries, entry_id, BillingState::FinalizeAcked, envelope, |_| {});
            }
            EventType::BillingFinalizeFail => {
                apply_simple_transition(
                    &mut entries,
                    entry_id,
                    BillingState::FinalizeFailed,
                    envelope,
                    |entry| entry.finalize_attempts += 1,
                );
            }
            _ => {}
        }

        let pending_count = entries.values().filter(|e| e.counts_as_pending()).count() as i64;
        self.pending_count.store(pending_count, Ordering::SeqCst);
    }
}

/// Shared body for every replay transition that isn't `BillingReserve`:
/// look the entry up, skip (rather than panic) if it's missing or the
/// transition is no longer legal, since replay can observe a record whose
/// effect was already folded in by a state recovered from a snapshot.
fn apply_simple_transition(
    entries: &mut EntryMap,
    entry_id: &BillingEntryId,
    to: BillingState,
    envelope: &WalEnvelope,
    mutate: impl FnOnce(&mut BillingEntry),
) {
    let Some(entry) = entries.get_mut(entry_id) else {
        warn!(%entry_id, "replay: transition for unknown entry, skipping");
        return;
    };
    if !entry.state.can_transition_to(to) {
        warn!(%entry_id, from = ?entry.state, to = ?to, "replay: stale transition, skipping");
        return;
    }
    entry.state = to;
    entry.updated_at = common::time::TimestampMillis::now();
    entry.last_wal_sequence = envelope.wal_sequence.unwrap_or(entry.last_wal_sequence);
    mutate(entry);
}

#[cfg(test)]
mod test {
    use super::*;

    fn snapshot() -> ExchangeRateSnapshot {
        ExchangeRateSnapshot {
            credit_units_per_usd: rust_decimal::Decimal::ONE,
            usd_per_settlement_token: rust_decimal::Decimal::ONE,
            frozen_at: common::time::TimestampMillis::now(),
        }
    }

    #[tokio::test]
    async fn reserve_commit_finalize_ack_happy_path() {
        let dir = tempfile::tempdir().unwrap();
        let wal = Arc::new(WalWriter::open(dir.path(), 1 << 20, 0).unwrap());
        let manager = BillingManager::new(wal);
        let entry_id = BillingEntryId::from_raw("01ABCDEFGHJKMNPQRSTVWXYZ0");
        let tenant = TenantId::new("tenant-1");
        let corr = CorrelationId::new("corr-1");
        let now = common::time::TimestampMillis::now();

        manager
            .reserve(entry_id.clone(), tenant, corr, MicroDollars::from_micros(100_000), snapshot(), now)
            .await
            .unwrap();
        manager.commit(&entry_id, MicroDollars::from_micros(95_000), now).await.unwrap();
        manager.finalize_pending(&entry_id, now).await.unwrap();
        assert_eq!(manager.pending_count(), 1);
        manager.finalize_ack(&entry_id, now).await.unwrap();
        assert_eq!(manager.pending_count(), 0);

        let entry = manager.get(&entry_id).unwrap();
        assert_eq!(entry.state, BillingState::FinalizeAcked);
        assert_eq!(entry.actual_cost, Some(MicroDollars::from_micros(95_000)));
    }

    #[tokio::test]
    async fn illegal_transition_is_rejected_without_mutating_state() {
        let dir = tempfile::tempdir().unwrap();
        let wal = Arc::new(WalWriter::open(dir.path(), 1 << 20, 0).unwrap());
        let manager = BillingManager::new(wal);
        let entry_id = BillingEntryId::from_raw("01ABCDEFGHJKMNPQRSTVWXYZ0");
        let tenant = TenantId::new("tenant-1");
        let corr = CorrelationId::new("corr-1");
        let now = common::time::TimestampMillis::now();

        manager
            .reserve(entry_id.clone(), tenant, corr, MicroDollars::from_micros(1), snapshot(), now)
            .await
            .unwrap();
        let err = manager.finalize_ack(&entry_id, now).await.unwrap_err();
        assert_eq!(err.from, BillingState::ReserveHeld);
        let entry = manager.get(&entry_id).unwrap();
        assert_eq!(entry.state, BillingState::ReserveHeld);
    }

    #[tokio::test]
    async fn duplicate_reserve_for_same_id_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let wal = Arc::new(WalWriter::open(dir.path(), 1 << 20, 0).unwrap());
        let manager = BillingManager::new(wal);
        let entry_id = BillingEntryId::from_raw("01ABCDEFGHJKMNPQRSTVWXYZ0");
        let now = common::time::TimestampMillis::now();

        manager
            .reserve(
                entry_id.clone(),
                TenantId::new("tenant-1"),
                CorrelationId::new("corr-1"),
                MicroDollars::from_micros(1),
                snapshot(),
                now,
            )
            .await
            .unwrap();
        let err = manager
            .reserve(
                entry_id,
                TenantId::new("tenant-1"),
                CorrelationId::new("corr-2"),
                MicroDollars::from_micros(1),
                snapshot(),
                now,
            )
            .await
            .unwrap_err();
        assert_eq!(err.from, BillingState::ReserveHeld);
    }

    #[test]
    fn replay_reconstructs_identical_state_to_live_transitions() {
        use crate::wal::replay;

        let dir = tempfile::tempdir().unwrap();
        let rt = tokio::runtime::Runtime::new().unwrap();
        let wal = Arc::new(WalWriter::open(dir.path(), 1 << 20, 0).unwrap());
        let live = BillingManager::new(wal.clone());
        let entry_id = BillingEntryId::from_raw("01ABCDEFGHJKMNPQRSTVWXYZ0");
        let now = common::time::TimestampMillis::now();

        rt.block_on(async {
            live.reserve(
                entry_id.clone(),
                TenantId::new("tenant-1"),
                CorrelationId::new("corr-1"),
                MicroDollars::from_micros(100_000),
                snapshot(),
                now,
            )
            .await
            .unwrap();
            live.commit(&entry_id, MicroDollars::from_micros(90_000), now).await.unwrap();
        });

        let mut replayed = BillingManager::new(wal);
        replay::replay(dir.path(), &mut replayed).unwrap();

        let live_entry = live.get(&entry_id).unwrap();
        let replayed_entry = replayed.get(&entry_id).unwrap();
        assert_eq!(live_entry.state, replayed_entry.state);
        assert_eq!(live_entry.actual_cost, replayed_entry.actual_cost);
    }

    fn add_millis(ts: common::time::TimestampMillis, ms: i64) -> common::time::TimestampMillis {
        common::time::TimestampMillis::try_from(
            std::time::SystemTime::from(ts) + Duration::from_millis(ms as u64),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn expire_overdue_reserves_releases_only_entries_past_ttl() {
        let dir = tempfile::tempdir().unwrap();
        let wal = Arc::new(WalWriter::open(dir.path(), 1 << 20, 0).unwrap());
        let manager = BillingManager::new(wal);
        let now = common::time::TimestampMillis::now();
        let old_id = BillingEntryId::from_raw("01ABCDEFGHJKMNPQRSTVWXYZ0");
        let fresh_id = BillingEntryId::from_raw("01ABCDEFGHJKMNPQRSTVWXYZ1");

        manager
            .reserve(old_id.clone(), TenantId::new("t1"), CorrelationId::new("c1"), MicroDollars::from_micros(1), snapshot(), now)
            .await
            .unwrap();
        let later = add_millis(now, 400_000);
        manager
            .reserve(fresh_id.clone(), TenantId::new("t1"), CorrelationId::new("c2"), MicroDollars::from_micros(1), snapshot(), later)
            .await
            .unwrap();

        let expired = manager.expire_overdue_reserves(Duration::from_secs(300), later).await;
        assert_eq!(expired, 1);
        assert_eq!(manager.get(&old_id).unwrap().state, BillingState::Released);
        assert_eq!(manager.get(&fresh_id).unwrap().state, BillingState::ReserveHeld);
    }

    #[tokio::test]
    async fn expire_overdue_reserves_skips_entries_already_committed() {
        let dir = tempfile::tempdir().unwrap();
        let wal = Arc::new(WalWriter::open(dir.path(), 1 << 20, 0).unwrap());
        let manager = BillingManager::new(wal);
        let now = common::time::TimestampMillis::now();
        let entry_id = BillingEntryId::from_raw("01ABCDEFGHJKMNPQRSTVWXYZ0");

        manager
            .reserve(entry_id.clone(), TenantId::new("t1"), CorrelationId::new("c1"), MicroDollars::from_micros(1), snapshot(), now)
            .await
            .unwrap();
        manager.commit(&entry_id, MicroDollars::from_micros(1), now).await.unwrap();

        let later = add_millis(now, 400_000);
        let expired = manager.expire_overdue_reserves(Duration::from_secs(300), later).await;
        assert_eq!(expired, 0);
        assert_eq!(manager.get(&entry_id).unwrap().state, BillingState::Committed);
    }

    #[tokio::test]
    async fn reserve_ttl_scheduler_expires_overdue_holds_and_stops_on_shutdown() {
        tokio::time::pause();
        let dir = tempfile::tempdir().unwrap();
        let wal = Arc::new(WalWriter::open(dir.path(), 1 << 20, 0).unwrap());
        let manager = Arc::new(BillingManager::new(wal));
        let now = common::time::TimestampMillis::now();
        let entry_id = BillingEntryId::from_raw("01ABCDEFGHJKMNPQRSTVWXYZ0");
        manager
            .reserve(entry_id.clone(), TenantId::new("t1"), CorrelationId::new("c1"), MicroDollars::from_micros(1), snapshot(), now)
            .await
            .unwrap();

        let shutdown = ShutdownChannel::new();
        let task = manager.clone().start_reserve_ttl_scheduler(Duration::from_secs(300), shutdown.clone());

        tokio::time::advance(Duration::from_secs(301)).await;
        tokio::time::advance(RESERVE_TTL_CHECK_INTERVAL).await;
        tokio::task::yield_now().await;
        assert_eq!(manager.get(&entry_id).unwrap().state, BillingState::Released);

        shutdown.send();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("scheduler did not stop after shutdown")
            .expect("task panicked");
    }

    #[test]
    fn sweep_terminal_entries_removes_only_aged_terminal_entries() {
        let dir = tempfile::tempdir().unwrap();
        let rt = tokio::runtime::Runtime::new().unwrap();
        let wal = Arc::new(WalWriter::open(dir.path(), 1 << 20, 0).unwrap());
        let manager = BillingManager::new(wal);
        let now = common::time::TimestampMillis::now();
        let acked_id = BillingEntryId::from_raw("01ABCDEFGHJKMNPQRSTVWXYZ0");
        let pending_id = BillingEntryId::from_raw("01ABCDEFGHJKMNPQRSTVWXYZ1");

        rt.block_on(async {
            manager
                .reserve(acked_id.clone(), TenantId::new("t1"), CorrelationId::new("c1"), MicroDollars::from_micros(1), snapshot(), now)
                .await
                .unwrap();
            manager.commit(&acked_id, MicroDollars::from_micros(1), now).await.unwrap();
            manager.finalize_pending(&acked_id, now).await.unwrap();
            manager.finalize_ack(&acked_id, now).await.unwrap();

            manager
                .reserve(pending_id.clone(), TenantId::new("t1"), CorrelationId::new("c2"), MicroDollars::from_micros(1), snapshot(), now)
                .await
                .unwrap();
        });

        let later = add_millis(now, 7 * 24 * 60 * 60 * 1_000);
        let removed = manager.sweep_terminal_entries(Duration::from_secs(3600), later);
        assert_eq!(removed, 1);
        assert!(manager.get(&acked_id).is_none());
        assert!(manager.get(&pending_id).is_some());
    }
}
