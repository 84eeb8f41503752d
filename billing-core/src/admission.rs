//! The integration surface consumed by request handlers: a thin conjunctive
//! composition of reconciliation state, DLQ capped-risk, and the state
//! machine's own legal-transition check.

use std::sync::Arc;

use tracing::{instrument, warn};

use crate::amount::{ExchangeRateSnapshot, MicroDollars};
use crate::dlq::DlqProcessor;
use crate::error::AdmissionDenial;
use crate::ids::{BillingEntryId, CorrelationId, TenantId};
use crate::reconciliation::ReconciliationClient;
use crate::state_machine::manager::BillingManager;

/// Composes the billing manager, a tenant's reconciliation client, and a DLQ
/// processor into the single `may_proceed` decision point request handlers
/// call before doing any billable work.
pub struct AdmissionGate {
    manager: BillingManager,
    reconciliation: Arc<ReconciliationClient>,
    dlq: Arc<DlqProcessor>,
}

impl AdmissionGate {
    pub fn new(manager: BillingManager, reconciliation: Arc<ReconciliationClient>, dlq: Arc<DlqProcessor>) -> Self {
        Self {
            manager,
            reconciliation,
            dlq,
        }
    }

    /// Check (a) reconciliation allows new requests, (b) the tenant's
    /// combined in-flight finalize risk is under the cap, and (c) the
    /// target entry can legally enter `RESERVE_HELD`; if all three hold, the
    /// reserve is written durably and this returns `Ok`.
    #[instrument(skip_all, fields(entry_id = %entry_id, tenant = %tenant))]
    #[allow(clippy::too_many_arguments)]
    pub async fn may_proceed(
        &self,
        entry_id: BillingEntryId,
        tenant: TenantId,
        correlation_id: CorrelationId,
        estimated_cost: MicroDollars,
        exchange_rate: ExchangeRateSnapshot,
        now: common::time::TimestampMillis,
    ) -> Result<(), AdmissionDenial> {
        if !self.reconciliation.should_allow_request().await {
            warn!("admission refused: reconciliation fail-closed");
            return Err(AdmissionDenial::ReconciliationFailClosed);
        }

        if !self.dlq.check_capped_risk(&tenant, estimated_cost).await {
            warn!("admission refused: capped risk exceeded");
            return Err(AdmissionDenial::CappedRiskExceeded);
        }

        self.manager
            .reserve(entry_id, tenant, correlation_id, estimated_cost, exchange_rate, now)
            .await
            .map_err(|_| {
                warn!("admission refused: illegal transition");
                AdmissionDenial::IllegalTransition
            })
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::config::Config;
    use crate::dlq::InMemoryDlqStream;
    use crate::reconciliation::AuthorityClient;
    use crate::reconciliation::AuthorityError;
    use crate::wal::WalWriter;

    struct AlwaysReachable;
    #[async_trait]
    impl AuthorityClient for AlwaysReachable {
        async fn fetch_committed_spend(
            &self,
            _tenant: &TenantId,
        ) -> Result<(MicroDollars, MicroDollars), AuthorityError> {
            Ok((MicroDollars::ZERO, MicroDollars::from_micros(1_000_000)))
        }
    }

    struct AlwaysUnreachable;
    #[async_trait]
    impl AuthorityClient for AlwaysUnreachable {
        async fn fetch_committed_spend(
            &self,
            _tenant: &TenantId,
        ) -> Result<(MicroDollars, MicroDollars), AuthorityError> {
            Err(AuthorityError::Unreachable("down".to_owned()))
        }
    }

    fn snapshot() -> ExchangeRateSnapshot {
        ExchangeRateSnapshot {
            credit_units_per_usd: rust_decimal::Decimal::ONE,
            usd_per_settlement_token: rust_decimal::Decimal::ONE,
            frozen_at: common::time::TimestampMillis::now(),
        }
    }

    fn dlq() -> Arc<DlqProcessor> {
        let mut cfg = Config::default();
        cfg.challenge_secret = vec![0u8; 32];
        Arc::new(DlqProcessor::new(Arc::new(InMemoryDlqStream::new()), Arc::new(cfg)))
    }

    #[tokio::test]
    async fn reserve_succeeds_when_all_three_checks_pass() {
        let dir = tempfile::tempdir().unwrap();
        let wal = Arc::new(WalWriter::open(dir.path(), 1 << 20, 0).unwrap());
        let manager = BillingManager::new(wal);
        let reconciliation = Arc::new(ReconciliationClient::new(
            TenantId::new("tenant-1"),
            Arc::new(AlwaysReachable),
            None,
            MicroDollars::from_micros(100),
            10,
            MicroDollars::from_micros(1_000_000),
            Duration::from_secs(5),
            Duration::from_secs(5),
        ));
        let gate = AdmissionGate::new(manager.clone(), reconciliation, dlq());

        let result = gate
            .may_proceed(
                BillingEntryId::from_raw("01ABCDEFGHJKMNPQRSTVWXYZ0"),
                TenantId::new("tenant-1"),
                CorrelationId::new("corr-1"),
                MicroDollars::from_micros(1_000),
                snapshot(),
                common::time::TimestampMillis::now(),
            )
            .await;
        assert!(result.is_ok());
        assert!(manager.get(&BillingEntryId::from_raw("01ABCDEFGHJKMNPQRSTVWXYZ0")).is_some());
    }

    #[tokio::test]
    async fn refuses_when_reconciliation_is_fail_closed() {
        let dir = tempfile::tempdir().unwrap();
        let wal = Arc::new(WalWriter::open(dir.path(), 1 << 20, 0).unwrap());
        let manager = BillingManager::new(wal);
        let reconciliation = Arc::new(ReconciliationClient::new(
            TenantId::new("tenant-1"),
            Arc::new(AlwaysUnreachable),
            None,
            MicroDollars::from_micros(100),
            10,
            MicroDollars::from_micros(0),
            Duration::from_secs(5),
            Duration::from_secs(5),
        ));
        // Zero absolute cap: the very first poll's fail-open headroom is
        // zero, so entering fail-open is immediately equivalent to
        // fail-closed once any spend is recorded. Poll first, then spend a
        // single unit to force FAIL_CLOSED deterministically.
        reconciliation.poll(common::time::TimestampMillis::now()).await;
        reconciliation.record_local_spend(MicroDollars::from_micros(1)).await;

        let gate = AdmissionGate::new(manager, reconciliation, dlq());
        let result = gate
            .may_proceed(
                BillingEntryId::from_raw("01ABCDEFGHJKMNPQRSTVWXYZ0"),
                TenantId::new("tenant-1"),
                CorrelationId::new("corr-1"),
                MicroDollars::from_micros(1_000),
                snapshot(),
                common::time::TimestampMillis::now(),
            )
            .await;
        assert_eq!(result.unwrap_err(), AdmissionDenial::ReconciliationFailClosed);
    }

    #[tokio::test]
    async fn refuses_when_capped_risk_exceeded() {
        let dir = tempfile::tempdir().unwrap();
        let wal = Arc::new(WalWriter::open(dir.path(), 1 << 20, 0).unwrap());
        let manager = BillingManager::new(wal);
        let reconciliation = Arc::new(ReconciliationClient::new(
            TenantId::new("tenant-1"),
            Arc::new(AlwaysReachable),
            None,
            MicroDollars::from_micros(100),
            10,
            MicroDollars::from_micros(1_000_000),
            Duration::from_secs(5),
            Duration::from_secs(5),
        ));
        let dlq_processor = dlq();
        dlq_processor
            .enqueue(
                BillingEntryId::from_raw("01ABCDEFGHJKMNPQRSTVWXYZ1"),
                TenantId::new("tenant-1"),
                MicroDollars::from_micros(1_000_000),
                CorrelationId::new("corr-0"),
                "http_500".to_owned(),
                common::time::TimestampMillis::now(),
            )
            .await;

        let gate = AdmissionGate::new(manager, reconciliation, dlq_processor);
        let result = gate
            .may_proceed(
                BillingEntryId::from_raw("01ABCDEFGHJKMNPQRSTVWXYZ0"),
                TenantId::new("tenant-1"),
                CorrelationId::new("corr-1"),
                MicroDollars::from_micros(1_000),
                snapshot(),
                common::time::TimestampMillis::now(),
            )
            .await;
        assert_eq!(result.unwrap_err(), AdmissionDenial::CappedRiskExceeded);
    }

    #[tokio::test]
    async fn refuses_when_transition_is_illegal() {
        let dir = tempfile::tempdir().unwrap();
        let wal = Arc::new(WalWriter::open(dir.path(), 1 << 20, 0).unwrap());
        let manager = BillingManager::new(wal);
        let reconciliation = Arc::new(ReconciliationClient::new(
            TenantId::new("tenant-1"),
            Arc::new(AlwaysReachable),
            None,
            MicroDollars::from_micros(100),
            10,
            MicroDollars::from_micros(1_000_000),
            Duration::from_secs(5),
            Duration::from_secs(5),
        ));
        let entry_id = BillingEntryId::from_raw("01ABCDEFGHJKMNPQRSTVWXYZ0");
        manager
            .reserve(
                entry_id.clone(),
                TenantId::new("tenant-1"),
                CorrelationId::new("corr-1"),
                MicroDollars::from_micros(1),
                snapshot(),
                common::time::TimestampMillis::now(),
            )
            .await
            .unwrap();

        let gate = AdmissionGate::new(manager, reconciliation, dlq());
        let result = gate
            .may_proceed(
                entry_id,
                TenantId::new("tenant-1"),
                CorrelationId::new("corr-2"),
                MicroDollars::from_micros(1_000),
                snapshot(),
                common::time::TimestampMillis::now(),
            )
            .await;
        assert_eq!(result.unwrap_err(), AdmissionDenial::IllegalTransition);
    }
}
