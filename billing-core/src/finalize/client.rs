//! The transport to the external billing authority: classifies responses,
//! enqueues every failure to an instance-owned DLQ, and never retries
//! directly — all retries happen through [`crate::dlq::DlqProcessor`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{instrument, warn};

use crate::amount::MicroDollars;
use crate::dlq::{DlqEntry, DlqProcessor, FinalizeAttempt, FinalizeCallback};
use crate::error::FinalizeOutcome;
use crate::finalize::token::{ServiceTokenClaims, ServiceTokenSigner, PURPOSE_BILLING_FINALIZE};
use crate::ids::{BillingEntryId, CorrelationId, TenantId};

/// Default transport timeout (ties to the "finalize: 1 s" default from the
/// external-interfaces timeout table).
pub const DEFAULT_FINALIZE_TIMEOUT: Duration = Duration::from_secs(1);

/// The logical HTTP request body and auth header, once a token has been
/// minted. Transport-agnostic: an HTTP implementation would serialize this
/// directly; a test double can just inspect the fields.
#[derive(Clone, Debug)]
pub struct FinalizeHttpRequest {
    pub reservation_id: BillingEntryId,
    pub tenant_id: TenantId,
    pub actual_cost_micro: String,
    pub trace_id: CorrelationId,
    pub bearer_token: String,
}

#[derive(Debug, Error)]
pub enum FinalizeTransportError {
    #[error("network error: {0}")]
    Network(String),
    #[error("request timed out")]
    Timeout,
}

/// The external authority's billing-finalize endpoint, abstracted behind a
/// trait: this crate does not implement its HTTP wire format, only the
/// classification of whatever status code comes back.
#[async_trait]
pub trait FinalizeTransport: Send + Sync {
    /// Returns the raw HTTP status code on any response received, or a
    /// transport-level error if none was received at all.
    async fn send(&self, request: &FinalizeHttpRequest) -> Result<u16, FinalizeTransportError>;
}

/// Who the minted service token claims to be.
#[derive(Clone, Debug)]
pub enum TokenSubject {
    /// The token's `subject` claim is the tenant being finalized.
    Tenant,
    /// The token's `subject` claim is a fixed service identity.
    Service(String),
}

impl TokenSubject {
    fn resolve(&self, tenant: &TenantId) -> String {
        match self {
            TokenSubject::Tenant => tenant.as_str().to_owned(),
            TokenSubject::Service(id) => id.clone(),
        }
    }
}

/// The outcome of one `finalize` call, matching the `ok | dlq` contract.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FinalizeResult {
    Ok,
    Dlq,
}

/// Classify a raw HTTP status code into a [`FinalizeOutcome`].
fn classify_status(status: u16) -> FinalizeOutcome {
    if status == 409 {
        FinalizeOutcome::IdempotentSuccess
    } else if (200..300).contains(&status) {
        FinalizeOutcome::Success
    } else if (400..500).contains(&status) {
        FinalizeOutcome::Terminal
    } else {
        FinalizeOutcome::Retryable
    }
}

/// Synchronous transport to the external authority, owning its own DLQ
/// instance (DLQ isolation: two `FinalizeClient`s never share state).
pub struct FinalizeClient {
    transport: Arc<dyn FinalizeTransport>,
    signer: Arc<dyn ServiceTokenSigner>,
    dlq: Arc<DlqProcessor>,
    subject: TokenSubject,
    timeout: Duration,
}

impl FinalizeClient {
    pub fn new(
        transport: Arc<dyn FinalizeTransport>,
        signer: Arc<dyn ServiceTokenSigner>,
        dlq: Arc<DlqProcessor>,
        subject: TokenSubject,
        timeout: Duration,
    ) -> Self {
        Self {
            transport,
            signer,
            dlq,
            subject,
            timeout,
        }
    }

    pub fn dlq(&self) -> &Arc<DlqProcessor> {
        &self.dlq
    }

    /// Attempt to finalize a committed charge. `actual_cost_micro` is taken
    /// as a raw decimal string (the wire representation this call's caller
    /// received) so malformed input is rejected the same way a malformed
    /// upstream response would be, without ever reaching the network.
    #[instrument(skip_all, fields(entry_id = %entry_id, tenant = %tenant))]
    pub async fn finalize(
        &self,
        entry_id: BillingEntryId,
        tenant: TenantId,
        actual_cost_micro: &str,
        correlation_id: CorrelationId,
        now: common::time::TimestampMillis,
    ) -> FinalizeResult {
        let actual_cost = match MicroDollars::parse_decimal_str(actual_cost_micro) {
            Ok(cost) => cost,
            Err(e) => {
                warn!(error = %e, "invalid actual_cost, routing to DLQ without a network attempt");
                self.dlq
                    .enqueue(
                        entry_id,
                        tenant,
                        MicroDollars::ZERO,
                        correlation_id,
                        "invalid_actual_cost".to_owned(),
                        now,
                    )
                    .await;
                return FinalizeResult::Dlq;
            }
        };

        match self.attempt(&entry_id, &tenant, actual_cost, &correlation_id, now).await {
            Ok(()) => FinalizeResult::Ok,
            Err(reason) => {
                warn!(reason = %reason, "finalize attempt failed, enqueueing to DLQ");
                self.dlq
                    .enqueue(entry_id, tenant, actual_cost, correlation_id, reason, now)
                    .await;
                FinalizeResult::Dlq
            }
        }
    }

    /// Mint a service token and send one finalize request, without touching
    /// the DLQ either way. Shared by [`FinalizeClient::finalize`] (the first
    /// attempt) and the [`FinalizeCallback`] impl below (DLQ-driven retries).
    async fn attempt(
        &self,
        entry_id: &BillingEntryId,
        tenant: &TenantId,
        actual_cost: MicroDollars,
        correlation_id: &CorrelationId,
        now: common::time::TimestampMillis,
    ) -> Result<(), String> {
        let claims = ServiceTokenClaims {
            subject: self.subject.resolve(tenant),
            purpose: PURPOSE_BILLING_FINALIZE,
            entry_id: entry_id.clone(),
            correlation_id: correlation_id.clone(),
            issued_at: now,
        };
        let bearer_token = match self.signer.sign(&claims).await {
            Ok(token) => token,
            Err(e) => {
                warn!(error = %e, "service token generation failed, routing to DLQ");
                return Err("token_generation_failed".to_owned());
            }
        };

        let request = FinalizeHttpRequest {
            reservation_id: entry_id.clone(),
            tenant_id: tenant.clone(),
            actual_cost_micro: actual_cost.to_decimal_str(),
            trace_id: correlation_id.clone(),
            bearer_token,
        };

        let send_result = tokio::time::timeout(self.timeout, self.transport.send(&request)).await;
        match send_result {
            Err(_elapsed) => Err("timeout".to_owned()),
            Ok(Err(FinalizeTransportError::Network(msg))) => Err(format!("network_error:{msg}")),
            Ok(Err(FinalizeTransportError::Timeout)) => Err("timeout".to_owned()),
            Ok(Ok(status)) => match classify_status(status) {
                FinalizeOutcome::Success | FinalizeOutcome::IdempotentSuccess => Ok(()),
                FinalizeOutcome::Terminal | FinalizeOutcome::Retryable => Err(format!("http_{status}")),
            },
        }
    }
}

/// Bridges the DLQ processor's retry loop back to the real transport: each
/// retry re-mints a token and re-sends, exactly like the first attempt.
#[async_trait]
impl FinalizeCallback for FinalizeClient {
    async fn call(&self, entry: &DlqEntry) -> FinalizeAttempt {
        match self
            .attempt(
                &entry.billing_entry_id,
                &entry.tenant,
                entry.actual_cost,
                &entry.correlation_id,
                common::time::TimestampMillis::now(),
            )
            .await
        {
            Ok(()) => FinalizeAttempt::Success,
            Err(reason) => FinalizeAttempt::Failure(reason),
        }
    }
}
