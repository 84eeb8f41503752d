//! The error taxonomy for the billing substrate (see the "Error Handling
//! Design" section of the design notes this crate was built from).
//!
//! Two tiers, matching the rest of this codebase: internal plumbing threads
//! `anyhow::Result` with `.context(...)` chains, while errors and reason
//! codes that cross a component boundary (WAL replay, DLQ, payment
//! verification) are `thiserror`-derived enums so callers can match on them.

use common::error::ForwardCompatible;
use thiserror::Error;

use crate::state_machine::BillingState;

/// A requested state-machine transition was not legal from the entry's
/// current state. Never retried; the caller made a logic error or is racing
/// a stale view of the entry.
#[derive(Debug, Error)]
#[error("illegal transition for {entry_id}: {from:?} -> {attempted:?}")]
pub struct IllegalTransitionError {
    pub entry_id: crate::ids::BillingEntryId,
    pub from: BillingState,
    pub attempted: BillingState,
}

/// A WAL append failed to become durable. Fatal to the in-flight request:
/// the in-memory reducer must not be applied, since the record that would
/// justify it was never safely written.
#[derive(Debug, Error)]
pub enum WalWriteError {
    #[error("failed to serialize WAL record: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("failed to append WAL record: {0}")]
    Io(#[source] std::io::Error),
    #[error("failed to fsync WAL segment: {0}")]
    Fsync(#[source] std::io::Error),
}

/// Reasons a single WAL record failed to be trusted during replay. Confined
/// to that one record; replay continues past it.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Error)]
pub enum ReplayDefect {
    #[error("record failed to parse as JSON")]
    Unparseable,
    #[error("checksum mismatch")]
    ChecksumMismatch,
    #[error("schema version {0} is newer than this binary understands")]
    FutureSchemaVersion(u32),
}

/// The outcome of attempting to finalize a charge with the external billing
/// authority.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FinalizeOutcome {
    /// 2xx.
    Success,
    /// 409: the authority had already recorded this charge.
    IdempotentSuccess,
    /// 4xx other than 409: will never succeed no matter how many times it's
    /// retried.
    Terminal,
    /// 5xx, network error, or timeout: may succeed on a later attempt.
    Retryable,
}

/// Reasons a payment verification attempt was rejected. Carries an explicit
/// catch-all so that a reason code introduced by a newer writer doesn't
/// panic an older reader replaying stored verification-failure observations.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Error)]
pub enum VerifyRejection {
    #[error("no challenge found for nonce")]
    NonceNotFound,
    #[error("HMAC did not match current or previous secret")]
    HmacInvalid,
    #[error("request binding did not match the issued challenge")]
    BindingMismatch,
    #[error("request path/method did not match the issued challenge")]
    PathMismatch,
    #[error("challenge has expired")]
    Expired,
    #[error("on-chain transaction reverted")]
    TxReverted,
    #[error("transaction has fewer confirmations than required")]
    Pending,
    #[error("chain RPC pool was unreachable")]
    RpcUnreachable,
    #[error("no matching Transfer event found in the receipt")]
    TransferNotFound,
    #[error("this payment has already been consumed by another request")]
    ReplayDetected,
    #[error("unrecognized verification rejection reason: {0}")]
    Unknown(String),
}

impl ForwardCompatible for VerifyRejection {
    fn is_unknown(&self) -> bool {
        matches!(self, VerifyRejection::Unknown(_))
    }
}

impl VerifyRejection {
    /// Whether this rejection is transient (should be retried by the caller)
    /// as opposed to a hard 402-class denial.
    pub fn is_retryable(&self) -> bool {
        matches!(self, VerifyRejection::Pending | VerifyRejection::RpcUnreachable)
    }
}

/// Reasons the admission gate refused to let a request proceed.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Error)]
pub enum AdmissionDenial {
    #[error("reconciliation state is FAIL_CLOSED")]
    ReconciliationFailClosed,
    #[error("tenant's pending finalize risk exceeds the configured cap")]
    CappedRiskExceeded,
    #[error("requested transition is not legal from the entry's current state")]
    IllegalTransition,
}
