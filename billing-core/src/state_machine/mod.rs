//! The per-request billing state machine.

pub mod manager;

use serde::{Deserialize, Serialize};

use crate::amount::{ExchangeRateSnapshot, MicroDollars};
use crate::ids::{BillingEntryId, CorrelationId, TenantId};

/// The state of a single billing entry. `IDLE` (no entry exists yet) is not
/// itself a variant here; an entry only exists in the derived store once it
/// has been reserved.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum BillingState {
    ReserveHeld,
    Committed,
    FinalizePending,
    FinalizeAcked,
    FinalizeFailed,
    Voided,
    Released,
}

impl BillingState {
    /// True if this state has no outgoing transitions.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BillingState::FinalizeAcked | BillingState::Released | BillingState::Voided
        )
    }

    /// Whether `self -> to` is an edge in the transition graph.
    pub fn can_transition_to(self, to: BillingState) -> bool {
        use BillingState::*;
        matches!(
            (self, to),
            (ReserveHeld, Committed)
                | (ReserveHeld, Released)
                | (Committed, FinalizePending)
                | (Committed, Voided)
                | (FinalizePending, FinalizeAcked)
                | (FinalizePending, FinalizeFailed)
                | (FinalizeFailed, FinalizeAcked)
                | (FinalizeFailed, Voided)
        )
    }
}

/// A single billable request, as reconstructed from the WAL.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BillingEntry {
    pub id: BillingEntryId,
    pub tenant: TenantId,
    pub state: BillingState,
    pub estimated_cost: MicroDollars,
    pub actual_cost: Option<MicroDollars>,
    pub exchange_rate: ExchangeRateSnapshot,
    pub created_at: common::time::TimestampMillis,
    pub updated_at: common::time::TimestampMillis,
    pub last_wal_sequence: u64,
    pub correlation_id: CorrelationId,
    pub finalize_attempts: u32,
}

impl BillingEntry {
    /// Whether this entry currently counts toward the `pending_count` gauge.
    pub fn counts_as_pending(&self) -> bool {
        matches!(
            self.state,
            BillingState::FinalizePending | BillingState::FinalizeFailed
        )
    }
}
