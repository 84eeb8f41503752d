//! Billing, payment-verification, and budget-reconciliation substrate for a
//! multi-tenant AI-request gateway.
//!
//! Every billable request is accounted for exactly once, even across process
//! crashes, transient network partitions, and concurrent workers; no request
//! proceeds without a verified payment or a budget headroom guarantee; and
//! the local service's view of spend converges to the authoritative upstream
//! billing system's view.
//!
//! Three tightly coupled subsystems, leaves first:
//! - [`wal`] + [`state_machine`]: a crash-safe, per-request state machine
//!   whose transitions are serialized to a checksummed on-disk log that is
//!   the single source of truth; in-memory state is derived and
//!   reconstructed deterministically from the log at startup.
//! - [`dlq`] + [`finalize`]: the at-least-once mechanism that propagates
//!   committed charges to an external billing authority with
//!   exponential-backoff retries, poison-message quarantine, escalation, and
//!   bulk replay.
//! - [`payment`] + [`reconciliation`]: a pay-per-request protocol binding
//!   request parameters to a cryptographically signed challenge and
//!   verifying an on-chain payment receipt, plus a periodic reconciliation
//!   loop comparing local spend against the authoritative billing authority.
//!
//! [`admission`] composes all three into the single decision point request
//! handlers consult before doing any billable work; [`pricing`] resolves the
//! estimated cost that decision is made against.

pub mod admission;
pub mod amount;
pub mod config;
pub mod dlq;
pub mod error;
pub mod finalize;
pub mod ids;
pub mod payment;
pub mod pricing;
pub mod reconciliation;
pub mod state_machine;
pub mod wal;
