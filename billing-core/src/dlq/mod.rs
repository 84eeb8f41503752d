//! The dead-letter queue: at-least-once delivery of committed charges to the
//! external billing authority, with exponential backoff, poison-message
//! quarantine, escalation, and bulk replay.

pub mod processor;
pub mod stream;

pub use processor::{
    DlqProcessor, EscalationCallback, FinalizeAttempt, FinalizeCallback, PoisonCallback,
};
pub use stream::{DlqEntry, DlqStream, InMemoryDlqStream, PoisonedEntry};
