//! The write-ahead log: the single source of truth for billing state.

pub mod envelope;
pub mod replay;
pub mod writer;

pub use envelope::{EventType, WalEnvelope};
pub use replay::{replay, ReplayOutcome, Reducer};
pub use writer::WalWriter;
