//! Pay-per-request payment challenge issuance and on-chain receipt
//! verification (the "x402" flow referenced by the challenge store's key
//! prefix).

pub mod challenge;
pub mod chain;
pub mod store;
pub mod verify;

pub use challenge::{PaymentChallenge, RequestParams};
pub use chain::{ChainRpcPool, ChainRpcError, TransactionReceipt, TransferLog, TxStatus};
pub use store::{ChallengeStore, InMemoryChallengeStore};
pub use verify::{ReceiptSubmission, Verifier};
