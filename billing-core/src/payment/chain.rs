//! The chain-RPC pool boundary. This crate calls into a pool of RPC
//! endpoints to fetch transaction receipts; it does not manage endpoint
//! lifecycle, failover, or the wire format of any particular chain's RPC
//! protocol; those live behind this trait.

use async_trait::async_trait;
use thiserror::Error;

use crate::amount::TokenAmount;

/// The on-chain status of a submitted transaction.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TxStatus {
    Success,
    Reverted,
}

/// A single ERC20-style `Transfer(from, to, value)` log entry.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TransferLog {
    pub contract: String,
    pub from: String,
    pub to: String,
    pub value: TokenAmount,
}

/// The minimal shape of a transaction receipt this crate needs in order to
/// verify a payment: status, confirmation depth, and any Transfer logs it
/// emitted.
#[derive(Clone, Debug)]
pub struct TransactionReceipt {
    pub status: TxStatus,
    pub tx_block: u64,
    pub head_block: u64,
    pub logs: Vec<TransferLog>,
}

impl TransactionReceipt {
    /// `head_block - tx_block`, i.e. how many blocks have been mined on top
    /// of the block containing this transaction.
    pub fn confirmations(&self) -> u64 {
        self.head_block.saturating_sub(self.tx_block)
    }
}

#[derive(Debug, Error)]
pub enum ChainRpcError {
    #[error("chain RPC pool unreachable: {0}")]
    Unreachable(String),
    #[error("transaction not found")]
    NotFound,
}

/// A pool of chain-RPC endpoints. Out of scope for this crate beyond this
/// boundary: failover, rate limiting, and endpoint health are the pool
/// implementation's concern.
#[async_trait]
pub trait ChainRpcPool: Send + Sync {
    async fn get_transaction_receipt(
        &self,
        chain_id: u64,
        tx_hash: &str,
    ) -> Result<TransactionReceipt, ChainRpcError>;
}
