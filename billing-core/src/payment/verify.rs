//! Receipt verification: the strict, short-circuiting 10-step procedure
//! described in the payment challenge/verify design. Each step either
//! advances or rejects with a specific [`crate::error::VerifyRejection`]
//! reason so the caller can surface why a payment was refused.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, instrument, warn};

use crate::amount::TokenAmount;
use crate::error::VerifyRejection;
use crate::payment::chain::{ChainRpcError, ChainRpcPool, TxStatus};
use crate::payment::challenge::RequestParams;
use crate::payment::store::{ChallengeStore, ConsumeError};

/// A receipt submitted by the payer, binding a transaction hash to the
/// challenge nonce it's meant to settle.
#[derive(Clone, Debug)]
pub struct ReceiptSubmission {
    pub tx_hash: String,
    pub nonce: uuid::Uuid,
    pub request_path: String,
    pub request_method: String,
    pub params: RequestParams,
}

/// The canonicalized sender, recovered from the matching Transfer log's
/// `from` field. Smart-contract wallets may relay payment from a funding
/// address distinct from any address bound into the challenge, so this is
/// informational rather than a field that was ever checked against anything.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VerifiedPayment {
    pub sender: String,
}

pub struct Verifier {
    store: Arc<dyn ChallengeStore>,
    chain: Arc<dyn ChainRpcPool>,
    secret: Vec<u8>,
    secret_previous: Option<Vec<u8>>,
    min_confirmations: u64,
    replay_window: Duration,
}

impl Verifier {
    pub fn new(
        store: Arc<dyn ChallengeStore>,
        chain: Arc<dyn ChainRpcPool>,
        secret: Vec<u8>,
        secret_previous: Option<Vec<u8>>,
        min_confirmations: u64,
        replay_window: Duration,
    ) -> Self {
        Self {
            store,
            chain,
            secret,
            secret_previous,
            min_confirmations,
            replay_window,
        }
    }

    #[instrument(skip_all, fields(nonce = %submission.nonce))]
    pub async fn verify(
        &self,
        submission: &ReceiptSubmission,
        now: common::time::TimestampMillis,
    ) -> Result<VerifiedPayment, VerifyRejection> {
        // 1. look up the challenge.
        let challenge = self
            .store
            .get(submission.nonce, now)
            .await
            .ok_or(VerifyRejection::NonceNotFound)?;

        // 2. HMAC, current then previous secret.
        if !challenge.verify_hmac(&self.secret, self.secret_previous.as_deref()) {
            warn!("hmac mismatch against current and previous secret");
            return Err(VerifyRejection::HmacInvalid);
        }

        // 3. request binding.
        if challenge.request_binding != submission.params.binding_hex() {
            return Err(VerifyRejection::BindingMismatch);
        }

        // 4. request path/method.
        if challenge.request_path != submission.request_path
            || challenge.request_method != submission.request_method
        {
            return Err(VerifyRejection::PathMismatch);
        }

        // 5. expiry.
        if now.as_i64() / 1000 > challenge.expiry {
            return Err(VerifyRejection::Expired);
        }

        // 6. fetch the receipt.
        let receipt = self
            .chain
            .get_transaction_receipt(challenge.chain_id, &submission.tx_hash)
            .await
            .map_err(|e| match e {
                ChainRpcError::Unreachable(_) | ChainRpcError::NotFound => {
                    VerifyRejection::RpcUnreachable
                }
            })?;

        // 7. revert status.
        if receipt.status == TxStatus::Reverted {
            return Err(VerifyRejection::TxReverted);
        }

        // 8. confirmation depth.
        if receipt.confirmations() < self.min_confirmations {
            return Err(VerifyRejection::Pending);
        }

        // 9. matching Transfer log. Sender is deliberately not matched here:
        // smart-contract wallets may relay payment on behalf of a different
        // funding address.
        let transfer = receipt
            .logs
            .iter()
            .find(|log| {
                log.contract.eq_ignore_ascii_case(&challenge.token_address)
                    && log.to.eq_ignore_ascii_case(&challenge.recipient)
                    && log.value == challenge.amount
            })
            .ok_or(VerifyRejection::TransferNotFound)?;
        let sender = transfer.from.clone();

        // 10. atomic consumption.
        self.store
            .consume(submission.nonce, &submission.tx_hash, now, self.replay_window)
            .await
            .map_err(|e| match e {
                ConsumeError::NotFound => VerifyRejection::NonceNotFound,
                ConsumeError::AlreadyConsumed => VerifyRejection::ReplayDetected,
            })?;

        info!(sender = %sender, "payment verified");
        Ok(VerifiedPayment { sender })
    }
}

#[cfg(test)]
mod test {
    use async_trait::async_trait;

    use super::*;
    use crate::payment::chain::{TransactionReceipt, TransferLog};
    use crate::payment::challenge::PaymentChallenge;
    use crate::payment::store::InMemoryChallengeStore;

    struct FakeChain {
        receipt: Result<TransactionReceipt, ChainRpcError>,
    }

    #[async_trait]
    impl ChainRpcPool for FakeChain {
        async fn get_transaction_receipt(
            &self,
            _chain_id: u64,
            _tx_hash: &str,
        ) -> Result<TransactionReceipt, ChainRpcError> {
            match &self.receipt {
                Ok(r) => Ok(r.clone()),
                Err(ChainRpcError::Unreachable(s)) => Err(ChainRpcError::Unreachable(s.clone())),
                Err(ChainRpcError::NotFound) => Err(ChainRpcError::NotFound),
            }
        }
    }

    fn params() -> RequestParams {
        RequestParams {
            token_id: "0x1".to_owned(),
            model_id: "claude-opus".to_owned(),
            max_tokens: 4096,
        }
    }

    fn receipt_with_confirmations(confirmations: u64) -> TransactionReceipt {
        TransactionReceipt {
            status: TxStatus::Success,
            tx_block: 100,
            head_block: 100 + confirmations,
            logs: vec![TransferLog {
                contract: "0xTOKEN".to_owned(),
                from: "0xSENDER".to_owned(),
                to: "0xABC".to_owned(),
                value: TokenAmount::from_base_units(100_000),
            }],
        }
    }

    async fn setup(
        receipt: Result<TransactionReceipt, ChainRpcError>,
    ) -> (Verifier, Arc<InMemoryChallengeStore>, PaymentChallenge) {
        let store = Arc::new(InMemoryChallengeStore::new());
        let now = common::time::TimestampMillis::now();
        let challenge = PaymentChallenge::issue(
            TokenAmount::from_base_units(100_000),
            "0xABC".to_owned(),
            1,
            "0xTOKEN".to_owned(),
            uuid::Uuid::new_v4(),
            now.as_i64() / 1000 + 300,
            "/v1/messages".to_owned(),
            "POST".to_owned(),
            &params(),
            b"secret",
        );
        store.put(challenge.clone(), now).await;
        let chain = Arc::new(FakeChain { receipt });
        let verifier = Verifier::new(
            store.clone(),
            chain,
            b"secret".to_vec(),
            None,
            10,
            Duration::from_secs(600),
        );
        (verifier, store, challenge)
    }

    #[tokio::test]
    async fn happy_path_succeeds_and_consumes_the_challenge() {
        let (verifier, store, challenge) = setup(Ok(receipt_with_confirmations(100))).await;
        let now = common::time::TimestampMillis::now();
        let submission = ReceiptSubmission {
            tx_hash: "0xTX1".to_owned(),
            nonce: challenge.nonce,
            request_path: "/v1/messages".to_owned(),
            request_method: "POST".to_owned(),
            params: params(),
        };
        let result = verifier.verify(&submission, now).await.unwrap();
        assert_eq!(result.sender, "0xSENDER");
        assert!(store.get(challenge.nonce, now).await.is_none());
    }

    #[tokio::test]
    async fn replay_with_same_tx_hash_is_rejected() {
        let (verifier, store, challenge) = setup(Ok(receipt_with_confirmations(100))).await;
        let now = common::time::TimestampMillis::now();
        let submission = ReceiptSubmission {
            tx_hash: "0xTX1".to_owned(),
            nonce: challenge.nonce,
            request_path: "/v1/messages".to_owned(),
            request_method: "POST".to_owned(),
            params: params(),
        };
        verifier.verify(&submission, now).await.unwrap();

        // A second challenge, reusing the same on-chain tx hash.
        let challenge2 = PaymentChallenge::issue(
            TokenAmount::from_base_units(100_000),
            "0xABC".to_owned(),
            1,
            "0xTOKEN".to_owned(),
            uuid::Uuid::new_v4(),
            now.as_i64() / 1000 + 300,
            "/v1/messages".to_owned(),
            "POST".to_owned(),
            &params(),
            b"secret",
        );
        store.put(challenge2.clone(), now).await;
        let submission2 = ReceiptSubmission {
            tx_hash: "0xTX1".to_owned(),
            nonce: challenge2.nonce,
            request_path: "/v1/messages".to_owned(),
            request_method: "POST".to_owned(),
            params: params(),
        };
        let err = verifier.verify(&submission2, now).await.unwrap_err();
        assert_eq!(err, VerifyRejection::ReplayDetected);
    }

    #[tokio::test]
    async fn tampered_model_id_is_a_binding_mismatch_and_does_not_consume() {
        let (verifier, store, challenge) = setup(Ok(receipt_with_confirmations(100))).await;
        let now = common::time::TimestampMillis::now();
        let mut tampered_params = params();
        tampered_params.model_id = "claude-haiku".to_owned();
        let submission = ReceiptSubmission {
            tx_hash: "0xTX1".to_owned(),
            nonce: challenge.nonce,
            request_path: "/v1/messages".to_owned(),
            request_method: "POST".to_owned(),
            params: tampered_params,
        };
        let err = verifier.verify(&submission, now).await.unwrap_err();
        assert_eq!(err, VerifyRejection::BindingMismatch);
        assert!(store.get(challenge.nonce, now).await.is_some());
    }

    #[tokio::test]
    async fn confirmations_one_below_threshold_is_pending() {
        let (verifier, challenge_store, challenge) = setup(Ok(receipt_with_confirmations(9))).await;
        let _ = &challenge_store;
        let now = common::time::TimestampMillis::now();
        let submission = ReceiptSubmission {
            tx_hash: "0xTX1".to_owned(),
            nonce: challenge.nonce,
            request_path: "/v1/messages".to_owned(),
            request_method: "POST".to_owned(),
            params: params(),
        };
        let err = verifier.verify(&submission, now).await.unwrap_err();
        assert_eq!(err, VerifyRejection::Pending);
    }

    #[tokio::test]
    async fn confirmations_exactly_at_threshold_succeeds() {
        let (verifier, _store, challenge) = setup(Ok(receipt_with_confirmations(10))).await;
        let now = common::time::TimestampMillis::now();
        let submission = ReceiptSubmission {
            tx_hash: "0xTX1".to_owned(),
            nonce: challenge.nonce,
            request_path: "/v1/messages".to_owned(),
            request_method: "POST".to_owned(),
            params: params(),
        };
        assert!(verifier.verify(&submission, now).await.is_ok());
    }

    #[tokio::test]
    async fn unreachable_rpc_surfaces_as_rpc_unreachable() {
        let (verifier, _store, challenge) =
            setup(Err(ChainRpcError::Unreachable("connection refused".to_owned()))).await;
        let now = common::time::TimestampMillis::now();
        let submission = ReceiptSubmission {
            tx_hash: "0xTX1".to_owned(),
            nonce: challenge.nonce,
            request_path: "/v1/messages".to_owned(),
            request_method: "POST".to_owned(),
            params: params(),
        };
        let err = verifier.verify(&submission, now).await.unwrap_err();
        assert_eq!(err, VerifyRejection::RpcUnreachable);
    }
}
