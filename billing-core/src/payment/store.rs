//! The short-lived keyed cache backing the challenge store and the
//! used-transaction dedupe index.
//!
//! The production deployment of this store is a Redis-like keyed cache (the
//! `x402:challenge:<nonce>` key prefix in the design notes); this crate ships
//! an in-process implementation sufficient for a single-node deployment and
//! for tests, behind the same trait so a real keyed-cache client can be
//! substituted without touching the verifier.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::payment::challenge::PaymentChallenge;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Error)]
pub enum ConsumeError {
    #[error("no challenge found for this nonce")]
    NotFound,
    #[error("challenge or transaction hash already consumed")]
    AlreadyConsumed,
}

/// The short-lived keyed cache holding issued challenges and the
/// used-transaction-hash dedupe index.
#[async_trait]
pub trait ChallengeStore: Send + Sync {
    /// Store a freshly issued challenge, expiring at `expires_at`.
    async fn put(&self, challenge: PaymentChallenge, expires_at: common::time::TimestampMillis);

    /// Look up a challenge by nonce without consuming it. Returns `None` if
    /// absent or past its expiry.
    async fn get(&self, nonce: Uuid, now: common::time::TimestampMillis) -> Option<PaymentChallenge>;

    /// Atomically: assert the challenge still exists and is unconsumed,
    /// assert `tx_hash` hasn't previously been recorded as used, mark the
    /// challenge consumed, record `tx_hash` as used for `replay_window`, and
    /// delete the challenge. A single operation so no other caller can
    /// observe (or race) an intermediate state.
    async fn consume(
        &self,
        nonce: Uuid,
        tx_hash: &str,
        now: common::time::TimestampMillis,
        replay_window: Duration,
    ) -> Result<(), ConsumeError>;
}

struct Inner {
    challenges: HashMap<Uuid, (PaymentChallenge, common::time::TimestampMillis)>,
    used_tx: HashMap<String, common::time::TimestampMillis>,
}

/// An in-process [`ChallengeStore`]. Everything lives behind one
/// [`tokio::sync::Mutex`] so [`ChallengeStore::consume`] is trivially a
/// single atomic multi-key operation, matching what a real keyed-cache
/// transaction or Lua script would provide in production.
pub struct InMemoryChallengeStore {
    inner: Mutex<Inner>,
}

impl Default for InMemoryChallengeStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryChallengeStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                challenges: HashMap::new(),
                used_tx: HashMap::new(),
            }),
        }
    }
}

#[async_trait]
impl ChallengeStore for InMemoryChallengeStore {
    async fn put(&self, challenge: PaymentChallenge, expires_at: common::time::TimestampMillis) {
        let mut inner = self.inner.lock().await;
        inner.challenges.insert(challenge.nonce, (challenge, expires_at));
    }

    async fn get(&self, nonce: Uuid, now: common::time::TimestampMillis) -> Option<PaymentChallenge> {
        let inner = self.inner.lock().await;
        inner.challenges.get(&nonce).and_then(|(challenge, expires_at)| {
            if expires_at.as_i64() >= now.as_i64() {
                Some(challenge.clone())
            } else {
                None
            }
        })
    }

    async fn consume(
        &self,
        nonce: Uuid,
        tx_hash: &str,
        now: common::time::TimestampMillis,
        replay_window: Duration,
    ) -> Result<(), ConsumeError> {
        let mut inner = self.inner.lock().await;

        let still_valid = inner
            .challenges
            .get(&nonce)
            .is_some_and(|(_, expires_at)| expires_at.as_i64() >= now.as_i64());
        if !still_valid {
            return Err(ConsumeError::NotFound);
        }

        let tx_hash_in_use = inner
            .used_tx
            .get(tx_hash)
            .is_some_and(|expires_at| expires_at.as_i64() >= now.as_i64());
        if tx_hash_in_use {
            return Err(ConsumeError::AlreadyConsumed);
        }

        let expires_at = common::time::TimestampMillis::try_from(
            std::time::SystemTime::from(now) + replay_window,
        )
        .expect("replay window expiry overflowed Unix epoch bounds");
        inner.used_tx.insert(tx_hash.to_owned(), expires_at);
        inner.challenges.remove(&nonce);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::payment::challenge::RequestParams;

    fn challenge(nonce: Uuid) -> PaymentChallenge {
        PaymentChallenge::issue(
            crate::amount::TokenAmount::from_base_units(1),
            "0xABC".to_owned(),
            1,
            "0xTOKEN".to_owned(),
            nonce,
            1_700_000_300,
            "/v1/messages".to_owned(),
            "POST".to_owned(),
            &RequestParams {
                token_id: "0x1".to_owned(),
                model_id: "claude-opus".to_owned(),
                max_tokens: 4096,
            },
            b"secret",
        )
    }

    #[tokio::test]
    async fn consume_then_reconsume_same_nonce_fails() {
        let store = InMemoryChallengeStore::new();
        let nonce = Uuid::new_v4();
        let now = common::time::TimestampMillis::now();
        store.put(challenge(nonce), now).await;

        store.consume(nonce, "0xTX1", now, Duration::from_secs(60)).await.unwrap();
        assert_eq!(
            store.consume(nonce, "0xTX2", now, Duration::from_secs(60)).await.unwrap_err(),
            ConsumeError::NotFound
        );
    }

    #[tokio::test]
    async fn reusing_tx_hash_with_a_different_challenge_is_rejected() {
        let store = InMemoryChallengeStore::new();
        let now = common::time::TimestampMillis::now();
        let nonce_a = Uuid::new_v4();
        let nonce_b = Uuid::new_v4();
        store.put(challenge(nonce_a), now).await;
        store.put(challenge(nonce_b), now).await;

        store.consume(nonce_a, "0xDUP", now, Duration::from_secs(60)).await.unwrap();
        assert_eq!(
            store.consume(nonce_b, "0xDUP", now, Duration::from_secs(60)).await.unwrap_err(),
            ConsumeError::AlreadyConsumed
        );
    }

    #[tokio::test]
    async fn expired_challenge_is_not_returned() {
        let store = InMemoryChallengeStore::new();
        let now = common::time::TimestampMillis::now();
        let nonce = Uuid::new_v4();
        store.put(challenge(nonce), now).await;

        let later = common::time::TimestampMillis::try_from(
            std::time::SystemTime::from(now) + Duration::from_secs(3600),
        )
        .unwrap();
        assert!(store.get(nonce, later).await.is_none());
    }
}
