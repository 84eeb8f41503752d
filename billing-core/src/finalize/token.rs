//! Short-lived service-to-service tokens attached to every finalize call.
//!
//! Signing is modeled as an injected port, same pattern as
//! [`crate::payment::chain::ChainRpcPool`] and
//! [`crate::payment::store::ChallengeStore`]: a real deployment would likely
//! sign with an org-wide identity service, which can fail independently of
//! this process (HSM unavailable, key rotation in flight). This crate ships
//! an in-process HMAC-SHA256 signer, reusing the canonicalization approach
//! from [`crate::payment::challenge`] rather than adding an asymmetric-crypto
//! dependency this workspace doesn't otherwise need.

use async_trait::async_trait;
use thiserror::Error;

use crate::ids::{BillingEntryId, CorrelationId};

/// Fixed purpose claim for every token this client issues.
pub const PURPOSE_BILLING_FINALIZE: &str = "billing_finalize";

#[derive(Clone, Debug)]
pub struct ServiceTokenClaims {
    pub subject: String,
    pub purpose: &'static str,
    pub entry_id: BillingEntryId,
    pub correlation_id: CorrelationId,
    pub issued_at: common::time::TimestampMillis,
}

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("service token signing backend unavailable: {0}")]
    SigningUnavailable(String),
}

/// Mints the bearer token carried in the finalize call's authorization slot.
#[async_trait]
pub trait ServiceTokenSigner: Send + Sync {
    async fn sign(&self, claims: &ServiceTokenClaims) -> Result<String, TokenError>;
}

/// An in-process signer: HMAC-SHA256 over the canonical claims, hex-encoded.
/// Sufficient for a single-node deployment where the finalize authority
/// shares the same secret out of band; a multi-node deployment would swap
/// this for a real identity-service client behind the same trait.
pub struct HmacServiceTokenSigner {
    secret: Vec<u8>,
}

impl HmacServiceTokenSigner {
    pub fn new(secret: Vec<u8>) -> Self {
        Self { secret }
    }

    fn canonical_bytes(claims: &ServiceTokenClaims) -> Vec<u8> {
        serde_json::json!({
            "subject": claims.subject,
            "purpose": claims.purpose,
            "entry_id": claims.entry_id.as_str(),
            "correlation_id": claims.correlation_id.as_str(),
            "issued_at": claims.issued_at.as_i64(),
        })
        .to_string()
        .into_bytes()
    }
}

#[async_trait]
impl ServiceTokenSigner for HmacServiceTokenSigner {
    async fn sign(&self, claims: &ServiceTokenClaims) -> Result<String, TokenError> {
        let key = ring::hmac::Key::new(ring::hmac::HMAC_SHA256, &self.secret);
        let tag = ring::hmac::sign(&key, &Self::canonical_bytes(claims));
        Ok(common::hex::encode(tag.as_ref()))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn same_claims_sign_identically() {
        let signer = HmacServiceTokenSigner::new(b"secret".to_vec());
        let claims = ServiceTokenClaims {
            subject: "tenant-1".to_owned(),
            purpose: PURPOSE_BILLING_FINALIZE,
            entry_id: BillingEntryId::from_raw("01ABCDEFGHJKMNPQRSTVWXYZ0"),
            correlation_id: CorrelationId::new("corr-1"),
            issued_at: common::time::TimestampMillis::now(),
        };
        let a = signer.sign(&claims).await.unwrap();
        let b = signer.sign(&claims).await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn different_entry_ids_sign_differently() {
        let signer = HmacServiceTokenSigner::new(b"secret".to_vec());
        let now = common::time::TimestampMillis::now();
        let claims_a = ServiceTokenClaims {
            subject: "tenant-1".to_owned(),
            purpose: PURPOSE_BILLING_FINALIZE,
            entry_id: BillingEntryId::from_raw("01ABCDEFGHJKMNPQRSTVWXYZ0"),
            correlation_id: CorrelationId::new("corr-1"),
            issued_at: now,
        };
        let mut claims_b = claims_a.clone();
        claims_b.entry_id = BillingEntryId::from_raw("01ABCDEFGHJKMNPQRSTVWXYZ1");
        let a = signer.sign(&claims_a).await.unwrap();
        let b = signer.sign(&claims_b).await.unwrap();
        assert_ne!(a, b);
    }
}
