//! The HMAC-bound payment challenge: binds an on-chain amount to the
//! specific request parameters it's meant to pay for.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::amount::TokenAmount;

/// The request parameters a challenge is bound to. Lower-cased before
/// hashing so a case-mismatch in, say, a model identifier's casing doesn't
/// cause a spurious `binding_mismatch`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RequestParams {
    pub token_id: String,
    pub model_id: String,
    pub max_tokens: u64,
}

impl RequestParams {
    /// SHA-256 hex over the lower-cased fields joined by `|`, matching the
    /// separator used for the challenge's own canonical HMAC input.
    pub fn binding_hex(&self) -> String {
        let canonical = format!(
            "{}|{}|{}",
            self.token_id.to_lowercase(),
            self.model_id.to_lowercase(),
            self.max_tokens,
        );
        common::hex::encode(common::sha256::digest(canonical.as_bytes()).as_ref())
    }
}

/// A single-use, HMAC-signed challenge issued for a pay-per-request path.
///
/// `hmac` is always the last field populated: [`PaymentChallenge::issue`]
/// computes every other field first, then signs their canonical
/// serialization. Skipping a no-longer-valid previous secret on
/// [`PaymentChallenge::verify_hmac`] is how rotation is supported.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PaymentChallenge {
    pub amount: TokenAmount,
    pub recipient: String,
    pub chain_id: u64,
    pub token_address: String,
    pub nonce: Uuid,
    /// Unix seconds.
    pub expiry: i64,
    pub request_path: String,
    pub request_method: String,
    pub request_binding: String,
    pub hmac: String,
}

impl PaymentChallenge {
    /// Issue a fresh challenge for `params`, signing it with `secret`.
    #[allow(clippy::too_many_arguments)]
    pub fn issue(
        amount: TokenAmount,
        recipient: String,
        chain_id: u64,
        token_address: String,
        nonce: Uuid,
        expiry: i64,
        request_path: String,
        request_method: String,
        params: &RequestParams,
        secret: &[u8],
    ) -> Self {
        let request_binding = params.binding_hex();
        let mut challenge = Self {
            amount,
            recipient,
            chain_id,
            token_address,
            nonce,
            expiry,
            request_path,
            request_method,
            request_binding,
            hmac: String::new(),
        };
        challenge.hmac = challenge.sign(secret);
        challenge
    }

    /// The canonical, key-sorted byte serialization of every field except
    /// `hmac` itself. `serde_json::Value::Object` in this workspace is
    /// backed by a `BTreeMap` (no crate enables `preserve_order`), so
    /// `to_string()` on the constructed value already sorts keys at every
    /// depth.
    fn canonical_bytes(&self) -> Vec<u8> {
        let value = serde_json::json!({
            "amount": self.amount.to_decimal_str(),
            "recipient": self.recipient.to_lowercase(),
            "chain_id": self.chain_id,
            "token_address": self.token_address.to_lowercase(),
            "nonce": self.nonce,
            "expiry": self.expiry,
            "request_path": self.request_path,
            "request_method": self.request_method,
            "request_binding": self.request_binding,
        });
        value.to_string().into_bytes()
    }

    fn sign(&self, secret: &[u8]) -> String {
        let key = ring::hmac::Key::new(ring::hmac::HMAC_SHA256, secret);
        let tag = ring::hmac::sign(&key, &self.canonical_bytes());
        common::hex::encode(tag.as_ref())
    }

    /// Verify `self.hmac` against `secret`, constant-time.
    fn hmac_matches(&self, secret: &[u8]) -> bool {
        let Ok(expected) = common::hex::decode(&self.hmac) else {
            return false;
        };
        let key = ring::hmac::Key::new(ring::hmac::HMAC_SHA256, secret);
        ring::hmac::verify(&key, &self.canonical_bytes(), &expected).is_ok()
    }

    /// Verify against the current secret, falling back to `secret_previous`
    /// (if configured) during a rotation grace period.
    pub fn verify_hmac(&self, secret: &[u8], secret_previous: Option<&[u8]>) -> bool {
        if self.hmac_matches(secret) {
            return true;
        }
        match secret_previous {
            Some(previous) => self.hmac_matches(previous),
            None => false,
        }
    }
}
