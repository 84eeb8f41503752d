//! Identifiers used throughout the billing substrate.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A sortable, unique identifier for a single [`crate::state_machine::BillingEntry`].
///
/// Formatted as a 26-character Crockford base32 string, timestamp-prefixed so
/// that lexicographic order matches creation order (the same convention LDK
/// payment IDs use, but sortable rather than random). Two entries created in
/// the same process never collide because the random suffix is drawn from a
/// CSPRNG.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BillingEntryId(String);

const CROCKFORD: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

impl BillingEntryId {
    /// Generate a new identifier from the given millisecond timestamp and a
    /// source of randomness. `timestamp_ms` occupies the first 10 characters
    /// (48 bits is enough until the year 10889); the remaining 16 characters
    /// (80 bits) are random.
    pub fn generate(
        timestamp_ms: i64,
        rng: &mut dyn rand_core::RngCore,
    ) -> Self {
        let mut out = String::with_capacity(26);
        let ts = timestamp_ms.max(0) as u64;
        for i in (0..10).rev() {
            let shift = i * 5;
            let idx = ((ts >> shift) & 0x1f) as usize;
            out.push(CROCKFORD[idx] as char);
        }
        let mut rand_bytes = [0u8; 10];
        rng.fill_bytes(&mut rand_bytes);
        // 10 bytes = 80 bits = 16 base32 chars
        let mut acc: u128 = 0;
        for b in rand_bytes {
            acc = (acc << 8) | u128::from(b);
        }
        for i in (0..16).rev() {
            let shift = i * 5;
            let idx = ((acc >> shift) & 0x1f) as usize;
            out.push(CROCKFORD[idx] as char);
        }
        Self(out)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Construct from an already-formatted string, e.g. when reading one back
    /// out of the WAL. Does not validate the Crockford alphabet; callers that
    /// need that guarantee should check `as_str().bytes()` themselves.
    pub fn from_raw(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl fmt::Display for BillingEntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A tenant / account identifier. Opaque to this crate beyond equality and
/// ordering; the gateway is responsible for assigning these.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Caller-supplied correlation id, threaded through the WAL, DLQ, and
/// finalize call so that multi-hop failures can be traced back to a single
/// originating request.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
