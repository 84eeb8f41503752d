//! The on-disk WAL record format.

use common::error::ForwardCompatible;
use serde::{Deserialize, Serialize};

use crate::ids::{BillingEntryId, CorrelationId};

/// The highest schema version this binary understands. A record with a
/// higher version is skipped at replay rather than rejected outright, so
/// that a newer writer's records don't wedge an older reader.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

/// The tag identifying what kind of event a WAL record carries.
///
/// Carries an explicit [`EventType::Unknown`] arm: a record written by a
/// newer binary with an event type this one doesn't recognize is skipped
/// during replay (forward compatibility) instead of aborting it.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum EventType {
    BillingReserve,
    BillingCommit,
    BillingRelease,
    BillingVoid,
    BillingFinalizeAck,
    BillingFinalizeFail,
    BillingReserveExpired,
    BillingReconciliation,
    CreditMint,
    CreditDeduct,
    CreditNote,
    RequestStart,
    RequestComplete,
    /// A recognized-but-unimplemented string tag, preserved verbatim.
    Unknown(String),
}

impl EventType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::BillingReserve => "billing_reserve",
            Self::BillingCommit => "billing_commit",
            Self::BillingRelease => "billing_release",
            Self::BillingVoid => "billing_void",
            Self::BillingFinalizeAck => "billing_finalize_ack",
            Self::BillingFinalizeFail => "billing_finalize_fail",
            Self::BillingReserveExpired => "billing_reserve_expired",
            Self::BillingReconciliation => "billing_reconciliation",
            Self::CreditMint => "credit_mint",
            Self::CreditDeduct => "credit_deduct",
            Self::CreditNote => "credit_note",
            Self::RequestStart => "request_start",
            Self::RequestComplete => "request_complete",
            Self::Unknown(s) => s,
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "billing_reserve" => Self::BillingReserve,
            "billing_commit" => Self::BillingCommit,
            "billing_release" => Self::BillingRelease,
            "billing_void" => Self::BillingVoid,
            "billing_finalize_ack" => Self::BillingFinalizeAck,
            "billing_finalize_fail" => Self::BillingFinalizeFail,
            "billing_reserve_expired" => Self::BillingReserveExpired,
            "billing_reconciliation" => Self::BillingReconciliation,
            "credit_mint" => Self::CreditMint,
            "credit_deduct" => Self::CreditDeduct,
            "credit_note" => Self::CreditNote,
            "request_start" => Self::RequestStart,
            "request_complete" => Self::RequestComplete,
            other => Self::Unknown(other.to_owned()),
        }
    }
}

impl ForwardCompatible for EventType {
    fn is_unknown(&self) -> bool {
        matches!(self, EventType::Unknown(_))
    }
}

impl Serialize for EventType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(EventType::from_str(&s))
    }
}

/// A single WAL record: the envelope plus its event-specific payload.
///
/// `payload` is kept as a [`serde_json::Value`] at this layer so the envelope
/// can be parsed, checksummed, and (if unrecognized) skipped without needing
/// to know the concrete payload shape. Callers that recognize `event_type`
/// deserialize `payload` into the specific reducer input type they expect.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WalEnvelope {
    pub schema_version: u32,
    pub event_type: EventType,
    /// Unix milliseconds.
    pub timestamp: i64,
    pub billing_entry_id: BillingEntryId,
    pub correlation_id: CorrelationId,
    /// Absent only for legacy pre-sequence-number records.
    #[serde(default)]
    pub wal_sequence: Option<u64>,
    /// Lowercase hex CRC32 of the canonical serialization of `payload`.
    pub checksum: String,
    pub payload: serde_json::Value,
}

impl WalEnvelope {
    /// Construct a new envelope, computing the checksum over `payload`.
    ///
    /// `serde_json::Value::Object` is backed by a `BTreeMap` in this crate's
    /// configuration (the `preserve_order` feature is not enabled anywhere in
    /// this workspace), so `to_string()` on a `Value` is already canonical:
    /// object keys come out in sorted order at every depth.
    pub fn new(
        event_type: EventType,
        timestamp: i64,
        billing_entry_id: BillingEntryId,
        correlation_id: CorrelationId,
        wal_sequence: u64,
        payload: serde_json::Value,
    ) -> Self {
        let checksum = checksum_hex(&payload);
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            event_type,
            timestamp,
            billing_entry_id,
            correlation_id,
            wal_sequence: Some(wal_sequence),
            checksum,
            payload,
        }
    }

    /// Recompute the checksum over `self.payload` and compare against the
    /// stored `checksum` field.
    pub fn checksum_valid(&self) -> bool {
        checksum_hex(&self.payload) == self.checksum
    }
}

/// Canonical CRC32 checksum of a JSON value, as lowercase hex.
pub fn checksum_hex(value: &serde_json::Value) -> String {
    let canonical = value.to_string();
    let crc = crc32fast::hash(canonical.as_bytes());
    format!("{crc:08x}")
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn unknown_event_type_roundtrips_verbatim() {
        let json = r#""some_future_event""#;
        let parsed: EventType = serde_json::from_str(json).unwrap();
        assert_eq!(parsed, EventType::Unknown("some_future_event".to_owned()));
        assert_eq!(serde_json::to_string(&parsed).unwrap(), json);
    }

    #[test]
    fn known_event_type_roundtrips() {
        let json = r#""billing_commit""#;
        let parsed: EventType = serde_json::from_str(json).unwrap();
        assert_eq!(parsed, EventType::BillingCommit);
        assert_eq!(serde_json::to_string(&parsed).unwrap(), json);
    }

    #[test]
    fn checksum_detects_tampering() {
        let payload = serde_json::json!({"amount": 100});
        let checksum = checksum_hex(&payload);
        let tampered = serde_json::json!({"amount": 101});
        assert_ne!(checksum, checksum_hex(&tampered));
    }

    #[test]
    fn envelope_checksum_valid_after_construction() {
        let env = WalEnvelope::new(
            EventType::BillingReserve,
            1_700_000_000_000,
            BillingEntryId::from_raw("01ABCDEFGHJKMNPQRSTVWXYZ0"),
            CorrelationId::new("corr-1"),
            1,
            serde_json::json!({"amount": "100000"}),
        );
        assert!(env.checksum_valid());
    }
}
