//! Runtime configuration for the billing substrate.
//!
//! A single [`Config`] covers every item in the "Recognized configuration
//! options" list this crate was specified against. It's `serde`-deserializable
//! from TOML (or any other format) with every field defaulted, and a
//! [`Config::validate`] step that rejects nonsensical values (negative
//! durations, empty secrets) before any component gets to use them.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Directory where WAL segments are written and read.
    pub wal_dir: std::path::PathBuf,
    /// Segment rotation ceiling in bytes.
    pub wal_segment_max_bytes: u64,
    /// How long a `RESERVE_HELD` entry may sit uncommitted before it's
    /// automatically expired.
    pub reserve_ttl_seconds: u64,
    /// Maximum finalize attempts before an entry is quarantined to the
    /// poison stream.
    pub max_dlq_retries: u32,
    /// Backoff schedule, in milliseconds, indexed by attempt number.
    /// Saturates at the final entry for attempts beyond the table's length.
    pub dlq_backoff_ms: Vec<u64>,
    /// How old a poisoned entry must be before it triggers an escalation
    /// callback.
    pub escalation_window_ms: u64,
    /// Above this combined pending/failed finalize value (in credit units),
    /// the admission gate refuses new reserves for a tenant.
    pub max_pending_risk_cu: u64,
    /// Percentage of the authority's configured limit granted as headroom
    /// upon entering FAIL_OPEN.
    pub fail_open_headroom_percent: u8,
    /// Absolute ceiling on FAIL_OPEN headroom, regardless of percentage,
    /// in microdollars.
    pub fail_open_absolute_cap_micro: u128,
    /// Maximum duration the reconciliation client may remain in FAIL_OPEN
    /// before forcing FAIL_CLOSED.
    pub fail_open_max_duration_ms: u64,
    /// How often the reconciliation client polls the authority.
    pub reconciliation_poll_interval_ms: u64,
    /// Local/authority drift, in microdollars, tolerated before leaving
    /// SYNCED.
    pub drift_threshold_micro: u128,
    /// Current HMAC secret used to sign payment challenges.
    pub challenge_secret: Vec<u8>,
    /// Previous HMAC secret, accepted during a rotation grace period.
    pub challenge_secret_previous: Option<Vec<u8>>,
    /// HMAC secret used to sign the short-lived service-to-service tokens
    /// attached to finalize calls. Kept distinct from `challenge_secret` so
    /// the two signing contexts never share key material.
    pub service_token_secret: Vec<u8>,
    /// Minimum on-chain confirmations required before a receipt is accepted.
    pub min_confirmations: u64,
    /// TTL for an issued payment challenge.
    pub challenge_ttl_seconds: u64,
    /// How long a consumed `tx_hash` is remembered to prevent replay.
    pub replay_window_seconds: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            wal_dir: std::path::PathBuf::from("./wal"),
            wal_segment_max_bytes: 1 << 30, // 1 GiB
            reserve_ttl_seconds: 300,
            max_dlq_retries: 5,
            dlq_backoff_ms: vec![1_000, 2_000, 4_000, 8_000, 16_000],
            escalation_window_ms: 24 * 60 * 60 * 1_000,
            max_pending_risk_cu: 500,
            fail_open_headroom_percent: 10,
            fail_open_absolute_cap_micro: 0,
            fail_open_max_duration_ms: 5_000,
            reconciliation_poll_interval_ms: 5_000,
            drift_threshold_micro: 100,
            challenge_secret: Vec::new(),
            challenge_secret_previous: None,
            service_token_secret: Vec::new(),
            min_confirmations: 10,
            challenge_ttl_seconds: 300,
            replay_window_seconds: 600,
        }
    }
}

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("wal_segment_max_bytes must be nonzero")]
    ZeroSegmentSize,
    #[error("max_dlq_retries must be nonzero")]
    ZeroMaxRetries,
    #[error("dlq_backoff_ms must contain at least one entry")]
    EmptyBackoffTable,
    #[error("challenge_secret must not be empty")]
    EmptyChallengeSecret,
    #[error("service_token_secret must not be empty")]
    EmptyServiceTokenSecret,
    #[error("fail_open_headroom_percent must be in 1..=100")]
    InvalidHeadroomPercent,
}

impl Config {
    /// Parse a [`Config`] from TOML text, then validate it.
    pub fn from_toml_str(s: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.wal_segment_max_bytes == 0 {
            return Err(ValidationError::ZeroSegmentSize);
        }
        if self.max_dlq_retries == 0 {
            return Err(ValidationError::ZeroMaxRetries);
        }
        if self.dlq_backoff_ms.is_empty() {
            return Err(ValidationError::EmptyBackoffTable);
        }
        if self.challenge_secret.is_empty() {
            return Err(ValidationError::EmptyChallengeSecret);
        }
        if self.service_token_secret.is_empty() {
            return Err(ValidationError::EmptyServiceTokenSecret);
        }
        if self.fail_open_headroom_percent == 0 {
            return Err(ValidationError::InvalidHeadroomPercent);
        }
        Ok(())
    }

    pub fn reserve_ttl(&self) -> Duration {
        Duration::from_secs(self.reserve_ttl_seconds)
    }

    pub fn escalation_window(&self) -> Duration {
        Duration::from_millis(self.escalation_window_ms)
    }

    pub fn fail_open_max_duration(&self) -> Duration {
        Duration::from_millis(self.fail_open_max_duration_ms)
    }

    pub fn reconciliation_poll_interval(&self) -> Duration {
        Duration::from_millis(self.reconciliation_poll_interval_ms)
    }

    pub fn challenge_ttl(&self) -> Duration {
        Duration::from_secs(self.challenge_ttl_seconds)
    }

    pub fn replay_window(&self) -> Duration {
        Duration::from_secs(self.replay_window_seconds)
    }

    /// Backoff duration for the given 1-indexed attempt number, saturating
    /// at the table's last entry.
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let idx = (attempt.saturating_sub(1) as usize).min(self.dlq_backoff_ms.len() - 1);
        Duration::from_millis(self.dlq_backoff_ms[idx])
    }
}
