//! The append-only WAL writer.
//!
//! Mirrors the "single in-flight writer, durable before returning" discipline
//! used elsewhere in this codebase for persisted state (see
//! `PaymentsManager::new_payment`'s check-persist-commit sequence): exactly
//! one [`WalWriter`] should exist per `wal_dir` in a process, and its
//! [`WalWriter::append`] method serializes appends behind an internal mutex.

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::WalWriteError;
use crate::ids::{BillingEntryId, CorrelationId};
use crate::wal::envelope::{EventType, WalEnvelope};

/// Segment filenames are zero-padded decimal tokens so that lexicographic
/// and creation order coincide, e.g. `billing-wal-0000000001.jsonl`.
fn segment_filename(index: u64) -> String {
    format!("billing-wal-{index:010}.jsonl")
}

struct WriterState {
    file: std::fs::File,
    segment_index: u64,
    segment_bytes: u64,
}

/// Appends checksummed, sequence-numbered records to a rotating set of WAL
/// segment files under `wal_dir`.
pub struct WalWriter {
    wal_dir: PathBuf,
    segment_max_bytes: u64,
    next_sequence: AtomicU64,
    state: Mutex<WriterState>,
}

impl WalWriter {
    /// Open (creating if necessary) the WAL directory and start a fresh
    /// segment. `starting_sequence` should be one past the highest sequence
    /// number observed during the preceding replay.
    pub fn open(
        wal_dir: impl Into<PathBuf>,
        segment_max_bytes: u64,
        starting_sequence: u64,
    ) -> std::io::Result<Self> {
        let wal_dir = wal_dir.into();
        std::fs::create_dir_all(&wal_dir)?;
        let segment_index = next_segment_index(&wal_dir)?;
        let path = wal_dir.join(segment_filename(segment_index));
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        let segment_bytes = file.metadata()?.len();
        info!(path = %path.display(), "opened WAL segment for writing");
        Ok(Self {
            wal_dir,
            segment_max_bytes,
            next_sequence: AtomicU64::new(starting_sequence),
            state: Mutex::new(WriterState {
                file,
                segment_index,
                segment_bytes,
            }),
        })
    }

    /// Append a new record of `event_type` for `entry_id`, assigning it the
    /// next sequence number. Durable (fsync'd) before returning.
    pub async fn append(
        &self,
        event_type: EventType,
        timestamp_ms: i64,
        entry_id: BillingEntryId,
        correlation_id: CorrelationId,
        payload: serde_json::Value,
    ) -> Result<u64, WalWriteError> {
        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        let envelope = WalEnvelope::new(
            event_type,
            timestamp_ms,
            entry_id,
            correlation_id,
            sequence,
            payload,
        );
        let mut line = serde_json::to_string(&envelope)
            .map_err(WalWriteError::Serialize)?;
        line.push('\n');

        let mut state = self.state.lock().await;
        if state.segment_bytes + line.len() as u64 > self.segment_max_bytes
            && state.segment_bytes > 0
        {
            self.rotate(&mut state)?;
        }
        state.file.write_all(line.as_bytes()).map_err(WalWriteError::Io)?;
        state.file.sync_data().map_err(WalWriteError::Fsync)?;
        state.segment_bytes += line.len() as u64;

        debug!(sequence, event = %envelope.event_type.as_str(), "appended WAL record");
        Ok(sequence)
    }

    /// Bump the next-assigned sequence number up to `at_least` if it isn't
    /// already there. Called once, after replay, so that live appends never
    /// reissue a sequence number a prior run already durably wrote.
    pub fn fast_forward_sequence(&self, at_least: u64) {
        self.next_sequence.fetch_max(at_least, Ordering::SeqCst);
    }

    fn rotate(&self, state: &mut WriterState) -> Result<(), WalWriteError> {
        let new_index = state.segment_index + 1;
        let path = self.wal_dir.join(segment_filename(new_index));
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(WalWriteError::Io)?;
        info!(path = %path.display(), "rotated to new WAL segment");
        state.file = file;
        state.segment_index = new_index;
        state.segment_bytes = 0;
        Ok(())
    }
}

/// Find the index one past the highest-numbered existing segment, so a fresh
/// writer continues the lexicographic ordering rather than colliding with
/// segments left by a prior run.
fn next_segment_index(wal_dir: &Path) -> std::io::Result<u64> {
    let mut max_index = None;
    if wal_dir.exists() {
        for entry in std::fs::read_dir(wal_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(index) = parse_segment_index(&name) {
                max_index = Some(max_index.map_or(index, |m: u64| m.max(index)));
            }
        }
    }
    Ok(match max_index {
        Some(i) => i + 1,
        None => 0,
    })
}

fn parse_segment_index(filename: &str) -> Option<u64> {
    let stripped = filename
        .strip_prefix("billing-wal-")?
        .strip_suffix(".jsonl")?;
    stripped.parse().ok()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn segment_filenames_sort_lexicographically_in_creation_order() {
        let a = segment_filename(1);
        let b = segment_filename(2);
        let c = segment_filename(10);
        let mut names = vec![c.clone(), a.clone(), b.clone()];
        names.sort();
        assert_eq!(names, vec![a, b, c]);
    }

    #[tokio::test]
    async fn append_assigns_increasing_sequence_numbers() {
        let dir = tempfile::tempdir().unwrap();
        let writer = WalWriter::open(dir.path(), 1 << 20, 0).unwrap();
        let entry_id = BillingEntryId::from_raw("01ABCDEFGHJKMNPQRSTVWXYZ0");
        let corr = CorrelationId::new("corr-1");
        let seq1 = writer
            .append(
                EventType::BillingReserve,
                0,
                entry_id.clone(),
                corr.clone(),
                serde_json::json!({}),
            )
            .await
            .unwrap();
        let seq2 = writer
            .append(EventType::BillingCommit, 0, entry_id, corr, serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(seq1 + 1, seq2);
    }

    #[tokio::test]
    async fn fast_forward_sequence_never_reissues_a_prior_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let writer = WalWriter::open(dir.path(), 1 << 20, 0).unwrap();
        let entry_id = BillingEntryId::from_raw("01ABCDEFGHJKMNPQRSTVWXYZ0");
        let corr = CorrelationId::new("corr-1");
        writer
            .append(EventType::BillingReserve, 0, entry_id, corr, serde_json::json!({}))
            .await
            .unwrap();

        writer.fast_forward_sequence(100);
        let reopened = WalWriter::open(dir.path(), 1 << 20, 0).unwrap();
        reopened.fast_forward_sequence(100);
        let entry_id2 = BillingEntryId::from_raw("01ABCDEFGHJKMNPQRSTVWXYZ1");
        let corr2 = CorrelationId::new("corr-2");
        let seq = reopened
            .append(EventType::BillingReserve, 0, entry_id2, corr2, serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(seq, 100);
    }

    #[tokio::test]
    async fn append_rotates_at_segment_ceiling() {
        let dir = tempfile::tempdir().unwrap();
        // Tiny ceiling forces rotation on the second append.
        let writer = WalWriter::open(dir.path(), 10, 0).unwrap();
        let entry_id = BillingEntryId::from_raw("01ABCDEFGHJKMNPQRSTVWXYZ0");
        let corr = CorrelationId::new("corr-1");
        for _ in 0..3 {
            writer
                .append(
                    EventType::BillingReserve,
                    0,
                    entry_id.clone(),
                    corr.clone(),
                    serde_json::json!({}),
                )
                .await
                .unwrap();
        }
        let mut segments: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        segments.sort();
        assert!(segments.len() > 1, "expected rotation to produce multiple segments");
    }
}
