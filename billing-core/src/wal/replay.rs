//! Deterministic WAL replay.
//!
//! Runs once at startup, before the service accepts traffic, to reconstruct
//! the derived in-memory billing state from the append-only log. Replay must
//! be idempotent: running it twice over the same segments from scratch
//! produces identical derived state.

use std::io::{BufRead, BufReader, Write as _};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::wal::envelope::WalEnvelope;

const CURSOR_FILENAME: &str = "replay-cursor";

/// Anything that can apply a recognized WAL record to its own derived state.
/// Implemented by [`crate::state_machine::manager::BillingManager`]; kept as
/// a trait so replay can be unit tested against a trivial recorder.
pub trait Reducer {
    /// Apply one recognized, checksum-valid record. Must be a pure function
    /// of `envelope` plus the reducer's current state: replaying the same
    /// envelope twice from the same starting state must be a no-op the
    /// second time (entries are looked up and transitioned idempotently by
    /// the state machine, which rejects an already-applied transition as a
    /// no-op rather than an error during replay).
    fn apply(&mut self, envelope: &WalEnvelope);
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct ReplayOutcome {
    pub entries_processed: u64,
    pub entries_skipped: u64,
    pub entries_corrupted: u64,
    pub last_sequence: u64,
}

/// Replay every segment in `wal_dir` into `reducer`, skipping records at or
/// below the persisted cursor, then atomically persist the new cursor.
pub fn replay(
    wal_dir: &Path,
    reducer: &mut dyn Reducer,
) -> std::io::Result<ReplayOutcome> {
    let cursor = read_cursor(wal_dir)?;
    let mut outcome = ReplayOutcome {
        last_sequence: cursor.unwrap_or(0),
        ..Default::default()
    };

    let segments = list_segments(wal_dir)?;
    let last_segment_index = segments.len().checked_sub(1);

    for (i, segment_path) in segments.iter().enumerate() {
        let is_last_segment = last_segment_index == Some(i);
        replay_segment(segment_path, is_last_segment, cursor, reducer, &mut outcome)?;
    }

    write_cursor(wal_dir, outcome.last_sequence)?;
    Ok(outcome)
}

fn replay_segment(
    path: &Path,
    is_last_segment: bool,
    cursor: Option<u64>,
    reducer: &mut dyn Reducer,
    outcome: &mut ReplayOutcome,
) -> std::io::Result<()> {
    let file = std::fs::File::open(path)?;
    let reader = BufReader::new(file);
    let lines: Vec<String> = reader
        .lines()
        .collect::<Result<_, _>>()
        .unwrap_or_default();

    for (line_idx, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let is_last_line = is_last_segment && line_idx == lines.len() - 1;

        let envelope: WalEnvelope = match serde_json::from_str(line) {
            Ok(e) => e,
            Err(e) => {
                if is_last_line {
                    warn!(path = %path.display(), error = %e, "truncating torn last WAL record");
                    truncate_last_line(path, lines[..line_idx].len())?;
                    break;
                } else {
                    warn!(path = %path.display(), error = %e, "skipping corrupted WAL record");
                    outcome.entries_corrupted += 1;
                    continue;
                }
            }
        };

        if envelope.schema_version > crate::wal::envelope::CURRENT_SCHEMA_VERSION {
            warn!(version = envelope.schema_version, "skipping future-schema WAL record");
            outcome.entries_skipped += 1;
            continue;
        }

        if !envelope.checksum_valid() {
            warn!(sequence = ?envelope.wal_sequence, "checksum mismatch, skipping record");
            outcome.entries_corrupted += 1;
            continue;
        }

        if let Some(seq) = envelope.wal_sequence {
            if let Some(cursor) = cursor {
                if seq <= cursor {
                    continue;
                }
            }
            outcome.last_sequence = outcome.last_sequence.max(seq);
        }

        if envelope.event_type.as_str().is_empty() {
            // unreachable in practice; defensive against a malformed record
            outcome.entries_skipped += 1;
            continue;
        }

        use common::error::ForwardCompatible;
        if envelope.event_type.is_unknown() {
            debug!(event = envelope.event_type.as_str(), "skipping unrecognized event type");
            outcome.entries_skipped += 1;
            continue;
        }

        reducer.apply(&envelope);
        outcome.entries_processed += 1;
    }

    Ok(())
}

/// Truncate `path` to its first `keep_lines` lines, dropping a torn trailing
/// record without disturbing anything that parsed successfully.
fn truncate_last_line(path: &Path, keep_lines: usize) -> std::io::Result<()> {
    let contents = std::fs::read_to_string(path)?;
    let kept: String = contents
        .lines()
        .take(keep_lines)
        .map(|l| format!("{l}\n"))
        .collect();
    let mut file = std::fs::OpenOptions::new().write(true).truncate(true).open(path)?;
    file.write_all(kept.as_bytes())?;
    file.sync_data()?;
    Ok(())
}

fn list_segments(wal_dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    if !wal_dir.exists() {
        return Ok(Vec::new());
    }
    let mut segments: Vec<PathBuf> = std::fs::read_dir(wal_dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("billing-wal-") && n.ends_with(".jsonl"))
        })
        .collect();
    segments.sort();
    Ok(segments)
}

fn read_cursor(wal_dir: &Path) -> std::io::Result<Option<u64>> {
    let path = wal_dir.join(CURSOR_FILENAME);
    match std::fs::read_to_string(&path) {
        Ok(s) => Ok(s.trim().parse().ok()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

fn write_cursor(wal_dir: &Path, sequence: u64) -> std::io::Result<()> {
    std::fs::create_dir_all(wal_dir)?;
    let path = wal_dir.join(CURSOR_FILENAME);
    let tmp_path = wal_dir.join(format!("{CURSOR_FILENAME}.tmp"));
    std::fs::write(&tmp_path, sequence.to_string())?;
    std::fs::rename(&tmp_path, &path)?;
    Ok(())
}
