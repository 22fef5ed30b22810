//! Snapshots of entity state and their on-disk persistence.
//!
//! A snapshot file lives at `<base_dir>/snapshots/<stream uuid>/<sequence>.json`.
//! Identities are opaque strings, so they never become path components.
//! Writes are atomic via a temp-rename pattern so a crash mid-write never
//! leaves a half-written snapshot behind.

use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::aggregate::Aggregate;
use crate::event::{StreamId, now_millis};
use crate::log::SnapshotRecord;

/// A point-in-time capture of an entity's state.
///
/// Folding the events after `sequence` onto `state` yields the same state
/// as replaying the full history from `A::default()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound(serialize = "A: Serialize", deserialize = "A: DeserializeOwned"))]
pub struct Snapshot<A> {
    /// The state after the event at `sequence` was applied.
    pub state: A,
    /// Sequence of the last event folded into `state`.
    pub sequence: u64,
}

impl<A: Aggregate> Snapshot<A> {
    /// Serialize into a storable record stamped with the current time.
    pub fn to_record(&self) -> serde_json::Result<SnapshotRecord> {
        Ok(SnapshotRecord {
            sequence: self.sequence,
            payload: serde_json::to_value(&self.state)?,
            taken_at: now_millis(),
        })
    }

    /// Decode a stored record back into typed state.
    pub fn from_record(record: &SnapshotRecord) -> serde_json::Result<Self> {
        Ok(Self {
            state: serde_json::from_value(record.payload.clone())?,
            sequence: record.sequence,
        })
    }
}

/// When snapshots are taken and how many are retained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotPolicy {
    /// Take a snapshot each time the sequence crosses a multiple of this
    /// value. `0` disables snapshotting.
    pub every: u64,
    /// Number of most recent snapshots to keep per identity.
    pub keep: usize,
}

impl Default for SnapshotPolicy {
    fn default() -> Self {
        Self {
            every: 100,
            keep: 3,
        }
    }
}

impl SnapshotPolicy {
    /// A policy that never snapshots.
    pub fn disabled() -> Self {
        Self { every: 0, keep: 0 }
    }

    /// Whether an append that moved the head from `previous` to `current`
    /// crossed a snapshot boundary.
    ///
    /// A single command may append several events, so the check is for
    /// crossing a multiple rather than landing on one.
    pub fn is_due(&self, previous: u64, current: u64) -> bool {
        self.every != 0 && current / self.every > previous / self.every
    }
}

pub(crate) fn snapshot_dir(base_dir: &Path, stream: &StreamId) -> PathBuf {
    base_dir
        .join("snapshots")
        .join(stream.uuid().to_string())
}

/// Path of the snapshot file for `stream` at `sequence`.
pub fn snapshot_path(base_dir: &Path, stream: &StreamId, sequence: u64) -> PathBuf {
    snapshot_dir(base_dir, stream).join(format!("{sequence}.json"))
}

/// Sequences of all snapshot files for `stream`, ascending.
fn stored_sequences(base_dir: &Path, stream: &StreamId) -> io::Result<Vec<u64>> {
    let entries = match std::fs::read_dir(snapshot_dir(base_dir, stream)) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut sequences: Vec<u64> = entries
        .filter_map(|entry| {
            let name = entry.ok()?.file_name();
            name.to_str()?.strip_suffix(".json")?.parse().ok()
        })
        .collect();
    sequences.sort_unstable();
    Ok(sequences)
}

/// Save a snapshot record atomically.
///
/// # Errors
///
/// Returns `io::Error` if directory creation, writing, or renaming fails.
pub fn save_snapshot(base_dir: &Path, stream: &StreamId, record: &SnapshotRecord) -> io::Result<()> {
    let dir = snapshot_dir(base_dir, stream);
    std::fs::create_dir_all(&dir)?;

    let path = snapshot_path(base_dir, stream, record.sequence);
    let tmp_path = path.with_extension("json.tmp");
    let json = serde_json::to_vec_pretty(record)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    std::fs::write(&tmp_path, &json)?;
    std::fs::rename(&tmp_path, &path)?;
    Ok(())
}

/// Load the newest readable snapshot of `stream`.
///
/// A file that fails to deserialize is logged and skipped in favour of the
/// next older one; with none left the result is `Ok(None)` and recovery
/// replays from the start.
///
/// # Errors
///
/// Returns `io::Error` only for unexpected I/O failures.
pub fn load_latest_snapshot(base_dir: &Path, stream: &StreamId) -> io::Result<Option<SnapshotRecord>> {
    for sequence in stored_sequences(base_dir, stream)?.into_iter().rev() {
        let path = snapshot_path(base_dir, stream, sequence);
        let bytes = match std::fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };
        match serde_json::from_slice::<SnapshotRecord>(&bytes) {
            Ok(record) => return Ok(Some(record)),
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to deserialize snapshot; treating as cache miss"
                );
            }
        }
    }
    Ok(None)
}

/// Delete all but the `keep` newest snapshot files of `stream`.
///
/// # Errors
///
/// Returns `io::Error` if listing or removing files fails.
pub fn prune_snapshots(base_dir: &Path, stream: &StreamId, keep: usize) -> io::Result<usize> {
    let sequences = stored_sequences(base_dir, stream)?;
    let excess = sequences.len().saturating_sub(keep);
    for sequence in &sequences[..excess] {
        match std::fs::remove_file(snapshot_path(base_dir, stream, *sequence)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }
    Ok(excess)
}
