//! The event log boundary.
//!
//! The log is the only durable, cross-process shared resource. The runtime
//! treats it as append-only: events and snapshots are written once and
//! never modified. Two backends ship with the crate:
//! [`MemoryEventLog`](crate::MemoryEventLog) and
//! [`FileEventLog`](crate::FileEventLog).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::LogError;
use crate::event::{PersistedEvent, ProposedEvent, StreamId, TaggedEvent};

/// A stored snapshot: serialized state at a given sequence number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    /// Sequence of the last event folded into `payload`.
    pub sequence: u64,
    /// Serialized aggregate state.
    pub payload: Value,
    /// When the snapshot was taken (Unix epoch milliseconds).
    pub taken_at: u64,
}

/// Append-only, per-stream ordered event storage with snapshot records and
/// per-tag feeds.
///
/// Implementations must be safe to share across tasks. Every method is a
/// single logical operation: an append either commits all of its events or
/// none of them.
#[async_trait]
pub trait EventLog: Send + Sync + 'static {
    /// Append `events` to `stream` if its head is exactly `expected_sequence`.
    ///
    /// The events receive sequences `expected_sequence + 1 ..`. Returns the
    /// new head (the sequence of the last appended event).
    ///
    /// # Errors
    ///
    /// [`LogError::Conflict`] if the head has moved, which means another
    /// writer exists for this identity. Any other error must leave the
    /// stream unchanged: the runtime recovers and decides the same command
    /// again, so an error for an append that did commit would make that
    /// command take effect twice or be rejected against its own events.
    async fn append(
        &self,
        stream: &StreamId,
        expected_sequence: u64,
        events: Vec<ProposedEvent>,
    ) -> Result<u64, LogError>;

    /// Read all events of `stream` with sequence greater than
    /// `after_sequence`, in ascending order.
    async fn read_from(
        &self,
        stream: &StreamId,
        after_sequence: u64,
    ) -> Result<Vec<PersistedEvent>, LogError>;

    /// Current head of `stream` (0 if it has no events).
    async fn head(&self, stream: &StreamId) -> Result<u64, LogError>;

    /// Durably store a snapshot for `stream`.
    async fn write_snapshot(
        &self,
        stream: &StreamId,
        snapshot: SnapshotRecord,
    ) -> Result<(), LogError>;

    /// The snapshot with the highest sequence for `stream`, if any.
    async fn read_latest_snapshot(
        &self,
        stream: &StreamId,
    ) -> Result<Option<SnapshotRecord>, LogError>;

    /// Delete all but the `keep` most recent snapshots of `stream`.
    ///
    /// Returns how many snapshots were removed.
    async fn prune_snapshots(&self, stream: &StreamId, keep: usize) -> Result<usize, LogError>;

    /// Read up to `max` events of `tag` with offset greater than
    /// `after_offset`, in persistence order.
    async fn read_tag(
        &self,
        tag: &str,
        after_offset: u64,
        max: usize,
    ) -> Result<Vec<TaggedEvent>, LogError>;
}
