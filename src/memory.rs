//! In-memory event log.
//!
//! [`LogIndex`] holds the per-stream and per-tag views of the log and is
//! shared with the file-backed log, which rebuilds it from its journal.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;

use crate::error::LogError;
use crate::event::{PersistedEvent, ProposedEvent, StreamId, TaggedEvent};
use crate::log::{EventLog, SnapshotRecord};

/// Per-stream and per-tag views over persisted events.
#[derive(Debug, Default)]
pub(crate) struct LogIndex {
    streams: HashMap<StreamId, Vec<PersistedEvent>>,
    tags: HashMap<String, Vec<PersistedEvent>>,
}

impl LogIndex {
    pub(crate) fn head(&self, stream: &StreamId) -> u64 {
        self.streams
            .get(stream)
            .and_then(|events| events.last())
            .map_or(0, |e| e.sequence)
    }

    /// Assign sequences to `events`, enforcing the expected head.
    pub(crate) fn prepare_append(
        &self,
        stream: &StreamId,
        expected_sequence: u64,
        events: Vec<ProposedEvent>,
    ) -> Result<Vec<PersistedEvent>, LogError> {
        let actual = self.head(stream);
        if actual != expected_sequence {
            return Err(LogError::Conflict {
                expected: expected_sequence,
                actual,
            });
        }
        Ok(events
            .into_iter()
            .zip(expected_sequence + 1..)
            .map(|(proposed, sequence)| {
                PersistedEvent::from_proposed(stream.clone(), sequence, proposed)
            })
            .collect())
    }

    /// Insert already-sequenced events, fanning them out to their tags.
    pub(crate) fn insert(&mut self, events: Vec<PersistedEvent>) {
        for event in events {
            for tag in &event.tags {
                self.tags.entry(tag.clone()).or_default().push(event.clone());
            }
            self.streams
                .entry(event.stream.clone())
                .or_default()
                .push(event);
        }
    }

    pub(crate) fn read_from(&self, stream: &StreamId, after_sequence: u64) -> Vec<PersistedEvent> {
        self.streams
            .get(stream)
            .map(|events| {
                events
                    .iter()
                    .filter(|e| e.sequence > after_sequence)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub(crate) fn read_tag(&self, tag: &str, after_offset: u64, max: usize) -> Vec<TaggedEvent> {
        let Some(events) = self.tags.get(tag) else {
            return Vec::new();
        };
        events
            .iter()
            .zip(1u64..)
            .skip(after_offset as usize)
            .take(max)
            .map(|(event, offset)| TaggedEvent {
                tag: tag.to_owned(),
                offset,
                event: event.clone(),
            })
            .collect()
    }
}

/// Counters of operations that should fail, consumed one per call.
#[derive(Debug, Default)]
struct Faults {
    appends: u32,
    reads: u32,
}

impl Faults {
    fn take(counter: &mut u32) -> bool {
        if *counter > 0 {
            *counter -= 1;
            true
        } else {
            false
        }
    }
}

#[derive(Debug, Default)]
struct MemoryInner {
    index: RwLock<LogIndex>,
    snapshots: RwLock<HashMap<StreamId, Vec<SnapshotRecord>>>,
    faults: Mutex<Faults>,
}

/// An [`EventLog`] held entirely in memory.
///
/// `Clone` is cheap and clones share the same log, so one instance can back
/// every node of an in-process cluster and outlive any of them. Supports
/// fault injection for exercising restart and recovery paths.
#[derive(Debug, Clone, Default)]
pub struct MemoryEventLog {
    inner: Arc<MemoryInner>,
}

impl MemoryEventLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` appends fail with [`LogError::Unavailable`].
    pub fn fail_next_appends(&self, n: u32) {
        self.inner.faults.lock().expect("faults mutex poisoned").appends = n;
    }

    /// Make the next `n` stream reads fail with [`LogError::Unavailable`].
    pub fn fail_next_reads(&self, n: u32) {
        self.inner.faults.lock().expect("faults mutex poisoned").reads = n;
    }

    /// All events of `stream`, for inspection.
    pub fn events(&self, stream: &StreamId) -> Vec<PersistedEvent> {
        self.inner
            .index
            .read()
            .expect("index lock poisoned")
            .read_from(stream, 0)
    }

    /// All retained snapshots of `stream`, oldest first.
    pub fn snapshots(&self, stream: &StreamId) -> Vec<SnapshotRecord> {
        self.inner
            .snapshots
            .read()
            .expect("snapshot lock poisoned")
            .get(stream)
            .cloned()
            .unwrap_or_default()
    }

    fn injected(&self, pick: impl FnOnce(&mut Faults) -> &mut u32) -> Result<(), LogError> {
        let mut faults = self.inner.faults.lock().expect("faults mutex poisoned");
        if Faults::take(pick(&mut faults)) {
            return Err(LogError::Unavailable("injected fault".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl EventLog for MemoryEventLog {
    async fn append(
        &self,
        stream: &StreamId,
        expected_sequence: u64,
        events: Vec<ProposedEvent>,
    ) -> Result<u64, LogError> {
        self.injected(|f| &mut f.appends)?;
        let mut index = self.inner.index.write().expect("index lock poisoned");
        let stamped = index.prepare_append(stream, expected_sequence, events)?;
        index.insert(stamped);
        Ok(index.head(stream))
    }

    async fn read_from(
        &self,
        stream: &StreamId,
        after_sequence: u64,
    ) -> Result<Vec<PersistedEvent>, LogError> {
        self.injected(|f| &mut f.reads)?;
        let index = self.inner.index.read().expect("index lock poisoned");
        Ok(index.read_from(stream, after_sequence))
    }

    async fn head(&self, stream: &StreamId) -> Result<u64, LogError> {
        Ok(self.inner.index.read().expect("index lock poisoned").head(stream))
    }

    async fn write_snapshot(
        &self,
        stream: &StreamId,
        snapshot: SnapshotRecord,
    ) -> Result<(), LogError> {
        let mut snapshots = self.inner.snapshots.write().expect("snapshot lock poisoned");
        let records = snapshots.entry(stream.clone()).or_default();
        records.retain(|r| r.sequence != snapshot.sequence);
        records.push(snapshot);
        records.sort_by_key(|r| r.sequence);
        Ok(())
    }

    async fn read_latest_snapshot(
        &self,
        stream: &StreamId,
    ) -> Result<Option<SnapshotRecord>, LogError> {
        Ok(self
            .inner
            .snapshots
            .read()
            .expect("snapshot lock poisoned")
            .get(stream)
            .and_then(|records| records.last().cloned()))
    }

    async fn prune_snapshots(&self, stream: &StreamId, keep: usize) -> Result<usize, LogError> {
        let mut snapshots = self.inner.snapshots.write().expect("snapshot lock poisoned");
        let Some(records) = snapshots.get_mut(stream) else {
            return Ok(0);
        };
        let excess = records.len().saturating_sub(keep);
        records.drain(..excess);
        Ok(excess)
    }

    async fn read_tag(
        &self,
        tag: &str,
        after_offset: u64,
        max: usize,
    ) -> Result<Vec<TaggedEvent>, LogError> {
        let index = self.inner.index.read().expect("index lock poisoned");
        Ok(index.read_tag(tag, after_offset, max))
    }
}
