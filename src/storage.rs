//! File-backed event log.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;

use crate::error::LogError;
use crate::event::{PersistedEvent, ProposedEvent, StreamId, TaggedEvent};
use crate::log::{EventLog, SnapshotRecord};
use crate::memory::LogIndex;
use crate::snapshot;

/// Manages the on-disk directory layout of a node's data directory.
///
/// ```text
/// <base_dir>/
///     journal/
///         events.jsonl            -- one JSON array line per append
///     snapshots/
///         <stream uuid>/          -- StreamId::uuid, never the raw id
///             <sequence>.json
///     projections/
///         <projection_name>/
///             <tag>/
///                 checkpoint.json
/// ```
///
/// `StreamLayout` is cheap to clone (it wraps a single `PathBuf`).
#[derive(Debug, Clone)]
pub struct StreamLayout {
    base_dir: PathBuf,
}

impl StreamLayout {
    /// Create a layout rooted at `base_dir`. The directory is created
    /// lazily.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Returns the root directory of this layout.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// `<base_dir>/journal/events.jsonl`
    pub fn journal_path(&self) -> PathBuf {
        self.base_dir.join("journal").join("events.jsonl")
    }

    /// `<base_dir>/projections`
    pub fn projections_dir(&self) -> PathBuf {
        self.base_dir.join("projections")
    }

    /// `<base_dir>/projections/<projection>/<tag>`, the directory holding
    /// that tag's `checkpoint.json`.
    pub fn checkpoint_dir(&self, projection: &str, tag: &str) -> PathBuf {
        self.projections_dir().join(projection).join(tag)
    }
}

struct FileInner {
    layout: StreamLayout,
    index: RwLock<LogIndex>,
    journal: Mutex<Journal>,
}

/// The open journal file plus whether a failed append could not be
/// rolled back.
struct Journal {
    file: File,
    broken: bool,
}

impl Journal {
    /// Write one append line durably, or leave the file exactly as it was.
    fn append_line(&mut self, line: &[u8]) -> Result<(), LogError> {
        if self.broken {
            return Err(LogError::Unavailable(
                "journal has an unrecoverable torn tail; reopen the log".into(),
            ));
        }
        let len = self.file.metadata()?.len();
        let written = self
            .file
            .write_all(line)
            .and_then(|()| self.file.sync_data());
        if let Err(e) = written {
            if let Err(rollback) = self.file.set_len(len).and_then(|()| self.file.sync_data()) {
                tracing::error!(
                    error = %rollback,
                    "failed to roll back a partial journal write"
                );
                self.broken = true;
            }
            return Err(e.into());
        }
        Ok(())
    }
}

/// An [`EventLog`] persisted to a single append-only JSONL journal plus
/// snapshot files.
///
/// Each journal line holds the events of one append as a JSON array, so a
/// batch is either whole on disk or not at all. The per-stream and per-tag
/// indexes are rebuilt from the journal on [`open`](FileEventLog::open). A
/// journal belongs to one process at a time.
#[derive(Clone)]
pub struct FileEventLog {
    inner: Arc<FileInner>,
}

impl std::fmt::Debug for FileEventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileEventLog")
            .field("base_dir", &self.inner.layout.base_dir())
            .finish_non_exhaustive()
    }
}

impl FileEventLog {
    /// Open (or create) the log under `base_dir`.
    ///
    /// A final journal line without its newline, left by a crash
    /// mid-append, was never acknowledged; it is cut off before the
    /// journal is reopened for writing.
    ///
    /// # Errors
    ///
    /// [`LogError::Io`] if the journal cannot be opened or truncated,
    /// [`LogError::Codec`] if a complete line is not a valid batch.
    pub fn open(base_dir: impl Into<PathBuf>) -> Result<Self, LogError> {
        let layout = StreamLayout::new(base_dir);
        let journal_path = layout.journal_path();
        if let Some(dir) = journal_path.parent() {
            fs::create_dir_all(dir)?;
        }

        let mut index = LogIndex::default();
        let mut recovered = 0usize;
        if journal_path.exists() {
            let mut reader = BufReader::new(File::open(&journal_path)?);
            let mut good_len = 0u64;
            let mut line = Vec::new();
            loop {
                line.clear();
                let read = reader.read_until(b'\n', &mut line)?;
                if read == 0 {
                    break;
                }
                let Some(body) = line.strip_suffix(b"\n") else {
                    tracing::warn!(
                        path = %journal_path.display(),
                        offset = good_len,
                        bytes = read,
                        "cutting torn journal tail"
                    );
                    break;
                };
                if !body.is_empty() {
                    let batch: Vec<PersistedEvent> = serde_json::from_slice(body)?;
                    recovered += batch.len();
                    index.insert(batch);
                }
                good_len += read as u64;
            }
            drop(reader);

            let file = OpenOptions::new().write(true).open(&journal_path)?;
            if file.metadata()?.len() > good_len {
                file.set_len(good_len)?;
                file.sync_data()?;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&journal_path)?;
        tracing::debug!(
            path = %journal_path.display(),
            events = recovered,
            "opened event journal"
        );

        Ok(Self {
            inner: Arc::new(FileInner {
                layout,
                index: RwLock::new(index),
                journal: Mutex::new(Journal {
                    file,
                    broken: false,
                }),
            }),
        })
    }

    /// The directory layout this log writes into.
    pub fn layout(&self) -> &StreamLayout {
        &self.inner.layout
    }
}

#[async_trait]
impl EventLog for FileEventLog {
    async fn append(
        &self,
        stream: &StreamId,
        expected_sequence: u64,
        events: Vec<ProposedEvent>,
    ) -> Result<u64, LogError> {
        let mut index = self.inner.index.write().expect("index lock poisoned");
        let stamped = index.prepare_append(stream, expected_sequence, events)?;

        let mut line = serde_json::to_vec(&stamped)?;
        line.push(b'\n');
        self.inner
            .journal
            .lock()
            .expect("journal mutex poisoned")
            .append_line(&line)?;

        index.insert(stamped);
        Ok(index.head(stream))
    }

    async fn read_from(
        &self,
        stream: &StreamId,
        after_sequence: u64,
    ) -> Result<Vec<PersistedEvent>, LogError> {
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
        snapshot::save_snapshot(self.inner.layout.base_dir(), stream, &snapshot)?;
        Ok(())
    }

    async fn read_latest_snapshot(
        &self,
        stream: &StreamId,
    ) -> Result<Option<SnapshotRecord>, LogError> {
        Ok(snapshot::load_latest_snapshot(
            self.inner.layout.base_dir(),
            stream,
        )?)
    }

    async fn prune_snapshots(&self, stream: &StreamId, keep: usize) -> Result<usize, LogError> {
        Ok(snapshot::prune_snapshots(
            self.inner.layout.base_dir(),
            stream,
            keep,
        )?)
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
