//! Per-tag projections (read models) fed from the event log.
//!
//! Every persisted event carries the tag its identity hashes to. A
//! projection consumes one tag's feed in persistence order, tracking the
//! last processed offset in a checkpoint file so it can resume after a
//! restart. Delivery is at-least-once: after a crash the events between the
//! last saved checkpoint and the crash are delivered again.

use std::any::Any;
use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{LogError, ProjectionError};
use crate::event::{PersistedEvent, TaggedEvent};
use crate::log::EventLog;
use crate::membership::Role;
use crate::tagging::TagScheme;

/// A read model built from the events of one tag.
///
/// # Contract
///
/// - [`apply`](Projection::apply) must be deterministic.
/// - Unknown event types or aggregate types should be ignored for forward
///   compatibility. Filtering on `event.stream.aggregate_type` or
///   `event.event_type` is done in the method body.
pub trait Projection:
    Default + Clone + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Human-readable name, used as a directory name for checkpoints and as
    /// the workload name for placement.
    const NAME: &'static str;

    /// Apply a single event.
    fn apply(&mut self, event: &PersistedEvent);
}

/// Placement of a projection: which tags it consumes and which role a
/// member needs to run it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectionSettings {
    /// Role required to host this projection's tags, if any.
    pub role: Option<Role>,
    /// Tags to consume; one placement shard per tag.
    pub tags: TagScheme,
}

impl ProjectionSettings {
    /// Consume every tag of `tags`, on any member.
    pub fn new(tags: TagScheme) -> Self {
        Self { role: None, tags }
    }

    /// Restrict hosting to members carrying `role`.
    pub fn with_role(mut self, role: impl Into<Role>) -> Self {
        self.role = Some(role.into());
        self
    }
}

/// Tuning for tag feeds and the live projection loop.
#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// Wait between polls when a feed has no new events.
    ///
    /// Default: 100 milliseconds.
    pub poll_interval: Duration,
    /// Maximum events read per poll.
    ///
    /// Default: 256.
    pub batch_size: usize,
    /// How often the live loop flushes its checkpoint. Checkpoints are also
    /// saved on shutdown and after a feed error.
    ///
    /// Default: 5 seconds.
    pub checkpoint_interval: Duration,
    /// Base delay for exponential backoff after a feed error.
    ///
    /// Default: 1 second.
    pub reconnect_base_delay: Duration,
    /// Maximum delay between reconnection attempts.
    ///
    /// Default: 30 seconds.
    pub reconnect_max_delay: Duration,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            batch_size: 256,
            checkpoint_interval: Duration::from_secs(5),
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(30),
        }
    }
}

struct FeedState {
    log: Arc<dyn EventLog>,
    tag: String,
    after: u64,
    buffer: VecDeque<TaggedEvent>,
    poll_interval: Duration,
    batch_size: usize,
}

/// Lazy, infinite feed of `tag`'s events after `from_offset`.
///
/// Nothing is read until the stream is polled. When the tag has no new
/// events the feed waits `poll_interval` and polls again, so the stream
/// never ends on its own. A read failure is yielded as an `Err` item
/// without advancing; polling again retries from the same offset.
pub fn feed(
    log: Arc<dyn EventLog>,
    tag: impl Into<String>,
    from_offset: u64,
    config: &FeedConfig,
) -> impl Stream<Item = Result<TaggedEvent, LogError>> + Send + 'static {
    let state = FeedState {
        log,
        tag: tag.into(),
        after: from_offset,
        buffer: VecDeque::new(),
        poll_interval: config.poll_interval,
        batch_size: config.batch_size.max(1),
    };

    futures::stream::unfold(state, |mut st| async move {
        loop {
            if let Some(event) = st.buffer.pop_front() {
                st.after = event.offset;
                return Some((Ok(event), st));
            }
            match st.log.read_tag(&st.tag, st.after, st.batch_size).await {
                Ok(batch) if batch.is_empty() => tokio::time::sleep(st.poll_interval).await,
                Ok(batch) => st.buffer.extend(batch),
                Err(e) => return Some((Err(e), st)),
            }
        }
    })
}

/// Persisted state of a projection for one tag.
///
/// Serialized to JSON as `{ "state": <P>, "offset": <N> }`, where `offset`
/// is the last tag offset folded into `state` (0 = nothing processed).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ProjectionCheckpoint<P> {
    pub state: P,
    pub offset: u64,
}

impl<P: Default> Default for ProjectionCheckpoint<P> {
    fn default() -> Self {
        Self {
            state: P::default(),
            offset: 0,
        }
    }
}

/// Save a projection checkpoint atomically to `dir/checkpoint.json`.
///
/// # Errors
///
/// Returns `io::Error` if directory creation, file writing, or renaming fails.
pub(crate) fn save_checkpoint<P: Projection>(
    dir: &Path,
    checkpoint: &ProjectionCheckpoint<P>,
) -> io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join("checkpoint.json");
    let tmp_path = dir.join("checkpoint.json.tmp");
    let json = serde_json::to_string_pretty(checkpoint).map_err(io::Error::other)?;
    std::fs::write(&tmp_path, json)?;
    std::fs::rename(&tmp_path, &path)?;
    Ok(())
}

/// Load a projection checkpoint from `dir/checkpoint.json`.
///
/// Returns `Ok(None)` if the file does not exist or is corrupt; a corrupt
/// checkpoint makes the projection rebuild from offset 0.
///
/// # Errors
///
/// Returns `io::Error` for I/O failures other than file-not-found.
pub(crate) fn load_checkpoint<P: Projection>(
    dir: &Path,
) -> io::Result<Option<ProjectionCheckpoint<P>>> {
    let path = dir.join("checkpoint.json");
    match std::fs::read_to_string(&path) {
        Ok(content) => match serde_json::from_str(&content) {
            Ok(checkpoint) => Ok(Some(checkpoint)),
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "corrupt projection checkpoint, will rebuild"
                );
                Ok(None)
            }
        },
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Drives one projection over one tag: load checkpoint, catch up, save.
pub struct ProjectionRunner<P: Projection> {
    log: Arc<dyn EventLog>,
    tag: String,
    checkpoint: ProjectionCheckpoint<P>,
    checkpoint_dir: PathBuf,
    batch_size: usize,
}

impl<P: Projection> std::fmt::Debug for ProjectionRunner<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectionRunner")
            .field("projection", &P::NAME)
            .field("tag", &self.tag)
            .field("offset", &self.checkpoint.offset)
            .finish_non_exhaustive()
    }
}

impl<P: Projection> ProjectionRunner<P> {
    /// Create a runner for `tag`, resuming from the checkpoint in
    /// `checkpoint_dir` if one exists.
    ///
    /// # Errors
    ///
    /// Returns `io::Error` if reading an existing checkpoint fails (other
    /// than file-not-found).
    pub fn new(
        log: Arc<dyn EventLog>,
        tag: impl Into<String>,
        checkpoint_dir: impl Into<PathBuf>,
    ) -> io::Result<Self> {
        let checkpoint_dir = checkpoint_dir.into();
        let checkpoint = load_checkpoint::<P>(&checkpoint_dir)?.unwrap_or_default();
        Ok(Self {
            log,
            tag: tag.into(),
            checkpoint,
            checkpoint_dir,
            batch_size: FeedConfig::default().batch_size,
        })
    }

    /// Read at most `batch_size` events per log call during catch-up.
    ///
    /// Defaults to [`FeedConfig::default`]'s batch size.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// The tag this runner consumes.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Current projection state.
    pub fn state(&self) -> &P {
        &self.checkpoint.state
    }

    /// Last processed offset.
    pub fn offset(&self) -> u64 {
        self.checkpoint.offset
    }

    /// Apply `event` unless its offset was already processed.
    ///
    /// Returns whether the event was applied.
    pub fn apply(&mut self, event: &TaggedEvent) -> bool {
        if event.offset <= self.checkpoint.offset {
            return false;
        }
        self.checkpoint.state.apply(&event.event);
        self.checkpoint.offset = event.offset;
        tracing::debug!(
            projection = P::NAME,
            tag = %self.tag,
            offset = event.offset,
            event_type = %event.event.event_type,
            "event applied"
        );
        true
    }

    /// Persist the checkpoint.
    pub fn save(&self) -> io::Result<()> {
        save_checkpoint::<P>(&self.checkpoint_dir, &self.checkpoint)
    }

    /// Read and apply everything currently in the tag, then save.
    ///
    /// Returns how many events were applied.
    pub async fn catch_up(&mut self) -> Result<usize, ProjectionError> {
        let mut applied = 0;
        loop {
            let batch = self
                .log
                .read_tag(&self.tag, self.checkpoint.offset, self.batch_size)
                .await?;
            if batch.is_empty() {
                break;
            }
            for event in &batch {
                if self.apply(event) {
                    applied += 1;
                }
            }
        }
        self.save()?;
        tracing::debug!(
            projection = P::NAME,
            tag = %self.tag,
            offset = self.checkpoint.offset,
            applied,
            "caught up"
        );
        Ok(applied)
    }
}

// --- Type-erased trait for the live loop and node integration ---

/// Type-erased interface for projection runners.
pub(crate) trait ProjectionCatchUp: Send + Sync {
    fn name(&self) -> &'static str;

    fn tag(&self) -> &str;

    fn catch_up(&mut self)
    -> Pin<Box<dyn Future<Output = Result<usize, ProjectionError>> + Send + '_>>;

    fn apply_event(&mut self, event: &TaggedEvent) -> bool;

    fn offset(&self) -> u64;

    fn save(&self) -> io::Result<()>;

    /// Clone the current state into a box the caller downcasts to `P`.
    fn state_any(&self) -> Box<dyn Any + Send>;
}

impl<P: Projection> ProjectionCatchUp for ProjectionRunner<P> {
    fn name(&self) -> &'static str {
        P::NAME
    }

    fn tag(&self) -> &str {
        &self.tag
    }

    fn catch_up(
        &mut self,
    ) -> Pin<Box<dyn Future<Output = Result<usize, ProjectionError>> + Send + '_>> {
        Box::pin(ProjectionRunner::catch_up(self))
    }

    fn apply_event(&mut self, event: &TaggedEvent) -> bool {
        self.apply(event)
    }

    fn offset(&self) -> u64 {
        self.checkpoint.offset
    }

    fn save(&self) -> io::Result<()> {
        ProjectionRunner::save(self)
    }

    fn state_any(&self) -> Box<dyn Any + Send> {
        Box::new(self.checkpoint.state.clone())
    }
}


#[cfg(test)]
mod tests {
    use super::test_fixtures::EventCounter;
    use super::*;
    use crate::event::StreamId;
    use crate::memory::MemoryEventLog;
    use crate::memory::test_support::proposed;
    use tokio_stream::StreamExt;

    async fn append_tagged(log: &MemoryEventLog, id: &str, types: &[&str], tag: &str) {
        let stream = StreamId::new("counter", id);
        let head = log.head(&stream).await.unwrap();
        let events = types.iter().map(|t| proposed(t, &[tag])).collect();
        log.append(&stream, head, events).await.unwrap();
    }

    fn fast_feed() -> FeedConfig {
        FeedConfig {
            poll_interval: Duration::from_millis(5),
            batch_size: 2,
            ..FeedConfig::default()
        }
    }

    #[test]
    fn checkpoint_serializes_state_and_offset() {
        let checkpoint = ProjectionCheckpoint {
            state: EventCounter {
                count: 5,
                types: vec![],
            },
            offset: 42,
        };
        let json = serde_json::to_value(&checkpoint).expect("serialization should succeed");
        assert_eq!(json["state"]["count"], 5);
        assert_eq!(json["offset"], 42);
    }

    #[test]
    fn save_then_load_roundtrips() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let checkpoint = ProjectionCheckpoint {
            state: EventCounter {
                count: 7,
                types: vec!["A".into()],
            },
            offset: 99,
        };
        save_checkpoint(dir.path(), &checkpoint).expect("save should succeed");
        let loaded = load_checkpoint::<EventCounter>(dir.path())
            .expect("load should succeed")
            .expect("checkpoint should exist");
        assert_eq!(loaded.state, checkpoint.state);
        assert_eq!(loaded.offset, 99);
        assert!(!dir.path().join("checkpoint.json.tmp").exists());
    }

    #[test]
    fn corrupt_file_returns_none() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        std::fs::write(dir.path().join("checkpoint.json"), b"not json").unwrap();
        let loaded = load_checkpoint::<EventCounter>(dir.path()).expect("load should not error");
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn feed_is_lazy_and_ordered() {
        let log = MemoryEventLog::new();
        append_tagged(&log, "c-1", &["A", "B"], "t-0").await;
        append_tagged(&log, "c-2", &["X"], "t-1").await;
        append_tagged(&log, "c-1", &["C"], "t-0").await;

        let items: Vec<(u64, String)> = Box::pin(feed(Arc::new(log.clone()), "t-0", 0, &fast_feed()))
            .take(3)
            .map(|r| r.map(|t| (t.offset, t.event.event_type)))
            .collect::<Result<_, _>>()
            .await
            .expect("feed should not error");
        assert_eq!(
            items,
            vec![(1, "A".into()), (2, "B".into()), (3, "C".into())]
        );
    }

    #[tokio::test]
    async fn feed_resumes_after_offset_and_waits_for_new_events() {
        let log = MemoryEventLog::new();
        append_tagged(&log, "c-1", &["A", "B"], "t-0").await;

        let mut stream = Box::pin(feed(Arc::new(log.clone()), "t-0", 2, &fast_feed()));
        let writer = log.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            append_tagged(&writer, "c-1", &["C"], "t-0").await;
        });

        let next = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .expect("feed should deliver the new event")
            .expect("feed never ends")
            .expect("no read error");
        assert_eq!(next.offset, 3);
        assert_eq!(next.event.event_type, "C");
    }

    #[tokio::test]
    async fn runner_catches_up_and_resumes_from_checkpoint() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let log = MemoryEventLog::new();
        append_tagged(&log, "c-1", &["A", "B", "C"], "t-0").await;

        let mut runner =
            ProjectionRunner::<EventCounter>::new(Arc::new(log.clone()), "t-0", dir.path()).unwrap();
        assert_eq!(runner.catch_up().await.unwrap(), 3);
        assert_eq!(runner.offset(), 3);

        append_tagged(&log, "c-1", &["D"], "t-0").await;
        let mut resumed =
            ProjectionRunner::<EventCounter>::new(Arc::new(log.clone()), "t-0", dir.path()).unwrap();
        assert_eq!(resumed.offset(), 3, "resumes from saved checkpoint");
        assert_eq!(resumed.catch_up().await.unwrap(), 1);
        assert_eq!(resumed.state().types, vec!["A", "B", "C", "D"]);
    }

    #[tokio::test]
    async fn redelivered_events_are_skipped() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let log = MemoryEventLog::new();
        append_tagged(&log, "c-1", &["A", "B"], "t-0").await;

        let mut runner =
            ProjectionRunner::<EventCounter>::new(Arc::new(log.clone()), "t-0", dir.path()).unwrap();
        runner.catch_up().await.unwrap();

        let replay = log.read_tag("t-0", 0, 10).await.unwrap();
        for event in &replay {
            assert!(!runner.apply(event), "offset {} re-applied", event.offset);
        }
        assert_eq!(runner.state().count, 2);
    }

    #[tokio::test]
    async fn type_erased_state_downcasts() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let log = MemoryEventLog::new();
        append_tagged(&log, "c-1", &["A"], "t-0").await;

        let mut runner: Box<dyn ProjectionCatchUp> = Box::new(
            ProjectionRunner::<EventCounter>::new(Arc::new(log), "t-0", dir.path()).unwrap(),
        );
        runner.catch_up().await.unwrap();
        let state = runner
            .state_any()
            .downcast::<EventCounter>()
            .expect("type should match");
        assert_eq!(state.count, 1);
        assert_eq!(runner.name(), "event-counter");
    }
}
