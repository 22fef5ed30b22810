//! One cluster member: its roles, the entity regions and projection tags it
//! hosts, and the routing entry point for commands delivered to it.
//!
//! A [`Node`] is assembled with [`NodeBuilder`]. Every entity type and
//! projection the cluster runs is registered explicitly at startup, on every
//! node, with the same settings; the registrations double as the workload
//! table handed to the [`ShardCoordinator`](crate::ShardCoordinator).

use std::any::{Any, TypeId};
use std::collections::{BTreeSet, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::actor::ActorConfig;
use crate::aggregate::Aggregate;
use crate::backoff::RetryPolicy;
use crate::command::CommandContext;
use crate::coordinator::{ShardHost, WorkloadSpec};
use crate::error::{ExecuteError, ShardingError, StateError};
use crate::live::{LiveHandle, RunnerLoader, start_live};
use crate::log::EventLog;
use crate::membership::{Member, MemberId, Role};
use crate::projection::{
    FeedConfig, Projection, ProjectionCatchUp, ProjectionRunner, ProjectionSettings,
};
use crate::region::{HostedRegion, ShardRegion};
use crate::sharding::ShardId;
use crate::snapshot::SnapshotPolicy;
use crate::storage::StreamLayout;
use crate::tagging::TagScheme;

/// Default number of shards per entity type.
const DEFAULT_SHARD_COUNT: u32 = 100;

/// Placement and tagging of one entity type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntitySettings {
    /// Role a member needs to host instances of this type, if any.
    pub role: Option<Role>,
    /// Number of shards identities are hashed into.
    ///
    /// Default: 100.
    pub shard_count: u32,
    /// Projection tags stamped onto every persisted event, if any.
    pub tags: Option<TagScheme>,
}

impl Default for EntitySettings {
    fn default() -> Self {
        Self {
            role: None,
            shard_count: DEFAULT_SHARD_COUNT,
            tags: None,
        }
    }
}

impl EntitySettings {
    /// Restrict hosting to members carrying `role`.
    pub fn with_role(mut self, role: impl Into<Role>) -> Self {
        self.role = Some(role.into());
        self
    }

    /// Set the shard count.
    pub fn with_shard_count(mut self, shard_count: u32) -> Self {
        self.shard_count = shard_count.max(1);
        self
    }

    /// Tag every event with `tags`.
    pub fn with_tags(mut self, tags: TagScheme) -> Self {
        self.tags = Some(tags);
        self
    }
}

type RegionFactory =
    Box<dyn FnOnce(&MemberId, Arc<dyn EventLog>, &ActorConfig) -> Arc<dyn HostedRegion> + Send>;

type RunnerFactory = Arc<
    dyn Fn(Arc<dyn EventLog>, &str, &Path, &FeedConfig) -> io::Result<Box<dyn ProjectionCatchUp>>
        + Send
        + Sync,
>;

struct EntityRegistration {
    spec: WorkloadSpec,
    type_id: TypeId,
    tags: Option<TagScheme>,
    factory: RegionFactory,
}

#[derive(Clone)]
struct ProjectionSlot {
    tags: TagScheme,
    factory: RunnerFactory,
}

/// Builder for a [`Node`].
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use cluster_es::{EntitySettings, MemoryEventLog, NodeBuilder, ProjectionSettings, TagScheme};
/// use cluster_es::cart::{ItemPopularity, ShoppingCart};
///
/// let log = Arc::new(MemoryEventLog::new());
/// let node = NodeBuilder::new("m1", log)
///     .role("host")
///     .base_dir("/tmp/m1")
///     .entity::<ShoppingCart>(
///         EntitySettings::default()
///             .with_role("host")
///             .with_tags(TagScheme::new("carts", 5)),
///     )
///     .projection::<ItemPopularity>(ProjectionSettings::new(TagScheme::new("carts", 5)))
///     .build();
/// assert_eq!(node.id().as_str(), "m1");
/// ```
pub struct NodeBuilder {
    id: MemberId,
    roles: BTreeSet<Role>,
    log: Arc<dyn EventLog>,
    base_dir: Option<PathBuf>,
    actor: ActorConfig,
    feed: FeedConfig,
    entities: Vec<EntityRegistration>,
    projections: Vec<(WorkloadSpec, ProjectionSlot)>,
}

impl NodeBuilder {
    /// Start a node named `id` persisting to `log`.
    ///
    /// Every node of a cluster must share the same log.
    pub fn new(id: impl Into<MemberId>, log: Arc<dyn EventLog>) -> Self {
        Self {
            id: id.into(),
            roles: BTreeSet::new(),
            log,
            base_dir: None,
            actor: ActorConfig::default(),
            feed: FeedConfig::default(),
            entities: Vec::new(),
            projections: Vec::new(),
        }
    }

    /// Add a role to this member.
    pub fn role(mut self, role: impl Into<Role>) -> Self {
        self.roles.insert(role.into());
        self
    }

    /// Local directory for projection checkpoints.
    ///
    /// If not set, defaults to a system temp directory.
    pub fn base_dir(mut self, path: impl AsRef<Path>) -> Self {
        self.base_dir = Some(path.as_ref().to_owned());
        self
    }

    /// How long an instance waits for a command before passivating.
    ///
    /// Defaults to 120 seconds.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.actor.idle_timeout = timeout;
        self
    }

    /// Mailbox capacity of each instance. Defaults to 32.
    pub fn mailbox_capacity(mut self, capacity: usize) -> Self {
        self.actor.mailbox_capacity = capacity.max(1);
        self
    }

    /// Restart policy for instances.
    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.actor.retry = retry;
        self
    }

    /// Snapshot cadence and retention.
    pub fn snapshots(mut self, policy: SnapshotPolicy) -> Self {
        self.actor.snapshots = policy;
        self
    }

    /// Tag feed and live loop tuning for hosted projections.
    pub fn feed_config(mut self, config: FeedConfig) -> Self {
        self.feed = config;
        self
    }

    /// Register entity type `A`.
    pub fn entity<A: Aggregate>(mut self, settings: EntitySettings) -> Self {
        let mut spec = WorkloadSpec::new(A::AGGREGATE_TYPE, settings.shard_count);
        spec.role = settings.role;
        let shard_count = spec.shard_count;
        self.entities.push(EntityRegistration {
            spec,
            type_id: TypeId::of::<A>(),
            tags: settings.tags,
            factory: Box::new(move |member: &MemberId, log: Arc<dyn EventLog>, config: &ActorConfig| {
                Arc::new(ShardRegion::<A>::new(
                    member.clone(),
                    log,
                    config.clone(),
                    shard_count,
                )) as Arc<dyn HostedRegion>
            }),
        });
        self
    }

    /// Register projection `P`, one placement shard per tag.
    pub fn projection<P: Projection>(mut self, settings: ProjectionSettings) -> Self {
        let mut spec = WorkloadSpec::new(P::NAME, settings.tags.count());
        spec.role = settings.role;
        let factory: RunnerFactory = Arc::new(
            |log: Arc<dyn EventLog>, tag: &str, checkpoint_dir: &Path, feed: &FeedConfig| {
                let runner = ProjectionRunner::<P>::new(log, tag, checkpoint_dir)?
                    .with_batch_size(feed.batch_size);
                Ok(Box::new(runner) as Box<dyn ProjectionCatchUp>)
            },
        );
        self.projections.push((
            spec,
            ProjectionSlot {
                tags: settings.tags,
                factory,
            },
        ));
        self
    }

    /// Build the node. It owns no shards until the coordinator assigns some.
    pub fn build(self) -> Node {
        let layout = StreamLayout::new(
            self.base_dir
                .unwrap_or_else(|| std::env::temp_dir().join("cluster-es")),
        );

        let mut workloads = Vec::new();
        let mut regions = HashMap::new();
        let mut typed = HashMap::new();
        for registration in self.entities {
            let config = ActorConfig {
                tags: registration.tags,
                ..self.actor.clone()
            };
            let region = (registration.factory)(&self.id, Arc::clone(&self.log), &config);
            typed.insert(registration.type_id, Arc::clone(&region).into_any());
            regions.insert(registration.spec.name.clone(), region);
            workloads.push(registration.spec);
        }

        let mut projections = HashMap::new();
        for (spec, slot) in self.projections {
            projections.insert(spec.name.clone(), slot);
            workloads.push(spec);
        }

        Node {
            inner: Arc::new(NodeInner {
                member: Member {
                    id: self.id,
                    roles: self.roles,
                },
                log: self.log,
                layout,
                feed: self.feed,
                workloads,
                regions,
                typed,
                projections,
                live: Mutex::new(HashMap::new()),
            }),
        }
    }
}

struct NodeInner {
    member: Member,
    log: Arc<dyn EventLog>,
    layout: StreamLayout,
    feed: FeedConfig,
    workloads: Vec<WorkloadSpec>,
    regions: HashMap<String, Arc<dyn HostedRegion>>,
    typed: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
    projections: HashMap<String, ProjectionSlot>,
    live: Mutex<HashMap<(String, String), LiveHandle>>,
}

/// One cluster member.
///
/// `Clone` is cheap: the node is `Arc`-wrapped.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("member", &self.inner.member)
            .field("base_dir", &self.inner.layout.base_dir())
            .finish_non_exhaustive()
    }
}

impl Node {
    /// This node's member id.
    pub fn id(&self) -> &MemberId {
        &self.inner.member.id
    }

    /// This node's id and roles.
    pub fn member(&self) -> &Member {
        &self.inner.member
    }

    /// Every registered entity type and projection, as coordinator
    /// workloads.
    pub fn workloads(&self) -> Vec<WorkloadSpec> {
        self.inner.workloads.clone()
    }

    /// The region hosting entity type `A`, if registered.
    pub fn region<A: Aggregate>(&self) -> Option<Arc<ShardRegion<A>>> {
        let any = Arc::clone(self.inner.typed.get(&TypeId::of::<A>())?);
        any.downcast::<ShardRegion<A>>().ok()
    }

    fn region_or_unknown<A: Aggregate>(&self) -> Result<Arc<ShardRegion<A>>, ShardingError> {
        self.region::<A>()
            .ok_or_else(|| ShardingError::UnknownEntityType(A::AGGREGATE_TYPE.to_owned()))
    }

    /// Execute `cmd` on the local instance of `instance_id`.
    ///
    /// # Errors
    ///
    /// Besides the instance's own errors,
    /// [`ExecuteError::Unavailable`] if `A` is not registered or this node
    /// does not own the identity's shard.
    pub async fn execute<A: Aggregate>(
        &self,
        instance_id: &str,
        cmd: A::Command,
        ctx: CommandContext,
    ) -> Result<A::Reply, ExecuteError<A::Error>> {
        let region = self.region_or_unknown::<A>()?;
        region.execute(instance_id, cmd, ctx).await
    }

    /// Current state of the local instance of `instance_id`.
    pub async fn state<A: Aggregate>(&self, instance_id: &str) -> Result<A, StateError> {
        let region = self.region_or_unknown::<A>()?;
        region.state(instance_id).await
    }

    /// State of projection `P` for `tag`, if this node currently runs it.
    pub async fn projection_state<P: Projection>(&self, tag: &str) -> Option<P> {
        let handle = self.live_handle(P::NAME, tag).await?;
        handle.state::<P>().await
    }

    /// Live loop of `projection` for `tag`, if this node currently runs it.
    pub async fn live_handle(&self, projection: &str, tag: &str) -> Option<LiveHandle> {
        self.inner
            .live
            .lock()
            .await
            .get(&(projection.to_owned(), tag.to_owned()))
            .cloned()
    }

    /// Tags of `projection` this node currently consumes, sorted.
    pub async fn hosted_tags(&self, projection: &str) -> Vec<String> {
        let live = self.inner.live.lock().await;
        let mut tags: Vec<String> = live
            .keys()
            .filter(|(name, _)| name == projection)
            .map(|(_, tag)| tag.clone())
            .collect();
        tags.sort();
        tags
    }

    /// Passivate every instance and stop every projection loop, saving
    /// checkpoints.
    pub async fn shutdown(&self) {
        futures::future::join_all(self.inner.regions.values().map(|r| r.stop_all())).await;
        let handles: Vec<LiveHandle> = self.inner.live.lock().await.drain().map(|(_, h)| h).collect();
        for handle in handles {
            if let Err(e) = handle.shutdown().await {
                tracing::error!(member = %self.id(), tag = %handle.tag(), error = %e, "projection loop failed");
            }
        }
        tracing::info!(member = %self.id(), "node stopped");
    }

    fn tag_of(&self, projection: &str, shard: ShardId) -> Option<(ProjectionSlot, String)> {
        let slot = self.inner.projections.get(projection)?;
        Some((slot.clone(), slot.tags.tag(shard.0)))
    }
}

#[async_trait]
impl ShardHost for Node {
    fn member_id(&self) -> &MemberId {
        self.id()
    }

    async fn release(&self, workload: &str, shard: ShardId) {
        if let Some(region) = self.inner.regions.get(workload) {
            region.release_shard(shard).await;
            return;
        }
        let Some((_, tag)) = self.tag_of(workload, shard) else {
            tracing::warn!(workload, shard = %shard, "release of unknown workload");
            return;
        };
        let handle = self
            .inner
            .live
            .lock()
            .await
            .remove(&(workload.to_owned(), tag.clone()));
        if let Some(handle) = handle {
            tracing::info!(projection = workload, tag = %tag, member = %self.id(), "stopping projection");
            if let Err(e) = handle.shutdown().await {
                tracing::error!(projection = workload, tag = %tag, error = %e, "projection loop failed");
            }
        }
    }

    async fn acquire(&self, workload: &str, shard: ShardId) {
        if let Some(region) = self.inner.regions.get(workload) {
            region.acquire_shard(shard).await;
            return;
        }
        let Some((slot, tag)) = self.tag_of(workload, shard) else {
            tracing::warn!(workload, shard = %shard, "acquire of unknown workload");
            return;
        };

        let mut live = self.inner.live.lock().await;
        let key = (workload.to_owned(), tag.clone());
        if live.contains_key(&key) {
            return;
        }
        let checkpoint_dir = self.inner.layout.checkpoint_dir(workload, &tag);
        let feed = self.inner.feed.clone();
        let log = Arc::clone(&self.inner.log);
        let runner_tag = tag.clone();
        let load: RunnerLoader = Box::new(move || {
            (slot.factory)(Arc::clone(&log), &runner_tag, &checkpoint_dir, &feed)
        });
        tracing::info!(projection = workload, tag = %tag, member = %self.id(), "starting projection");
        let handle = start_live(
            Arc::clone(&self.inner.log),
            workload,
            &tag,
            load,
            self.inner.feed.clone(),
        );
        live.insert(key, handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::test_fixtures::{Counter, CounterCommand};
    use crate::event::StreamId;
    use crate::memory::MemoryEventLog;
    use crate::projection::test_fixtures::EventCounter;

    fn node(log: &MemoryEventLog, dir: &Path) -> Node {
        NodeBuilder::new("m1", Arc::new(log.clone()))
            .role("host")
            .base_dir(dir)
            .feed_config(FeedConfig {
                poll_interval: Duration::from_millis(5),
                ..FeedConfig::default()
            })
            .entity::<Counter>(
                EntitySettings::default()
                    .with_shard_count(2)
                    .with_tags(TagScheme::new("counters", 1)),
            )
            .projection::<EventCounter>(ProjectionSettings::new(TagScheme::new("counters", 1)))
            .build()
    }

    #[test]
    fn registrations_become_workloads() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let node = node(&MemoryEventLog::new(), dir.path());
        let names: Vec<String> = node.workloads().into_iter().map(|w| w.name).collect();
        assert_eq!(names, vec!["counter", "event-counter"]);
        assert!(node.member().is_eligible(Some(&Role::from("host"))));
    }

    #[tokio::test]
    async fn execute_requires_acquired_shard() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let log = MemoryEventLog::new();
        let node = node(&log, dir.path());

        let err = node
            .execute::<Counter>("c-1", CounterCommand::Increment, CommandContext::default())
            .await
            .unwrap_err();
        assert!(err.is_retryable());

        let region = node.region::<Counter>().expect("counter is registered");
        node.acquire("counter", region.shard_of("c-1")).await;
        let value = node
            .execute::<Counter>("c-1", CounterCommand::Increment, CommandContext::default())
            .await
            .expect("owned shard executes");
        assert_eq!(value, 1);

        let events = log.events(&StreamId::new("counter", "c-1"));
        assert_eq!(events[0].tags, vec!["counters-0"]);
    }

    #[tokio::test]
    async fn acquiring_projection_tag_starts_live_loop() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let log = MemoryEventLog::new();
        let node = node(&log, dir.path());
        for shard in 0..2 {
            node.acquire("counter", ShardId(shard)).await;
        }
        node.execute::<Counter>("c-1", CounterCommand::Add(2), CommandContext::default())
            .await
            .unwrap();

        node.acquire("event-counter", ShardId(0)).await;
        assert_eq!(node.hosted_tags("event-counter").await, vec!["counters-0"]);

        let mut seen = 0;
        for _ in 0..200 {
            seen = node
                .projection_state::<EventCounter>("counters-0")
                .await
                .map(|p| p.count)
                .unwrap_or_default();
            if seen == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(seen, 1);

        node.release("event-counter", ShardId(0)).await;
        assert!(node.hosted_tags("event-counter").await.is_empty());
        assert!(
            dir.path()
                .join("projections/event-counter/counters-0/checkpoint.json")
                .exists()
        );
        node.shutdown().await;
    }

    async fn wait_for_count(node: &Node, tag: &str, expected: u64) -> u64 {
        let mut seen = 0;
        for _ in 0..200 {
            seen = node
                .projection_state::<EventCounter>(tag)
                .await
                .map(|p| p.count)
                .unwrap_or_default();
            if seen == expected {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        seen
    }

    #[tokio::test]
    async fn unreadable_checkpoint_keeps_the_tag_claimed_and_retries() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let log = MemoryEventLog::new();
        let node = NodeBuilder::new("m1", Arc::new(log.clone()))
            .base_dir(dir.path())
            .feed_config(FeedConfig {
                poll_interval: Duration::from_millis(5),
                reconnect_base_delay: Duration::from_millis(5),
                reconnect_max_delay: Duration::from_millis(20),
                ..FeedConfig::default()
            })
            .entity::<Counter>(
                EntitySettings::default()
                    .with_shard_count(1)
                    .with_tags(TagScheme::new("counters", 1)),
            )
            .projection::<EventCounter>(ProjectionSettings::new(TagScheme::new("counters", 1)))
            .build();
        node.acquire("counter", ShardId(0)).await;
        node.execute::<Counter>("c-1", CounterCommand::Increment, CommandContext::default())
            .await
            .unwrap();

        let blocker = dir
            .path()
            .join("projections/event-counter/counters-0/checkpoint.json");
        std::fs::create_dir_all(&blocker).unwrap();
        node.acquire("event-counter", ShardId(0)).await;
        assert_eq!(node.hosted_tags("event-counter").await, vec!["counters-0"]);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(node.projection_state::<EventCounter>("counters-0").await.is_none());

        std::fs::remove_dir(&blocker).unwrap();
        assert_eq!(wait_for_count(&node, "counters-0", 1).await, 1);
        node.shutdown().await;
    }

    #[tokio::test]
    async fn configured_batch_size_reaches_catch_up() {
        use crate::memory::test_support::TagReadRecorder;
        use std::sync::atomic::Ordering;

        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let log = TagReadRecorder::default();
        let node = NodeBuilder::new("m1", Arc::new(log.clone()))
            .base_dir(dir.path())
            .feed_config(FeedConfig {
                poll_interval: Duration::from_millis(5),
                batch_size: 2,
                ..FeedConfig::default()
            })
            .entity::<Counter>(
                EntitySettings::default()
                    .with_shard_count(1)
                    .with_tags(TagScheme::new("counters", 1)),
            )
            .projection::<EventCounter>(ProjectionSettings::new(TagScheme::new("counters", 1)))
            .build();
        node.acquire("counter", ShardId(0)).await;
        for i in 0..5 {
            node.execute::<Counter>(&format!("c-{i}"), CounterCommand::Increment, CommandContext::default())
                .await
                .unwrap();
        }

        node.acquire("event-counter", ShardId(0)).await;
        assert_eq!(wait_for_count(&node, "counters-0", 5).await, 5);
        assert_eq!(log.largest_max.load(Ordering::SeqCst), 2);
        node.shutdown().await;
    }
}
