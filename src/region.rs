//! Per-member host of one entity type's live instances.

use std::any::Any;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::actor::{ActorConfig, EntityHandle, spawn_entity};
use crate::aggregate::Aggregate;
use crate::command::CommandContext;
use crate::error::{ExecuteError, ShardingError, StateError};
use crate::log::EventLog;
use crate::membership::MemberId;
use crate::sharding::{ShardId, shard_of};

struct RegionState<A: Aggregate> {
    owned: BTreeSet<ShardId>,
    handles: HashMap<String, EntityHandle<A>>,
}

/// Live instances of entity type `A` on one member, grouped by shard.
///
/// Instances are activated on demand, only for shards this member owns.
/// Releasing a shard passivates its instances and waits for them to stop;
/// from that point activation in the shard is refused.
pub struct ShardRegion<A: Aggregate> {
    member: MemberId,
    log: Arc<dyn EventLog>,
    config: ActorConfig,
    shard_count: u32,
    state: Arc<RwLock<RegionState<A>>>,
}

impl<A: Aggregate> std::fmt::Debug for ShardRegion<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardRegion")
            .field("aggregate_type", &A::AGGREGATE_TYPE)
            .field("member", &self.member)
            .field("shard_count", &self.shard_count)
            .finish_non_exhaustive()
    }
}

impl<A: Aggregate> ShardRegion<A> {
    /// Create a region owning no shards yet.
    pub fn new(member: MemberId, log: Arc<dyn EventLog>, config: ActorConfig, shard_count: u32) -> Self {
        Self {
            member,
            log,
            config,
            shard_count: shard_count.max(1),
            state: Arc::new(RwLock::new(RegionState {
                owned: BTreeSet::new(),
                handles: HashMap::new(),
            })),
        }
    }

    /// Shard of `instance_id`.
    pub fn shard_of(&self, instance_id: &str) -> ShardId {
        shard_of(instance_id, self.shard_count)
    }

    /// Handle to the live instance of `instance_id`, activating it if needed.
    ///
    /// # Errors
    ///
    /// [`ShardingError::NotOwner`] if this member does not own the shard.
    pub async fn activate(&self, instance_id: &str) -> Result<EntityHandle<A>, ShardingError> {
        let shard = self.shard_of(instance_id);

        // Fast path: live cached handle.
        {
            let state = self.state.read().await;
            if let Some(handle) = state.handles.get(instance_id)
                && handle.is_alive()
            {
                return Ok(handle.clone());
            }
        }

        // Slow path: check ownership, evict any stale entry, and spawn.
        let mut state = self.state.write().await;
        if !state.owned.contains(&shard) {
            return Err(ShardingError::NotOwner {
                entity_type: A::AGGREGATE_TYPE.to_owned(),
                shard,
                member: self.member.clone(),
            });
        }
        if let Some(handle) = state.handles.get(instance_id)
            && handle.is_alive()
        {
            return Ok(handle.clone());
        }

        tracing::debug!(
            aggregate_type = A::AGGREGATE_TYPE,
            instance_id = %instance_id,
            shard = %shard,
            member = %self.member,
            "spawning actor"
        );
        let handle = spawn_entity::<A>(Arc::clone(&self.log), instance_id, self.config.clone());
        state.handles.insert(instance_id.to_owned(), handle.clone());
        self.evict_when_stopped(handle.clone());
        Ok(handle)
    }

    /// Drop the cached handle once its instance stops, unless a newer
    /// instance has replaced it by then.
    fn evict_when_stopped(&self, handle: EntityHandle<A>) {
        let state = Arc::downgrade(&self.state);
        tokio::spawn(async move {
            handle.stopped().await;
            let Some(state) = state.upgrade() else {
                return;
            };
            let mut state = state.write().await;
            if state
                .handles
                .get(handle.instance_id())
                .is_some_and(|cached| cached.same_instance(&handle))
            {
                state.handles.remove(handle.instance_id());
            }
        });
    }

    /// Execute `cmd` on `instance_id`.
    ///
    /// An instance that stopped before taking the command (idle passivation
    /// racing the delivery) is replaced once and the command resent; such a
    /// command was never processed.
    pub async fn execute(
        &self,
        instance_id: &str,
        cmd: A::Command,
        ctx: CommandContext,
    ) -> Result<A::Reply, ExecuteError<A::Error>> {
        let handle = self.activate(instance_id).await?;
        match handle.execute(cmd.clone(), ctx.clone()).await {
            Err(ExecuteError::ActorGone) => {
                let handle = self.activate(instance_id).await?;
                handle.execute(cmd, ctx).await
            }
            other => other,
        }
    }

    /// Current state of `instance_id`.
    pub async fn state(&self, instance_id: &str) -> Result<A, StateError> {
        let handle = self.activate(instance_id).await?;
        match handle.state().await {
            Err(StateError::ActorGone) => self.activate(instance_id).await?.state().await,
            other => other,
        }
    }

    /// Start accepting activations in `shard`.
    pub async fn acquire_shard(&self, shard: ShardId) {
        self.state.write().await.owned.insert(shard);
    }

    /// Stop accepting activations in `shard`, then passivate its instances
    /// and wait for them to stop. Queued commands complete first.
    pub async fn release_shard(&self, shard: ShardId) {
        let draining: Vec<EntityHandle<A>> = {
            let mut state = self.state.write().await;
            state.owned.remove(&shard);
            let ids: Vec<String> = state
                .handles
                .keys()
                .filter(|id| shard_of(id, self.shard_count) == shard)
                .cloned()
                .collect();
            ids.iter()
                .filter_map(|id| state.handles.remove(id))
                .collect()
        };
        tracing::info!(
            aggregate_type = A::AGGREGATE_TYPE,
            shard = %shard,
            member = %self.member,
            instances = draining.len(),
            "draining shard"
        );
        drain(draining).await;
    }

    /// Release every shard.
    pub async fn stop_all(&self) {
        let draining: Vec<EntityHandle<A>> = {
            let mut state = self.state.write().await;
            state.owned.clear();
            state.handles.drain().map(|(_, h)| h).collect()
        };
        drain(draining).await;
    }

    /// Shards this member currently hosts, ascending.
    pub async fn owned_shards(&self) -> Vec<ShardId> {
        self.state.read().await.owned.iter().copied().collect()
    }

    /// Identities with a live instance on this member, sorted.
    pub async fn active_instances(&self) -> Vec<String> {
        let state = self.state.read().await;
        let mut ids: Vec<String> = state
            .handles
            .iter()
            .filter(|(_, h)| h.is_alive())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }
}

async fn drain<A: Aggregate>(handles: Vec<EntityHandle<A>>) {
    futures::future::join_all(handles.iter().map(|h| async move {
        h.passivate().await;
        h.stopped().await;
    }))
    .await;
}

/// Type-erased view of a [`ShardRegion`] for hosting several entity types on
/// one member.
#[async_trait]
pub(crate) trait HostedRegion: Send + Sync + 'static {
    async fn acquire_shard(&self, shard: ShardId);
    async fn release_shard(&self, shard: ShardId);
    async fn stop_all(&self);
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

#[async_trait]
impl<A: Aggregate> HostedRegion for ShardRegion<A> {
    async fn acquire_shard(&self, shard: ShardId) {
        ShardRegion::acquire_shard(self, shard).await;
    }

    async fn release_shard(&self, shard: ShardId) {
        ShardRegion::release_shard(self, shard).await;
    }

    async fn stop_all(&self) {
        ShardRegion::stop_all(self).await;
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
