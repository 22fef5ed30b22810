//! In-process cluster: nodes, membership and the coordinator wired
//! together, with location-transparent entity references.
//!
//! Members join and leave explicitly. Each change rebalances every workload
//! before the call returns, so shard ownership is settled when `join` or
//! `leave` completes.

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::{Arc, RwLock};

use crate::aggregate::Aggregate;
use crate::command::CommandContext;
use crate::coordinator::{ShardCoordinator, WorkloadSpec};
use crate::error::{ExecuteError, ShardingError, StateError};
use crate::membership::{MemberId, Membership};
use crate::node::Node;
use crate::projection::Projection;
use crate::sharding::ShardMove;

struct ClusterInner {
    membership: Membership,
    coordinator: ShardCoordinator,
    nodes: RwLock<BTreeMap<MemberId, Node>>,
}

/// A set of [`Node`]s sharing one membership view and coordinator.
///
/// `Clone` is cheap: all state is `Arc`-wrapped.
#[derive(Clone)]
pub struct Cluster {
    inner: Arc<ClusterInner>,
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("members", &self.member_ids())
            .finish_non_exhaustive()
    }
}

impl Cluster {
    /// A cluster running `workloads`. Pass the [`Node::workloads`] of any
    /// node; every node registers the same ones.
    pub fn new(workloads: impl IntoIterator<Item = WorkloadSpec>) -> Self {
        Self {
            inner: Arc::new(ClusterInner {
                membership: Membership::new(),
                coordinator: ShardCoordinator::new(workloads),
                nodes: RwLock::new(BTreeMap::new()),
            }),
        }
    }

    /// The shared membership view.
    pub fn membership(&self) -> &Membership {
        &self.inner.membership
    }

    /// The shard coordinator.
    pub fn coordinator(&self) -> &ShardCoordinator {
        &self.inner.coordinator
    }

    /// Ids of the current members, sorted.
    pub fn member_ids(&self) -> Vec<MemberId> {
        self.inner
            .nodes
            .read()
            .expect("nodes lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// The node of `member`, if it is part of the cluster.
    pub fn node(&self, member: &MemberId) -> Option<Node> {
        self.inner
            .nodes
            .read()
            .expect("nodes lock poisoned")
            .get(member)
            .cloned()
    }

    /// Add `node` to the cluster and rebalance. Returns the shard moves.
    pub async fn join(&self, node: Node) -> BTreeMap<String, Vec<ShardMove>> {
        let member = node.member().clone();
        self.inner.coordinator.register_host(Arc::new(node.clone()));
        self.inner
            .nodes
            .write()
            .expect("nodes lock poisoned")
            .insert(member.id.clone(), node);
        self.inner.membership.join(member);
        self.rebalance().await
    }

    /// Remove `member` gracefully: its shards are drained and handed to the
    /// remaining eligible members, then the node is shut down.
    pub async fn leave(&self, member: &MemberId) -> Option<Node> {
        if !self.inner.membership.leave(member) {
            return None;
        }
        self.rebalance().await;
        self.inner.coordinator.deregister_host(member);
        let node = self
            .inner
            .nodes
            .write()
            .expect("nodes lock poisoned")
            .remove(member)?;
        node.shutdown().await;
        Some(node)
    }

    /// Recompute assignments for the current membership.
    pub async fn rebalance(&self) -> BTreeMap<String, Vec<ShardMove>> {
        let members = self.inner.membership.current_members();
        self.inner.coordinator.rebalance(&members).await
    }

    /// A reference to instance `instance_id` of entity type `A`, wherever
    /// it lives.
    pub fn entity_ref<A: Aggregate>(&self, instance_id: impl Into<String>) -> EntityRef<A> {
        EntityRef {
            cluster: self.clone(),
            instance_id: instance_id.into(),
            _aggregate: PhantomData,
        }
    }

    /// State of projection `P` for `tag`, from whichever member runs it.
    pub async fn projection_state<P: Projection>(&self, tag: &str) -> Option<P> {
        let nodes: Vec<Node> = self
            .inner
            .nodes
            .read()
            .expect("nodes lock poisoned")
            .values()
            .cloned()
            .collect();
        for node in nodes {
            if let Some(state) = node.projection_state::<P>(tag).await {
                return Some(state);
            }
        }
        None
    }

    /// Shut down every member.
    pub async fn shutdown(&self) {
        let nodes: Vec<Node> = std::mem::take(
            &mut *self.inner.nodes.write().expect("nodes lock poisoned"),
        )
        .into_values()
        .collect();
        for node in nodes {
            self.inner.membership.leave(node.id());
            self.inner.coordinator.deregister_host(node.id());
            node.shutdown().await;
        }
    }

    fn owner_of<A: Aggregate>(&self, instance_id: &str) -> Result<Node, ShardingError> {
        let (_, owner) = self.inner.coordinator.locate(A::AGGREGATE_TYPE, instance_id)?;
        self.node(&owner)
            .ok_or(ShardingError::MemberUnreachable(owner))
    }
}

/// Location-transparent reference to one entity instance.
///
/// Every call resolves the current owner through the coordinator, so a
/// reference stays valid across rebalances.
pub struct EntityRef<A: Aggregate> {
    cluster: Cluster,
    instance_id: String,
    _aggregate: PhantomData<fn() -> A>,
}

impl<A: Aggregate> Clone for EntityRef<A> {
    fn clone(&self) -> Self {
        Self {
            cluster: self.cluster.clone(),
            instance_id: self.instance_id.clone(),
            _aggregate: PhantomData,
        }
    }
}

impl<A: Aggregate> std::fmt::Debug for EntityRef<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityRef")
            .field("aggregate_type", &A::AGGREGATE_TYPE)
            .field("instance_id", &self.instance_id)
            .finish()
    }
}

impl<A: Aggregate> EntityRef<A> {
    /// The referenced identity.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Send `cmd` and wait for the reply.
    pub async fn ask(&self, cmd: A::Command) -> Result<A::Reply, ExecuteError<A::Error>> {
        self.ask_with(cmd, CommandContext::default()).await
    }

    /// Send `cmd` with metadata and wait for the reply.
    ///
    /// # Errors
    ///
    /// - [`ExecuteError::Domain`] if the entity rejected the command.
    /// - [`ExecuteError::Unavailable`] if the shard is unassigned, being
    ///   handed off, or its owner is unreachable. Retry with backoff.
    pub async fn ask_with(
        &self,
        cmd: A::Command,
        ctx: CommandContext,
    ) -> Result<A::Reply, ExecuteError<A::Error>> {
        let node = self.cluster.owner_of::<A>(&self.instance_id)?;
        node.execute::<A>(&self.instance_id, cmd, ctx).await
    }

    /// Current state of the referenced instance.
    pub async fn state(&self) -> Result<A, StateError> {
        let node = self.cluster.owner_of::<A>(&self.instance_id)?;
        node.state::<A>(&self.instance_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::test_fixtures::{Counter, CounterCommand};
    use crate::memory::MemoryEventLog;
    use crate::node::{EntitySettings, NodeBuilder};

    fn counter_node(id: &str, log: &MemoryEventLog, dir: &std::path::Path) -> Node {
        NodeBuilder::new(id, Arc::new(log.clone()))
            .role("host")
            .base_dir(dir.join(id))
            .entity::<Counter>(EntitySettings::default().with_role("host").with_shard_count(4))
            .build()
    }

    #[tokio::test]
    async fn ask_routes_to_owner_and_survives_member_leaving() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let log = MemoryEventLog::new();
        let m1 = counter_node("m1", &log, dir.path());
        let m2 = counter_node("m2", &log, dir.path());
        let cluster = Cluster::new(m1.workloads());
        cluster.join(m1).await;
        cluster.join(m2).await;

        let refs: Vec<EntityRef<Counter>> =
            (0..8).map(|i| cluster.entity_ref(format!("c-{i}"))).collect();
        for r in &refs {
            assert_eq!(r.ask(CounterCommand::Add(2)).await.unwrap(), 2);
        }

        cluster.leave(&MemberId::from("m1")).await.expect("m1 was a member");
        assert_eq!(cluster.member_ids(), vec![MemberId::from("m2")]);
        for r in &refs {
            assert_eq!(r.ask(CounterCommand::Increment).await.unwrap(), 3);
        }
        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn ask_without_members_is_unavailable() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let log = MemoryEventLog::new();
        let cluster = Cluster::new(counter_node("m1", &log, dir.path()).workloads());

        let err = cluster
            .entity_ref::<Counter>("c-1")
            .ask(CounterCommand::Increment)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ExecuteError::Unavailable(ShardingError::NoEligibleMember { .. })
        ));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn owner_without_a_node_is_unreachable() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let log = MemoryEventLog::new();
        let m1 = counter_node("m1", &log, dir.path());
        let cluster = Cluster::new(m1.workloads());
        cluster.join(m1).await;

        // The coordinator still assigns m1 while its node is gone.
        let node = cluster
            .inner
            .nodes
            .write()
            .expect("nodes lock poisoned")
            .remove(&MemberId::from("m1"))
            .expect("m1 joined");
        let err = cluster
            .entity_ref::<Counter>("c-1")
            .ask(CounterCommand::Increment)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ExecuteError::Unavailable(ShardingError::MemberUnreachable(ref m)) if m.as_str() == "m1"
        ));
        assert!(err.is_retryable());
        node.shutdown().await;
    }

    #[tokio::test]
    async fn leaving_unknown_member_is_none() {
        let cluster = Cluster::new([]);
        assert!(cluster.leave(&MemberId::from("ghost")).await.is_none());
    }
}
