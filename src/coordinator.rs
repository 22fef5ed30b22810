//! Sharding coordinator: shard ownership per workload and handoff.
//!
//! A workload is either an entity type (its shards group identities) or a
//! projection (one shard per tag). Each workload may require a [`Role`];
//! only members carrying it receive its shards.
//!
//! Rebalancing is serialized. A moving shard is first marked as handing
//! off, so [`locate`](ShardCoordinator::locate) reports it unavailable; the
//! old host then drains and releases it, and only after that is the new
//! owner committed and asked to acquire it.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::ShardingError;
use crate::membership::{Member, MemberId, Membership, Role};
use crate::sharding::{Assignment, ShardId, ShardMove, allocate, moves, shard_of};

/// Placement requirements of one workload, registered at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadSpec {
    /// Entity type or projection name.
    pub name: String,
    /// Role a member must carry to host this workload, if any.
    pub role: Option<Role>,
    /// Number of shards (tags, for a projection).
    pub shard_count: u32,
}

impl WorkloadSpec {
    /// A workload of `shard_count` shards with no role requirement.
    pub fn new(name: impl Into<String>, shard_count: u32) -> Self {
        Self {
            name: name.into(),
            role: None,
            shard_count: shard_count.max(1),
        }
    }

    /// Require `role` on hosting members.
    pub fn with_role(mut self, role: impl Into<Role>) -> Self {
        self.role = Some(role.into());
        self
    }
}

/// A member that can host shards.
#[async_trait]
pub trait ShardHost: Send + Sync + 'static {
    /// The member this host runs on.
    fn member_id(&self) -> &MemberId;

    /// Stop everything of `workload` in `shard`, completing only once it has
    /// stopped.
    async fn release(&self, workload: &str, shard: ShardId);

    /// Take ownership of `shard`. Entity shards activate lazily, so hosts
    /// may treat this as a no-op for them.
    async fn acquire(&self, workload: &str, shard: ShardId);
}

#[derive(Debug, Default)]
struct WorkloadTable {
    assignment: Assignment,
    handing_off: BTreeSet<ShardId>,
}

struct CoordinatorInner {
    workloads: BTreeMap<String, WorkloadSpec>,
    tables: RwLock<BTreeMap<String, WorkloadTable>>,
    hosts: RwLock<HashMap<MemberId, Arc<dyn ShardHost>>>,
    rebalance: tokio::sync::Mutex<()>,
}

/// Cloneable handle to the cluster's shard coordinator.
#[derive(Clone)]
pub struct ShardCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl std::fmt::Debug for ShardCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardCoordinator")
            .field("workloads", &self.inner.workloads.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl ShardCoordinator {
    /// Create a coordinator for a fixed set of workloads.
    pub fn new(workloads: impl IntoIterator<Item = WorkloadSpec>) -> Self {
        let workloads: BTreeMap<String, WorkloadSpec> = workloads
            .into_iter()
            .map(|w| (w.name.clone(), w))
            .collect();
        let tables = workloads
            .values()
            .map(|w| {
                (
                    w.name.clone(),
                    WorkloadTable {
                        assignment: Assignment::empty(w.shard_count),
                        handing_off: BTreeSet::new(),
                    },
                )
            })
            .collect();
        Self {
            inner: Arc::new(CoordinatorInner {
                workloads,
                tables: RwLock::new(tables),
                hosts: RwLock::new(HashMap::new()),
                rebalance: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// The registered spec of `workload`.
    pub fn workload(&self, workload: &str) -> Option<&WorkloadSpec> {
        self.inner.workloads.get(workload)
    }

    /// Make `host` reachable for handoffs and routing.
    pub fn register_host(&self, host: Arc<dyn ShardHost>) {
        let id = host.member_id().clone();
        self.inner
            .hosts
            .write()
            .expect("hosts lock poisoned")
            .insert(id, host);
    }

    /// Forget the host of `member`.
    pub fn deregister_host(&self, member: &MemberId) -> Option<Arc<dyn ShardHost>> {
        self.inner
            .hosts
            .write()
            .expect("hosts lock poisoned")
            .remove(member)
    }

    /// The registered host of `member`, if reachable.
    pub fn host(&self, member: &MemberId) -> Option<Arc<dyn ShardHost>> {
        self.inner
            .hosts
            .read()
            .expect("hosts lock poisoned")
            .get(member)
            .cloned()
    }

    /// Shard of `identity` within `workload`.
    ///
    /// # Errors
    ///
    /// [`ShardingError::UnknownEntityType`] if `workload` was not registered.
    pub fn shard_for(&self, workload: &str, identity: &str) -> Result<ShardId, ShardingError> {
        let spec = self
            .workload(workload)
            .ok_or_else(|| ShardingError::UnknownEntityType(workload.to_owned()))?;
        Ok(shard_of(identity, spec.shard_count))
    }

    /// Member currently responsible for `identity` of `workload`.
    ///
    /// # Errors
    ///
    /// - [`ShardingError::UnknownEntityType`] for an unregistered workload.
    /// - [`ShardingError::HandoffInProgress`] while the shard is draining.
    /// - [`ShardingError::NoEligibleMember`] if the shard is unassigned.
    pub fn locate(&self, workload: &str, identity: &str) -> Result<(ShardId, MemberId), ShardingError> {
        let shard = self.shard_for(workload, identity)?;
        let owner = self.locate_shard(workload, shard)?;
        Ok((shard, owner))
    }

    /// Member currently owning `shard` of `workload`. Errors as
    /// [`locate`](Self::locate).
    pub fn locate_shard(&self, workload: &str, shard: ShardId) -> Result<MemberId, ShardingError> {
        let tables = self.inner.tables.read().expect("tables lock poisoned");
        let table = tables
            .get(workload)
            .ok_or_else(|| ShardingError::UnknownEntityType(workload.to_owned()))?;
        if table.handing_off.contains(&shard) {
            return Err(ShardingError::HandoffInProgress {
                entity_type: workload.to_owned(),
                shard,
            });
        }
        table
            .assignment
            .owner(shard)
            .cloned()
            .ok_or_else(|| ShardingError::NoEligibleMember {
                entity_type: workload.to_owned(),
                shard,
            })
    }

    /// Current assignment of `workload`.
    pub fn assignment(&self, workload: &str) -> Option<Assignment> {
        self.inner
            .tables
            .read()
            .expect("tables lock poisoned")
            .get(workload)
            .map(|t| t.assignment.clone())
    }

    /// Recompute every workload's assignment for `members` and carry out the
    /// resulting handoffs. Returns the moves that were made, per workload.
    pub async fn rebalance(&self, members: &[Member]) -> BTreeMap<String, Vec<ShardMove>> {
        let _serialized = self.inner.rebalance.lock().await;
        let mut applied = BTreeMap::new();

        for spec in self.inner.workloads.values() {
            let eligible: Vec<MemberId> = members
                .iter()
                .filter(|m| m.is_eligible(spec.role.as_ref()))
                .map(|m| m.id.clone())
                .collect();

            let (next, shard_moves) = {
                let mut tables = self.inner.tables.write().expect("tables lock poisoned");
                let table = tables.entry(spec.name.clone()).or_default();
                let next = allocate(&table.assignment, &eligible, spec.shard_count);
                let shard_moves = moves(&table.assignment, &next);
                table
                    .handing_off
                    .extend(shard_moves.iter().filter(|m| m.from.is_some()).map(|m| m.shard));
                (next, shard_moves)
            };
            if shard_moves.is_empty() {
                continue;
            }

            if eligible.is_empty() {
                tracing::warn!(
                    workload = %spec.name,
                    role = ?spec.role,
                    "no eligible member; shards unassigned"
                );
            }

            let releases = shard_moves.iter().filter_map(|mv| {
                let from = mv.from.as_ref()?;
                let host = self.host(from)?;
                tracing::info!(
                    workload = %spec.name,
                    shard = %mv.shard,
                    member = %from,
                    "releasing shard"
                );
                Some(async move { host.release(&spec.name, mv.shard).await })
            });
            futures::future::join_all(releases).await;

            {
                let mut tables = self.inner.tables.write().expect("tables lock poisoned");
                let table = tables.entry(spec.name.clone()).or_default();
                table.assignment = next;
                for mv in &shard_moves {
                    table.handing_off.remove(&mv.shard);
                }
            }

            let acquisitions = shard_moves.iter().filter_map(|mv| {
                let to = mv.to.as_ref()?;
                let host = self.host(to)?;
                tracing::info!(
                    workload = %spec.name,
                    shard = %mv.shard,
                    member = %to,
                    "acquiring shard"
                );
                Some(async move { host.acquire(&spec.name, mv.shard).await })
            });
            futures::future::join_all(acquisitions).await;

            applied.insert(spec.name.clone(), shard_moves);
        }
        applied
    }

    /// Rebalance on every change of `membership` until the returned handle
    /// is shut down.
    pub fn follow(&self, membership: &Membership) -> FollowHandle {
        let coordinator = self.clone();
        let mut members = membership.subscribe();
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            let current = members.borrow_and_update().clone();
            coordinator.rebalance(&current).await;
            loop {
                tokio::select! {
                    changed = members.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let current = members.borrow_and_update().clone();
                        coordinator.rebalance(&current).await;
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        });

        FollowHandle {
            shutdown_tx,
            task: Arc::new(Mutex::new(Some(task))),
        }
    }
}

/// Handle to a [`ShardCoordinator::follow`] task.
#[derive(Debug, Clone)]
pub struct FollowHandle {
    shutdown_tx: watch::Sender<bool>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl FollowHandle {
    /// Stop following membership and wait for the task to exit.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let task = self.task.lock().expect("follow task mutex poisoned").take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}
