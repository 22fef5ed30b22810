//! Sharded, event-sourced entities with role-restricted placement and
//! tagged projection feeds.
//!
//! Each entity identity is a single-writer state machine whose state is the
//! fold of its persisted events. Identities hash into shards; a coordinator
//! assigns shards to cluster members carrying the required role and hands
//! them off only after the previous owner drained. Every event carries a
//! projection tag, and per-tag feeds drive checkpointed read models.

mod actor;
pub use actor::{ActorConfig, EntityHandle, InstanceStatus, spawn_entity};
mod aggregate;
pub use aggregate::{Aggregate, fold_events, replay};
mod backoff;
pub use backoff::RetryPolicy;
pub mod cart;
mod cluster;
pub use cluster::{Cluster, EntityRef};
mod command;
mod coordinator;
pub use coordinator::{FollowHandle, ShardCoordinator, ShardHost, WorkloadSpec};
mod error;
mod event;
mod live;
pub use live::LiveHandle;
mod log;
pub use log::{EventLog, SnapshotRecord};
mod membership;
pub use membership::{Member, MemberId, Membership, Role};
mod memory;
pub use memory::MemoryEventLog;
mod node;
pub use node::{EntitySettings, Node, NodeBuilder};
mod projection;
pub use projection::{FeedConfig, Projection, ProjectionRunner, ProjectionSettings, feed};
mod recovery;
pub use recovery::{Recovered, recover};
mod region;
pub use region::ShardRegion;
mod sharding;
pub use sharding::{Assignment, ShardId, ShardMove, allocate, moves, shard_of};
mod snapshot;
pub use snapshot::{Snapshot, SnapshotPolicy};
mod storage;
pub use storage::{FileEventLog, StreamLayout};
mod tagging;
pub use tagging::TagScheme;

pub use command::CommandContext;
pub use error::{
    ExecuteError, LogError, ProjectionError, RecoveryError, ShardingError, StateError,
};
pub use event::{
    EventMetadata, PersistedEvent, ProposedEvent, StreamId, TaggedEvent, decode_domain_event,
    encode_domain_event, placement_hash, stream_uuid,
};
