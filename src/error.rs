//! Crate-level error types.
//!
//! The taxonomy follows the failure classes of the runtime: business
//! rejections ([`ExecuteError::Domain`]), concurrent-writer conflicts,
//! storage unavailability, unavailable shards, and malformed history.

use crate::membership::MemberId;
use crate::sharding::ShardId;

/// Error returned by [`EventLog`](crate::EventLog) operations.
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    /// The append's expected sequence did not match the stream head.
    ///
    /// Signals a second writer for the same identity.
    #[error("append conflict: expected sequence {expected}, stream is at {actual}")]
    Conflict {
        /// Sequence the writer believed was the head.
        expected: u64,
        /// Actual head of the stream.
        actual: u64,
    },

    /// The log cannot be reached right now. Transient.
    #[error("event log unavailable: {0}")]
    Unavailable(String),

    /// Disk I/O failure in a file-backed log.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored record could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl LogError {
    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Io(_))
    }
}

/// Error returned when rebuilding an entity's state fails.
#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    /// The event log failed while loading the snapshot or events.
    #[error("event log failure during recovery: {0}")]
    Log(#[from] LogError),

    /// A persisted event could not be decoded into the aggregate's event type.
    ///
    /// Never skipped: folding around it would corrupt the derived state.
    #[error("malformed event at sequence {sequence} ({event_type}): {source}")]
    MalformedEvent {
        /// Sequence number of the offending event.
        sequence: u64,
        /// Its stored event type.
        event_type: String,
        /// The decode failure.
        #[source]
        source: serde_json::Error,
    },

    /// The log returned a non-contiguous history.
    #[error("sequence gap: expected {expected}, found {found}")]
    SequenceGap {
        /// The next sequence recovery expected.
        expected: u64,
        /// The sequence actually read.
        found: u64,
    },
}

impl RecoveryError {
    /// Whether a later activation attempt may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Log(e) if e.is_transient())
    }
}

/// Error raised by the sharding coordinator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ShardingError {
    /// No workload with this name was registered at startup.
    #[error("'{0}' is not a registered entity type or projection")]
    UnknownEntityType(String),

    /// The shard has no member carrying the required role.
    #[error("shard {shard} of '{entity_type}' has no eligible member")]
    NoEligibleMember {
        /// Entity type (or projection) name.
        entity_type: String,
        /// The unassigned shard.
        shard: ShardId,
    },

    /// The shard is draining on its previous host.
    #[error("shard {shard} of '{entity_type}' is being handed off")]
    HandoffInProgress {
        /// Entity type (or projection) name.
        entity_type: String,
        /// The moving shard.
        shard: ShardId,
    },

    /// A member was asked to host a shard it does not own.
    #[error("member '{member}' does not own shard {shard} of '{entity_type}'")]
    NotOwner {
        /// Entity type name.
        entity_type: String,
        /// The shard in question.
        shard: ShardId,
        /// The member that received the request.
        member: MemberId,
    },

    /// The owning member is known to the coordinator but not reachable.
    #[error("member '{0}' is not reachable")]
    MemberUnreachable(MemberId),
}

/// Error returned when executing a command against an entity fails.
///
/// Generic over `E`, the domain-specific error type that the aggregate's
/// command handler may produce (e.g., "quantity must be positive").
#[derive(Debug, thiserror::Error)]
pub enum ExecuteError<E: std::error::Error + Send + Sync + 'static> {
    /// Command rejected by aggregate logic. No events were persisted.
    #[error(transparent)]
    Domain(E),

    /// Another writer appended to this identity's stream. The instance
    /// stopped; the next command activates a fresh one.
    #[error("concurrent writer detected; entity instance stopped")]
    Conflict,

    /// Persisting failed and restarts were exhausted.
    ///
    /// Each restart recovers from the log and decides the command again,
    /// so with a log that honours the [`EventLog::append`] contract the
    /// command has not taken effect. A log that reports an error for a
    /// committed append breaks this; the retried command may then be
    /// rejected by a business rule it satisfied itself ("already added").
    ///
    /// [`EventLog::append`]: crate::EventLog::append
    #[error("event log failure: {0}")]
    Storage(#[source] LogError),

    /// The entity could not be recovered.
    #[error("entity recovery failed: {0}")]
    Recovery(#[source] RecoveryError),

    /// The owning shard is not available right now. Retry with backoff.
    #[error("entity unavailable: {0}")]
    Unavailable(#[from] ShardingError),

    /// The instance stopped (passivated, handed off, or failed) before
    /// replying. Retry with backoff.
    #[error("entity instance is no longer running")]
    ActorGone,
}

impl<E: std::error::Error + Send + Sync + 'static> ExecuteError<E> {
    /// Whether the caller may retry the same command later.
    ///
    /// Business rejections are final; placement and liveness failures are
    /// not. A retried command may already have taken effect.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Unavailable(_) | Self::ActorGone => true,
            Self::Storage(e) => e.is_transient(),
            Self::Recovery(e) => e.is_transient(),
            Self::Domain(_) | Self::Conflict => false,
        }
    }
}

/// Error returned when reading the current state of an entity fails.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// The entity could not be recovered.
    #[error("entity recovery failed: {0}")]
    Recovery(#[source] RecoveryError),

    /// The owning shard is not available right now.
    #[error("entity unavailable: {0}")]
    Unavailable(#[from] ShardingError),

    /// The instance stopped before replying.
    #[error("entity instance is no longer running")]
    ActorGone,
}

/// Error returned by projection catch-up and checkpointing.
#[derive(Debug, thiserror::Error)]
pub enum ProjectionError {
    /// Reading the tag feed failed.
    #[error("feed read failed: {0}")]
    Log(#[from] LogError),

    /// Saving or loading the checkpoint failed.
    #[error("checkpoint I/O failed: {0}")]
    Checkpoint(#[from] std::io::Error),
}
