//! Aggregate trait: the per-entity state machine.

use serde::{Serialize, de::DeserializeOwned};

/// A domain aggregate whose state is derived from its event history.
///
/// The implementing type itself serves as the aggregate's state.
/// [`Default`] is the empty state every identity starts from; state is
/// built by folding domain events through [`apply`](Aggregate::apply).
///
/// # Associated Types
///
/// - `Command`: the set of commands this aggregate can handle.
/// - `DomainEvent`: the set of events this aggregate can produce and apply.
/// - `Reply`: the value returned to the caller once a command is accepted.
/// - `Error`: command rejection / validation error.
///
/// # Contract
///
/// - [`handle`](Aggregate::handle) must be a pure decision function: no I/O,
///   no clock, no randomness. It validates a command against the current
///   state and returns zero or more events. Any timestamp or random value
///   an event needs must arrive inside the command.
/// - [`apply`](Aggregate::apply) must be a pure, total function over every
///   event `handle` can emit. It runs both for freshly persisted events and
///   during recovery, and must not be able to tell the two apart.
/// - [`reply`](Aggregate::reply) is computed from the state after the
///   accepted events were applied (or the unchanged state for commands
///   that produced no events).
pub trait Aggregate:
    Default + Clone + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Identifies this aggregate type (e.g. "shopping-cart"). Used as the
    /// entity type name for sharding and as part of every stream key.
    const AGGREGATE_TYPE: &'static str;

    /// The set of commands this aggregate can handle.
    ///
    /// `Clone` because a command whose events failed to persist is decided
    /// again after the instance restarts.
    type Command: Clone + Send + 'static;

    /// The set of events this aggregate can produce and apply.
    ///
    /// Must use adjacently tagged serde (`#[serde(tag = "type", content = "data")]`).
    type DomainEvent: Serialize + DeserializeOwned + Send + Sync + Clone + 'static;

    /// Reply sent to the caller after a command is accepted.
    type Reply: Send + 'static;

    /// Command rejection / validation error type.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Validate a command against the current state and produce events.
    ///
    /// `instance_id` is the identity of the entity this state belongs to,
    /// for aggregates that stamp it into their events.
    ///
    /// Returns `Ok(vec![])` for read-only or no-op commands.
    /// Returns `Err` to reject the command; nothing is persisted.
    fn handle(
        &self,
        instance_id: &str,
        cmd: Self::Command,
    ) -> Result<Vec<Self::DomainEvent>, Self::Error>;

    /// Apply a single event to produce the next state.
    fn apply(self, event: &Self::DomainEvent) -> Self;

    /// Build the reply for an accepted command from the current state.
    fn reply(&self) -> Self::Reply;
}

/// Fold a sequence of events onto `seed`.
///
/// Recovery, snapshot catch-up, and the live instance all derive state
/// through this one function.
pub fn fold_events<'a, A, I>(seed: A, events: I) -> A
where
    A: Aggregate,
    I: IntoIterator<Item = &'a A::DomainEvent>,
{
    events.into_iter().fold(seed, |state, event| state.apply(event))
}

/// Rebuild state from the empty state and a full event history.
pub fn replay<'a, A, I>(events: I) -> A
where
    A: Aggregate,
    I: IntoIterator<Item = &'a A::DomainEvent>,
{
    fold_events(A::default(), events)
}
