//! Rebuilding entity state from the event log.

use crate::aggregate::{Aggregate, fold_events};
use crate::error::RecoveryError;
use crate::event::{StreamId, decode_domain_event};
use crate::log::EventLog;
use crate::snapshot::Snapshot;

/// State rebuilt by [`recover`], with the sequence it reflects.
#[derive(Debug, Clone, PartialEq)]
pub struct Recovered<A> {
    /// The folded state.
    pub state: A,
    /// Sequence of the last event folded into `state` (0 for a new identity).
    pub sequence: u64,
    /// Sequence of the snapshot the fold started from, if one was used.
    pub from_snapshot: Option<u64>,
}

/// Rebuild the current state of `stream`.
///
/// Starts from the latest snapshot when one exists and decodes, otherwise
/// from `A::default()` at sequence 0, then folds every later event in
/// ascending order. Running it twice against the same log yields the same
/// state.
///
/// # Errors
///
/// - [`RecoveryError::Log`] if the log cannot be read (transient).
/// - [`RecoveryError::MalformedEvent`] if an event does not decode into
///   `A::DomainEvent`.
/// - [`RecoveryError::SequenceGap`] if the history is not contiguous.
pub async fn recover<A: Aggregate>(
    log: &dyn EventLog,
    stream: &StreamId,
) -> Result<Recovered<A>, RecoveryError> {
    let snapshot = match log.read_latest_snapshot(stream).await? {
        Some(record) => match Snapshot::<A>::from_record(&record) {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                tracing::warn!(
                    aggregate_type = %stream.aggregate_type,
                    instance_id = %stream.instance_id,
                    sequence = record.sequence,
                    error = %e,
                    "undecodable snapshot; replaying full history"
                );
                None
            }
        },
        None => None,
    };

    let from_snapshot = snapshot.as_ref().map(|s| s.sequence);
    let (seed, after) = match snapshot {
        Some(s) => (s.state, s.sequence),
        None => (A::default(), 0),
    };

    let persisted = log.read_from(stream, after).await?;
    let mut expected = after + 1;
    let mut events = Vec::with_capacity(persisted.len());
    for event in &persisted {
        if event.sequence != expected {
            return Err(RecoveryError::SequenceGap {
                expected,
                found: event.sequence,
            });
        }
        let decoded =
            decode_domain_event::<A>(event).map_err(|source| RecoveryError::MalformedEvent {
                sequence: event.sequence,
                event_type: event.event_type.clone(),
                source,
            })?;
        events.push(decoded);
        expected += 1;
    }

    let sequence = after + events.len() as u64;
    tracing::debug!(
        aggregate_type = %stream.aggregate_type,
        instance_id = %stream.instance_id,
        sequence,
        replayed = events.len(),
        snapshot = ?from_snapshot,
        "recovered state"
    );

    Ok(Recovered {
        state: fold_events(seed, &events),
        sequence,
        from_snapshot,
    })
}
