//! Event envelopes, stream identity, and domain event encoding.
//!
//! This module provides the data types shared by the event log, the
//! instance runtime, recovery, and projections. No I/O occurs here.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::aggregate::Aggregate;
use crate::command::CommandContext;

/// Fixed namespace UUID for deterministic stream ID derivation.
///
/// All stream UUIDs are UUID v5 values derived from this namespace and the
/// `"{aggregate_type}/{instance_id}"` string, so the same identity maps to
/// the same UUID in every process.
const STREAM_NAMESPACE: Uuid = Uuid::from_bytes([
    0x9a, 0x1e, 0x7c, 0x3b, 0x4d, 0x2f, 0x4a, 0x8e, 0xb5, 0x6c, 0x1f, 0x3d, 0x7e, 0x9a, 0x0b, 0xc4,
]);

/// Namespace for placement hashing (shards and projection tags).
const PLACEMENT_NAMESPACE: Uuid = Uuid::from_bytes([
    0x3f, 0x0c, 0x51, 0xd2, 0x8a, 0x17, 0x4e, 0x62, 0x9b, 0x05, 0xe4, 0x7a, 0x21, 0xc8, 0x6d, 0x93,
]);

/// Derive a deterministic stream UUID from aggregate type and instance ID.
///
/// The type is length-prefixed, so `("a/b", "c")` and `("a", "b/c")` differ.
///
/// # Examples
///
/// ```
/// use cluster_es::stream_uuid;
/// let id = stream_uuid("counter", "c-1");
/// assert_eq!(id, stream_uuid("counter", "c-1")); // deterministic
/// ```
pub fn stream_uuid(aggregate_type: &str, instance_id: &str) -> Uuid {
    let name = format!("{}:{aggregate_type}/{instance_id}", aggregate_type.len());
    Uuid::new_v5(&STREAM_NAMESPACE, name.as_bytes())
}

/// Stable, process-independent hash of a key.
///
/// `std::hash` is randomly seeded per process and therefore unusable for
/// placement; a UUID v5 digest is identical everywhere.
pub fn placement_hash(key: &str) -> u128 {
    Uuid::new_v5(&PLACEMENT_NAMESPACE, key.as_bytes()).as_u128()
}

/// Current wall-clock time in Unix epoch milliseconds.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Identity of one entity's event stream: entity type plus instance ID.
///
/// The instance ID is the shard key; the pair is the event log partition key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamId {
    /// Entity type name (`Aggregate::AGGREGATE_TYPE`).
    pub aggregate_type: String,
    /// Entity identity, unique within the type.
    pub instance_id: String,
}

impl StreamId {
    /// Build a stream ID from its parts.
    pub fn new(aggregate_type: impl Into<String>, instance_id: impl Into<String>) -> Self {
        Self {
            aggregate_type: aggregate_type.into(),
            instance_id: instance_id.into(),
        }
    }

    /// Stream ID for an instance of aggregate type `A`.
    pub fn of<A: Aggregate>(instance_id: impl Into<String>) -> Self {
        Self::new(A::AGGREGATE_TYPE, instance_id)
    }

    /// Deterministic UUID for this stream (see [`stream_uuid`]).
    pub fn uuid(&self) -> Uuid {
        stream_uuid(&self.aggregate_type, &self.instance_id)
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.aggregate_type, self.instance_id)
    }
}

/// Infrastructure metadata stamped on every event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Actor identity from the command context, if provided.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    /// Correlation ID from the command context, if provided.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Free-form metadata from the command context, if provided.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<Value>,
}

impl From<&CommandContext> for EventMetadata {
    fn from(ctx: &CommandContext) -> Self {
        Self {
            actor: ctx.actor.clone(),
            correlation_id: ctx.correlation_id.clone(),
            extra: ctx.metadata.clone(),
        }
    }
}

/// An encoded event that has not yet been assigned a sequence number.
#[derive(Debug, Clone, PartialEq)]
pub struct ProposedEvent {
    /// Newly generated UUID v4 event ID.
    pub event_id: Uuid,
    /// Variant name extracted from the adjacently tagged domain event.
    pub event_type: String,
    /// The `"data"` portion of the adjacently tagged domain event.
    pub payload: Value,
    /// Infrastructure metadata.
    pub metadata: EventMetadata,
    /// Projection tags, fixed at creation time.
    pub tags: Vec<String>,
    /// Creation timestamp (Unix epoch milliseconds).
    pub recorded_at: u64,
}

/// An event as stored in the log: immutable, with its per-stream sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedEvent {
    /// Client-assigned event ID.
    pub event_id: Uuid,
    /// Owning stream.
    pub stream: StreamId,
    /// One-based, gapless, strictly increasing sequence within the stream.
    pub sequence: u64,
    /// Variant name (e.g. `"ItemAdded"`).
    pub event_type: String,
    /// Domain event payload.
    pub payload: Value,
    /// Infrastructure metadata.
    #[serde(default)]
    pub metadata: EventMetadata,
    /// Projection tags this event was routed to.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Creation timestamp (Unix epoch milliseconds).
    pub recorded_at: u64,
}

impl PersistedEvent {
    /// Stamp a proposed event with its stream and sequence.
    pub fn from_proposed(stream: StreamId, sequence: u64, proposed: ProposedEvent) -> Self {
        Self {
            event_id: proposed.event_id,
            stream,
            sequence,
            event_type: proposed.event_type,
            payload: proposed.payload,
            metadata: proposed.metadata,
            tags: proposed.tags,
            recorded_at: proposed.recorded_at,
        }
    }
}

/// A persisted event as seen through one projection tag's feed.
#[derive(Debug, Clone, PartialEq)]
pub struct TaggedEvent {
    /// The tag this feed belongs to.
    pub tag: String,
    /// One-based position of the event within the tag, in persistence order.
    pub offset: u64,
    /// The event itself.
    pub event: PersistedEvent,
}

/// Encode a domain event into a [`ProposedEvent`].
///
/// The domain event must serialize adjacently tagged
/// (`#[serde(tag = "type", content = "data")]`): `"type"` becomes the
/// `event_type`, `"data"` (absent for unit variants) becomes the payload.
///
/// # Errors
///
/// Returns `serde_json::Error` if the event cannot be serialized or is not
/// adjacently tagged.
pub fn encode_domain_event<A: Aggregate>(
    event: &A::DomainEvent,
    ctx: &CommandContext,
    tags: &[String],
) -> serde_json::Result<ProposedEvent> {
    let value = serde_json::to_value(event)?;
    let Value::Object(mut obj) = value else {
        return Err(serde::ser::Error::custom(
            "domain event must serialize to a JSON object",
        ));
    };
    let event_type = match obj.remove("type") {
        Some(Value::String(s)) => s,
        _ => {
            return Err(serde::ser::Error::custom(
                "domain event must carry a string 'type' field",
            ));
        }
    };
    let payload = obj.remove("data").unwrap_or(Value::Null);

    Ok(ProposedEvent {
        event_id: Uuid::new_v4(),
        event_type,
        payload,
        metadata: EventMetadata::from(ctx),
        tags: tags.to_vec(),
        recorded_at: now_millis(),
    })
}

/// Decode a persisted event back into `A::DomainEvent`.
///
/// # Errors
///
/// Returns `serde_json::Error` if the event type is unknown to `A` or the
/// payload does not match the variant.
pub fn decode_domain_event<A: Aggregate>(
    event: &PersistedEvent,
) -> serde_json::Result<A::DomainEvent> {
    let tagged = if event.payload.is_null() {
        serde_json::json!({ "type": event.event_type })
    } else {
        serde_json::json!({
            "type": event.event_type,
            "data": event.payload,
        })
    };
    serde_json::from_value(tagged)
}
