//! Projection tags: deterministic bucketing of identities into feeds.

use serde::{Deserialize, Serialize};

use crate::event::placement_hash;

/// A fixed set of tags `"<prefix>-0" .. "<prefix>-<count-1>"`.
///
/// Every event of an identity carries the same tag, so a consumer of one
/// tag sees that identity's full history in order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TagScheme {
    prefix: String,
    count: u32,
}

impl TagScheme {
    /// Create a scheme of `count` tags. A `count` of 0 is treated as 1.
    pub fn new(prefix: impl Into<String>, count: u32) -> Self {
        Self {
            prefix: prefix.into(),
            count: count.max(1),
        }
    }

    /// The tag prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Number of tags in the scheme.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// The tag for bucket `index`.
    pub fn tag(&self, index: u32) -> String {
        format!("{}-{}", self.prefix, index)
    }

    /// Bucket index for `identity`.
    pub fn index_for(&self, identity: &str) -> u32 {
        (placement_hash(identity) % u128::from(self.count)) as u32
    }

    /// The tag every event of `identity` is routed to.
    pub fn tag_for(&self, identity: &str) -> String {
        self.tag(self.index_for(identity))
    }

    /// All tags of the scheme, in index order.
    pub fn tags(&self) -> Vec<String> {
        (0..self.count).map(|i| self.tag(i)).collect()
    }
}
