//! Cluster membership view.
//!
//! Membership itself (gossip, failure detection) is external; this module
//! is the interface the coordinator consumes: a current member set and a
//! change subscription. Each member carries a static set of [`Role`]s.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Identity of one cluster member.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MemberId(String);

impl MemberId {
    /// Wrap a member name.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The member name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MemberId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// A capability tag declaring which workloads a member may run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Role(String);

impl Role {
    /// Wrap a role name.
    pub fn new(role: impl Into<String>) -> Self {
        Self(role.into())
    }

    /// The role name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Role {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// A cluster member and its roles, fixed for the member's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    /// Member identity.
    pub id: MemberId,
    /// Capability tags.
    pub roles: BTreeSet<Role>,
}

impl Member {
    /// Build a member from an id and its roles.
    pub fn new<R: Into<Role>>(id: impl Into<MemberId>, roles: impl IntoIterator<Item = R>) -> Self {
        Self {
            id: id.into(),
            roles: roles.into_iter().map(Into::into).collect(),
        }
    }

    /// Whether this member carries `role`. `None` means no requirement.
    pub fn is_eligible(&self, role: Option<&Role>) -> bool {
        role.is_none_or(|r| self.roles.contains(r))
    }
}

impl From<String> for MemberId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Shared, observable set of live members.
///
/// Clones share the same view. Readers get a snapshot sorted by member id
/// and can subscribe to every change.
#[derive(Debug, Clone)]
pub struct Membership {
    tx: Arc<watch::Sender<Vec<Member>>>,
}

impl Default for Membership {
    fn default() -> Self {
        Self::new()
    }
}

impl Membership {
    /// An empty cluster.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Vec::new());
        Self { tx: Arc::new(tx) }
    }

    /// Add `member`, replacing any previous entry with the same id.
    pub fn join(&self, member: Member) {
        self.tx.send_if_modified(|members| {
            let mut by_id: BTreeMap<MemberId, Member> =
                members.drain(..).map(|m| (m.id.clone(), m)).collect();
            let changed = by_id.get(&member.id) != Some(&member);
            tracing::info!(member = %member.id, roles = ?member.roles, "member joined");
            by_id.insert(member.id.clone(), member);
            *members = by_id.into_values().collect();
            changed
        });
    }

    /// Remove the member with `id`. Returns whether it was present.
    pub fn leave(&self, id: &MemberId) -> bool {
        self.tx.send_if_modified(|members| {
            let before = members.len();
            members.retain(|m| &m.id != id);
            let removed = members.len() != before;
            if removed {
                tracing::info!(member = %id, "member left");
            }
            removed
        })
    }

    /// The current member set, sorted by id.
    pub fn current_members(&self) -> Vec<Member> {
        self.tx.borrow().clone()
    }

    /// Subscribe to membership changes.
    pub fn subscribe(&self) -> watch::Receiver<Vec<Member>> {
        self.tx.subscribe()
    }
}
