//! Shard function and shard-to-member allocation.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::event::placement_hash;
use crate::membership::MemberId;

/// Index of one shard, `0 .. shard_count`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardId(pub u32);

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The shard `identity` belongs to: `hash(identity) mod shard_count`.
///
/// Identical in every process for a fixed `shard_count`.
pub fn shard_of(identity: &str, shard_count: u32) -> ShardId {
    let n = u128::from(shard_count.max(1));
    ShardId((placement_hash(identity) % n) as u32)
}

/// Owner of every assigned shard of one workload.
///
/// Shards without an eligible member are absent.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Assignment {
    shard_count: u32,
    owners: BTreeMap<ShardId, MemberId>,
}

impl Assignment {
    /// An assignment with no owners.
    pub fn empty(shard_count: u32) -> Self {
        Self {
            shard_count,
            owners: BTreeMap::new(),
        }
    }

    /// Total number of shards.
    pub fn shard_count(&self) -> u32 {
        self.shard_count
    }

    /// Owner of `shard`, if assigned.
    pub fn owner(&self, shard: ShardId) -> Option<&MemberId> {
        self.owners.get(&shard)
    }

    /// Shards owned by `member`, ascending.
    pub fn shards_of(&self, member: &MemberId) -> Vec<ShardId> {
        self.owners
            .iter()
            .filter(|(_, owner)| *owner == member)
            .map(|(shard, _)| *shard)
            .collect()
    }

    /// Number of shards per owning member.
    pub fn load(&self) -> BTreeMap<MemberId, usize> {
        let mut load = BTreeMap::new();
        for owner in self.owners.values() {
            *load.entry(owner.clone()).or_default() += 1;
        }
        load
    }

    /// Whether every shard has an owner.
    pub fn is_complete(&self) -> bool {
        self.owners.len() == self.shard_count as usize
    }

    /// Iterate `(shard, owner)` pairs in shard order.
    pub fn iter(&self) -> impl Iterator<Item = (ShardId, &MemberId)> {
        self.owners.iter().map(|(s, m)| (*s, m))
    }
}

/// One shard changing hands between two assignments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardMove {
    /// The moving shard.
    pub shard: ShardId,
    /// Previous owner, if any.
    pub from: Option<MemberId>,
    /// New owner, if any.
    pub to: Option<MemberId>,
}

/// Compute a balanced assignment over `eligible`, moving as few shards from
/// `previous` as possible.
///
/// Shards whose owner is still eligible stay put unless that owner holds
/// more than its fair share (`ceil(n / m)`, or `floor(n / m)` once the
/// extra slots are taken). Surplus and orphaned shards go to the least
/// loaded members. An unchanged member set yields an unchanged assignment.
pub fn allocate(previous: &Assignment, eligible: &[MemberId], shard_count: u32) -> Assignment {
    let members: BTreeSet<&MemberId> = eligible.iter().collect();
    if members.is_empty() {
        return Assignment::empty(shard_count);
    }

    // Shards that may stay where they are.
    let mut held: BTreeMap<&MemberId, Vec<ShardId>> =
        members.iter().map(|m| (*m, Vec::new())).collect();
    if previous.shard_count == shard_count {
        for (shard, owner) in &previous.owners {
            if let Some(shards) = held.get_mut(owner) {
                shards.push(*shard);
            }
        }
    }

    // Members already holding the most keep the `extra` larger quotas.
    let n = shard_count as usize;
    let base = n / members.len();
    let extra = n % members.len();
    let mut by_holding: Vec<&MemberId> = members.iter().copied().collect();
    by_holding.sort_by(|a, b| held[b].len().cmp(&held[a].len()).then_with(|| a.cmp(b)));
    let quota: BTreeMap<&MemberId, usize> = by_holding
        .iter()
        .enumerate()
        .map(|(rank, m)| (*m, base + usize::from(rank < extra)))
        .collect();

    let mut owners = BTreeMap::new();
    for (member, shards) in &held {
        for shard in shards.iter().take(quota[member]) {
            owners.insert(*shard, (*member).clone());
        }
    }

    let mut load: BTreeMap<&MemberId, usize> = members
        .iter()
        .map(|m| (*m, held[m].len().min(quota[m])))
        .collect();
    for shard in (0..shard_count).map(ShardId) {
        if owners.contains_key(&shard) {
            continue;
        }
        let target = members
            .iter()
            .copied()
            .filter(|m| load[m] < quota[m])
            .min_by(|a, b| load[a].cmp(&load[b]).then_with(|| a.cmp(b)));
        if let Some(member) = target {
            owners.insert(shard, member.clone());
            if let Some(l) = load.get_mut(member) {
                *l += 1;
            }
        }
    }

    Assignment {
        shard_count,
        owners,
    }
}

/// Shards whose owner differs between `previous` and `next`, ascending.
pub fn moves(previous: &Assignment, next: &Assignment) -> Vec<ShardMove> {
    let shards: BTreeSet<ShardId> = previous
        .owners
        .keys()
        .chain(next.owners.keys())
        .copied()
        .collect();
    shards
        .into_iter()
        .filter_map(|shard| {
            let from = previous.owner(shard).cloned();
            let to = next.owner(shard).cloned();
            (from != to).then_some(ShardMove { shard, from, to })
        })
        .collect()
}
