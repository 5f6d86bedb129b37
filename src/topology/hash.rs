//! Immutable consistent-hash topology snapshots.
//!
//! A snapshot maps a fixed segment space to ordered owner lists. New
//! snapshots supersede old ones; an instance is never mutated in place, so a
//! `Locality` closed over one snapshot stays coherent during a rehash.

use crate::types::{NodeId, SessionKey, TopologyId};
use std::sync::Arc;

/// A consistent-hash snapshot: segment -> ordered owners, primary first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsistentHashTopology {
    topology_id: TopologyId,

    /// Owner lists per segment. The first entry of each list is the primary.
    segments: Vec<Vec<NodeId>>,

    /// Distinct members, sorted.
    members: Vec<NodeId>,
}

impl ConsistentHashTopology {
    /// Build a snapshot from explicit per-segment owner lists.
    ///
    /// An empty list is padded to one ownerless segment so ownership queries
    /// stay total.
    pub fn with_assignments(topology_id: TopologyId, mut segments: Vec<Vec<NodeId>>) -> Self {
        if segments.is_empty() {
            segments.push(Vec::new());
        }
        let mut members: Vec<NodeId> = segments.iter().flatten().copied().collect();
        members.sort_unstable();
        members.dedup();
        Self {
            topology_id,
            segments,
            members,
        }
    }

    /// Build a balanced snapshot that assigns segments round-robin across the
    /// given members, with `num_owners` owners per segment.
    ///
    /// Deterministic: the same member set always yields the same assignment.
    pub fn balanced(
        topology_id: TopologyId,
        members: &[NodeId],
        num_segments: usize,
        num_owners: usize,
    ) -> Self {
        let mut sorted: Vec<NodeId> = members.to_vec();
        sorted.sort_unstable();
        sorted.dedup();

        let owners_per_segment = num_owners.clamp(1, sorted.len().max(1));
        let segments = (0..num_segments.max(1))
            .map(|segment| {
                if sorted.is_empty() {
                    return Vec::new();
                }
                (0..owners_per_segment)
                    .map(|offset| sorted[(segment + offset) % sorted.len()])
                    .collect()
            })
            .collect();

        Self::with_assignments(topology_id, segments)
    }

    pub fn topology_id(&self) -> TopologyId {
        self.topology_id
    }

    pub fn num_segments(&self) -> usize {
        self.segments.len()
    }

    /// Distinct members of this topology view, sorted.
    pub fn members(&self) -> &[NodeId] {
        &self.members
    }

    pub fn contains_member(&self, node: NodeId) -> bool {
        self.members.binary_search(&node).is_ok()
    }

    /// Whether every member of `other` is also a member of this snapshot.
    pub fn contains_members_of(&self, other: &ConsistentHashTopology) -> bool {
        other.members.iter().all(|m| self.contains_member(*m))
    }

    /// The segment a key hashes to.
    pub fn segment_of(&self, key: &SessionKey) -> usize {
        (key.routing_hash() % self.segments.len() as u64) as usize
    }

    /// The member serving the authoritative copy of `key`, if any.
    pub fn primary_owner(&self, key: &SessionKey) -> Option<NodeId> {
        self.segments[self.segment_of(key)].first().copied()
    }

    /// All owners of `key`, primary first.
    pub fn owners(&self, key: &SessionKey) -> &[NodeId] {
        &self.segments[self.segment_of(key)]
    }

    /// Segments for which `node` is the primary owner.
    pub fn primary_segments_for_owner(&self, node: NodeId) -> Vec<usize> {
        self.segments
            .iter()
            .enumerate()
            .filter(|(_, owners)| owners.first() == Some(&node))
            .map(|(segment, _)| segment)
            .collect()
    }

    /// Whether `node` is the primary owner of at least one segment.
    pub fn owns_primary_segments(&self, node: NodeId) -> bool {
        self.segments
            .iter()
            .any(|owners| owners.first() == Some(&node))
    }

    /// A successor snapshot with one member added, rebalanced.
    pub fn with_member(&self, topology_id: TopologyId, node: NodeId) -> Arc<Self> {
        let mut members = self.members.clone();
        if !members.contains(&node) {
            members.push(node);
        }
        let owners = self.segments.first().map_or(1, Vec::len);
        Arc::new(Self::balanced(
            topology_id,
            &members,
            self.segments.len(),
            owners,
        ))
    }

    /// A successor snapshot with one member removed, rebalanced.
    pub fn without_member(&self, topology_id: TopologyId, node: NodeId) -> Arc<Self> {
        let members: Vec<NodeId> = self.members.iter().copied().filter(|m| *m != node).collect();
        let owners = self.segments.first().map_or(1, Vec::len);
        Arc::new(Self::balanced(
            topology_id,
            &members,
            self.segments.len(),
            owners,
        ))
    }
}
