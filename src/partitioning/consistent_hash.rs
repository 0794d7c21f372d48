//! Segment ownership table.
//!
//! A `ConsistentHash` is an immutable, precomputed mapping from every
//! segment to its ordered owner list. The first owner is the primary, the
//! rest are backups. Lookups are plain indexing; the table is only rebuilt
//! by [`ConsistentHashFactory`](super::ConsistentHashFactory).

use crate::types::{NodeId, SegmentId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// Ordered owner lists for every segment over a member list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsistentHash {
    /// Configured replication factor.
    num_owners: usize,

    /// Every member owns every segment.
    replicated: bool,

    /// Members in placement order.
    members: Vec<NodeId>,

    /// Owners per segment, primary first.
    segment_owners: Vec<Vec<NodeId>>,
}

impl ConsistentHash {
    pub(crate) fn from_parts(
        num_owners: usize,
        replicated: bool,
        members: Vec<NodeId>,
        segment_owners: Vec<Vec<NodeId>>,
    ) -> Self {
        Self {
            num_owners,
            replicated,
            members,
            segment_owners,
        }
    }

    /// Configured replication factor.
    pub fn num_owners(&self) -> usize {
        self.num_owners
    }

    pub fn is_replicated(&self) -> bool {
        self.replicated
    }

    /// Number of owners every segment should have over the current members.
    pub fn effective_num_owners(&self) -> usize {
        if self.replicated {
            self.members.len()
        } else {
            self.num_owners.min(self.members.len())
        }
    }

    pub fn num_segments(&self) -> usize {
        self.segment_owners.len()
    }

    pub fn members(&self) -> &[NodeId] {
        &self.members
    }

    pub fn is_member(&self, node: NodeId) -> bool {
        self.members.contains(&node)
    }

    /// Owners of a segment, primary first. Empty for an unknown segment.
    pub fn locate_owners(&self, segment: SegmentId) -> &[NodeId] {
        self.segment_owners
            .get(segment as usize)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Primary owner of a segment.
    pub fn locate_primary(&self, segment: SegmentId) -> Option<NodeId> {
        self.locate_owners(segment).first().copied()
    }

    pub fn is_owner(&self, segment: SegmentId, node: NodeId) -> bool {
        self.locate_owners(segment).contains(&node)
    }

    pub fn is_primary(&self, segment: SegmentId, node: NodeId) -> bool {
        self.locate_primary(segment) == Some(node)
    }

    /// All segments a node owns, primary or backup.
    pub fn segments_for_owner(&self, node: NodeId) -> BTreeSet<SegmentId> {
        self.segment_owners
            .iter()
            .enumerate()
            .filter(|(_, owners)| owners.contains(&node))
            .map(|(segment, _)| segment as SegmentId)
            .collect()
    }

    /// Segments for which a node is the primary.
    pub fn primary_segments_for_owner(&self, node: NodeId) -> BTreeSet<SegmentId> {
        self.segment_owners
            .iter()
            .enumerate()
            .filter(|(_, owners)| owners.first() == Some(&node))
            .map(|(segment, _)| segment as SegmentId)
            .collect()
    }

    /// Number of primary segments per member.
    pub fn primary_counts(&self) -> HashMap<NodeId, usize> {
        let mut counts: HashMap<NodeId, usize> = self.members.iter().map(|&m| (m, 0)).collect();
        for owners in &self.segment_owners {
            if let Some(primary) = owners.first() {
                *counts.entry(*primary).or_insert(0) += 1;
            }
        }
        counts
    }

    /// Number of owned segments per member.
    pub fn owned_counts(&self) -> HashMap<NodeId, usize> {
        let mut counts: HashMap<NodeId, usize> = self.members.iter().map(|&m| (m, 0)).collect();
        for owners in &self.segment_owners {
            for owner in owners {
                *counts.entry(*owner).or_insert(0) += 1;
            }
        }
        counts
    }

    pub(crate) fn segment_owners(&self) -> &[Vec<NodeId>] {
        &self.segment_owners
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ConsistentHash {
        ConsistentHash::from_parts(
            2,
            false,
            vec![1, 2, 3],
            vec![vec![1, 2], vec![2, 3], vec![3, 1], vec![1, 3]],
        )
    }

    #[test]
    fn test_lookups() {
        let ch = sample();
        assert_eq!(ch.num_segments(), 4);
        assert_eq!(ch.locate_owners(1), &[2, 3]);
        assert_eq!(ch.locate_primary(2), Some(3));
        assert!(ch.is_owner(0, 2));
        assert!(!ch.is_primary(0, 2));
        assert!(ch.locate_owners(99).is_empty());
    }

    #[test]
    fn test_segments_for_owner() {
        let ch = sample();
        assert_eq!(ch.segments_for_owner(1), BTreeSet::from([0, 2, 3]));
        assert_eq!(ch.primary_segments_for_owner(1), BTreeSet::from([0, 3]));
        assert_eq!(ch.primary_counts()[&2], 1);
        assert_eq!(ch.owned_counts()[&3], 3);
    }

    #[test]
    fn test_effective_owners() {
        let ch = ConsistentHash::from_parts(3, false, vec![1, 2], vec![vec![1, 2]]);
        assert_eq!(ch.effective_num_owners(), 2);
        let replicated = ConsistentHash::from_parts(1, true, vec![1, 2, 3], vec![vec![1, 2, 3]]);
        assert_eq!(replicated.effective_num_owners(), 3);
    }
}
