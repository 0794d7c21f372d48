//! Versioned cache topology snapshots and the rebalance phase machine.

use crate::config::{CacheConfig, CacheMode};
use crate::error::Result;
use crate::partitioning::{ConsistentHash, ConsistentHashFactory};
use crate::types::{NodeId, SegmentId, TopologyId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Global rebalance phase.
///
/// ```text
/// NoRebalance ──start──► ReadOldWriteAll ──all applied──► ReadAllWriteAll
///      ▲                                                        │
///      │                                          transfers done│
///      └────────────all confirmed──── ReadNewWriteAll ◄─────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    /// Stable, no pending hash.
    NoRebalance,
    /// Reads from old owners, writes to old and new owners.
    ReadOldWriteAll,
    /// Reads from either, writes to old and new owners.
    ReadAllWriteAll,
    /// Reads from new owners, writes to old and new owners.
    ReadNewWriteAll,
}

impl Phase {
    /// Whether a rebalance is in progress.
    pub fn is_rebalance(&self) -> bool {
        !matches!(self, Phase::NoRebalance)
    }

    /// Phase that follows once every member confirmed this one.
    pub fn next(&self) -> Phase {
        match self {
            Phase::NoRebalance => Phase::NoRebalance,
            Phase::ReadOldWriteAll => Phase::ReadAllWriteAll,
            Phase::ReadAllWriteAll => Phase::ReadNewWriteAll,
            Phase::ReadNewWriteAll => Phase::NoRebalance,
        }
    }
}

/// Whether a cache accepts operations after losing members.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AvailabilityMode {
    Available,
    /// Some segments lost all their owners; rebalancing is suspended.
    Degraded,
}

/// Immutable snapshot of a cache's ownership. Shared by reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheTopology {
    /// Increases with every change.
    pub topology_id: TopologyId,

    /// Increases when a rebalance starts.
    pub rebalance_id: u64,

    pub current_ch: Arc<ConsistentHash>,

    /// Target of the rebalance in progress.
    pub pending_ch: Option<Arc<ConsistentHash>>,

    /// Union of current and pending, used while rebalancing.
    pub union_ch: Option<Arc<ConsistentHash>>,

    pub phase: Phase,

    /// Members that take part in this topology and must confirm its phases.
    pub actual_members: Vec<NodeId>,

    /// Persistent identity of each member.
    pub persistent_uuids: Vec<(NodeId, Uuid)>,
}

impl CacheTopology {
    /// Stable topology over `current_ch`.
    pub fn stable(
        topology_id: TopologyId,
        rebalance_id: u64,
        current_ch: ConsistentHash,
        persistent_uuids: Vec<(NodeId, Uuid)>,
    ) -> Self {
        let actual_members = current_ch.members().to_vec();
        Self {
            topology_id,
            rebalance_id,
            current_ch: Arc::new(current_ch),
            pending_ch: None,
            union_ch: None,
            phase: Phase::NoRebalance,
            actual_members,
            persistent_uuids,
        }
    }

    /// Start a rebalance towards `pending`.
    pub fn start_rebalance(&self, factory: &ConsistentHashFactory, pending: ConsistentHash) -> Self {
        let union = factory.union(&self.current_ch, &pending);
        Self {
            topology_id: self.topology_id + 1,
            rebalance_id: self.rebalance_id + 1,
            current_ch: self.current_ch.clone(),
            actual_members: union.members().to_vec(),
            pending_ch: Some(Arc::new(pending)),
            union_ch: Some(Arc::new(union)),
            phase: Phase::ReadOldWriteAll,
            persistent_uuids: self.persistent_uuids.clone(),
        }
    }

    /// The topology for the next phase. Leaving `ReadNewWriteAll` folds the
    /// pending hash into the current one.
    pub fn advance_phase(&self) -> Self {
        match (self.phase.next(), &self.pending_ch) {
            (Phase::NoRebalance, Some(pending)) => {
                let members = pending.members().to_vec();
                Self {
                    topology_id: self.topology_id + 1,
                    rebalance_id: self.rebalance_id,
                    current_ch: pending.clone(),
                    pending_ch: None,
                    union_ch: None,
                    phase: Phase::NoRebalance,
                    persistent_uuids: self
                        .persistent_uuids
                        .iter()
                        .filter(|(n, _)| members.contains(n))
                        .copied()
                        .collect(),
                    actual_members: members,
                }
            }
            (next, _) => Self {
                topology_id: self.topology_id + 1,
                phase: next,
                ..self.clone()
            },
        }
    }

    /// Drop `leavers` from every hash, keeping the phase. Segments that lost
    /// all of their owners are reassigned by `update_members`.
    pub fn without_members(&self, factory: &ConsistentHashFactory, leavers: &[NodeId]) -> Self {
        let keep = |ch: &ConsistentHash| -> Vec<NodeId> {
            ch.members()
                .iter()
                .copied()
                .filter(|m| !leavers.contains(m))
                .collect()
        };
        let current = factory.update_members(&self.current_ch, &keep(&self.current_ch));
        let pending = self
            .pending_ch
            .as_ref()
            .map(|p| factory.update_members(p, &keep(p)));
        let union = pending.as_ref().map(|p| factory.union(&current, p));
        Self {
            topology_id: self.topology_id + 1,
            rebalance_id: self.rebalance_id,
            actual_members: self
                .actual_members
                .iter()
                .copied()
                .filter(|m| !leavers.contains(m))
                .collect(),
            current_ch: Arc::new(current),
            pending_ch: pending.map(Arc::new),
            union_ch: union.map(Arc::new),
            phase: self.phase,
            persistent_uuids: self
                .persistent_uuids
                .iter()
                .filter(|(n, _)| !leavers.contains(n))
                .copied()
                .collect(),
        }
    }

    /// Same ownership, new ids.
    pub fn with_ids(&self, topology_id: TopologyId, rebalance_id: u64) -> Self {
        Self {
            topology_id,
            rebalance_id,
            ..self.clone()
        }
    }

    pub fn is_stable(&self) -> bool {
        self.pending_ch.is_none()
    }

    pub fn members(&self) -> &[NodeId] {
        &self.actual_members
    }

    pub fn is_member(&self, node: NodeId) -> bool {
        self.actual_members.contains(&node)
    }

    pub fn num_segments(&self) -> usize {
        self.current_ch.num_segments()
    }

    /// Hash used to route reads in this phase.
    pub fn read_ch(&self) -> &ConsistentHash {
        match (self.phase, &self.pending_ch, &self.union_ch) {
            (Phase::ReadAllWriteAll, _, Some(union)) => union,
            (Phase::ReadNewWriteAll, Some(pending), _) => pending,
            _ => &self.current_ch,
        }
    }

    /// Hash used to route writes in this phase.
    pub fn write_ch(&self) -> &ConsistentHash {
        match &self.union_ch {
            Some(union) if self.phase.is_rebalance() => union,
            _ => &self.current_ch,
        }
    }

    pub fn read_owners(&self, segment: SegmentId) -> &[NodeId] {
        self.read_ch().locate_owners(segment)
    }

    pub fn write_owners(&self, segment: SegmentId) -> &[NodeId] {
        self.write_ch().locate_owners(segment)
    }

    /// Node that executes writes for a segment: the current primary.
    pub fn primary_owner(&self, segment: SegmentId) -> Option<NodeId> {
        self.write_ch().locate_primary(segment)
    }

    pub fn is_read_owner(&self, segment: SegmentId, node: NodeId) -> bool {
        self.read_ch().is_owner(segment, node)
    }

    pub fn is_write_owner(&self, segment: SegmentId, node: NodeId) -> bool {
        self.write_ch().is_owner(segment, node)
    }

    pub fn uuid_of(&self, node: NodeId) -> Option<Uuid> {
        self.persistent_uuids
            .iter()
            .find(|(n, _)| *n == node)
            .map(|(_, u)| *u)
    }
}

/// What a node tells the coordinator about its cache when joining.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheJoinInfo {
    pub mode: CacheMode,
    pub num_owners: usize,
    pub num_segments: usize,
    pub partition_handling: bool,
    pub persistent_uuid: Uuid,
}

impl CacheJoinInfo {
    pub fn new(config: &CacheConfig, persistent_uuid: Uuid) -> Self {
        Self {
            mode: config.mode,
            num_owners: config.num_owners,
            num_segments: config.num_segments,
            partition_handling: config.partition_handling,
            persistent_uuid,
        }
    }

    pub fn factory(&self) -> Result<ConsistentHashFactory> {
        ConsistentHashFactory::new(self.mode, self.num_owners, self.num_segments)
    }

    /// Whether two nodes agree on placement.
    pub fn is_compatible(&self, other: &CacheJoinInfo) -> bool {
        self.mode == other.mode
            && self.num_owners == other.num_owners
            && self.num_segments == other.num_segments
    }
}

/// A node's view of one cache, returned on join and on status requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStatusResponse {
    pub join_info: CacheJoinInfo,
    pub topology: Option<CacheTopology>,
    pub stable_topology: Option<CacheTopology>,
    pub availability: AvailabilityMode,
}
