//! Tracking of phase confirmations on the coordinator.

use crate::types::{NodeId, TopologyId};
use std::collections::BTreeSet;

/// Members still to confirm one topology.
#[derive(Debug, Default)]
pub struct ConfirmationCollector {
    topology_id: Option<TopologyId>,
    waiting: BTreeSet<NodeId>,
}

impl ConfirmationCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start collecting for `topology_id` from `members`.
    pub fn reset(&mut self, topology_id: TopologyId, members: &[NodeId]) {
        self.topology_id = Some(topology_id);
        self.waiting = members.iter().copied().collect();
    }

    pub fn clear(&mut self) {
        self.topology_id = None;
        self.waiting.clear();
    }

    pub fn is_active(&self) -> bool {
        self.topology_id.is_some()
    }

    /// Record a confirmation. Returns true when it was the last one missing.
    /// Confirmations for any other topology are ignored.
    pub fn confirm(&mut self, node: NodeId, topology_id: TopologyId) -> bool {
        if self.topology_id != Some(topology_id) || !self.waiting.remove(&node) {
            return false;
        }
        self.waiting.is_empty()
    }

    pub fn awaiting(&self) -> &BTreeSet<NodeId> {
        &self.waiting
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completes_on_last_member() {
        let mut c = ConfirmationCollector::new();
        c.reset(7, &[1, 2, 3]);
        assert!(!c.confirm(1, 7));
        assert!(!c.confirm(1, 7));
        assert!(!c.confirm(2, 6));
        assert!(!c.confirm(2, 7));
        assert_eq!(c.awaiting(), &BTreeSet::from([3]));
        assert!(c.confirm(3, 7));
    }

    #[test]
    fn test_cleared_collector_ignores_everything() {
        let mut c = ConfirmationCollector::new();
        c.reset(2, &[1]);
        c.clear();
        assert!(!c.is_active());
        assert!(!c.confirm(1, 2));
    }
}
