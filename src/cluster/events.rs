//! Cluster views and membership events.

use crate::types::{NodeId, ViewId};
use serde::{Deserialize, Serialize};

/// An ordered membership list agreed by the group membership layer.
/// The first member is the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterView {
    pub view_id: ViewId,
    pub members: Vec<NodeId>,
}

impl ClusterView {
    pub fn new(view_id: ViewId, members: Vec<NodeId>) -> Self {
        Self { view_id, members }
    }

    /// Coordinator elected by view order.
    pub fn coordinator(&self) -> Option<NodeId> {
        self.members.first().copied()
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.members.contains(&node)
    }
}

/// Events related to cluster membership changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemberEvent {
    /// A node entered the view.
    NodeJoin { node_id: NodeId, view_id: ViewId },

    /// A node left the view, gracefully or by crashing.
    NodeLeave { node_id: NodeId, view_id: ViewId },

    /// The coordinator changed.
    CoordinatorChange {
        previous: Option<NodeId>,
        current: NodeId,
        view_id: ViewId,
    },

    /// Partitions healed and their views merged.
    Merge { view_id: ViewId, members: usize },
}

impl MemberEvent {
    pub fn view_id(&self) -> ViewId {
        match self {
            MemberEvent::NodeJoin { view_id, .. }
            | MemberEvent::NodeLeave { view_id, .. }
            | MemberEvent::CoordinatorChange { view_id, .. }
            | MemberEvent::Merge { view_id, .. } => *view_id,
        }
    }

    /// Check if this is a leave-type event.
    pub fn is_leave(&self) -> bool {
        matches!(self, MemberEvent::NodeLeave { .. })
    }
}

/// Difference between two consecutive views.
#[derive(Debug, Clone)]
pub struct ViewChange {
    pub previous: Option<ClusterView>,
    pub current: ClusterView,
    pub joiners: Vec<NodeId>,
    pub leavers: Vec<NodeId>,
    /// The view merges previously separated partitions.
    pub merge: bool,
}

impl ViewChange {
    pub fn coordinator_changed(&self) -> bool {
        self.previous.as_ref().and_then(ClusterView::coordinator) != self.current.coordinator()
    }

    /// Events describing this change, in notification order.
    pub fn events(&self) -> Vec<MemberEvent> {
        let view_id = self.current.view_id;
        let mut events = Vec::new();
        if self.merge {
            events.push(MemberEvent::Merge {
                view_id,
                members: self.current.members.len(),
            });
        }
        events.extend(
            self.leavers
                .iter()
                .map(|&node_id| MemberEvent::NodeLeave { node_id, view_id }),
        );
        events.extend(
            self.joiners
                .iter()
                .map(|&node_id| MemberEvent::NodeJoin { node_id, view_id }),
        );
        if self.coordinator_changed() {
            if let Some(current) = self.current.coordinator() {
                events.push(MemberEvent::CoordinatorChange {
                    previous: self.previous.as_ref().and_then(ClusterView::coordinator),
                    current,
                    view_id,
                });
            }
        }
        events
    }
}

/// Listener for membership events.
pub trait MemberEventListener: Send + Sync + 'static {
    /// Called when a membership event occurs.
    fn on_event(&self, event: MemberEvent);
}

/// Event listener that logs events.
pub struct LoggingEventListener;

impl MemberEventListener for LoggingEventListener {
    fn on_event(&self, event: MemberEvent) {
        match &event {
            MemberEvent::NodeJoin { node_id, view_id } => {
                tracing::info!(node_id, view_id, "Node joined cluster");
            }
            MemberEvent::NodeLeave { node_id, view_id } => {
                tracing::info!(node_id, view_id, "Node left cluster");
            }
            MemberEvent::CoordinatorChange {
                previous,
                current,
                view_id,
            } => {
                tracing::info!(?previous, current, view_id, "Coordinator changed");
            }
            MemberEvent::Merge { view_id, members } => {
                tracing::warn!(view_id, members, "Cluster partitions merged");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_view_coordinator() {
        let view = ClusterView::new(3, vec![4, 1, 2]);
        assert_eq!(view.coordinator(), Some(4));
        assert!(view.contains(1));
        assert_eq!(ClusterView::new(1, vec![]).coordinator(), None);
    }

    #[test]
    fn test_change_events() {
        let change = ViewChange {
            previous: Some(ClusterView::new(1, vec![1, 2, 3])),
            current: ClusterView::new(2, vec![2, 3, 4]),
            joiners: vec![4],
            leavers: vec![1],
            merge: false,
        };
        assert!(change.coordinator_changed());
        let events = change.events();
        assert_eq!(events[0], MemberEvent::NodeLeave { node_id: 1, view_id: 2 });
        assert_eq!(events[1], MemberEvent::NodeJoin { node_id: 4, view_id: 2 });
        assert!(matches!(
            events[2],
            MemberEvent::CoordinatorChange {
                previous: Some(1),
                current: 2,
                ..
            }
        ));
        assert!(events[0].is_leave());
    }
}
