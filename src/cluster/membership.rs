//! View tracking and coordinator election.
//!
//! The group membership layer (not part of this crate) delivers ordered
//! views; this module keeps the latest one, derives joiners and leavers,
//! and elects the coordinator as the first member of the view.

use crate::cluster::events::{ClusterView, MemberEvent, MemberEventListener, ViewChange};
use crate::error::{Error, MembershipError, Result};
use crate::types::{NodeId, ViewId};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

/// Current cluster view of one node.
pub struct ClusterMembership {
    /// This node's ID.
    node_id: NodeId,

    view: RwLock<Option<ClusterView>>,

    /// Publishes the installed view id.
    view_tx: watch::Sender<ViewId>,

    /// Event listeners.
    listeners: RwLock<Vec<Arc<dyn MemberEventListener>>>,

    /// Channel for membership events.
    event_tx: mpsc::UnboundedSender<MemberEvent>,
}

impl ClusterMembership {
    /// Create a new membership tracker.
    pub fn new(node_id: NodeId) -> (Arc<Self>, mpsc::UnboundedReceiver<MemberEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (view_tx, _) = watch::channel(0);

        let membership = Arc::new(Self {
            node_id,
            view: RwLock::new(None),
            view_tx,
            listeners: RwLock::new(Vec::new()),
            event_tx,
        });

        (membership, event_rx)
    }

    /// Get this node's ID.
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Add an event listener.
    pub fn add_listener(&self, listener: Arc<dyn MemberEventListener>) {
        self.listeners.write().push(listener);
    }

    fn notify(&self, event: MemberEvent) {
        let _ = self.event_tx.send(event.clone());
        for listener in self.listeners.read().iter() {
            listener.on_event(event.clone());
        }
    }

    /// Install a view. Views with an id not above the current one are
    /// ignored and yield `None`.
    pub fn install_view(&self, view: ClusterView, merge: bool) -> Option<ViewChange> {
        let change = {
            let mut current = self.view.write();
            if let Some(existing) = current.as_ref() {
                if view.view_id <= existing.view_id {
                    debug!(
                        view_id = view.view_id,
                        current = existing.view_id,
                        "Ignoring old view"
                    );
                    return None;
                }
            }
            let previous = current.replace(view.clone());
            let (joiners, leavers) = match &previous {
                Some(prev) => (
                    view.members
                        .iter()
                        .copied()
                        .filter(|m| !prev.contains(*m))
                        .collect(),
                    prev.members
                        .iter()
                        .copied()
                        .filter(|m| !view.contains(*m))
                        .collect(),
                ),
                None => (view.members.clone(), Vec::new()),
            };
            ViewChange {
                previous,
                current: view,
                joiners,
                leavers,
                merge,
            }
        };

        info!(
            node_id = self.node_id,
            view_id = change.current.view_id,
            members = ?change.current.members,
            merge,
            "Installed cluster view"
        );
        self.view_tx.send_replace(change.current.view_id);
        for event in change.events() {
            self.notify(event);
        }
        Some(change)
    }

    pub fn view(&self) -> Option<ClusterView> {
        self.view.read().clone()
    }

    pub fn view_id(&self) -> ViewId {
        self.view.read().as_ref().map(|v| v.view_id).unwrap_or(0)
    }

    pub fn members(&self) -> Vec<NodeId> {
        self.view
            .read()
            .as_ref()
            .map(|v| v.members.clone())
            .unwrap_or_default()
    }

    pub fn is_member(&self, node: NodeId) -> bool {
        self.view.read().as_ref().is_some_and(|v| v.contains(node))
    }

    /// The coordinator of the current view.
    pub fn coordinator(&self) -> Result<NodeId> {
        self.view
            .read()
            .as_ref()
            .and_then(ClusterView::coordinator)
            .ok_or_else(|| MembershipError::NoView.into())
    }

    pub fn is_coordinator(&self) -> bool {
        self.coordinator().ok() == Some(self.node_id)
    }

    /// Block until a view with id at least `view_id` is installed.
    pub async fn wait_for_view(&self, view_id: ViewId, timeout: Duration) -> Result<()> {
        let mut rx = self.view_tx.subscribe();
        let result = match tokio::time::timeout(timeout, rx.wait_for(|v| *v >= view_id)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(Error::Cancelled),
            Err(_) => Err(Error::Timeout),
        };
        result
    }
}

impl std::fmt::Debug for ClusterMembership {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterMembership")
            .field("node_id", &self.node_id)
            .field("view", &*self.view.read())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_and_coordinator() {
        let (membership, mut rx) = ClusterMembership::new(2);
        assert!(membership.coordinator().is_err());

        let change = membership
            .install_view(ClusterView::new(1, vec![1, 2]), false)
            .unwrap();
        assert_eq!(change.joiners, vec![1, 2]);
        assert_eq!(membership.coordinator().unwrap(), 1);
        assert!(!membership.is_coordinator());

        let change = membership
            .install_view(ClusterView::new(2, vec![2, 3]), false)
            .unwrap();
        assert_eq!(change.leavers, vec![1]);
        assert_eq!(change.joiners, vec![3]);
        assert!(membership.is_coordinator());

        let mut events = Vec::new();
        while let Ok(e) = rx.try_recv() {
            events.push(e);
        }
        assert!(events.contains(&MemberEvent::NodeLeave { node_id: 1, view_id: 2 }));
    }

    #[test]
    fn test_old_view_ignored() {
        let (membership, _rx) = ClusterMembership::new(1);
        membership.install_view(ClusterView::new(5, vec![1]), false);
        assert!(membership
            .install_view(ClusterView::new(4, vec![1, 2]), false)
            .is_none());
        assert_eq!(membership.view_id(), 5);
    }

    #[tokio::test]
    async fn test_wait_for_view() {
        let (membership, _rx) = ClusterMembership::new(1);
        let waiter = {
            let membership = membership.clone();
            tokio::spawn(async move { membership.wait_for_view(3, Duration::from_secs(5)).await })
        };
        membership.install_view(ClusterView::new(3, vec![1]), false);
        assert!(waiter.await.unwrap().is_ok());

        let err = membership
            .wait_for_view(9, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout));
    }
}
