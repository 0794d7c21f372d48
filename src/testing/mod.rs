//! In-process clusters for tests and embedded experiments.
//!
//! ```text
//! ┌──────────────────────────── TestCluster ────────────────────────────┐
//! │                                                                     │
//! │   GridNode 1        GridNode 2        GridNode 3                    │
//! │       │                 │                 │                         │
//! │       └────────── InMemoryNetwork ────────┘                         │
//! │                  kill / partition / heal                            │
//! │                                                                     │
//! │   views are installed on every live node, coordinator last          │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```

pub mod utils;

#[cfg(test)]
mod scenarios;

use crate::cache::GridCache;
use crate::cluster::ClusterView;
use crate::config::{CacheConfig, NodeConfig};
use crate::error::{Error, Result};
use crate::network::InMemoryNetwork;
use crate::node::GridNode;
use crate::topology::CacheTopology;
use crate::types::{NodeId, ViewId};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// A set of [`GridNode`]s connected by an [`InMemoryNetwork`].
#[derive(Debug)]
pub struct TestCluster {
    network: Arc<InMemoryNetwork>,
    nodes: BTreeMap<NodeId, Arc<GridNode>>,
    next_node: NodeId,
    view_id: ViewId,
    node_config: fn(NodeId) -> NodeConfig,
}

impl TestCluster {
    /// Node settings with short timeouts and generous retries.
    pub fn default_node_config(node_id: NodeId) -> NodeConfig {
        NodeConfig::new(node_id)
            .with_rpc_timeout(Duration::from_secs(2))
            .with_join_timeout(Duration::from_secs(10))
            .with_max_retries(10)
            .with_topology_wait_timeout(Duration::from_secs(2))
            .with_confirmation_retries(5)
    }

    /// Start `count` nodes sharing one view.
    pub async fn start(count: usize) -> Self {
        Self::with_node_config(count, Self::default_node_config).await
    }

    pub async fn with_node_config(count: usize, node_config: fn(NodeId) -> NodeConfig) -> Self {
        let mut cluster = Self {
            network: InMemoryNetwork::new(),
            nodes: BTreeMap::new(),
            next_node: 1,
            view_id: 0,
            node_config,
        };
        for _ in 0..count {
            cluster.spawn_node();
        }
        cluster.install_view(&cluster.members(), false).await;
        cluster
    }

    fn spawn_node(&mut self) -> NodeId {
        let id = self.next_node;
        self.next_node += 1;
        self.spawn_node_with_id(id);
        id
    }

    fn spawn_node_with_id(&mut self, id: NodeId) {
        let node = GridNode::new((self.node_config)(id), self.network.transport(id));
        self.network.register(id, node.clone());
        self.nodes.insert(id, node);
    }

    pub fn network(&self) -> &Arc<InMemoryNetwork> {
        &self.network
    }

    /// Live node ids in view order.
    pub fn members(&self) -> Vec<NodeId> {
        self.nodes.keys().copied().collect()
    }

    pub fn node(&self, id: NodeId) -> Option<Arc<GridNode>> {
        self.nodes.get(&id).cloned()
    }

    pub fn nodes(&self) -> Vec<Arc<GridNode>> {
        self.nodes.values().cloned().collect()
    }

    pub fn coordinator(&self) -> Option<Arc<GridNode>> {
        self.nodes.values().find(|n| n.is_coordinator()).cloned()
    }

    /// Install a new view on `members`; the view's coordinator goes last so
    /// every other member already knows the view when it acts on it.
    async fn install_view(&mut self, members: &[NodeId], merge: bool) {
        self.view_id += 1;
        let view = ClusterView::new(self.view_id, members.to_vec());
        info!(view_id = self.view_id, ?members, merge, "Installing test view");
        let mut order: Vec<NodeId> = members.iter().skip(1).copied().collect();
        order.extend(members.first().copied());
        for id in order {
            if let Some(node) = self.nodes.get(&id) {
                node.install_view(view.clone(), merge).await;
            }
        }
    }

    /// Add a node and install the enlarged view.
    pub async fn add_node(&mut self) -> NodeId {
        let id = self.spawn_node();
        self.install_view(&self.members(), false).await;
        id
    }

    /// Crash a node and install the view without it.
    pub async fn kill(&mut self, id: NodeId) {
        self.network.kill(id);
        self.nodes.remove(&id);
        self.install_view(&self.members(), false).await;
    }

    /// Bring a killed node back with empty state.
    pub async fn restart(&mut self, id: NodeId) {
        self.spawn_node_with_id(id);
        self.install_view(&self.members(), false).await;
    }

    /// Split the cluster; each group gets its own view.
    pub async fn partition(&mut self, groups: &[Vec<NodeId>]) {
        self.network.partition(groups);
        for group in groups {
            self.install_view(group, false).await;
        }
    }

    /// Heal every partition and install a merge view.
    pub async fn merge(&mut self) {
        self.network.heal();
        self.install_view(&self.members(), true).await;
    }

    /// Start `name` on every live node, one after the other.
    pub async fn start_cache(&self, name: &str, config: CacheConfig) -> Result<Vec<Arc<GridCache>>> {
        let mut caches = Vec::with_capacity(self.nodes.len());
        for node in self.nodes.values() {
            caches.push(node.start_cache(name, config.clone()).await?);
        }
        Ok(caches)
    }

    pub async fn start_cache_on(&self, id: NodeId, name: &str, config: CacheConfig) -> Result<Arc<GridCache>> {
        let node = self
            .node(id)
            .ok_or_else(|| Error::Internal(format!("no live node {id}")))?;
        node.start_cache(name, config).await
    }

    pub fn cache(&self, id: NodeId, name: &str) -> Option<Arc<GridCache>> {
        self.node(id).and_then(|n| n.cache(name))
    }

    /// Nodes running `name`.
    pub fn cache_members(&self, name: &str) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|(_, n)| n.cache(name).is_some())
            .map(|(id, _)| *id)
            .collect()
    }

    /// The stable topology every cache member agrees on, with the current
    /// hash spanning exactly the members and no transfer running.
    pub fn stable_topology(&self, name: &str) -> Option<Arc<CacheTopology>> {
        let members = self.cache_members(name);
        let caches: Vec<Arc<GridCache>> = members
            .iter()
            .filter_map(|id| self.cache(*id, name))
            .collect();
        let topology = caches.first()?.topology()?;
        let mut owners = topology.current_ch.members().to_vec();
        owners.sort_unstable();
        let agreed = topology.is_stable()
            && owners == members
            && caches.iter().all(|c| {
                !c.is_state_transfer_in_progress()
                    && c.topology().map(|t| t.topology_id) == Some(topology.topology_id)
            });
        let coordinator_agrees = self
            .coordinator()
            .and_then(|c| c.coordinator().cache_topology(name))
            .is_some_and(|t| t.topology_id == topology.topology_id);
        (agreed && coordinator_agrees).then_some(topology)
    }

    pub async fn wait_for_stable(&self, name: &str, timeout: Duration) -> Option<Arc<CacheTopology>> {
        utils::wait_for_result(
            || async { self.stable_topology(name) },
            Option::is_some,
            timeout,
        )
        .await
        .flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_views_follow_membership_changes() {
        let mut cluster = TestCluster::start(2).await;
        assert_eq!(cluster.members(), vec![1, 2]);
        assert_eq!(cluster.coordinator().unwrap().node_id(), 1);

        let id = cluster.add_node().await;
        assert_eq!(id, 3);
        for node in cluster.nodes() {
            assert_eq!(node.membership().members(), vec![1, 2, 3]);
        }

        cluster.kill(1).await;
        assert_eq!(cluster.coordinator().unwrap().node_id(), 2);
        assert!(!cluster.network().is_alive(1));

        cluster.partition(&[vec![2], vec![3]]).await;
        assert!(cluster.node(3).unwrap().is_coordinator());
        cluster.merge().await;
        assert_eq!(cluster.node(3).unwrap().membership().members(), vec![2, 3]);
        assert_eq!(cluster.coordinator().unwrap().node_id(), 2);
    }
}
