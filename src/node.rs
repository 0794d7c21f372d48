//! Per-node wiring.
//!
//! A [`GridNode`] owns the view, the transport, both topology managers and
//! the caches started on this node, and routes every inbound [`Message`] to
//! the component that handles it.

use crate::admin::TopologyAdmin;
use crate::cache::GridCache;
use crate::cluster::{ClusterMembership, ClusterView, LoggingEventListener, ViewChange};
use crate::config::{CacheConfig, NodeConfig};
use crate::error::{Error, Result};
use crate::network::rpc::unexpected;
use crate::network::{Message, MessageHandler, Transport};
use crate::rebalancing::{ClusterTopologyManager, DefaultRebalancePolicy, RebalancePolicy};
use crate::topology::{CacheJoinInfo, LocalTopologyManager};
use crate::types::NodeId;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub struct GridNode {
    config: NodeConfig,
    membership: Arc<ClusterMembership>,
    transport: Arc<dyn Transport>,
    local_topology: Arc<LocalTopologyManager>,
    coordinator: ClusterTopologyManager,
    caches: DashMap<String, Arc<GridCache>>,
    /// Identity that survives restarts of the same member.
    persistent_uuid: Uuid,
}

impl std::fmt::Debug for GridNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GridNode")
            .field("node_id", &self.config.node_id)
            .field("view_id", &self.membership.view_id())
            .field("caches", &self.caches.len())
            .finish()
    }
}

impl GridNode {
    pub fn new(config: NodeConfig, transport: Arc<dyn Transport>) -> Arc<Self> {
        Self::with_policy(config, transport, Arc::new(DefaultRebalancePolicy))
    }

    pub fn with_policy(
        config: NodeConfig,
        transport: Arc<dyn Transport>,
        policy: Arc<dyn RebalancePolicy>,
    ) -> Arc<Self> {
        let (membership, _events) = ClusterMembership::new(config.node_id);
        membership.add_listener(Arc::new(LoggingEventListener));
        let local_topology =
            LocalTopologyManager::new(config.clone(), membership.clone(), transport.clone());
        let coordinator = ClusterTopologyManager::new(
            config.clone(),
            membership.clone(),
            transport.clone(),
            policy,
        );
        info!(node_id = config.node_id, "Grid node created");
        Arc::new(Self {
            config,
            membership,
            transport,
            local_topology,
            coordinator,
            caches: DashMap::new(),
            persistent_uuid: Uuid::new_v4(),
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.config.node_id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn membership(&self) -> &Arc<ClusterMembership> {
        &self.membership
    }

    pub fn is_coordinator(&self) -> bool {
        self.membership.is_coordinator()
    }

    pub fn local_topology(&self) -> &Arc<LocalTopologyManager> {
        &self.local_topology
    }

    pub fn coordinator(&self) -> &ClusterTopologyManager {
        &self.coordinator
    }

    pub fn admin(&self) -> TopologyAdmin<'_> {
        TopologyAdmin::new(self)
    }

    /// Install a view delivered by the group membership layer.
    pub async fn install_view(&self, view: ClusterView, merge: bool) -> Option<ViewChange> {
        let change = self.membership.install_view(view, merge)?;
        if !change.leavers.is_empty() {
            for cache in self.caches() {
                cache.release_orphans(&change.current.members);
            }
        }
        self.coordinator.handle_view_change(&change).await;
        Some(change)
    }

    pub fn cache(&self, name: &str) -> Option<Arc<GridCache>> {
        self.caches.get(name).map(|c| c.value().clone())
    }

    pub fn caches(&self) -> Vec<Arc<GridCache>> {
        self.caches.iter().map(|c| c.value().clone()).collect()
    }

    fn running(&self, name: &str) -> Result<Arc<GridCache>> {
        self.cache(name)
            .ok_or_else(|| Error::CacheNotFound(name.to_string()))
    }

    /// Start `name` on this node and join it through the coordinator.
    ///
    /// With `await_initial_transfer` the call returns once this node owns
    /// its segments in a stable topology and received their data. While
    /// rebalancing is suspended cluster-wide the node cannot become an
    /// owner, so the call returns right after the join.
    pub async fn start_cache(&self, name: &str, config: CacheConfig) -> Result<Arc<GridCache>> {
        if let Some(existing) = self.cache(name) {
            return Ok(existing);
        }
        config.validate()?;
        let cache = Arc::new(GridCache::new(
            name,
            config.clone(),
            &self.config,
            self.transport.clone(),
            self.local_topology.confirmation_sender(),
        )?);
        // reachable before the join: commands and state may arrive right after it
        self.caches.insert(name.to_string(), cache.clone());

        let join_info = CacheJoinInfo::new(&config, self.persistent_uuid);
        if let Err(e) = self
            .local_topology
            .join(name, join_info, cache.topology_handler(), cache.metrics())
            .await
        {
            self.caches.remove(name);
            cache.stop();
            return Err(e);
        }

        if config.await_initial_transfer {
            if self.local_topology.is_rebalancing_enabled() {
                cache
                    .wait_for_initial_transfer(config.state_transfer.timeout)
                    .await?;
            } else {
                info!(cache = name, "Rebalancing suspended, not waiting for initial transfer");
            }
        }
        info!(cache = name, node_id = self.config.node_id, "Cache started");
        Ok(cache)
    }

    /// Leave `name` and drop its local state.
    pub async fn stop_cache(&self, name: &str) -> Result<()> {
        let Some((_, cache)) = self.caches.remove(name) else {
            return Err(Error::CacheNotFound(name.to_string()));
        };
        cache.stop();
        self.local_topology.leave(name).await
    }

    async fn dispatch(&self, from: NodeId, msg: Message) -> Result<Message> {
        match msg {
            Message::Join {
                cache,
                joiner,
                join_info,
                view_id,
            } => self
                .coordinator
                .handle_join(&cache, joiner, join_info, view_id)
                .await
                .map(Message::CacheStatus),
            Message::Leave {
                cache,
                leaver,
                view_id,
            } => {
                self.coordinator.handle_leave(&cache, leaver, view_id).await?;
                Ok(Message::Ack)
            }
            Message::RebalancePhaseConfirm {
                cache,
                node,
                topology_id,
                view_id,
            } => {
                self.coordinator
                    .handle_phase_confirm(&cache, node, topology_id, view_id)
                    .await?;
                Ok(Message::Ack)
            }
            Message::RebalancePolicyUpdate { cache, enabled } => {
                self.coordinator
                    .set_rebalancing_enabled(cache.as_deref(), enabled)
                    .await?;
                Ok(Message::Ack)
            }
            Message::ForceRebalance { cache } => {
                self.coordinator.force_rebalance(&cache).await?;
                Ok(Message::Ack)
            }
            Message::RebalancingStatusRequest { cache } => self
                .coordinator
                .rebalancing_status(&cache)
                .await
                .map(Message::RebalancingStatus),
            Message::AvailabilityModeUpdate { cache, mode } => {
                self.coordinator.set_availability_mode(&cache, mode).await?;
                Ok(Message::Ack)
            }
            Message::RebalanceStart { cache, topology, .. } => {
                self.local_topology.handle_rebalance(&cache, topology).await?;
                Ok(Message::Ack)
            }
            Message::TopologyUpdate {
                cache,
                topology,
                availability,
                ..
            } => {
                self.local_topology
                    .handle_topology_update(&cache, topology, availability)
                    .await?;
                Ok(Message::Ack)
            }
            Message::StableTopologyUpdate { cache, topology, .. } => {
                self.local_topology
                    .handle_stable_topology_update(&cache, topology);
                Ok(Message::Ack)
            }
            Message::RebalancingEnabled { enabled } => {
                debug!(from, enabled, "Coordinator announced rebalancing flag");
                self.local_topology.set_rebalancing_enabled_local(enabled);
                Ok(Message::Ack)
            }
            Message::StatusRequest { view_id } => {
                debug!(from, view_id, "Reporting status to new coordinator");
                Ok(Message::ManagerStatus(
                    self.local_topology.handle_status_request(),
                ))
            }
            Message::StateRequest(request) => {
                self.running(&request.cache)?
                    .handle_state_request(request)
                    .await
            }
            Message::StateResponse(response) => {
                self.running(&response.cache)?
                    .handle_state_response(from, response)
                    .await?;
                Ok(Message::Ack)
            }
            Message::Command(envelope) => self
                .running(&envelope.cache)?
                .handle_remote_command(from, envelope)
                .await
                .map(Message::CommandResult),
            other => {
                warn!(from, kind = other.kind(), "Response received as a request");
                Err(unexpected(&other))
            }
        }
    }
}

#[async_trait]
impl MessageHandler for GridNode {
    async fn handle(&self, from: NodeId, msg: Message) -> Message {
        Message::from_result(self.dispatch(from, msg).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::InMemoryNetwork;
    use std::time::Duration;

    fn config(node_id: NodeId) -> NodeConfig {
        NodeConfig::new(node_id)
            .with_rpc_timeout(Duration::from_secs(2))
            .with_join_timeout(Duration::from_secs(5))
            .with_topology_wait_timeout(Duration::from_secs(2))
    }

    #[tokio::test]
    async fn test_single_node_start_and_stop() {
        let network = InMemoryNetwork::new();
        let node = GridNode::new(config(1), network.transport(1));
        network.register(1, node.clone());
        node.install_view(ClusterView::new(1, vec![1]), false).await;
        assert!(node.is_coordinator());

        let cache = node
            .start_cache("c", CacheConfig::distributed(2).with_num_segments(8))
            .await
            .unwrap();
        let topology = cache.topology().unwrap();
        assert_eq!(topology.members(), &[1]);
        cache.put("k", "v").await.unwrap();
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some(&b"v"[..]));

        node.stop_cache("c").await.unwrap();
        assert!(node.cache("c").is_none());
        assert!(node.coordinator().cache_topology("c").is_none());
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let network = InMemoryNetwork::new();
        let node = GridNode::new(config(1), network.transport(1));
        network.register(1, node.clone());
        node.install_view(ClusterView::new(1, vec![1]), false).await;
        let err = node
            .start_cache("c", CacheConfig::distributed(0))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(node.cache("c").is_none());
    }

    #[tokio::test]
    async fn test_commands_for_unknown_cache() {
        let network = InMemoryNetwork::new();
        let node = GridNode::new(config(1), network.transport(1));
        let reply = node.handle(2, Message::ForceRebalance { cache: "nope".into() }).await;
        assert!(matches!(reply, Message::Error(_)));
        let reply = node.handle(2, Message::Ack).await;
        assert!(matches!(reply, Message::Error(_)));
    }
}
