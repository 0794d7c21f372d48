//! Cluster-wide topology management on the coordinator.
//!
//! Only the first member of the current view acts on these requests. Other
//! nodes answer with `NotCoordinator` so the sender retries once its view
//! catches up. A node that becomes coordinator rebuilds every cache's state
//! from what the members report.

use crate::cluster::{ClusterMembership, ViewChange};
use crate::config::NodeConfig;
use crate::error::{Error, MembershipError, Result};
use crate::network::{Message, Transport};
use crate::rebalancing::cache_status::{ClusterCacheStatus, CoordinatorContext};
use crate::rebalancing::policy::{RebalancePolicy, RebalancingStatus};
use crate::topology::{AvailabilityMode, CacheJoinInfo, CacheStatusResponse, CacheTopology};
use crate::types::{NodeId, TopologyId, ViewId};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

pub struct ClusterTopologyManager {
    local: NodeId,
    config: NodeConfig,
    membership: Arc<ClusterMembership>,
    transport: Arc<dyn Transport>,
    policy: Arc<dyn RebalancePolicy>,
    caches: DashMap<String, Arc<ClusterCacheStatus>>,
    /// Cluster-wide rebalancing flag.
    rebalancing_enabled: AtomicBool,
    /// Held for writing while the cache statuses are rebuilt.
    recovery: RwLock<()>,
}

impl std::fmt::Debug for ClusterTopologyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterTopologyManager")
            .field("local", &self.local)
            .field("caches", &self.caches.len())
            .field("rebalancing_enabled", &self.is_rebalancing_enabled())
            .finish()
    }
}

impl ClusterTopologyManager {
    pub fn new(
        config: NodeConfig,
        membership: Arc<ClusterMembership>,
        transport: Arc<dyn Transport>,
        policy: Arc<dyn RebalancePolicy>,
    ) -> Self {
        Self {
            local: config.node_id,
            rebalancing_enabled: AtomicBool::new(config.rebalancing_enabled),
            config,
            membership,
            transport,
            policy,
            caches: DashMap::new(),
            recovery: RwLock::new(()),
        }
    }

    pub fn is_rebalancing_enabled(&self) -> bool {
        self.rebalancing_enabled.load(Ordering::Acquire)
    }

    fn ctx(&self) -> CoordinatorContext<'_> {
        CoordinatorContext {
            policy: self.policy.as_ref(),
            cluster_enabled: self.is_rebalancing_enabled(),
            view_id: self.membership.view_id(),
        }
    }

    fn check_coordinator(&self) -> Result<()> {
        if self.membership.is_coordinator() {
            return Ok(());
        }
        let node = self.membership.coordinator().unwrap_or(self.local);
        Err(Error::NotCoordinator { node })
    }

    fn status(&self, cache: &str) -> Result<Arc<ClusterCacheStatus>> {
        self.caches
            .get(cache)
            .map(|s| s.value().clone())
            .ok_or_else(|| Error::CacheNotFound(cache.to_string()))
    }

    /// Wait until this node's view is at least `view_id`.
    async fn catch_up(&self, view_id: ViewId) -> Result<()> {
        if view_id > self.membership.view_id() {
            debug!(view_id, local = self.membership.view_id(), "Waiting for newer view");
            self.membership
                .wait_for_view(view_id, self.config.topology_wait_timeout)
                .await?;
        }
        Ok(())
    }

    pub async fn handle_join(
        &self,
        cache: &str,
        joiner: NodeId,
        join_info: CacheJoinInfo,
        view_id: ViewId,
    ) -> Result<CacheStatusResponse> {
        self.catch_up(view_id).await?;
        let _recovery = self.recovery.read().await;
        self.check_coordinator()?;
        if !self.membership.is_member(joiner) {
            return Err(MembershipError::NodeNotInView(joiner).into());
        }
        let existing = self.caches.get(cache).map(|s| s.value().clone());
        let status = match existing {
            Some(existing) => existing,
            None => {
                let created = Arc::new(ClusterCacheStatus::new(
                    cache,
                    join_info.clone(),
                    self.transport.clone(),
                    self.config.rpc_timeout,
                )?);
                self.caches
                    .entry(cache.to_string())
                    .or_insert(created)
                    .value()
                    .clone()
            }
        };
        info!(cache, joiner, "Join request");
        status.join(joiner, &join_info, &self.ctx())
    }

    pub async fn handle_leave(&self, cache: &str, leaver: NodeId, view_id: ViewId) -> Result<()> {
        self.catch_up(view_id).await?;
        let _recovery = self.recovery.read().await;
        self.check_coordinator()?;
        let Ok(status) = self.status(cache) else {
            debug!(cache, leaver, "Leave for an unknown cache");
            return Ok(());
        };
        info!(cache, leaver, "Leave request");
        if status.remove_members(&[leaver], &self.ctx()) {
            self.caches.remove(cache);
        }
        Ok(())
    }

    pub async fn handle_phase_confirm(
        &self,
        cache: &str,
        node: NodeId,
        topology_id: TopologyId,
        view_id: ViewId,
    ) -> Result<()> {
        self.catch_up(view_id).await?;
        let _recovery = self.recovery.read().await;
        self.check_coordinator()?;
        match self.status(cache) {
            Ok(status) => status.confirm(node, topology_id, &self.ctx()),
            Err(_) => debug!(cache, node, topology_id, "Confirmation for an unknown cache"),
        }
        Ok(())
    }

    /// Toggle rebalancing for one cache, or cluster-wide with `cache: None`.
    pub async fn set_rebalancing_enabled(&self, cache: Option<&str>, enabled: bool) -> Result<()> {
        let _recovery = self.recovery.read().await;
        self.check_coordinator()?;
        match cache {
            Some(cache) => self.status(cache)?.set_rebalancing_enabled(enabled, &self.ctx()),
            None => {
                info!(enabled, "Cluster rebalancing toggled");
                self.rebalancing_enabled.store(enabled, Ordering::Release);
                self.announce_rebalancing_enabled().await;
                if enabled {
                    let ctx = self.ctx();
                    for status in self.statuses() {
                        status.maybe_rebalance(&ctx);
                    }
                }
            }
        }
        Ok(())
    }

    async fn announce_rebalancing_enabled(&self) {
        self.announce_rebalancing_enabled_to(&self.membership.members())
            .await;
    }

    async fn announce_rebalancing_enabled_to(&self, targets: &[NodeId]) {
        let msg = Message::RebalancingEnabled {
            enabled: self.is_rebalancing_enabled(),
        };
        for (node, result) in self
            .transport
            .broadcast(targets, msg, self.config.rpc_timeout)
            .await
        {
            if let Err(e) = result.and_then(Message::expect_ack) {
                warn!(node, error = %e, "Rebalancing flag not acknowledged");
            }
        }
    }

    pub async fn force_rebalance(&self, cache: &str) -> Result<()> {
        let _recovery = self.recovery.read().await;
        self.check_coordinator()?;
        self.status(cache)?.force_rebalance(&self.ctx());
        Ok(())
    }

    pub async fn rebalancing_status(&self, cache: &str) -> Result<RebalancingStatus> {
        let _recovery = self.recovery.read().await;
        self.check_coordinator()?;
        Ok(self.status(cache)?.rebalancing_status(&self.ctx()))
    }

    pub async fn set_availability_mode(&self, cache: &str, mode: AvailabilityMode) -> Result<()> {
        let _recovery = self.recovery.read().await;
        self.check_coordinator()?;
        self.status(cache)?.set_availability(mode, &self.ctx());
        Ok(())
    }

    /// The coordinator's current topology for `cache`.
    pub fn cache_topology(&self, cache: &str) -> Option<CacheTopology> {
        self.caches.get(cache).and_then(|s| s.topology())
    }

    fn statuses(&self) -> Vec<Arc<ClusterCacheStatus>> {
        self.caches.iter().map(|e| e.value().clone()).collect()
    }

    /// React to a new cluster view.
    pub async fn handle_view_change(&self, change: &ViewChange) {
        if !self.membership.is_coordinator() {
            if !self.caches.is_empty() {
                info!(view_id = change.current.view_id, "No longer coordinator");
                self.caches.clear();
            }
            return;
        }
        if change.previous.is_none() || change.coordinator_changed() || change.merge {
            self.recover(change.current.view_id, change.merge).await;
            return;
        }
        if !change.joiners.is_empty() && !self.is_rebalancing_enabled() {
            // joiners start with rebalancing enabled
            self.announce_rebalancing_enabled_to(&change.joiners).await;
        }
        if change.leavers.is_empty() {
            return;
        }

        let _recovery = self.recovery.read().await;
        let ctx = self.ctx();
        for status in self.statuses() {
            if status.remove_members(&change.leavers, &ctx) {
                info!(cache = status.name(), "Cache has no members left");
                self.caches.remove(status.name());
            }
        }
    }

    /// Rebuild every cache's state from the members' reports.
    async fn recover(&self, view_id: ViewId, merge: bool) {
        let _recovery = self.recovery.write().await;
        let members = self.membership.members();
        info!(view_id, merge, ?members, "Recovering cluster topology");

        let responses = self
            .transport
            .broadcast(
                &members,
                Message::StatusRequest { view_id },
                self.config.rpc_timeout,
            )
            .await;
        let mut enabled = self.is_rebalancing_enabled();
        let mut reports: BTreeMap<String, Vec<(NodeId, CacheStatusResponse)>> = BTreeMap::new();
        for (node, response) in responses {
            match response {
                Ok(Message::ManagerStatus(status)) => {
                    enabled &= status.rebalancing_enabled;
                    for (cache, cache_status) in status.caches {
                        reports.entry(cache).or_default().push((node, cache_status));
                    }
                }
                Ok(other) => warn!(node, kind = other.kind(), "Unexpected status response"),
                Err(e) => warn!(node, error = %e, "Member did not report its status"),
            }
        }
        self.rebalancing_enabled.store(enabled, Ordering::Release);

        self.caches.clear();
        let ctx = self.ctx();
        for (cache, statuses) in reports {
            match ClusterCacheStatus::recover(
                &cache,
                statuses,
                merge,
                self.transport.clone(),
                self.config.rpc_timeout,
                &ctx,
            ) {
                Ok(status) => {
                    self.caches.insert(cache, Arc::new(status));
                }
                Err(e) => warn!(%cache, error = %e, "Failed to recover cache"),
            }
        }
        self.announce_rebalancing_enabled().await;
        info!(view_id, caches = self.caches.len(), "Cluster topology recovered");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ClusterView;
    use crate::config::CacheConfig;
    use crate::network::{InMemoryNetwork, MessageHandler};
    use crate::rebalancing::policy::DefaultRebalancePolicy;
    use crate::topology::ManagerStatusResponse;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use uuid::Uuid;

    /// A member that reports a fixed status and acknowledges the rest.
    #[derive(Default)]
    struct Member {
        caches: Mutex<Vec<(String, CacheStatusResponse)>>,
        flags: Mutex<Vec<bool>>,
    }

    #[async_trait]
    impl MessageHandler for Member {
        async fn handle(&self, _from: NodeId, msg: Message) -> Message {
            match msg {
                Message::StatusRequest { .. } => Message::ManagerStatus(ManagerStatusResponse {
                    caches: self.caches.lock().clone(),
                    rebalancing_enabled: true,
                }),
                Message::RebalancingEnabled { enabled } => {
                    self.flags.lock().push(enabled);
                    Message::Ack
                }
                _ => Message::Ack,
            }
        }
    }

    fn join_info() -> CacheJoinInfo {
        CacheJoinInfo::new(&CacheConfig::distributed(2).with_num_segments(8), Uuid::new_v4())
    }

    fn setup(local: NodeId, view: Vec<NodeId>) -> (ClusterTopologyManager, Arc<ClusterMembership>, Vec<Arc<Member>>) {
        let network = InMemoryNetwork::new();
        let members: Vec<Arc<Member>> = view.iter().map(|_| Arc::new(Member::default())).collect();
        for (node, member) in view.iter().zip(&members) {
            network.register(*node, member.clone());
        }
        let (membership, _events) = ClusterMembership::new(local);
        membership.install_view(ClusterView::new(1, view), false);
        let manager = ClusterTopologyManager::new(
            NodeConfig::new(local),
            membership.clone(),
            network.transport(local),
            Arc::new(DefaultRebalancePolicy),
        );
        (manager, membership, members)
    }

    #[tokio::test]
    async fn test_non_coordinator_rejects_join() {
        let (manager, _membership, _members) = setup(2, vec![1, 2]);
        let err = manager.handle_join("c", 2, join_info(), 1).await.unwrap_err();
        assert!(matches!(err, Error::NotCoordinator { node: 1 }));
    }

    #[tokio::test]
    async fn test_join_requires_view_membership() {
        let (manager, _membership, _members) = setup(1, vec![1, 2]);
        let err = manager.handle_join("c", 5, join_info(), 1).await.unwrap_err();
        assert!(matches!(err, Error::Membership(MembershipError::NodeNotInView(5))));
    }

    #[tokio::test]
    async fn test_joins_and_leaver_view() {
        let (manager, membership, _members) = setup(1, vec![1, 2, 3]);
        let first = manager.handle_join("c", 1, join_info(), 1).await.unwrap();
        assert_eq!(first.topology.unwrap().members(), &[1]);
        let second = manager.handle_join("c", 2, join_info(), 1).await.unwrap();
        assert!(second.topology.unwrap().phase.is_rebalance());

        let change = membership
            .install_view(ClusterView::new(2, vec![1, 3]), false)
            .unwrap();
        manager.handle_view_change(&change).await;
        let topology = manager.cache_topology("c").unwrap();
        assert!(!topology.is_member(2));
        assert_eq!(topology.members(), &[1]);
        assert!(!topology.current_ch.is_member(2));
    }

    #[tokio::test]
    async fn test_cluster_flag_is_announced() {
        let (manager, _membership, members) = setup(1, vec![1, 2]);
        manager.set_rebalancing_enabled(None, false).await.unwrap();
        assert!(!manager.is_rebalancing_enabled());
        assert_eq!(*members[1].flags.lock(), vec![false]);
        assert!(matches!(
            manager.force_rebalance("missing").await,
            Err(Error::CacheNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_new_coordinator_recovers_reported_caches() {
        let (manager, membership, members) = setup(2, vec![1, 2, 3]);
        let factory = join_info().factory().unwrap();
        let topology = CacheTopology::stable(4, 2, factory.create(&[1, 2, 3]).unwrap(), vec![]);
        for member in &members[1..] {
            member.caches.lock().push((
                "c".to_string(),
                CacheStatusResponse {
                    join_info: join_info(),
                    topology: Some(topology.clone()),
                    stable_topology: Some(topology.clone()),
                    availability: AvailabilityMode::Available,
                },
            ));
        }

        // node 1 crashes and 2 takes over
        let change = membership
            .install_view(ClusterView::new(2, vec![2, 3]), false)
            .unwrap();
        assert!(change.coordinator_changed());
        manager.handle_view_change(&change).await;

        let recovered = manager.cache_topology("c").unwrap();
        assert!(recovered.topology_id > 4);
        assert!(!recovered.is_member(1));
        assert!(recovered.current_ch.members().iter().all(|m| *m != 1));
    }
}
