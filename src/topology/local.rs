//! Per-node view of cache topologies.
//!
//! Every node runs one [`LocalTopologyManager`]. It joins caches through the
//! coordinator, applies the topologies the coordinator pushes in id order,
//! hands each one to the cache's [`CacheTopologyHandler`], and sends phase
//! confirmations back.

use crate::cluster::ClusterMembership;
use crate::config::NodeConfig;
use crate::error::{Error, MembershipError, Result, TopologyError};
use crate::metrics::StateTransferMetrics;
use crate::network::rpc::unexpected;
use crate::network::{Message, Transport};
use crate::rebalancing::RebalancingStatus;
use crate::topology::{AvailabilityMode, CacheJoinInfo, CacheStatusResponse, CacheTopology, Phase};
use crate::types::{NodeId, TopologyId};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const JOIN_RETRY_DELAY: Duration = Duration::from_millis(100);
const CONFIRM_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Everything a node knows about its caches; sent to a new coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagerStatusResponse {
    pub caches: Vec<(String, CacheStatusResponse)>,
    pub rebalancing_enabled: bool,
}

/// A rebalance phase this node is done with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseConfirmation {
    pub cache: String,
    pub topology_id: TopologyId,
}

/// Receives the topologies of one cache, in increasing id order.
#[async_trait]
pub trait CacheTopologyHandler: Send + Sync + Debug + 'static {
    async fn update_topology(&self, topology: Arc<CacheTopology>, is_rebalance_start: bool) -> Result<()>;
}

#[derive(Debug)]
struct LocalCacheState {
    topology: Option<Arc<CacheTopology>>,
    stable_topology: Option<CacheTopology>,
    availability: AvailabilityMode,
    /// Highest rebalance id applied.
    rebalance_id: u64,
}

#[derive(Debug)]
struct LocalCacheStatus {
    join_info: CacheJoinInfo,
    handler: Arc<dyn CacheTopologyHandler>,
    metrics: Arc<StateTransferMetrics>,
    state: Mutex<LocalCacheState>,
    /// Serializes installation.
    installing: tokio::sync::Mutex<()>,
}

impl LocalCacheStatus {
    fn response(&self) -> CacheStatusResponse {
        let state = self.state.lock();
        CacheStatusResponse {
            join_info: self.join_info.clone(),
            topology: state.topology.as_deref().cloned(),
            stable_topology: state.stable_topology.clone(),
            availability: state.availability,
        }
    }

    fn set_stable(&self, topology: CacheTopology) {
        let mut state = self.state.lock();
        let newer = state
            .stable_topology
            .as_ref()
            .map_or(true, |s| topology.topology_id > s.topology_id);
        if newer {
            state.stable_topology = Some(topology);
        }
    }
}

pub struct LocalTopologyManager {
    local: NodeId,
    config: NodeConfig,
    membership: Arc<ClusterMembership>,
    transport: Arc<dyn Transport>,
    caches: DashMap<String, Arc<LocalCacheStatus>>,
    /// Last cluster-wide flag announced by the coordinator.
    rebalancing_enabled: AtomicBool,
    confirmations: mpsc::UnboundedSender<PhaseConfirmation>,
}

impl std::fmt::Debug for LocalTopologyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTopologyManager")
            .field("local", &self.local)
            .field("caches", &self.caches.len())
            .finish()
    }
}

impl LocalTopologyManager {
    pub fn new(
        config: NodeConfig,
        membership: Arc<ClusterMembership>,
        transport: Arc<dyn Transport>,
    ) -> Arc<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<PhaseConfirmation>();
        let manager = Arc::new(Self {
            local: config.node_id,
            rebalancing_enabled: AtomicBool::new(config.rebalancing_enabled),
            config,
            membership,
            transport,
            caches: DashMap::new(),
            confirmations: tx,
        });

        let weak = Arc::downgrade(&manager);
        tokio::spawn(async move {
            while let Some(confirmation) = rx.recv().await {
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                tokio::spawn(async move { manager.send_confirmation(confirmation).await });
            }
        });
        manager
    }

    /// Channel the caches' transfer managers confirm phases through.
    pub fn confirmation_sender(&self) -> mpsc::UnboundedSender<PhaseConfirmation> {
        self.confirmations.clone()
    }

    fn status(&self, cache: &str) -> Option<Arc<LocalCacheStatus>> {
        self.caches.get(cache).map(|s| s.value().clone())
    }

    /// Join `cache` and install the topology the coordinator answers with.
    /// Retries while the coordinator is unknown, changing or unreachable.
    pub async fn join(
        &self,
        cache: &str,
        join_info: CacheJoinInfo,
        handler: Arc<dyn CacheTopologyHandler>,
        metrics: Arc<StateTransferMetrics>,
    ) -> Result<CacheStatusResponse> {
        let status = Arc::new(LocalCacheStatus {
            join_info: join_info.clone(),
            handler,
            metrics,
            state: Mutex::new(LocalCacheState {
                topology: None,
                stable_topology: None,
                availability: AvailabilityMode::Available,
                rebalance_id: 0,
            }),
            installing: tokio::sync::Mutex::new(()),
        });
        // registered first: a rebalance may be broadcast before the join reply
        self.caches.insert(cache.to_string(), status.clone());

        let deadline = Instant::now() + self.config.join_timeout;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_join(cache, &join_info).await {
                Ok(response) => {
                    info!(cache, attempt, "Joined cache");
                    if let Some(stable) = response.stable_topology.clone() {
                        status.set_stable(stable);
                    }
                    if let Some(topology) = response.topology.clone() {
                        self.install(cache, &status, topology, response.availability)
                            .await?;
                    }
                    return Ok(response);
                }
                Err(e) if Self::join_retryable(&e) && Instant::now() < deadline => {
                    debug!(cache, attempt, error = %e, "Join not accepted yet, retrying");
                    tokio::time::sleep(JOIN_RETRY_DELAY).await;
                }
                Err(e) => {
                    warn!(cache, attempt, error = %e, "Failed to join cache");
                    self.caches.remove(cache);
                    return Err(e);
                }
            }
        }
    }

    async fn try_join(&self, cache: &str, join_info: &CacheJoinInfo) -> Result<CacheStatusResponse> {
        let msg = Message::Join {
            cache: cache.to_string(),
            joiner: self.local,
            join_info: join_info.clone(),
            view_id: self.membership.view_id(),
        };
        match self.send_to_coordinator(msg).await? {
            Message::CacheStatus(response) => Ok(response),
            other => Err(unexpected(&other)),
        }
    }

    fn join_retryable(e: &Error) -> bool {
        e.is_suspect()
            || matches!(
                e,
                Error::NotCoordinator { .. } | Error::Timeout | Error::Membership(MembershipError::NoView)
            )
    }

    /// Leave `cache`. The coordinator is told on a best-effort basis.
    pub async fn leave(&self, cache: &str) -> Result<()> {
        if self.caches.remove(cache).is_none() {
            return Err(Error::CacheNotFound(cache.to_string()));
        }
        let msg = Message::Leave {
            cache: cache.to_string(),
            leaver: self.local,
            view_id: self.membership.view_id(),
        };
        match self.send_to_coordinator(msg).await.and_then(Message::expect_ack) {
            Ok(()) => info!(cache, "Left cache"),
            Err(e) => warn!(cache, error = %e, "Coordinator not told about leave"),
        }
        Ok(())
    }

    async fn install(
        &self,
        cache: &str,
        status: &LocalCacheStatus,
        topology: CacheTopology,
        availability: AvailabilityMode,
    ) -> Result<()> {
        let _installing = status.installing.lock().await;
        let is_rebalance_start = {
            let state = status.state.lock();
            if let Some(current) = &state.topology {
                if topology.topology_id <= current.topology_id {
                    status.metrics.topologies_ignored.inc();
                    debug!(
                        cache,
                        received = topology.topology_id,
                        installed = current.topology_id,
                        "Ignoring outdated topology"
                    );
                    return Ok(());
                }
            }
            if topology.rebalance_id < state.rebalance_id {
                warn!(
                    cache,
                    received = topology.rebalance_id,
                    seen = state.rebalance_id,
                    "Rejecting topology of an older rebalance"
                );
                return Err(TopologyError::StaleRebalance {
                    received: topology.rebalance_id,
                    seen: state.rebalance_id,
                }
                .into());
            }
            topology.pending_ch.is_some() && topology.rebalance_id > state.rebalance_id
        };

        let topology = Arc::new(topology);
        status
            .handler
            .update_topology(topology.clone(), is_rebalance_start)
            .await?;
        {
            let mut state = status.state.lock();
            state.rebalance_id = state.rebalance_id.max(topology.rebalance_id);
            state.availability = availability;
            state.topology = Some(topology.clone());
        }

        let confirm_now = matches!(topology.phase, Phase::ReadOldWriteAll | Phase::ReadNewWriteAll);
        if confirm_now && topology.is_member(self.local) {
            let _ = self.confirmations.send(PhaseConfirmation {
                cache: cache.to_string(),
                topology_id: topology.topology_id,
            });
        }
        Ok(())
    }

    pub async fn handle_topology_update(
        &self,
        cache: &str,
        topology: CacheTopology,
        availability: AvailabilityMode,
    ) -> Result<()> {
        let Some(status) = self.status(cache) else {
            debug!(cache, "Topology update for a cache not running here");
            return Ok(());
        };
        self.install(cache, &status, topology, availability).await
    }

    pub async fn handle_rebalance(&self, cache: &str, topology: CacheTopology) -> Result<()> {
        let Some(status) = self.status(cache) else {
            debug!(cache, "Rebalance for a cache not running here");
            return Ok(());
        };
        let availability = status.state.lock().availability;
        self.install(cache, &status, topology, availability).await
    }

    pub fn handle_stable_topology_update(&self, cache: &str, topology: CacheTopology) {
        if let Some(status) = self.status(cache) {
            debug!(cache, topology_id = topology.topology_id, "Stable topology updated");
            status.set_stable(topology);
        }
    }

    /// State of every local cache, for a recovering coordinator.
    pub fn handle_status_request(&self) -> ManagerStatusResponse {
        let caches = self
            .caches
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().response()))
            .collect();
        ManagerStatusResponse {
            caches,
            rebalancing_enabled: self.rebalancing_enabled.load(Ordering::Acquire),
        }
    }

    pub fn set_rebalancing_enabled_local(&self, enabled: bool) {
        self.rebalancing_enabled.store(enabled, Ordering::Release);
    }

    pub fn is_rebalancing_enabled(&self) -> bool {
        self.rebalancing_enabled.load(Ordering::Acquire)
    }

    pub fn topology(&self, cache: &str) -> Option<Arc<CacheTopology>> {
        self.status(cache).and_then(|s| s.state.lock().topology.clone())
    }

    pub fn stable_topology(&self, cache: &str) -> Option<CacheTopology> {
        self.status(cache)
            .and_then(|s| s.state.lock().stable_topology.clone())
    }

    pub fn availability(&self, cache: &str) -> Option<AvailabilityMode> {
        self.status(cache).map(|s| s.state.lock().availability)
    }

    async fn send_confirmation(&self, confirmation: PhaseConfirmation) {
        let PhaseConfirmation { cache, topology_id } = confirmation;
        for attempt in 0..=self.config.confirmation_retries {
            let superseded = self
                .topology(&cache)
                .map_or(true, |t| t.topology_id > topology_id);
            if superseded {
                debug!(%cache, topology_id, "Not confirming superseded topology");
                return;
            }
            let msg = Message::RebalancePhaseConfirm {
                cache: cache.clone(),
                node: self.local,
                topology_id,
                view_id: self.membership.view_id(),
            };
            match self.send_to_coordinator(msg).await.and_then(Message::expect_ack) {
                Ok(()) => {
                    debug!(%cache, topology_id, "Confirmed rebalance phase");
                    return;
                }
                Err(e) => {
                    warn!(%cache, topology_id, attempt, error = %e, "Phase confirmation failed");
                    tokio::time::sleep(CONFIRM_RETRY_DELAY).await;
                }
            }
        }
    }

    async fn send_to_coordinator(&self, msg: Message) -> Result<Message> {
        let coordinator = self.membership.coordinator()?;
        self.transport
            .send(coordinator, msg, self.config.rpc_timeout)
            .await
    }

    /// Turn rebalancing on or off for one cache, or cluster-wide.
    pub async fn set_rebalancing_enabled(&self, cache: Option<&str>, enabled: bool) -> Result<()> {
        self.send_to_coordinator(Message::RebalancePolicyUpdate {
            cache: cache.map(str::to_string),
            enabled,
        })
        .await?
        .expect_ack()
    }

    pub async fn force_rebalance(&self, cache: &str) -> Result<()> {
        self.send_to_coordinator(Message::ForceRebalance {
            cache: cache.to_string(),
        })
        .await?
        .expect_ack()
    }

    pub async fn rebalancing_status(&self, cache: &str) -> Result<RebalancingStatus> {
        match self
            .send_to_coordinator(Message::RebalancingStatusRequest {
                cache: cache.to_string(),
            })
            .await?
        {
            Message::RebalancingStatus(status) => Ok(status),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn set_availability_mode(&self, cache: &str, mode: AvailabilityMode) -> Result<()> {
        self.send_to_coordinator(Message::AvailabilityModeUpdate {
            cache: cache.to_string(),
            mode,
        })
        .await?
        .expect_ack()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ClusterView;
    use crate::config::{CacheConfig, CacheMode};
    use crate::network::{InMemoryNetwork, MessageHandler};
    use crate::partitioning::ConsistentHashFactory;
    use std::sync::atomic::AtomicUsize;
    use uuid::Uuid;

    #[derive(Debug, Default)]
    struct Recorder {
        applied: Mutex<Vec<(TopologyId, bool)>>,
    }

    #[async_trait]
    impl CacheTopologyHandler for Recorder {
        async fn update_topology(&self, topology: Arc<CacheTopology>, is_rebalance_start: bool) -> Result<()> {
            self.applied
                .lock()
                .push((topology.topology_id, is_rebalance_start));
            Ok(())
        }
    }

    /// Coordinator stub: refuses the first join, then answers with a stable
    /// topology; records phase confirmations.
    #[derive(Default)]
    struct Coordinator {
        joins: AtomicUsize,
        confirmed: Mutex<Vec<TopologyId>>,
    }

    #[async_trait]
    impl MessageHandler for Coordinator {
        async fn handle(&self, _from: NodeId, msg: Message) -> Message {
            match msg {
                Message::Join { join_info, .. } => {
                    if self.joins.fetch_add(1, Ordering::SeqCst) == 0 {
                        return Message::from_result(Err(Error::NotCoordinator { node: 1 }));
                    }
                    Message::CacheStatus(CacheStatusResponse {
                        join_info,
                        topology: Some(stable(3)),
                        stable_topology: Some(stable(3)),
                        availability: AvailabilityMode::Available,
                    })
                }
                Message::RebalancePhaseConfirm { topology_id, .. } => {
                    self.confirmed.lock().push(topology_id);
                    Message::Ack
                }
                _ => Message::Ack,
            }
        }
    }

    fn factory() -> ConsistentHashFactory {
        ConsistentHashFactory::new(CacheMode::Distributed, 2, 8).unwrap()
    }

    fn stable(id: TopologyId) -> CacheTopology {
        CacheTopology::stable(id, 1, factory().create(&[1, 2]).unwrap(), vec![])
    }

    fn join_info() -> CacheJoinInfo {
        CacheJoinInfo::new(&CacheConfig::distributed(2).with_num_segments(8), Uuid::new_v4())
    }

    async fn setup() -> (Arc<LocalTopologyManager>, Arc<Coordinator>, Arc<Recorder>, Arc<StateTransferMetrics>) {
        let network = InMemoryNetwork::new();
        let coordinator = Arc::new(Coordinator::default());
        network.register(1, coordinator.clone());
        network.register(2, coordinator.clone());
        let (membership, _events) = ClusterMembership::new(2);
        membership.install_view(ClusterView::new(1, vec![1, 2]), false);
        let manager = LocalTopologyManager::new(NodeConfig::new(2), membership, network.transport(2));
        let recorder = Arc::new(Recorder::default());
        let metrics = Arc::new(StateTransferMetrics::new());
        (manager, coordinator, recorder, metrics)
    }

    #[tokio::test]
    async fn test_join_retries_until_accepted() {
        let (manager, coordinator, recorder, metrics) = setup().await;
        let response = manager
            .join("c", join_info(), recorder.clone(), metrics)
            .await
            .unwrap();
        assert_eq!(coordinator.joins.load(Ordering::SeqCst), 2);
        assert_eq!(response.topology.unwrap().topology_id, 3);
        assert_eq!(*recorder.applied.lock(), vec![(3, false)]);
        assert_eq!(manager.topology("c").unwrap().topology_id, 3);
        assert_eq!(manager.stable_topology("c").unwrap().topology_id, 3);
    }

    #[tokio::test]
    async fn test_topologies_apply_in_order() {
        let (manager, coordinator, recorder, metrics) = setup().await;
        manager
            .join("c", join_info(), recorder.clone(), metrics.clone())
            .await
            .unwrap();

        let f = factory();
        let pending = f.rebalance(&f.update_members(&stable(3).current_ch, &[1, 2, 3]));
        let read_old = stable(3).start_rebalance(&f, pending);
        manager.handle_rebalance("c", read_old.clone()).await.unwrap();

        // a late copy of an older topology is ignored
        manager
            .handle_topology_update("c", stable(3), AvailabilityMode::Available)
            .await
            .unwrap();
        assert_eq!(metrics.topologies_ignored.get(), 1);

        // an older rebalance with a newer id is stale
        let stale = stable(9);
        let err = manager
            .handle_topology_update("c", stale.with_ids(9, 0), AvailabilityMode::Available)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Topology(TopologyError::StaleRebalance { .. })));

        assert_eq!(
            *recorder.applied.lock(),
            vec![(3, false), (read_old.topology_id, true)]
        );
        assert!(
            crate::testing::utils::wait_for(
                || coordinator.confirmed.lock().contains(&read_old.topology_id),
                Duration::from_secs(2),
                Duration::from_millis(10),
            )
            .await
        );
    }

    #[tokio::test]
    async fn test_status_lists_caches() {
        let (manager, _coordinator, recorder, metrics) = setup().await;
        manager.join("c", join_info(), recorder, metrics).await.unwrap();
        manager.set_rebalancing_enabled_local(false);
        let status = manager.handle_status_request();
        assert!(!status.rebalancing_enabled);
        assert_eq!(status.caches.len(), 1);
        assert_eq!(status.caches[0].0, "c");
        assert_eq!(status.caches[0].1.topology.as_ref().unwrap().topology_id, 3);

        manager.leave("c").await.unwrap();
        assert!(manager.topology("c").is_none());
    }
}
