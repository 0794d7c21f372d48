//! Administrative surface for operational tooling.
//!
//! Requests that change cluster state go to the coordinator through the
//! local topology manager; reads are answered from this node's state.

use crate::error::{Error, Result};
use crate::metrics::TransferStats;
use crate::node::GridNode;
use crate::rebalancing::RebalancingStatus;
use crate::topology::{AvailabilityMode, CacheTopology};
use std::sync::Arc;
use tracing::info;

/// Admin operations on behalf of one node.
#[derive(Debug, Clone, Copy)]
pub struct TopologyAdmin<'a> {
    node: &'a GridNode,
}

impl<'a> TopologyAdmin<'a> {
    pub fn new(node: &'a GridNode) -> Self {
        Self { node }
    }

    /// Suspend or resume rebalancing for every cache.
    pub async fn set_rebalancing_enabled(&self, enabled: bool) -> Result<()> {
        info!(enabled, "Requesting cluster-wide rebalancing change");
        self.node
            .local_topology()
            .set_rebalancing_enabled(None, enabled)
            .await
    }

    pub async fn set_cache_rebalancing_enabled(&self, cache: &str, enabled: bool) -> Result<()> {
        info!(cache, enabled, "Requesting cache rebalancing change");
        self.node
            .local_topology()
            .set_rebalancing_enabled(Some(cache), enabled)
            .await
    }

    /// Last cluster-wide flag this node heard of.
    pub fn is_rebalancing_enabled(&self) -> bool {
        self.node.local_topology().is_rebalancing_enabled()
    }

    pub async fn force_rebalance(&self, cache: &str) -> Result<()> {
        self.node.local_topology().force_rebalance(cache).await
    }

    pub async fn rebalancing_status(&self, cache: &str) -> Result<RebalancingStatus> {
        self.node.local_topology().rebalancing_status(cache).await
    }

    /// Set a degraded cache back to available, or force it degraded.
    pub async fn set_availability_mode(&self, cache: &str, mode: AvailabilityMode) -> Result<()> {
        info!(cache, ?mode, "Requesting availability change");
        self.node
            .local_topology()
            .set_availability_mode(cache, mode)
            .await
    }

    pub fn availability(&self, cache: &str) -> Option<AvailabilityMode> {
        self.node.local_topology().availability(cache)
    }

    /// Topology installed on this node.
    pub fn cache_topology(&self, cache: &str) -> Option<Arc<CacheTopology>> {
        self.node.local_topology().topology(cache)
    }

    pub fn stable_topology(&self, cache: &str) -> Option<CacheTopology> {
        self.node.local_topology().stable_topology(cache)
    }

    /// In-flight segment and transaction transfer counters.
    pub fn transfer_stats(&self, cache: &str) -> Result<TransferStats> {
        self.node
            .cache(cache)
            .map(|c| c.transfer_stats())
            .ok_or_else(|| Error::CacheNotFound(cache.to_string()))
    }

    pub fn is_state_transfer_in_progress(&self, cache: &str) -> Result<bool> {
        self.node
            .cache(cache)
            .map(|c| c.is_state_transfer_in_progress())
            .ok_or_else(|| Error::CacheNotFound(cache.to_string()))
    }

    /// Prometheus text for every cache on this node.
    pub fn metrics_text(&self) -> String {
        self.node
            .caches()
            .iter()
            .map(|c| c.metrics().to_prometheus(c.name()))
            .collect()
    }
}
