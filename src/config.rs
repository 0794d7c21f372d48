//! Configuration types for grid nodes and caches.

use crate::error::{Error, Result};
use crate::types::NodeId;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How a cache places its data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheMode {
    /// Each segment is owned by `num_owners` nodes.
    Distributed,
    /// Every member owns every segment.
    Replicated,
}

/// Per-node configuration.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Unique identifier for this node.
    pub node_id: NodeId,

    /// Timeout for a single RPC exchange.
    pub rpc_timeout: Duration,

    /// How long a cache join may take before giving up.
    pub join_timeout: Duration,

    /// How many times a command is retried after hitting a stale topology.
    pub max_retries: usize,

    /// How long a command waits for a topology it needs.
    pub topology_wait_timeout: Duration,

    /// How many times a phase confirmation is resent on failure.
    pub confirmation_retries: usize,

    /// Initial value of the cluster-wide rebalancing flag when this node coordinates.
    pub rebalancing_enabled: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            rpc_timeout: Duration::from_secs(15),
            join_timeout: Duration::from_secs(60),
            max_retries: 3,
            topology_wait_timeout: Duration::from_secs(30),
            confirmation_retries: 3,
            rebalancing_enabled: true,
        }
    }
}

impl NodeConfig {
    /// Create a new configuration for the given node.
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            ..Default::default()
        }
    }

    /// Set the RPC timeout.
    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    /// Set the join timeout.
    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }

    /// Set the bounded retry count for commands.
    pub fn with_max_retries(mut self, retries: usize) -> Self {
        self.max_retries = retries;
        self
    }

    /// Set how long commands wait for a required topology.
    pub fn with_topology_wait_timeout(mut self, timeout: Duration) -> Self {
        self.topology_wait_timeout = timeout;
        self
    }

    pub fn with_confirmation_retries(mut self, retries: usize) -> Self {
        self.confirmation_retries = retries;
        self
    }

    pub fn with_rebalancing_enabled(mut self, enabled: bool) -> Self {
        self.rebalancing_enabled = enabled;
        self
    }
}

/// State transfer tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransferConfig {
    /// Whether joiners pull state at all.
    pub enabled: bool,

    /// Maximum number of entries per chunk.
    pub chunk_size: usize,

    /// Timeout for pulling one batch of segments from one provider.
    pub timeout: Duration,
}

impl Default for StateTransferConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            chunk_size: 512,
            timeout: Duration::from_secs(240),
        }
    }
}

impl StateTransferConfig {
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// Per-cache configuration. Every member of a cache must agree on the
/// placement settings; the coordinator rejects mismatching joiners.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Placement mode.
    pub mode: CacheMode,

    /// Replication factor in distributed mode.
    pub num_owners: usize,

    /// Number of fixed keyspace partitions.
    pub num_segments: usize,

    /// Block `start_cache` until the initial state transfer finishes.
    pub await_initial_transfer: bool,

    /// Turn the cache degraded instead of rebalancing when segments lose every owner.
    pub partition_handling: bool,

    /// State transfer tuning.
    pub state_transfer: StateTransferConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            mode: CacheMode::Distributed,
            num_owners: 2,
            num_segments: 256,
            await_initial_transfer: true,
            partition_handling: false,
            state_transfer: StateTransferConfig::default(),
        }
    }
}

impl CacheConfig {
    /// A distributed cache with the given replication factor.
    pub fn distributed(num_owners: usize) -> Self {
        Self {
            num_owners,
            ..Default::default()
        }
    }

    /// A replicated cache.
    pub fn replicated() -> Self {
        Self {
            mode: CacheMode::Replicated,
            ..Default::default()
        }
    }

    pub fn with_num_owners(mut self, num_owners: usize) -> Self {
        self.num_owners = num_owners;
        self
    }

    pub fn with_num_segments(mut self, num_segments: usize) -> Self {
        self.num_segments = num_segments;
        self
    }

    pub fn with_await_initial_transfer(mut self, await_transfer: bool) -> Self {
        self.await_initial_transfer = await_transfer;
        self
    }

    pub fn with_partition_handling(mut self, enabled: bool) -> Self {
        self.partition_handling = enabled;
        self
    }

    pub fn with_state_transfer(mut self, state_transfer: StateTransferConfig) -> Self {
        self.state_transfer = state_transfer;
        self
    }

    /// Reject impossible placement settings.
    pub fn validate(&self) -> Result<()> {
        if self.num_segments < 1 {
            return Err(Error::Config(format!(
                "num_segments must be at least 1, got {}",
                self.num_segments
            )));
        }
        if self.num_segments > u32::MAX as usize {
            return Err(Error::Config(format!(
                "num_segments too large: {}",
                self.num_segments
            )));
        }
        if self.mode == CacheMode::Distributed && self.num_owners < 1 {
            return Err(Error::Config(format!(
                "num_owners must be at least 1, got {}",
                self.num_owners
            )));
        }
        if self.state_transfer.chunk_size < 1 {
            return Err(Error::Config("state transfer chunk_size must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CacheConfig::default();
        assert_eq!(config.num_owners, 2);
        assert_eq!(config.num_segments, 256);
        assert!(config.await_initial_transfer);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = CacheConfig::distributed(3)
            .with_num_segments(60)
            .with_await_initial_transfer(false)
            .with_state_transfer(StateTransferConfig::default().with_chunk_size(10));

        assert_eq!(config.num_owners, 3);
        assert_eq!(config.num_segments, 60);
        assert!(!config.await_initial_transfer);
        assert_eq!(config.state_transfer.chunk_size, 10);
    }

    #[test]
    fn test_invalid_placement_rejected() {
        assert!(matches!(
            CacheConfig::default().with_num_segments(0).validate(),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            CacheConfig::distributed(0).validate(),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_node_config_builder() {
        let config = NodeConfig::new(7)
            .with_max_retries(5)
            .with_rpc_timeout(Duration::from_millis(500));
        assert_eq!(config.node_id, 7);
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.rpc_timeout, Duration::from_millis(500));
    }
}
