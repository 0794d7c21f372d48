//! Moving segment data between owners while the topology changes.
//!
//! ```text
//!              topology update (exclusive lock)
//!                          │
//!                ┌─────────▼──────────┐
//!                │StateTransferManager│
//!                └───┬────────────┬───┘
//!                    │            │
//!          ┌─────────▼───┐    ┌───▼─────────┐
//!          │StateProvider│    │StateConsumer│──► CommitManager ──► data
//!          └─────────────┘    └─────────────┘
//!                    │            │
//!                    └────┬───────┘
//!                ┌────────▼───────────┐
//!                │StateTransferTracker│ "transfer in progress"
//!                └────────────────────┘
//! ```

mod commit_manager;
mod consumer;
mod lock;
mod manager;
mod provider;
mod tracker;

pub use commit_manager::CommitManager;
pub use consumer::StateConsumer;
pub use lock::StateTransferLock;
pub use manager::StateTransferManager;
pub use provider::StateProvider;
pub use tracker::{StateTransferTracker, TransferState};

use crate::cache::storage::DataContainer;
use crate::cache::transactions::TransactionRegistry;
use crate::config::StateTransferConfig;
use crate::metrics::StateTransferMetrics;
use crate::network::Transport;
use crate::partitioning::KeyPartitioner;
use crate::types::NodeId;
use std::sync::Arc;
use std::time::Duration;

/// Collaborators shared by the transfer components of one cache.
#[derive(Debug, Clone)]
pub struct TransferContext {
    pub cache: String,
    pub local: NodeId,
    pub partitioner: KeyPartitioner,
    pub data: Arc<dyn DataContainer>,
    pub registry: Arc<dyn TransactionRegistry>,
    pub transport: Arc<dyn Transport>,
    pub lock: Arc<StateTransferLock>,
    pub tracker: Arc<StateTransferTracker>,
    pub commit_manager: Arc<CommitManager>,
    pub metrics: Arc<StateTransferMetrics>,
    pub config: StateTransferConfig,
    pub rpc_timeout: Duration,
    pub topology_wait_timeout: Duration,
}
