//! Cluster topology and state transfer for a distributed in-memory grid.
//!
//! Each named cache splits its keyspace into segments. A consistent hash
//! maps every segment to an ordered list of owner nodes. When nodes join,
//! leave, crash or merge back after a partition, the coordinator computes a
//! new balanced hash and moves segments to their new owners while reads
//! and writes keep working.
//!
//! # Example
//!
//! ```rust,no_run
//! use gridstate::{CacheConfig, ClusterView, GridNode, InMemoryNetwork, NodeConfig};
//!
//! #[tokio::main]
//! async fn main() -> gridstate::Result<()> {
//!     let network = InMemoryNetwork::new();
//!     let node = GridNode::new(NodeConfig::new(1), network.transport(1));
//!     network.register(1, node.clone());
//!     node.install_view(ClusterView::new(1, vec![1]), false).await;
//!
//!     let cache = node.start_cache("users", CacheConfig::distributed(2)).await?;
//!     cache.put("user:123", "Alice").await?;
//!     assert!(cache.get("user:123").await?.is_some());
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                           GridNode                           │
//! │                                                              │
//! │  ClusterMembership ──views──> ClusterTopologyManager         │
//! │                               (coordinator only)             │
//! │                                     │ topologies             │
//! │                                     v                        │
//! │                             LocalTopologyManager             │
//! │                                     │                        │
//! │            ┌────────────────────────┼───────────────┐        │
//! │            v                        v               v        │
//! │       GridCache "a"            GridCache "b"       ...       │
//! │   ┌──────────────────────┐                                   │
//! │   │ InterceptorChain     │  StateTransferHandler             │
//! │   │                      │  DistributionHandler              │
//! │   │                      │  DataHandler                      │
//! │   │ StateProvider  ◄─────┼──── state requests from peers     │
//! │   │ StateConsumer  ──────┼───► pulls segments from owners    │
//! │   └──────────────────────┘                                   │
//! └──────────────────────────────┬───────────────────────────────┘
//!                                │ Transport (TCP or in-memory)
//!                                v
//!                           other nodes
//! ```
//!
//! # Consistency during rebalance
//!
//! - Writes go to the union of old and new owners until the new owners
//!   hold every segment they were assigned.
//! - A live write is never overwritten by an older value arriving through
//!   state transfer.
//! - Commands routed with an older topology are rejected as outdated and
//!   retried by the originator under the newer one.

pub mod admin;
pub mod cache;
pub mod cluster;
pub mod config;
pub mod error;
pub mod interceptor;
pub mod metrics;
pub mod network;
pub mod node;
pub mod partitioning;
pub mod rebalancing;
pub mod statetransfer;
pub mod testing;
pub mod topology;
pub mod types;

pub use admin::TopologyAdmin;
pub use cache::GridCache;
pub use cluster::{ClusterMembership, ClusterView, MemberEvent, ViewChange};
pub use config::{CacheConfig, CacheMode, NodeConfig, StateTransferConfig};
pub use error::{Error, Result};
pub use metrics::{StateTransferMetrics, TransferStats};
pub use network::{InMemoryNetwork, Message, MessageHandler, NetworkServer, TcpTransport, Transport};
pub use node::GridNode;
pub use partitioning::{ConsistentHash, ConsistentHashFactory, KeyPartitioner};
pub use rebalancing::{ClusterTopologyManager, DefaultRebalancePolicy, RebalancePolicy, RebalancingStatus};
pub use testing::TestCluster;
pub use topology::{AvailabilityMode, CacheTopology, LocalTopologyManager, Phase};
pub use types::{NodeId, SegmentId, TopologyId, ViewId};
