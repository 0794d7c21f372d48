//! Coordinator-driven rebalancing.
//!
//! When members join or leave a cache, the coordinator computes a balanced
//! pending hash and walks every member through four phases:
//!
//! ```text
//!   NoRebalance ──start──> ReadOldWriteAll ──all confirm──> ReadAllWriteAll
//!        ^                                                        │
//!        │                                              all transfers done
//!        │                                                        v
//!        └──────────all confirm (pending becomes current)── ReadNewWriteAll
//! ```
//!
//! Writes go to the union of old and new owners for the whole rebalance, so
//! no update is lost while segments move. Each phase only advances once
//! every member of the topology confirmed the previous one.

mod cache_status;
mod confirmation;
mod coordinator;
mod policy;
pub mod transfer;

pub use cache_status::{ClusterCacheStatus, CoordinatorContext};
pub use coordinator::ClusterTopologyManager;
pub use policy::{DefaultRebalancePolicy, RebalanceContext, RebalancePolicy, RebalancingStatus};
pub use transfer::{StateChunk, StateRequest, StateResponse, TransactionInfo};
