//! Cache topologies and their per-node installation.

mod cache_topology;
mod local;

pub use cache_topology::{
    AvailabilityMode, CacheJoinInfo, CacheStatusResponse, CacheTopology, Phase,
};
pub use local::{
    CacheTopologyHandler, LocalTopologyManager, ManagerStatusResponse, PhaseConfirmation,
};
