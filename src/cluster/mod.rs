//! Cluster views and membership.

pub mod events;
pub mod membership;

pub use events::{ClusterView, LoggingEventListener, MemberEvent, MemberEventListener, ViewChange};
pub use membership::ClusterMembership;
