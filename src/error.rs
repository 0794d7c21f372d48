//! Error types for the topology and state transfer core.

use crate::types::{NodeId, SegmentId, TopologyId};
use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

/// Result type alias for grid operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the grid.
#[derive(Error, Debug)]
pub enum Error {
    /// Network communication errors.
    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    /// Local storage errors.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Topology ordering errors.
    #[error("topology error: {0}")]
    Topology(#[from] TopologyError),

    /// State transfer protocol errors.
    #[error("state transfer error: {0}")]
    Transfer(#[from] TransferError),

    /// Cluster membership errors.
    #[error("membership error: {0}")]
    Membership(#[from] MembershipError),

    /// Configuration errors. Fatal at cache start.
    #[error("config error: {0}")]
    Config(String),

    /// The request reached a node that is not the coordinator.
    #[error("node {node} is not the coordinator")]
    NotCoordinator { node: NodeId },

    /// The cache is not running on this node.
    #[error("cache not found: {0}")]
    CacheNotFound(String),

    /// A command kept hitting stale topologies.
    #[error("retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: usize, last: Box<Error> },

    /// The operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// The operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),

    /// Error reported by a remote node.
    #[error("remote error: {0}")]
    Remote(String),
}

/// Network communication errors.
#[derive(Error, Debug)]
pub enum NetworkError {
    /// The peer did not answer in time or is unreachable. It may be gone;
    /// the next view change confirms or refutes that.
    #[error("node {0} is suspected")]
    Suspect(NodeId),

    /// A request timed out.
    #[error("request to node {0} timed out")]
    Timeout(NodeId),

    /// Connection failed.
    #[error("connection failed to {addr}: {reason}")]
    ConnectionFailed { addr: String, reason: String },

    /// Connection was closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization error.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// The peer answered with a message we did not expect.
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Local storage errors.
#[derive(Error, Debug)]
pub enum StorageError {
    /// A key is locked by another transaction.
    #[error("key is locked by transaction {owner}")]
    KeyLocked { owner: String },

    /// Transaction is not known.
    #[error("unknown transaction {0}")]
    UnknownTransaction(String),

    #[error("transaction {0} is already prepared")]
    AlreadyPrepared(String),
}

/// Topology ordering errors.
#[derive(Error, Debug)]
pub enum TopologyError {
    /// A command ran against a topology that was superseded.
    #[error("outdated topology: command {requested}, installed {installed}")]
    Outdated {
        requested: TopologyId,
        installed: TopologyId,
    },

    /// A topology update arrived with a lower rebalance id than one already seen.
    #[error("stale rebalance id {received}, already saw {seen}")]
    StaleRebalance { received: u64, seen: u64 },

    /// No topology is installed yet.
    #[error("no topology installed for cache {0}")]
    NotInstalled(String),
}

/// State transfer protocol errors.
#[derive(Error, Debug)]
pub enum TransferError {
    /// The provider does not serve the requested segment. Not retryable.
    #[error("node {node} does not serve segment {segment} in topology {topology_id}")]
    InvalidSegmentRequest {
        node: NodeId,
        segment: SegmentId,
        topology_id: TopologyId,
    },

    /// The transfer was superseded by a newer topology.
    #[error("transfer cancelled by topology {0}")]
    Superseded(TopologyId),

    /// A read reached an owner that has not received the segment yet.
    #[error("node {node} is still receiving segment {segment}")]
    SegmentReceiving { node: NodeId, segment: SegmentId },
}

/// Cluster membership errors.
#[derive(Error, Debug)]
pub enum MembershipError {
    /// Node is not part of the current view.
    #[error("node not in view: {0}")]
    NodeNotInView(NodeId),

    /// No view installed yet.
    #[error("no cluster view installed")]
    NoView,

    /// Join failed.
    #[error("join failed: {0}")]
    JoinFailed(String),
}

impl Error {
    /// True when the command should be retried against a newer topology.
    pub fn is_outdated_topology(&self) -> bool {
        matches!(self, Error::Topology(TopologyError::Outdated { .. }))
    }

    /// True when the error means the remote peer may have left.
    pub fn is_suspect(&self) -> bool {
        matches!(
            self,
            Error::Network(NetworkError::Suspect(_)) | Error::Network(NetworkError::Timeout(_))
        )
    }

    /// True when a read owner could not answer because its copy is incomplete.
    pub fn is_segment_receiving(&self) -> bool {
        matches!(self, Error::Transfer(TransferError::SegmentReceiving { .. }))
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Network(NetworkError::Serialization(e.to_string()))
    }
}

/// Serialisable form of an error that crosses the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteError {
    Outdated {
        requested: TopologyId,
        installed: TopologyId,
    },
    InvalidSegmentRequest {
        node: NodeId,
        segment: SegmentId,
        topology_id: TopologyId,
    },
    SegmentReceiving {
        node: NodeId,
        segment: SegmentId,
    },
    NotCoordinator {
        node: NodeId,
    },
    KeyLocked {
        owner: String,
    },
    CacheNotFound(String),
    Timeout,
    Other(String),
}

impl From<&Error> for RemoteError {
    fn from(e: &Error) -> Self {
        match e {
            Error::Topology(TopologyError::Outdated {
                requested,
                installed,
            }) => RemoteError::Outdated {
                requested: *requested,
                installed: *installed,
            },
            Error::Transfer(TransferError::InvalidSegmentRequest {
                node,
                segment,
                topology_id,
            }) => RemoteError::InvalidSegmentRequest {
                node: *node,
                segment: *segment,
                topology_id: *topology_id,
            },
            Error::Transfer(TransferError::SegmentReceiving { node, segment }) => {
                RemoteError::SegmentReceiving {
                    node: *node,
                    segment: *segment,
                }
            }
            Error::NotCoordinator { node } => RemoteError::NotCoordinator { node: *node },
            Error::Storage(StorageError::KeyLocked { owner }) => RemoteError::KeyLocked {
                owner: owner.clone(),
            },
            Error::CacheNotFound(name) => RemoteError::CacheNotFound(name.clone()),
            Error::Timeout => RemoteError::Timeout,
            other => RemoteError::Other(other.to_string()),
        }
    }
}

impl From<RemoteError> for Error {
    fn from(e: RemoteError) -> Self {
        match e {
            RemoteError::Outdated {
                requested,
                installed,
            } => TopologyError::Outdated {
                requested,
                installed,
            }
            .into(),
            RemoteError::InvalidSegmentRequest {
                node,
                segment,
                topology_id,
            } => TransferError::InvalidSegmentRequest {
                node,
                segment,
                topology_id,
            }
            .into(),
            RemoteError::SegmentReceiving { node, segment } => {
                TransferError::SegmentReceiving { node, segment }.into()
            }
            RemoteError::NotCoordinator { node } => Error::NotCoordinator { node },
            RemoteError::KeyLocked { owner } => StorageError::KeyLocked { owner }.into(),
            RemoteError::CacheNotFound(name) => Error::CacheNotFound(name),
            RemoteError::Timeout => Error::Timeout,
            RemoteError::Other(msg) => Error::Remote(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outdated_survives_remote_hop() {
        let err: Error = TopologyError::Outdated {
            requested: 3,
            installed: 5,
        }
        .into();
        let remote = RemoteError::from(&err);
        let back = Error::from(remote);
        assert!(back.is_outdated_topology());
    }

    #[test]
    fn test_suspect_classification() {
        assert!(Error::from(NetworkError::Suspect(2)).is_suspect());
        assert!(Error::from(NetworkError::Timeout(2)).is_suspect());
        assert!(!Error::Timeout.is_suspect());
    }

    #[test]
    fn test_segment_receiving_survives_remote_hop() {
        let err: Error = TransferError::SegmentReceiving { node: 3, segment: 7 }.into();
        let back = Error::from(RemoteError::from(&err));
        assert!(back.is_segment_receiving());
        assert!(!back.is_outdated_topology());
    }

    #[test]
    fn test_unknown_errors_become_remote() {
        let err = Error::Internal("boom".into());
        match Error::from(RemoteError::from(&err)) {
            Error::Remote(msg) => assert!(msg.contains("boom")),
            other => panic!("unexpected {other:?}"),
        }
    }
}
