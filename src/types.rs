//! Core types used throughout the grid.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Node identifier in the cluster.
pub type NodeId = u64;

/// Index of a fixed keyspace partition.
pub type SegmentId = u32;

/// Monotonic identifier of a cache topology.
pub type TopologyId = u64;

/// Identifier of an installed cluster view.
pub type ViewId = u64;

/// Milliseconds since the unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Metadata stored next to every value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMetadata {
    /// Absolute expiry time, if the entry has a lifespan.
    pub expires_at_ms: Option<u64>,
}

impl EntryMetadata {
    /// Metadata for an entry that lives for `lifespan` from now.
    pub fn with_lifespan(lifespan: Duration) -> Self {
        Self {
            expires_at_ms: Some(now_millis().saturating_add(lifespan.as_millis() as u64)),
        }
    }

    /// Whether the entry is expired at `now_ms`.
    pub fn is_expired_at(&self, now_ms: u64) -> bool {
        matches!(self.expires_at_ms, Some(at) if at <= now_ms)
    }
}

/// A key/value pair as held by the data container and moved by state transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InternalEntry {
    pub key: Bytes,
    pub value: Bytes,
    pub metadata: EntryMetadata,
}

impl InternalEntry {
    pub fn new(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            metadata: EntryMetadata::default(),
        }
    }

    pub fn with_metadata(mut self, metadata: EntryMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn is_expired(&self) -> bool {
        self.metadata.is_expired_at(now_millis())
    }
}

/// A single change to a key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mutation {
    Put(InternalEntry),
    Remove(Bytes),
}

impl Mutation {
    pub fn key(&self) -> &Bytes {
        match self {
            Mutation::Put(entry) => &entry.key,
            Mutation::Remove(key) => key,
        }
    }
}

/// Origin of a write that the commit manager must tell apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Flag {
    /// Written by a local rebalance state transfer.
    PutForStateTransfer,
    /// Written by a cross-site state transfer.
    PutForXSiteStateTransfer,
}
