//! State transfer payloads.
//!
//! These types travel between a consumer (the new owner) and a provider
//! (an owner in the current hash) inside `Message::StateRequest` and
//! `Message::StateResponse`.

use crate::cache::transactions::{GlobalTransactionId, RemoteTransaction};
use crate::partitioning::KeyPartitioner;
use crate::types::{InternalEntry, Mutation, NodeId, SegmentId, TopologyId};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A batch of entries for one segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChunk {
    pub segment: SegmentId,
    pub entries: Vec<InternalEntry>,
    /// No more chunks follow for this segment.
    pub is_last_chunk: bool,
}

impl StateChunk {
    pub fn new(segment: SegmentId, entries: Vec<InternalEntry>, is_last_chunk: bool) -> Self {
        Self {
            segment,
            entries,
            is_last_chunk,
        }
    }

    /// Final chunk of a segment that had no entries.
    pub fn empty_last(segment: SegmentId) -> Self {
        Self::new(segment, Vec::new(), true)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop entries that expired while in flight.
    pub fn filter_expired(mut self) -> Self {
        self.entries.retain(|e| !e.is_expired());
        self
    }

    /// Split a segment snapshot into chunks of at most `chunk_size` entries.
    /// A segment without entries still produces one (empty) last chunk.
    pub fn split(segment: SegmentId, entries: Vec<InternalEntry>, chunk_size: usize) -> Vec<Self> {
        if entries.is_empty() {
            return vec![Self::empty_last(segment)];
        }
        let chunk_size = chunk_size.max(1);
        let total = entries.len().div_ceil(chunk_size);
        let mut chunks = Vec::with_capacity(total);
        let mut entries = entries.into_iter().peekable();
        while entries.peek().is_some() {
            let batch: Vec<_> = entries.by_ref().take(chunk_size).collect();
            let last = entries.peek().is_none();
            chunks.push(Self::new(segment, batch, last));
        }
        chunks
    }
}

/// The part of an in-flight transaction that touches some segments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionInfo {
    pub gtx: GlobalTransactionId,
    pub modifications: Vec<Mutation>,
    pub locked_keys: Vec<Bytes>,
    pub topology_id: TopologyId,
}

impl TransactionInfo {
    /// Restrict a registered transaction to `segments`. Returns `None` when
    /// it touches none of them.
    pub fn for_segments(
        tx: &RemoteTransaction,
        partitioner: &KeyPartitioner,
        segments: &BTreeSet<SegmentId>,
    ) -> Option<Self> {
        let in_segments = |key: &[u8]| segments.contains(&partitioner.segment_of(key));
        let locked_keys: Vec<Bytes> = tx
            .locked_keys
            .iter()
            .filter(|k| in_segments(k))
            .cloned()
            .collect();
        if locked_keys.is_empty() {
            return None;
        }
        let modifications = tx
            .modifications
            .iter()
            .filter(|m| in_segments(m.key()))
            .cloned()
            .collect();
        Some(Self {
            gtx: tx.gtx,
            modifications,
            locked_keys,
            topology_id: tx.topology_id,
        })
    }

    /// Registry form of a received transaction.
    pub fn into_remote(self) -> RemoteTransaction {
        RemoteTransaction {
            gtx: self.gtx,
            modifications: self.modifications,
            locked_keys: self.locked_keys.into_iter().collect(),
            topology_id: self.topology_id,
            from_state_transfer: true,
        }
    }
}

/// What a consumer asks a provider for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateRequestKind {
    /// Reply with the open transactions of the segments.
    GetTransactions,
    /// Start streaming the segments' entries back to the origin.
    StartStateTransfer,
    /// Stop streaming the segments to the origin.
    CancelStateTransfer,
}

/// Consumer to provider request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateRequest {
    pub kind: StateRequestKind,
    pub cache: String,
    /// The consumer.
    pub origin: NodeId,
    /// Topology the consumer is pulling for.
    pub topology_id: TopologyId,
    pub segments: BTreeSet<SegmentId>,
}

impl StateRequest {
    pub fn new(
        kind: StateRequestKind,
        cache: impl Into<String>,
        origin: NodeId,
        topology_id: TopologyId,
        segments: BTreeSet<SegmentId>,
    ) -> Self {
        Self {
            kind,
            cache: cache.into(),
            origin,
            topology_id,
            segments,
        }
    }
}

/// Provider to consumer push of entry chunks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateResponse {
    pub cache: String,
    /// The provider.
    pub origin: NodeId,
    pub topology_id: TopologyId,
    pub chunks: Vec<StateChunk>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(n: usize) -> Vec<InternalEntry> {
        (0..n)
            .map(|i| InternalEntry::new(format!("k{i}"), "v"))
            .collect()
    }

    #[test]
    fn test_split_marks_only_last_chunk() {
        let chunks = StateChunk::split(3, entries(5), 2);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks.iter().map(StateChunk::len).sum::<usize>(), 5);
        assert!(!chunks[0].is_last_chunk);
        assert!(!chunks[1].is_last_chunk);
        assert!(chunks[2].is_last_chunk);
        assert!(chunks.iter().all(|c| c.segment == 3));
    }

    #[test]
    fn test_split_empty_segment() {
        let chunks = StateChunk::split(7, Vec::new(), 512);
        assert_eq!(chunks, vec![StateChunk::empty_last(7)]);
        assert!(chunks[0].is_empty());
    }

    #[test]
    fn test_transaction_info_filters_segments() {
        let p = KeyPartitioner::new(16);
        let a = Bytes::from_static(b"alpha");
        let b = (0..100)
            .map(|i| Bytes::from(format!("beta{i}")))
            .find(|k| p.segment_of(k) != p.segment_of(&a))
            .unwrap();
        let tx = RemoteTransaction {
            gtx: GlobalTransactionId { originator: 1, id: 9 },
            modifications: vec![
                Mutation::Put(InternalEntry::new(a.clone(), "1")),
                Mutation::Remove(b.clone()),
            ],
            locked_keys: BTreeSet::from([a.clone(), b.clone()]),
            topology_id: 4,
            from_state_transfer: false,
        };

        let only_a = BTreeSet::from([p.segment_of(&a)]);
        let info = TransactionInfo::for_segments(&tx, &p, &only_a).unwrap();
        assert_eq!(info.locked_keys, vec![a]);
        assert_eq!(info.modifications.len(), 1);
        assert!(info.clone().into_remote().from_state_transfer);

        let neither: BTreeSet<SegmentId> = (0..16)
            .filter(|s| *s != p.segment_of(b"alpha") && *s != p.segment_of(&b))
            .collect();
        assert!(TransactionInfo::for_segments(&tx, &p, &neither).is_none());
    }
}
