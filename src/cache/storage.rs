//! Local entry storage.
//!
//! The grid only talks to storage through [`DataContainer`]. The provided
//! [`InMemoryDataContainer`] keeps one concurrent map per segment so that
//! state transfer can read or drop a whole segment without scanning the
//! rest.

use crate::partitioning::KeyPartitioner;
use crate::types::{now_millis, InternalEntry, SegmentId};
use bytes::Bytes;
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::fmt::Debug;

/// Storage collaborator used by the provider (read) and consumer (write).
pub trait DataContainer: Send + Sync + Debug {
    /// Live entry for a key. Expired entries are not returned.
    fn get(&self, key: &[u8]) -> Option<InternalEntry>;

    /// Insert or replace an entry.
    fn put(&self, entry: InternalEntry);

    fn remove(&self, key: &[u8]) -> Option<InternalEntry>;

    fn clear(&self);

    /// Number of stored entries, expired ones included.
    fn size(&self) -> usize;

    /// Snapshot of the live entries of one segment.
    fn segment_entries(&self, segment: SegmentId) -> Vec<InternalEntry>;

    /// Drop every entry of the given segments, returning how many were removed.
    fn remove_segments(&self, segments: &BTreeSet<SegmentId>) -> usize;

    /// Keys of every stored entry.
    fn keys(&self) -> Vec<Bytes>;
}

/// Segmented in-memory container.
#[derive(Debug)]
pub struct InMemoryDataContainer {
    partitioner: KeyPartitioner,
    segments: Vec<DashMap<Bytes, InternalEntry>>,
}

impl InMemoryDataContainer {
    pub fn new(partitioner: KeyPartitioner) -> Self {
        let segments = (0..partitioner.num_segments())
            .map(|_| DashMap::new())
            .collect();
        Self {
            partitioner,
            segments,
        }
    }

    fn segment_map(&self, key: &[u8]) -> &DashMap<Bytes, InternalEntry> {
        &self.segments[self.partitioner.segment_of(key) as usize]
    }
}

impl DataContainer for InMemoryDataContainer {
    fn get(&self, key: &[u8]) -> Option<InternalEntry> {
        let entry = self.segment_map(key).get(key)?;
        if entry.is_expired() {
            return None;
        }
        Some(entry.clone())
    }

    fn put(&self, entry: InternalEntry) {
        self.segment_map(&entry.key).insert(entry.key.clone(), entry);
    }

    fn remove(&self, key: &[u8]) -> Option<InternalEntry> {
        self.segment_map(key).remove(key).map(|(_, e)| e)
    }

    fn clear(&self) {
        for segment in &self.segments {
            segment.clear();
        }
    }

    fn size(&self) -> usize {
        self.segments.iter().map(DashMap::len).sum()
    }

    fn segment_entries(&self, segment: SegmentId) -> Vec<InternalEntry> {
        let Some(map) = self.segments.get(segment as usize) else {
            return Vec::new();
        };
        let now = now_millis();
        map.iter()
            .filter(|e| !e.metadata.is_expired_at(now))
            .map(|e| e.value().clone())
            .collect()
    }

    fn remove_segments(&self, segments: &BTreeSet<SegmentId>) -> usize {
        let mut removed = 0;
        for segment in segments {
            if let Some(map) = self.segments.get(*segment as usize) {
                removed += map.len();
                map.clear();
            }
        }
        removed
    }

    fn keys(&self) -> Vec<Bytes> {
        self.segments
            .iter()
            .flat_map(|map| map.iter().map(|e| e.key().clone()).collect::<Vec<_>>())
            .collect()
    }
}
