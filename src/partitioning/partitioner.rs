//! Key to segment mapping.

use crate::types::SegmentId;
use std::hash::{Hash, Hasher};
use twox_hash::XxHash64;

/// Maps every key to one of a fixed number of segments, independent of
/// cluster membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyPartitioner {
    num_segments: u32,
}

impl KeyPartitioner {
    /// Create a partitioner. `num_segments` is clamped to at least one;
    /// configuration validation rejects zero before this point.
    pub fn new(num_segments: usize) -> Self {
        Self {
            num_segments: num_segments.clamp(1, u32::MAX as usize) as u32,
        }
    }

    pub fn num_segments(&self) -> usize {
        self.num_segments as usize
    }

    /// Segment of a key.
    pub fn segment_of(&self, key: &[u8]) -> SegmentId {
        (Self::hash_key(key) % self.num_segments as u64) as SegmentId
    }

    /// Calculate the hash of a key using xxHash64.
    fn hash_key(key: &[u8]) -> u64 {
        let mut hasher = XxHash64::with_seed(0);
        key.hash(&mut hasher);
        hasher.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_is_stable() {
        let p = KeyPartitioner::new(64);
        assert_eq!(p.segment_of(b"user:1"), p.segment_of(b"user:1"));
        assert!(p.segment_of(b"user:1") < 64);
    }

    #[test]
    fn test_single_segment() {
        let p = KeyPartitioner::new(1);
        for i in 0..100 {
            assert_eq!(p.segment_of(format!("k{i}").as_bytes()), 0);
        }
    }

    #[test]
    fn test_keys_spread_over_segments() {
        let p = KeyPartitioner::new(16);
        let mut seen = std::collections::HashSet::new();
        for i in 0..1000 {
            seen.insert(p.segment_of(format!("key_{i}").as_bytes()));
        }
        assert_eq!(seen.len(), 16);
    }
}
