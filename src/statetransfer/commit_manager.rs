//! Arbitration between transferred and live writes.
//!
//! While a segment is tracked for a transfer kind, every ordinary write to
//! it marks its key. A transfer write of that kind for a marked key is
//! dropped: the ordinary write is newer. A `clear` marks the whole segment.
//! Local rebalance and cross-site transfer are tracked independently.

use crate::cache::storage::DataContainer;
use crate::types::{Flag, Mutation, SegmentId};
use bytes::Bytes;
use dashmap::DashMap;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tracing::trace;

#[derive(Debug, Default)]
struct Tracking {
    /// Keys written by ordinary traffic since tracking started.
    overwritten: HashSet<Bytes>,
    /// A clear ran since tracking started.
    cleared: bool,
}

#[derive(Debug, Default)]
struct SegmentTracking {
    state_transfer: Option<Tracking>,
    xsite: Option<Tracking>,
}

impl SegmentTracking {
    fn slot(&mut self, flag: Flag) -> &mut Option<Tracking> {
        match flag {
            Flag::PutForStateTransfer => &mut self.state_transfer,
            Flag::PutForXSiteStateTransfer => &mut self.xsite,
        }
    }

    fn active(&mut self) -> impl Iterator<Item = &mut Tracking> {
        self.state_transfer.iter_mut().chain(self.xsite.iter_mut())
    }

    fn is_empty(&self) -> bool {
        self.state_transfer.is_none() && self.xsite.is_none()
    }
}

/// Writes entries to the data container, suppressing stale transfer writes.
#[derive(Debug)]
pub struct CommitManager {
    data: Arc<dyn DataContainer>,
    segments: DashMap<SegmentId, SegmentTracking>,
}

impl CommitManager {
    pub fn new(data: Arc<dyn DataContainer>) -> Self {
        Self {
            data,
            segments: DashMap::new(),
        }
    }

    /// Start tracking `segments` for one transfer kind. Existing marks of
    /// that kind are reset.
    pub fn start_track(&self, flag: Flag, segments: &BTreeSet<SegmentId>) {
        for &segment in segments {
            *self.segments.entry(segment).or_default().slot(flag) = Some(Tracking::default());
        }
        trace!(?flag, ?segments, "Tracking segments");
    }

    /// Stop tracking and forget the marks of one transfer kind.
    pub fn stop_track(&self, flag: Flag, segments: &BTreeSet<SegmentId>) {
        for segment in segments {
            let now_empty = match self.segments.get_mut(segment) {
                Some(mut tracking) => {
                    *tracking.slot(flag) = None;
                    tracking.is_empty()
                }
                None => false,
            };
            if now_empty {
                self.segments.remove_if(segment, |_, t| t.is_empty());
            }
        }
    }

    pub fn is_tracking(&self, flag: Flag, segment: SegmentId) -> bool {
        self.segments
            .get_mut(&segment)
            .is_some_and(|mut t| t.slot(flag).is_some())
    }

    /// Apply a mutation. `flag` is set for transfer writes. Returns false
    /// when a transfer write was discarded.
    pub fn commit(&self, mutation: Mutation, flag: Option<Flag>, segment: SegmentId) -> bool {
        let Some(mut tracking) = self.segments.get_mut(&segment) else {
            self.apply(mutation);
            return true;
        };
        match flag {
            None => {
                for t in tracking.active() {
                    t.overwritten.insert(mutation.key().clone());
                }
            }
            Some(flag) => {
                if let Some(t) = tracking.slot(flag) {
                    if t.cleared || t.overwritten.contains(mutation.key()) {
                        trace!(segment, ?flag, "Discarding stale transfer write");
                        return false;
                    }
                }
            }
        }
        // apply while the segment entry is held so arbitration and write are atomic
        self.apply(mutation);
        drop(tracking);
        true
    }

    /// Record a clear for every tracked segment.
    pub fn on_clear(&self) {
        for mut tracking in self.segments.iter_mut() {
            for t in tracking.active() {
                t.cleared = true;
            }
        }
    }

    fn apply(&self, mutation: Mutation) {
        match mutation {
            Mutation::Put(entry) => self.data.put(entry),
            Mutation::Remove(key) => {
                self.data.remove(&key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::storage::InMemoryDataContainer;
    use crate::partitioning::KeyPartitioner;
    use crate::types::InternalEntry;

    fn setup() -> (CommitManager, Arc<InMemoryDataContainer>, SegmentId) {
        let p = KeyPartitioner::new(4);
        let data = Arc::new(InMemoryDataContainer::new(p));
        (CommitManager::new(data.clone()), data, p.segment_of(b"k"))
    }

    fn put(value: &str) -> Mutation {
        Mutation::Put(InternalEntry::new("k", value.to_string()))
    }

    fn value(data: &InMemoryDataContainer) -> Option<Bytes> {
        data.get(b"k").map(|e| e.value)
    }

    #[test]
    fn test_live_write_beats_late_transfer() {
        let (cm, data, seg) = setup();
        cm.start_track(Flag::PutForStateTransfer, &BTreeSet::from([seg]));
        assert!(cm.commit(put("v2"), None, seg));
        assert!(!cm.commit(put("v1"), Some(Flag::PutForStateTransfer), seg));
        assert_eq!(value(&data).unwrap().as_ref(), b"v2");
    }

    #[test]
    fn test_transfer_write_applies_when_unmarked() {
        let (cm, data, seg) = setup();
        cm.start_track(Flag::PutForStateTransfer, &BTreeSet::from([seg]));
        assert!(cm.commit(put("v1"), Some(Flag::PutForStateTransfer), seg));
        // a live write after the transfer write still wins
        assert!(cm.commit(put("v2"), None, seg));
        assert_eq!(value(&data).unwrap().as_ref(), b"v2");
    }

    #[test]
    fn test_stop_clears_marks() {
        let (cm, data, seg) = setup();
        let segs = BTreeSet::from([seg]);
        cm.start_track(Flag::PutForStateTransfer, &segs);
        cm.commit(put("v2"), None, seg);
        cm.stop_track(Flag::PutForStateTransfer, &segs);
        assert!(!cm.is_tracking(Flag::PutForStateTransfer, seg));
        cm.start_track(Flag::PutForStateTransfer, &segs);
        assert!(cm.commit(put("v3"), Some(Flag::PutForStateTransfer), seg));
        assert_eq!(value(&data).unwrap().as_ref(), b"v3");
    }

    #[test]
    fn test_trackings_are_independent() {
        let (cm, _data, seg) = setup();
        let segs = BTreeSet::from([seg]);
        cm.start_track(Flag::PutForStateTransfer, &segs);
        cm.start_track(Flag::PutForXSiteStateTransfer, &segs);
        cm.commit(put("live"), None, seg);

        cm.stop_track(Flag::PutForStateTransfer, &segs);
        assert!(cm.is_tracking(Flag::PutForXSiteStateTransfer, seg));
        assert!(!cm.commit(put("x"), Some(Flag::PutForXSiteStateTransfer), seg));
    }

    #[test]
    fn test_clear_blocks_transfer_writes() {
        let (cm, data, seg) = setup();
        cm.start_track(Flag::PutForStateTransfer, &BTreeSet::from([seg]));
        data.clear();
        cm.on_clear();
        assert!(!cm.commit(put("old"), Some(Flag::PutForStateTransfer), seg));
        assert!(value(&data).is_none());
    }

    #[test]
    fn test_remove_marks_key() {
        let (cm, data, seg) = setup();
        cm.start_track(Flag::PutForStateTransfer, &BTreeSet::from([seg]));
        cm.commit(Mutation::Remove(Bytes::from_static(b"k")), None, seg);
        assert!(!cm.commit(put("old"), Some(Flag::PutForStateTransfer), seg));
        assert!(value(&data).is_none());
    }
}
