//! Partitioning module: keys to segments, segments to owners.
//!
//! The keyspace is split into a fixed number of segments by the
//! [`KeyPartitioner`]. A [`ConsistentHash`] assigns each segment an ordered
//! owner list over the current members, and the
//! [`ConsistentHashFactory`] builds new tables when membership changes.
//!
//! # Architecture
//!
//! ```text
//! key "user:123" ──xxhash64──► segment 17
//!                                  │
//!                                  ▼
//! ┌──────────────────────────────────────────────┐
//! │ ConsistentHash (numOwners = 2)               │
//! │   segment 0  → [n1, n2]                      │
//! │   ...                                        │
//! │   segment 17 → [n3, n1]   primary n3         │
//! │   ...                                        │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust
//! use gridstate::config::CacheMode;
//! use gridstate::partitioning::{ConsistentHashFactory, KeyPartitioner};
//!
//! let factory = ConsistentHashFactory::new(CacheMode::Distributed, 2, 64).unwrap();
//! let ch = factory.create(&[1, 2, 3]).unwrap();
//! let segment = KeyPartitioner::new(64).segment_of(b"user:123");
//! assert_eq!(ch.locate_owners(segment).len(), 2);
//!
//! // node 4 joins: keep current owners, then compute the balanced target
//! let pending = factory.rebalance(&factory.update_members(&ch, &[1, 2, 3, 4]));
//! let union = factory.union(&ch, &pending);
//! assert!(union.locate_owners(segment).len() >= 2);
//! ```

mod consistent_hash;
mod factory;
mod partitioner;

pub use consistent_hash::ConsistentHash;
pub use factory::ConsistentHashFactory;
pub use partitioner::KeyPartitioner;
