//! Multi-node scenarios over the in-memory network.

use super::utils::init_tracing;
use super::TestCluster;
use crate::config::CacheConfig;
use crate::partitioning::KeyPartitioner;
use crate::rebalancing::RebalancingStatus;
use crate::types::NodeId;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const CACHE: &str = "grid";
const STABLE_TIMEOUT: Duration = Duration::from_secs(20);

fn distributed() -> CacheConfig {
    CacheConfig::distributed(2).with_num_segments(32)
}

fn key(i: usize) -> String {
    format!("key-{i}")
}

/// Nodes whose local storage holds `key`.
fn holders(cluster: &TestCluster, key: &str) -> Vec<NodeId> {
    cluster
        .members()
        .into_iter()
        .filter(|id| {
            cluster
                .cache(*id, CACHE)
                .is_some_and(|c| c.data_container().get(key.as_bytes()).is_some())
        })
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_coordinator_crash_during_writes() {
    init_tracing();
    let mut cluster = TestCluster::start(3).await;
    cluster.start_cache(CACHE, distributed()).await.unwrap();
    cluster.wait_for_stable(CACHE, STABLE_TIMEOUT).await.unwrap();

    let writer = cluster.cache(2, CACHE).unwrap();
    for i in 0..100 {
        writer.put(key(i), format!("v{i}")).await.unwrap();
    }

    // keep overwriting while the coordinator dies and its segments move
    let stop = Arc::new(AtomicBool::new(false));
    let updates = {
        let writer = writer.clone();
        let stop = stop.clone();
        tokio::spawn(async move {
            let mut last: Vec<Option<String>> = vec![None; 100];
            let mut during_rebalance = 0;
            let mut round = 0;
            while !stop.load(Ordering::Acquire) {
                for (i, slot) in last.iter_mut().enumerate().take(20) {
                    let rebalancing = writer.topology().is_some_and(|t| !t.is_stable());
                    let value = format!("after_st_{round}_{i}");
                    writer.put(key(i), value.clone()).await.unwrap();
                    if rebalancing && writer.topology().is_some_and(|t| !t.is_stable()) {
                        during_rebalance += 1;
                    }
                    *slot = Some(value);
                }
                round += 1;
            }
            writer.put("after_st", "after").await.unwrap();
            (last, during_rebalance)
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    cluster.kill(1).await;
    assert!(cluster.node(2).unwrap().is_coordinator());
    let topology = cluster.wait_for_stable(CACHE, STABLE_TIMEOUT).await.unwrap();
    stop.store(true, Ordering::Release);
    let (last, during_rebalance) = updates.await.unwrap();
    assert_eq!(topology.members(), &[2, 3]);
    assert!(during_rebalance > 0, "no write landed while segments were moving");

    let partitioner = KeyPartitioner::new(topology.num_segments());
    let keys = (0..100).map(key).chain(std::iter::once("after_st".to_string()));
    for k in keys {
        for id in cluster.members() {
            let value = cluster.cache(id, CACHE).unwrap().get(k.clone()).await.unwrap();
            assert!(value.is_some(), "{k} missing when read through node {id}");
        }
        let owners = topology.read_owners(partitioner.segment_of(k.as_bytes())).len();
        assert_eq!(holders(&cluster, &k).len(), owners, "{k} has a wrong number of copies");
    }
    for id in cluster.members() {
        let reader = cluster.cache(id, CACHE).unwrap();
        assert_eq!(reader.get("after_st").await.unwrap(), Some(Bytes::from("after")));
        for (i, expected) in last.iter().enumerate() {
            let expected = expected.clone().unwrap_or_else(|| format!("v{i}"));
            assert_eq!(
                reader.get(key(i)).await.unwrap(),
                Some(Bytes::from(expected)),
                "{} reverted on node {id}",
                key(i)
            );
        }
        // every stored copy carries the latest write, not the transferred one
        let data = reader.data_container();
        for (i, expected) in last.iter().enumerate() {
            if let (Some(expected), Some(entry)) = (expected, data.get(key(i).as_bytes())) {
                assert_eq!(entry.value, Bytes::from(expected.clone()), "stale copy on node {id}");
            }
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_clear_during_join_leaves_no_entries() {
    init_tracing();
    let mut cluster = TestCluster::start(2).await;
    let caches = cluster.start_cache(CACHE, CacheConfig::replicated()).await.unwrap();
    for i in 0..50 {
        caches[0].put(key(i), "v").await.unwrap();
    }

    let clearing = caches[1].clone();
    let (joined, cleared) = tokio::join!(
        async {
            let id = cluster.add_node().await;
            cluster.start_cache_on(id, CACHE, CacheConfig::replicated()).await
        },
        clearing.clear()
    );
    joined.unwrap();
    cleared.unwrap();

    let topology = cluster.wait_for_stable(CACHE, STABLE_TIMEOUT).await.unwrap();
    assert_eq!(topology.members(), &[1, 2, 3]);
    for id in cluster.members() {
        let cache = cluster.cache(id, CACHE).unwrap();
        assert_eq!(cache.data_container().size(), 0, "node {id} kept entries after clear");
        assert_eq!(cache.get(key(0)).await.unwrap(), None);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_join_waits_for_initial_transfer() {
    init_tracing();
    let mut cluster = TestCluster::start(2).await;
    let config = CacheConfig::replicated().with_num_segments(16);
    let caches = cluster.start_cache(CACHE, config.clone()).await.unwrap();
    for i in 0..100 {
        caches[i % 2].put(key(i), format!("v{i}")).await.unwrap();
    }

    let id = cluster.add_node().await;
    let joined = cluster.start_cache_on(id, CACHE, config).await.unwrap();

    // no waiting: the data is local once start returns
    let topology = joined.topology().unwrap();
    assert!(topology.is_stable());
    assert!(topology.current_ch.is_member(id));
    let data = joined.data_container();
    for i in 0..100 {
        let entry = data.get(key(i).as_bytes()).unwrap();
        assert_eq!(entry.value, Bytes::from(format!("v{i}")));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_suspended_rebalancing_defers_joiners() {
    init_tracing();
    let mut cluster = TestCluster::start(2).await;
    cluster.start_cache(CACHE, distributed()).await.unwrap();
    cluster.wait_for_stable(CACHE, STABLE_TIMEOUT).await.unwrap();

    let admin_node = cluster.node(2).unwrap();
    admin_node.admin().set_rebalancing_enabled(false).await.unwrap();

    for _ in 0..2 {
        let id = cluster.add_node().await;
        cluster.start_cache_on(id, CACHE, distributed()).await.unwrap();
    }
    let coordinator = cluster.coordinator().unwrap();
    let topology = coordinator.coordinator().cache_topology(CACHE).unwrap();
    assert_eq!(topology.members(), &[1, 2]);
    assert!(topology.pending_ch.is_none());
    assert_eq!(
        admin_node.admin().rebalancing_status(CACHE).await.unwrap(),
        RebalancingStatus::Suspended
    );
    assert!(!cluster.node(4).unwrap().admin().is_rebalancing_enabled());

    admin_node.admin().set_rebalancing_enabled(true).await.unwrap();
    let topology = cluster.wait_for_stable(CACHE, STABLE_TIMEOUT).await.unwrap();
    assert_eq!(topology.members(), &[1, 2, 3, 4]);
    for segment in 0..topology.num_segments() as u32 {
        assert_eq!(topology.current_ch.locate_owners(segment).len(), 2);
    }
    assert_eq!(
        admin_node.admin().rebalancing_status(CACHE).await.unwrap(),
        RebalancingStatus::Complete
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_prepared_transaction_survives_primary_crash() {
    init_tracing();
    let mut cluster = TestCluster::start(3).await;
    cluster.start_cache(CACHE, distributed()).await.unwrap();
    let topology = cluster.wait_for_stable(CACHE, STABLE_TIMEOUT).await.unwrap();

    // node 1 coordinates and runs the transaction on a key it does not own
    let partitioner = KeyPartitioner::new(topology.num_segments());
    let (tx_key, owners) = (0..1000)
        .map(key)
        .map(|k| {
            let owners = topology.read_owners(partitioner.segment_of(k.as_bytes())).to_vec();
            (k, owners)
        })
        .find(|(_, owners)| !owners.contains(&1))
        .unwrap();
    let (primary, survivor) = (owners[0], owners[1]);
    let originator_id: NodeId = 1;

    let originator = cluster.cache(originator_id, CACHE).unwrap();
    let gtx = originator.begin();
    originator.tx_put(&gtx, tx_key.clone(), "committed").unwrap();
    originator.prepare(&gtx).await.unwrap();
    assert!(originator.transaction_registry().get(&gtx).is_none());
    for id in [primary, survivor] {
        let registry = cluster.cache(id, CACHE).unwrap().transaction_registry();
        assert_eq!(registry.lock_owner(tx_key.as_bytes()), Some(gtx));
    }

    cluster.kill(primary).await;
    let topology = cluster.wait_for_stable(CACHE, STABLE_TIMEOUT).await.unwrap();
    assert_eq!(topology.members(), &[1, survivor]);

    // the originator became an owner and learned the transaction by transfer
    let transferred = originator.transaction_registry().get(&gtx).unwrap();
    assert!(transferred.from_state_transfer);
    assert_eq!(
        originator.transaction_registry().lock_owner(tx_key.as_bytes()),
        Some(gtx)
    );

    originator.commit(&gtx).await.unwrap();
    let new_owners = topology.read_owners(partitioner.segment_of(tx_key.as_bytes()));
    assert!(new_owners.contains(&survivor));
    for &id in new_owners {
        let cache = cluster.cache(id, CACHE).unwrap();
        let entry = cache.data_container().get(tx_key.as_bytes()).unwrap();
        assert_eq!(entry.value, Bytes::from("committed"));
    }
    for id in cluster.members() {
        let cache = cluster.cache(id, CACHE).unwrap();
        assert_eq!(cache.transaction_registry().locked_key_count(), 0, "node {id} kept a lock");
        assert_eq!(cache.get(tx_key.clone()).await.unwrap(), Some(Bytes::from("committed")));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reads_never_miss_during_rebalance() {
    init_tracing();
    let mut cluster = TestCluster::start(2).await;
    let caches = cluster.start_cache(CACHE, distributed()).await.unwrap();
    for i in 0..50 {
        caches[0].put(key(i), "v").await.unwrap();
    }

    let stop = Arc::new(AtomicBool::new(false));
    let misses = Arc::new(AtomicUsize::new(0));
    let reader = {
        let cache = caches[1].clone();
        let stop = stop.clone();
        let misses = misses.clone();
        tokio::spawn(async move {
            let mut rounds = 0;
            while !stop.load(Ordering::SeqCst) || rounds == 0 {
                for i in 0..50 {
                    if !matches!(cache.get(key(i)).await, Ok(Some(_))) {
                        misses.fetch_add(1, Ordering::SeqCst);
                    }
                }
                rounds += 1;
            }
        })
    };

    let id = cluster.add_node().await;
    cluster.start_cache_on(id, CACHE, distributed()).await.unwrap();
    cluster.wait_for_stable(CACHE, STABLE_TIMEOUT).await.unwrap();
    stop.store(true, Ordering::SeqCst);
    reader.await.unwrap();
    assert_eq!(misses.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_recovered_coordinator_finishes_balanced() {
    init_tracing();
    let mut cluster = TestCluster::start(3).await;
    cluster.start_cache(CACHE, distributed()).await.unwrap();
    cluster.wait_for_stable(CACHE, STABLE_TIMEOUT).await.unwrap();

    // crash the coordinator while the fourth node is being rebalanced in
    let id = cluster.add_node().await;
    let joiner = cluster.node(id).unwrap();
    let join = tokio::spawn(async move { joiner.start_cache(CACHE, distributed()).await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    cluster.kill(1).await;
    join.await.unwrap().unwrap();

    let topology = cluster.wait_for_stable(CACHE, STABLE_TIMEOUT).await.unwrap();
    assert_eq!(topology.members(), &[2, 3, 4]);
    let ch = &topology.current_ch;
    for segment in 0..ch.num_segments() as u32 {
        let owners = ch.locate_owners(segment);
        assert_eq!(owners.len(), 2);
        assert!(!owners.contains(&1));
    }
    let counts = ch.primary_counts();
    let (min, max) = (
        counts.values().min().copied().unwrap_or(0),
        counts.values().max().copied().unwrap_or(0),
    );
    assert!(max - min <= 1, "unbalanced primaries: {counts:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_partition_merge_restores_single_topology() {
    init_tracing();
    let mut cluster = TestCluster::start(4).await;
    let caches = cluster.start_cache(CACHE, distributed()).await.unwrap();
    for i in 0..40 {
        caches[0].put(key(i), "v").await.unwrap();
    }
    cluster.wait_for_stable(CACHE, STABLE_TIMEOUT).await.unwrap();

    cluster.partition(&[vec![1, 2], vec![3, 4]]).await;
    cluster.merge().await;

    let topology = cluster.wait_for_stable(CACHE, STABLE_TIMEOUT).await.unwrap();
    assert_eq!(topology.members(), &[1, 2, 3, 4]);
    for segment in 0..topology.num_segments() as u32 {
        assert_eq!(topology.current_ch.locate_owners(segment).len(), 2);
    }
    for node in cluster.nodes() {
        assert!(node.coordinator().is_rebalancing_enabled());
    }
}
