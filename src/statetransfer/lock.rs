//! Topology gate for commands.
//!
//! Commands run under the shared topology lock; installing a topology takes
//! it exclusively. Both are fair (tokio's `RwLock` queues writers), so a
//! stream of commands cannot starve a topology change and vice versa.
//! Waiters block until a given topology, or the transaction data for it,
//! is installed.

use crate::error::{Error, Result};
use crate::topology::CacheTopology;
use crate::types::TopologyId;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::trace;

/// Per-cache topology lock and installation signals.
#[derive(Debug)]
pub struct StateTransferLock {
    topology_lock: RwLock<()>,
    topology: watch::Sender<Option<Arc<CacheTopology>>>,
    transaction_data: watch::Sender<TopologyId>,
}

impl Default for StateTransferLock {
    fn default() -> Self {
        Self::new()
    }
}

impl StateTransferLock {
    pub fn new() -> Self {
        Self {
            topology_lock: RwLock::new(()),
            topology: watch::channel(None).0,
            transaction_data: watch::channel(0).0,
        }
    }

    /// Held by commands while they read ownership and touch local data.
    pub async fn acquire_shared(&self) -> RwLockReadGuard<'_, ()> {
        self.topology_lock.read().await
    }

    /// Held while a new topology is installed.
    pub async fn acquire_exclusive(&self) -> RwLockWriteGuard<'_, ()> {
        self.topology_lock.write().await
    }

    /// Publish a new topology and release everyone waiting for it.
    pub fn notify_topology_installed(&self, topology: Arc<CacheTopology>) {
        trace!(topology_id = topology.topology_id, "Topology installed");
        self.topology.send_replace(Some(topology));
    }

    pub fn current_topology(&self) -> Option<Arc<CacheTopology>> {
        self.topology.borrow().clone()
    }

    pub fn topology_id(&self) -> TopologyId {
        self.topology
            .borrow()
            .as_ref()
            .map(|t| t.topology_id)
            .unwrap_or(0)
    }

    /// Wait until a topology with id at least `topology_id` is installed.
    pub async fn wait_for_topology(
        &self,
        topology_id: TopologyId,
        timeout: Duration,
    ) -> Result<Arc<CacheTopology>> {
        let mut rx = self.topology.subscribe();
        let wait = rx.wait_for(|t| t.as_ref().is_some_and(|t| t.topology_id >= topology_id));
        let result = match tokio::time::timeout(timeout, wait).await {
            Ok(Ok(t)) => t.clone().ok_or(Error::Cancelled),
            Ok(Err(_)) => Err(Error::Cancelled),
            Err(_) => Err(Error::Timeout),
        };
        result
    }

    /// Mark the transactions of every topology up to `topology_id` as received.
    pub fn notify_transaction_data_received(&self, topology_id: TopologyId) {
        self.transaction_data.send_if_modified(|current| {
            if topology_id > *current {
                *current = topology_id;
                true
            } else {
                false
            }
        });
    }

    pub fn transaction_data_received(&self, topology_id: TopologyId) -> bool {
        *self.transaction_data.borrow() >= topology_id
    }

    /// Wait until the transactions of `topology_id` have been pulled.
    pub async fn wait_for_transaction_data(
        &self,
        topology_id: TopologyId,
        timeout: Duration,
    ) -> Result<()> {
        let mut rx = self.transaction_data.subscribe();
        let result = match tokio::time::timeout(timeout, rx.wait_for(|id| *id >= topology_id)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(Error::Cancelled),
            Err(_) => Err(Error::Timeout),
        };
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheMode;
    use crate::partitioning::ConsistentHashFactory;

    fn topology(id: TopologyId) -> Arc<CacheTopology> {
        let factory = ConsistentHashFactory::new(CacheMode::Distributed, 1, 4).unwrap();
        Arc::new(CacheTopology::stable(id, 1, factory.create(&[1]).unwrap(), vec![]))
    }

    #[tokio::test]
    async fn test_waiters_released_by_install() {
        let lock = Arc::new(StateTransferLock::new());
        let waiter = {
            let lock = lock.clone();
            tokio::spawn(async move { lock.wait_for_topology(3, Duration::from_secs(5)).await })
        };
        lock.notify_topology_installed(topology(2));
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        lock.notify_topology_installed(topology(3));
        let t = waiter.await.unwrap().unwrap();
        assert_eq!(t.topology_id, 3);
        assert_eq!(lock.topology_id(), 3);
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let lock = StateTransferLock::new();
        let err = lock
            .wait_for_topology(1, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout));
    }

    #[tokio::test]
    async fn test_transaction_data_is_monotonic() {
        let lock = StateTransferLock::new();
        lock.notify_transaction_data_received(5);
        lock.notify_transaction_data_received(3);
        assert!(lock.transaction_data_received(5));
        assert!(!lock.transaction_data_received(6));
        lock.wait_for_transaction_data(4, Duration::from_millis(10))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_exclusive_waits_for_shared() {
        let lock = Arc::new(StateTransferLock::new());
        let shared = lock.acquire_shared().await;
        let writer = {
            let lock = lock.clone();
            tokio::spawn(async move {
                let _guard = lock.acquire_exclusive().await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!writer.is_finished());
        drop(shared);
        writer.await.unwrap();
    }
}
