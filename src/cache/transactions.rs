//! Transaction registry collaborator.
//!
//! A participant registers each prepared transaction here, together with
//! the keys it locks. State transfer copies registered transactions to new
//! owners so they can take part in commits that started before the
//! topology changed.

use crate::error::{Result, StorageError};
use crate::types::{Mutation, NodeId, TopologyId};
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// How many completed transaction ids are remembered.
const COMPLETED_HISTORY: usize = 4096;

/// Cluster-wide transaction identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GlobalTransactionId {
    pub originator: NodeId,
    pub id: u64,
}

impl fmt::Display for GlobalTransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx-{}-{}", self.originator, self.id)
    }
}

/// A prepared transaction as seen by a participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTransaction {
    pub gtx: GlobalTransactionId,
    pub modifications: Vec<Mutation>,
    pub locked_keys: BTreeSet<Bytes>,
    /// Topology the transaction was last prepared in.
    pub topology_id: TopologyId,
    /// Learned through state transfer rather than a prepare.
    pub from_state_transfer: bool,
}

/// Participant-side transaction table.
pub trait TransactionRegistry: Send + Sync + fmt::Debug {
    /// Register or extend a prepared transaction and lock its keys. A
    /// transaction that already completed is ignored.
    fn prepare(
        &self,
        gtx: GlobalTransactionId,
        modifications: Vec<Mutation>,
        topology_id: TopologyId,
    ) -> Result<()>;

    fn get(&self, gtx: &GlobalTransactionId) -> Option<RemoteTransaction>;

    /// Remove a transaction, release its locks and remember it as completed.
    fn complete(&self, gtx: &GlobalTransactionId) -> Option<RemoteTransaction>;

    fn is_completed(&self, gtx: &GlobalTransactionId) -> bool;

    fn transactions(&self) -> Vec<RemoteTransaction>;

    /// Register a transaction received from a previous owner. Returns false
    /// when it was ignored because it already completed here.
    fn add_from_state_transfer(&self, tx: RemoteTransaction) -> bool;

    fn lock_owner(&self, key: &[u8]) -> Option<GlobalTransactionId>;

    fn locked_key_count(&self) -> usize;

    /// Complete every transaction whose originator is not in `members`.
    fn release_orphans(&self, members: &[NodeId]) -> Vec<GlobalTransactionId>;
}

#[derive(Debug, Default)]
struct RegistryInner {
    transactions: HashMap<GlobalTransactionId, RemoteTransaction>,
    locks: HashMap<Bytes, GlobalTransactionId>,
    completed: HashSet<GlobalTransactionId>,
    completed_order: VecDeque<GlobalTransactionId>,
}

impl RegistryInner {
    fn lock_keys(&mut self, gtx: GlobalTransactionId, keys: &BTreeSet<Bytes>) -> Result<()> {
        if let Some(owner) = keys
            .iter()
            .filter_map(|k| self.locks.get(k))
            .find(|owner| **owner != gtx)
        {
            return Err(StorageError::KeyLocked {
                owner: owner.to_string(),
            }
            .into());
        }
        for key in keys {
            self.locks.insert(key.clone(), gtx);
        }
        Ok(())
    }

    fn merge(&mut self, tx: RemoteTransaction) -> Result<()> {
        self.lock_keys(tx.gtx, &tx.locked_keys)?;
        match self.transactions.get_mut(&tx.gtx) {
            Some(existing) => {
                for m in tx.modifications {
                    if !existing.modifications.contains(&m) {
                        existing.modifications.push(m);
                    }
                }
                existing.locked_keys.extend(tx.locked_keys);
                existing.topology_id = existing.topology_id.max(tx.topology_id);
            }
            None => {
                self.transactions.insert(tx.gtx, tx);
            }
        }
        Ok(())
    }

    fn complete(&mut self, gtx: &GlobalTransactionId) -> Option<RemoteTransaction> {
        let tx = self.transactions.remove(gtx);
        self.locks.retain(|_, owner| *owner != *gtx);
        if self.completed.insert(*gtx) {
            self.completed_order.push_back(*gtx);
            if self.completed_order.len() > COMPLETED_HISTORY {
                if let Some(old) = self.completed_order.pop_front() {
                    self.completed.remove(&old);
                }
            }
        }
        tx
    }
}

/// In-memory [`TransactionRegistry`].
#[derive(Debug, Default)]
pub struct InMemoryTransactionRegistry {
    inner: Mutex<RegistryInner>,
}

impl InMemoryTransactionRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TransactionRegistry for InMemoryTransactionRegistry {
    fn prepare(
        &self,
        gtx: GlobalTransactionId,
        modifications: Vec<Mutation>,
        topology_id: TopologyId,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.completed.contains(&gtx) {
            return Ok(());
        }
        let locked_keys = modifications.iter().map(|m| m.key().clone()).collect();
        inner.merge(RemoteTransaction {
            gtx,
            modifications,
            locked_keys,
            topology_id,
            from_state_transfer: false,
        })
    }

    fn get(&self, gtx: &GlobalTransactionId) -> Option<RemoteTransaction> {
        self.inner.lock().transactions.get(gtx).cloned()
    }

    fn complete(&self, gtx: &GlobalTransactionId) -> Option<RemoteTransaction> {
        self.inner.lock().complete(gtx)
    }

    fn is_completed(&self, gtx: &GlobalTransactionId) -> bool {
        self.inner.lock().completed.contains(gtx)
    }

    fn transactions(&self) -> Vec<RemoteTransaction> {
        self.inner.lock().transactions.values().cloned().collect()
    }

    fn add_from_state_transfer(&self, mut tx: RemoteTransaction) -> bool {
        let mut inner = self.inner.lock();
        if inner.completed.contains(&tx.gtx) {
            return false;
        }
        tx.from_state_transfer = !inner.transactions.contains_key(&tx.gtx);
        // keys locked by another transaction stay with their owner
        let gtx = tx.gtx;
        tx.locked_keys
            .retain(|k| inner.locks.get(k).map_or(true, |owner| *owner == gtx));
        inner.merge(tx).is_ok()
    }

    fn lock_owner(&self, key: &[u8]) -> Option<GlobalTransactionId> {
        self.inner.lock().locks.get(key).copied()
    }

    fn locked_key_count(&self) -> usize {
        self.inner.lock().locks.len()
    }

    fn release_orphans(&self, members: &[NodeId]) -> Vec<GlobalTransactionId> {
        let mut inner = self.inner.lock();
        let orphans: Vec<_> = inner
            .transactions
            .keys()
            .filter(|gtx| !members.contains(&gtx.originator))
            .copied()
            .collect();
        for gtx in &orphans {
            inner.complete(gtx);
        }
        orphans
    }
}

/// A transaction as seen by the node that started it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTransaction {
    pub gtx: GlobalTransactionId,
    pub modifications: Vec<Mutation>,
    /// Nodes a prepare succeeded on.
    pub prepared_on: BTreeSet<NodeId>,
    /// Topology of the last prepare.
    pub topology_id: TopologyId,
}

/// Originator-side transaction table.
#[derive(Debug)]
pub struct LocalTransactionTable {
    originator: NodeId,
    next_id: AtomicU64,
    transactions: DashMap<GlobalTransactionId, LocalTransaction>,
}

impl LocalTransactionTable {
    pub fn new(originator: NodeId) -> Self {
        Self {
            originator,
            next_id: AtomicU64::new(1),
            transactions: DashMap::new(),
        }
    }

    pub fn begin(&self) -> GlobalTransactionId {
        let gtx = GlobalTransactionId {
            originator: self.originator,
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
        };
        self.transactions.insert(
            gtx,
            LocalTransaction {
                gtx,
                modifications: Vec::new(),
                prepared_on: BTreeSet::new(),
                topology_id: 0,
            },
        );
        gtx
    }

    /// Record a write. Writes after the prepare are rejected.
    pub fn write(&self, gtx: &GlobalTransactionId, mutation: Mutation) -> Result<()> {
        let mut tx = self
            .transactions
            .get_mut(gtx)
            .ok_or_else(|| StorageError::UnknownTransaction(gtx.to_string()))?;
        if !tx.prepared_on.is_empty() {
            return Err(StorageError::AlreadyPrepared(gtx.to_string()).into());
        }
        tx.modifications.retain(|m| m.key() != mutation.key());
        tx.modifications.push(mutation);
        Ok(())
    }

    pub fn get(&self, gtx: &GlobalTransactionId) -> Result<LocalTransaction> {
        self.transactions
            .get(gtx)
            .map(|tx| tx.clone())
            .ok_or_else(|| StorageError::UnknownTransaction(gtx.to_string()).into())
    }

    pub fn mark_prepared(
        &self,
        gtx: &GlobalTransactionId,
        nodes: impl IntoIterator<Item = NodeId>,
        topology_id: TopologyId,
    ) {
        if let Some(mut tx) = self.transactions.get_mut(gtx) {
            tx.prepared_on.extend(nodes);
            tx.topology_id = tx.topology_id.max(topology_id);
        }
    }

    pub fn remove(&self, gtx: &GlobalTransactionId) -> Option<LocalTransaction> {
        self.transactions.remove(gtx).map(|(_, tx)| tx)
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::types::InternalEntry;

    fn gtx(id: u64) -> GlobalTransactionId {
        GlobalTransactionId { originator: 1, id }
    }

    fn put(key: &str) -> Mutation {
        Mutation::Put(InternalEntry::new(key.to_string(), "v"))
    }

    #[test]
    fn test_prepare_locks_and_complete_releases() {
        let registry = InMemoryTransactionRegistry::new();
        registry.prepare(gtx(1), vec![put("a"), put("b")], 3).unwrap();
        assert_eq!(registry.locked_key_count(), 2);
        assert_eq!(registry.lock_owner(b"a"), Some(gtx(1)));

        let tx = registry.complete(&gtx(1)).unwrap();
        assert_eq!(tx.modifications.len(), 2);
        assert_eq!(registry.locked_key_count(), 0);
        assert!(registry.is_completed(&gtx(1)));
    }

    #[test]
    fn test_conflicting_prepare_fails() {
        let registry = InMemoryTransactionRegistry::new();
        registry.prepare(gtx(1), vec![put("a")], 1).unwrap();
        let err = registry.prepare(gtx(2), vec![put("a")], 1).unwrap_err();
        assert!(matches!(err, Error::Storage(StorageError::KeyLocked { .. })));
        // repeating the same prepare is fine
        registry.prepare(gtx(1), vec![put("a")], 2).unwrap();
        assert_eq!(registry.get(&gtx(1)).unwrap().topology_id, 2);
    }

    #[test]
    fn test_prepare_after_completion_is_ignored() {
        let registry = InMemoryTransactionRegistry::new();
        registry.complete(&gtx(5));
        registry.prepare(gtx(5), vec![put("a")], 1).unwrap();
        assert!(registry.get(&gtx(5)).is_none());
        assert_eq!(registry.locked_key_count(), 0);
    }

    #[test]
    fn test_transferred_transactions() {
        let registry = InMemoryTransactionRegistry::new();
        let tx = RemoteTransaction {
            gtx: gtx(7),
            modifications: vec![put("k")],
            locked_keys: BTreeSet::from([Bytes::from_static(b"k")]),
            topology_id: 4,
            from_state_transfer: false,
        };
        assert!(registry.add_from_state_transfer(tx.clone()));
        let stored = registry.get(&gtx(7)).unwrap();
        assert!(stored.from_state_transfer);
        assert_eq!(registry.lock_owner(b"k"), Some(gtx(7)));

        registry.complete(&gtx(7));
        assert!(!registry.add_from_state_transfer(tx));
        assert_eq!(registry.locked_key_count(), 0);
    }

    #[test]
    fn test_release_orphans() {
        let registry = InMemoryTransactionRegistry::new();
        registry
            .prepare(GlobalTransactionId { originator: 1, id: 1 }, vec![put("a")], 1)
            .unwrap();
        registry
            .prepare(GlobalTransactionId { originator: 2, id: 1 }, vec![put("b")], 1)
            .unwrap();
        let released = registry.release_orphans(&[2, 3]);
        assert_eq!(released, vec![GlobalTransactionId { originator: 1, id: 1 }]);
        assert_eq!(registry.locked_key_count(), 1);
    }

    #[test]
    fn test_local_table() {
        let table = LocalTransactionTable::new(4);
        let gtx = table.begin();
        assert_eq!(gtx.originator, 4);
        table.write(&gtx, put("a")).unwrap();
        table.write(&gtx, put("a")).unwrap();
        table.write(&gtx, put("b")).unwrap();
        assert_eq!(table.get(&gtx).unwrap().modifications.len(), 2);

        table.mark_prepared(&gtx, [1, 2], 6);
        assert!(table.write(&gtx, put("c")).is_err());
        let tx = table.remove(&gtx).unwrap();
        assert_eq!(tx.prepared_on, BTreeSet::from([1, 2]));
        assert_eq!(tx.topology_id, 6);
        assert!(table.get(&gtx).is_err());
    }
}
