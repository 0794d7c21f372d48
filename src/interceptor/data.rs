//! Terminal handler: executes commands against local data.

use crate::cache::storage::DataContainer;
use crate::cache::transactions::TransactionRegistry;
use crate::error::{Result, StorageError};
use crate::interceptor::{
    Command, CommandHandler, CommandResult, InvocationContext, InvocationRole, Next,
};
use crate::partitioning::KeyPartitioner;
use crate::statetransfer::{CommitManager, StateTransferLock};
use crate::types::{Mutation, NodeId};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::trace;

#[derive(Debug)]
pub struct DataHandler {
    local: NodeId,
    partitioner: KeyPartitioner,
    data: Arc<dyn DataContainer>,
    registry: Arc<dyn TransactionRegistry>,
    commit_manager: Arc<CommitManager>,
    lock: Arc<StateTransferLock>,
}

impl DataHandler {
    pub fn new(
        local: NodeId,
        partitioner: KeyPartitioner,
        data: Arc<dyn DataContainer>,
        registry: Arc<dyn TransactionRegistry>,
        commit_manager: Arc<CommitManager>,
        lock: Arc<StateTransferLock>,
    ) -> Self {
        Self {
            local,
            partitioner,
            data,
            registry,
            commit_manager,
            lock,
        }
    }

    fn write(&self, ctx: &InvocationContext, mutation: Mutation) -> Result<CommandResult> {
        // backups apply what the primary already checked
        if ctx.role != InvocationRole::Backup {
            if let Some(owner) = self.registry.lock_owner(mutation.key()) {
                return Err(StorageError::KeyLocked {
                    owner: owner.to_string(),
                }
                .into());
            }
        }
        let segment = self.partitioner.segment_of(mutation.key());
        self.commit_manager.commit(mutation, None, segment);
        Ok(CommandResult::Done)
    }

    /// Apply the modifications this node owns.
    fn commit_transaction(&self, modifications: Vec<Mutation>) {
        let topology = self.lock.current_topology();
        for mutation in modifications {
            let segment = self.partitioner.segment_of(mutation.key());
            let owned = topology
                .as_ref()
                .map_or(true, |t| t.is_write_owner(segment, self.local));
            if owned {
                self.commit_manager.commit(mutation, None, segment);
            }
        }
    }
}

#[async_trait]
impl CommandHandler for DataHandler {
    async fn handle(
        &self,
        ctx: &mut InvocationContext,
        cmd: &Command,
        _next: Next<'_>,
    ) -> Result<CommandResult> {
        trace!(command = cmd.name(), role = ?ctx.role, "Executing locally");
        match cmd {
            Command::Get { key } => Ok(CommandResult::Value(self.data.get(key))),
            Command::Put { entry } => self.write(ctx, Mutation::Put(entry.clone())),
            Command::Remove { key } => self.write(ctx, Mutation::Remove(key.clone())),
            Command::Clear => {
                self.data.clear();
                self.commit_manager.on_clear();
                Ok(CommandResult::Done)
            }
            Command::Prepare { gtx, modifications } => {
                let topology_id = ctx.topology_id.unwrap_or_else(|| self.lock.topology_id());
                self.registry
                    .prepare(*gtx, modifications.clone(), topology_id)?;
                Ok(CommandResult::Done)
            }
            Command::Commit { gtx } => {
                if let Some(tx) = self.registry.complete(gtx) {
                    self.commit_transaction(tx.modifications);
                }
                Ok(CommandResult::Done)
            }
            Command::Rollback { gtx } => {
                self.registry.complete(gtx);
                Ok(CommandResult::Done)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::storage::InMemoryDataContainer;
    use crate::cache::transactions::{GlobalTransactionId, InMemoryTransactionRegistry};
    use crate::error::Error;
    use crate::interceptor::InterceptorChain;
    use crate::types::InternalEntry;

    fn setup() -> (InterceptorChain, Arc<InMemoryDataContainer>, Arc<InMemoryTransactionRegistry>) {
        let p = KeyPartitioner::new(8);
        let data = Arc::new(InMemoryDataContainer::new(p));
        let registry = Arc::new(InMemoryTransactionRegistry::new());
        let handler = DataHandler::new(
            1,
            p,
            data.clone(),
            registry.clone(),
            Arc::new(CommitManager::new(data.clone())),
            Arc::new(StateTransferLock::new()),
        );
        (InterceptorChain::new(vec![Arc::new(handler)]), data, registry)
    }

    fn put(key: &str, value: &str) -> Command {
        Command::Put {
            entry: InternalEntry::new(key.to_string(), value.to_string()),
        }
    }

    #[tokio::test]
    async fn test_put_get_clear() {
        let (chain, data, _) = setup();
        let ctx = || InvocationContext::local(1);
        chain.invoke(ctx(), &put("a", "1")).await.unwrap();
        let got = chain
            .invoke(ctx(), &Command::Get { key: "a".into() })
            .await
            .unwrap()
            .into_value()
            .unwrap();
        assert_eq!(got.value.as_ref(), b"1");

        chain.invoke(ctx(), &Command::Clear).await.unwrap();
        assert_eq!(data.size(), 0);
    }

    #[tokio::test]
    async fn test_transaction_lifecycle() {
        let (chain, data, registry) = setup();
        let gtx = GlobalTransactionId { originator: 1, id: 1 };
        let ctx = || InvocationContext::local(1);
        let modifications = vec![Mutation::Put(InternalEntry::new("k", "tx"))];
        chain
            .invoke(ctx(), &Command::Prepare { gtx, modifications })
            .await
            .unwrap();

        // a plain write to a locked key fails
        let err = chain.invoke(ctx(), &put("k", "plain")).await.unwrap_err();
        assert!(matches!(err, Error::Storage(StorageError::KeyLocked { .. })));

        chain.invoke(ctx(), &Command::Commit { gtx }).await.unwrap();
        assert_eq!(data.get(b"k").unwrap().value.as_ref(), b"tx");
        assert_eq!(registry.locked_key_count(), 0);
    }

    #[tokio::test]
    async fn test_rollback_discards() {
        let (chain, data, registry) = setup();
        let gtx = GlobalTransactionId { originator: 1, id: 2 };
        let ctx = || InvocationContext::local(1);
        let modifications = vec![Mutation::Put(InternalEntry::new("k", "tx"))];
        chain
            .invoke(ctx(), &Command::Prepare { gtx, modifications })
            .await
            .unwrap();
        chain.invoke(ctx(), &Command::Rollback { gtx }).await.unwrap();
        assert!(data.get(b"k").is_none());
        assert_eq!(registry.locked_key_count(), 0);
    }
}
