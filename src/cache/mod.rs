//! Cache facade.
//!
//! A [`GridCache`] is one named cache on one node. It owns the local data,
//! the transfer components and the command chain; every operation is turned
//! into a [`Command`] and run through the chain, which routes it to the
//! owners of the key under the installed topology.

pub mod storage;
pub mod transactions;

use crate::config::{CacheConfig, NodeConfig};
use crate::error::Result;
use crate::interceptor::{
    Command, CommandEnvelope, CommandHandler, CommandResult, DataHandler, DistributionHandler,
    InterceptorChain, InvocationContext, StateTransferHandler,
};
use crate::metrics::{StateTransferMetrics, TransferStats};
use crate::network::{Message, Transport};
use crate::partitioning::KeyPartitioner;
use crate::rebalancing::{StateRequest, StateResponse};
use crate::statetransfer::{
    CommitManager, StateConsumer, StateProvider, StateTransferLock, StateTransferManager,
    StateTransferTracker, TransferContext,
};
use crate::topology::{CacheTopology, CacheTopologyHandler, PhaseConfirmation};
use crate::types::{EntryMetadata, InternalEntry, Mutation, NodeId};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use storage::{DataContainer, InMemoryDataContainer};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use transactions::{
    GlobalTransactionId, InMemoryTransactionRegistry, LocalTransactionTable, TransactionRegistry,
};

/// One cache on one node.
#[derive(Debug)]
pub struct GridCache {
    name: String,
    local: NodeId,
    config: CacheConfig,
    ctx: TransferContext,
    chain: InterceptorChain,
    provider: Arc<StateProvider>,
    consumer: Arc<StateConsumer>,
    manager: Arc<StateTransferManager>,
    transactions: Arc<LocalTransactionTable>,
}

impl GridCache {
    /// Wire the components of a cache. Nothing is installed until the
    /// node joins the cache and the first topology arrives.
    pub fn new(
        name: &str,
        config: CacheConfig,
        node: &NodeConfig,
        transport: Arc<dyn Transport>,
        confirmations: mpsc::UnboundedSender<PhaseConfirmation>,
    ) -> Result<Self> {
        config.validate()?;
        let local = node.node_id;
        let partitioner = KeyPartitioner::new(config.num_segments);
        let data: Arc<dyn DataContainer> = Arc::new(InMemoryDataContainer::new(partitioner));
        let registry: Arc<dyn TransactionRegistry> = Arc::new(InMemoryTransactionRegistry::new());
        let lock = Arc::new(StateTransferLock::new());
        let commit_manager = Arc::new(CommitManager::new(data.clone()));
        let metrics = Arc::new(StateTransferMetrics::new());

        let ctx = TransferContext {
            cache: name.to_string(),
            local,
            partitioner,
            data: data.clone(),
            registry: registry.clone(),
            transport: transport.clone(),
            lock: lock.clone(),
            tracker: Arc::new(StateTransferTracker::new(local)),
            commit_manager: commit_manager.clone(),
            metrics: metrics.clone(),
            config: config.state_transfer.clone(),
            rpc_timeout: node.rpc_timeout,
            topology_wait_timeout: node.topology_wait_timeout,
        };
        let provider = Arc::new(StateProvider::new(ctx.clone()));
        let consumer = Arc::new(StateConsumer::new(ctx.clone()));
        let manager = Arc::new(StateTransferManager::new(
            ctx.clone(),
            provider.clone(),
            consumer.clone(),
            confirmations,
        ));
        let transactions = Arc::new(LocalTransactionTable::new(local));

        let handlers: Vec<Arc<dyn CommandHandler>> = vec![
            Arc::new(StateTransferHandler::new(
                lock.clone(),
                metrics,
                node.max_retries,
                node.topology_wait_timeout,
            )),
            Arc::new(DistributionHandler::new(
                name,
                local,
                partitioner,
                lock.clone(),
                consumer.clone(),
                transport,
                transactions.clone(),
                node.rpc_timeout,
            )),
            Arc::new(DataHandler::new(
                local,
                partitioner,
                data,
                registry,
                commit_manager,
                lock,
            )),
        ];

        Ok(Self {
            name: name.to_string(),
            local,
            config,
            ctx,
            chain: InterceptorChain::new(handlers),
            provider,
            consumer,
            manager,
            transactions,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    async fn invoke(&self, cmd: Command) -> Result<CommandResult> {
        self.chain
            .invoke(InvocationContext::local(self.local), &cmd)
            .await
    }

    pub async fn get(&self, key: impl Into<Bytes>) -> Result<Option<Bytes>> {
        let entry = self
            .invoke(Command::Get { key: key.into() })
            .await?
            .into_value();
        Ok(entry.filter(|e| !e.is_expired()).map(|e| e.value))
    }

    pub async fn put(&self, key: impl Into<Bytes>, value: impl Into<Bytes>) -> Result<()> {
        let entry = InternalEntry::new(key, value);
        self.invoke(Command::Put { entry }).await.map(|_| ())
    }

    /// Store an entry that expires after `lifespan`.
    pub async fn put_with_lifespan(
        &self,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
        lifespan: Duration,
    ) -> Result<()> {
        let entry =
            InternalEntry::new(key, value).with_metadata(EntryMetadata::with_lifespan(lifespan));
        self.invoke(Command::Put { entry }).await.map(|_| ())
    }

    pub async fn remove(&self, key: impl Into<Bytes>) -> Result<()> {
        self.invoke(Command::Remove { key: key.into() })
            .await
            .map(|_| ())
    }

    /// Remove every entry on every member.
    pub async fn clear(&self) -> Result<()> {
        self.invoke(Command::Clear).await.map(|_| ())
    }

    /// Start a transaction originated by this node.
    pub fn begin(&self) -> GlobalTransactionId {
        self.transactions.begin()
    }

    pub fn tx_put(
        &self,
        gtx: &GlobalTransactionId,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
    ) -> Result<()> {
        self.transactions
            .write(gtx, Mutation::Put(InternalEntry::new(key, value)))
    }

    pub fn tx_remove(&self, gtx: &GlobalTransactionId, key: impl Into<Bytes>) -> Result<()> {
        self.transactions.write(gtx, Mutation::Remove(key.into()))
    }

    /// Prepare the transaction on the write owners of its keys, locking them.
    pub async fn prepare(&self, gtx: &GlobalTransactionId) -> Result<()> {
        let tx = self.transactions.get(gtx)?;
        debug!(cache = %self.name, %gtx, keys = tx.modifications.len(), "Preparing transaction");
        self.invoke(Command::Prepare {
            gtx: *gtx,
            modifications: tx.modifications,
        })
        .await
        .map(|_| ())
    }

    /// Commit the transaction, preparing it first if needed.
    pub async fn commit(&self, gtx: &GlobalTransactionId) -> Result<()> {
        let tx = self.transactions.get(gtx)?;
        if tx.prepared_on.is_empty() && !tx.modifications.is_empty() {
            self.prepare(gtx).await?;
        }
        self.invoke(Command::Commit { gtx: *gtx }).await?;
        self.transactions.remove(gtx);
        debug!(cache = %self.name, %gtx, "Committed transaction");
        Ok(())
    }

    /// Roll the transaction back on every node it was prepared on.
    pub async fn rollback(&self, gtx: &GlobalTransactionId) -> Result<()> {
        let result = self.invoke(Command::Rollback { gtx: *gtx }).await;
        self.transactions.remove(gtx);
        result.map(|_| ())
    }

    /// Local storage, for inspection without going through the owners.
    pub fn data_container(&self) -> Arc<dyn DataContainer> {
        self.ctx.data.clone()
    }

    pub fn transaction_registry(&self) -> Arc<dyn TransactionRegistry> {
        self.ctx.registry.clone()
    }

    /// Topology installed on this node.
    pub fn topology(&self) -> Option<Arc<CacheTopology>> {
        self.ctx.lock.current_topology()
    }

    pub fn is_state_transfer_in_progress(&self) -> bool {
        self.ctx.tracker.is_state_transfer_in_progress()
    }

    /// Segments are being received or sent by this node.
    pub fn has_active_transfers(&self) -> bool {
        self.consumer.has_active_transfers() || self.provider.active_transfers() > 0
    }

    pub fn metrics(&self) -> Arc<StateTransferMetrics> {
        self.ctx.metrics.clone()
    }

    pub fn transfer_stats(&self) -> TransferStats {
        self.ctx.metrics.snapshot()
    }

    /// Handler the local topology manager installs topologies through.
    pub fn topology_handler(&self) -> Arc<dyn CacheTopologyHandler> {
        self.manager.clone()
    }

    /// Block until this node owns data in a stable topology and received it.
    pub async fn wait_for_initial_transfer(&self, timeout: Duration) -> Result<()> {
        info!(cache = %self.name, "Waiting for initial state transfer");
        self.ctx.tracker.wait_for_initial_transfer(timeout).await?;
        info!(cache = %self.name, "Initial state transfer complete");
        Ok(())
    }

    /// Execute a command sent by another node.
    pub async fn handle_remote_command(
        &self,
        origin: NodeId,
        envelope: CommandEnvelope,
    ) -> Result<CommandResult> {
        let ctx = InvocationContext::remote(origin, &envelope);
        self.chain.invoke(ctx, &envelope.command).await
    }

    pub async fn handle_state_request(&self, request: StateRequest) -> Result<Message> {
        self.provider.handle_request(request).await
    }

    pub async fn handle_state_response(&self, sender: NodeId, response: StateResponse) -> Result<()> {
        self.consumer.apply_state(sender, response).await
    }

    /// Roll back remote transactions whose originator left the cluster.
    pub fn release_orphans(&self, members: &[NodeId]) -> usize {
        let released = self.ctx.registry.release_orphans(members);
        if !released.is_empty() {
            warn!(cache = %self.name, count = released.len(), "Rolled back orphaned transactions");
        }
        released.len()
    }

    /// Stop pulling state.
    pub fn stop(&self) {
        self.consumer.stop();
        info!(cache = %self.name, "Cache stopped");
    }
}
