//! Routing of commands to the owners of their keys.

use crate::cache::transactions::LocalTransactionTable;
use crate::error::{Error, Result, TopologyError, TransferError};
use crate::interceptor::{
    Command, CommandEnvelope, CommandHandler, CommandResult, InvocationContext, InvocationRole,
    Next,
};
use crate::network::rpc::unexpected;
use crate::network::{Message, Transport};
use crate::partitioning::KeyPartitioner;
use crate::statetransfer::{StateConsumer, StateTransferLock};
use crate::topology::CacheTopology;
use crate::types::{Mutation, NodeId, SegmentId, TopologyId};
use async_trait::async_trait;
use futures::future::join_all;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// Sends each command to the nodes that must execute it.
///
/// Writes go to the primary owner of the write hash, which applies them
/// under the shared topology lock and replicates to the other write owners.
/// Reads are served locally when this node is a read owner that is not
/// still receiving the segment, otherwise by a remote read owner.
/// Transactions are prepared on the write owners of all their keys; a
/// commit first replays the prepare on owners that joined since.
#[derive(Debug)]
pub struct DistributionHandler {
    cache: String,
    local: NodeId,
    partitioner: KeyPartitioner,
    lock: Arc<StateTransferLock>,
    consumer: Arc<StateConsumer>,
    transport: Arc<dyn Transport>,
    transactions: Arc<LocalTransactionTable>,
    rpc_timeout: Duration,
}

impl DistributionHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cache: impl Into<String>,
        local: NodeId,
        partitioner: KeyPartitioner,
        lock: Arc<StateTransferLock>,
        consumer: Arc<StateConsumer>,
        transport: Arc<dyn Transport>,
        transactions: Arc<LocalTransactionTable>,
        rpc_timeout: Duration,
    ) -> Self {
        Self {
            cache: cache.into(),
            local,
            partitioner,
            lock,
            consumer,
            transport,
            transactions,
            rpc_timeout,
        }
    }

    fn topology(&self) -> Result<Arc<CacheTopology>> {
        self.lock
            .current_topology()
            .ok_or_else(|| TopologyError::NotInstalled(self.cache.clone()).into())
    }

    fn outdated(requested: TopologyId, installed: TopologyId) -> Error {
        TopologyError::Outdated {
            requested,
            installed,
        }
        .into()
    }

    async fn invoke_remote(
        &self,
        target: NodeId,
        command: Command,
        topology_id: TopologyId,
        role: InvocationRole,
    ) -> Result<CommandResult> {
        let envelope = CommandEnvelope {
            cache: self.cache.clone(),
            command,
            topology_id,
            role,
        };
        trace!(target, role = ?role, topology_id, "Forwarding command");
        match self
            .transport
            .send(target, Message::Command(envelope), self.rpc_timeout)
            .await?
        {
            Message::CommandResult(result) => Ok(result),
            other => Err(unexpected(&other)),
        }
    }

    /// Send to every target, the local node through the rest of the chain.
    /// Returns the nodes that succeeded and the first error.
    async fn invoke_on(
        &self,
        ctx: &mut InvocationContext,
        cmd: &Command,
        next: Next<'_>,
        targets: &BTreeSet<NodeId>,
        topology_id: TopologyId,
        role: InvocationRole,
    ) -> (Vec<NodeId>, Option<Error>) {
        let remotes = targets.iter().copied().filter(|t| *t != self.local);
        let sends = remotes.map(|target| {
            let cmd = cmd.clone();
            async move { (target, self.invoke_remote(target, cmd, topology_id, role).await) }
        });
        let mut results = join_all(sends).await;
        if targets.contains(&self.local) {
            let local = self.run_local(ctx, cmd, next, topology_id).await;
            results.push((self.local, local));
        }

        let mut succeeded = Vec::new();
        let mut first_error = None;
        for (node, result) in results {
            match result {
                Ok(_) => succeeded.push(node),
                Err(e) => {
                    debug!(node, command = cmd.name(), error = %e, "Command failed on target");
                    first_error.get_or_insert(e);
                }
            }
        }
        (succeeded, first_error)
    }

    /// Run the rest of the chain under the shared lock, if the topology did
    /// not move past `topology_id`.
    async fn run_local(
        &self,
        ctx: &mut InvocationContext,
        cmd: &Command,
        next: Next<'_>,
        topology_id: TopologyId,
    ) -> Result<CommandResult> {
        let _guard = self.lock.acquire_shared().await;
        let installed = self.lock.topology_id();
        if installed > topology_id {
            return Err(Self::outdated(topology_id, installed));
        }
        next.run(ctx, cmd).await
    }

    async fn handle_originator(
        &self,
        ctx: &mut InvocationContext,
        cmd: &Command,
        next: Next<'_>,
    ) -> Result<CommandResult> {
        let topology = self.topology()?;
        let topology_id = topology.topology_id;
        ctx.topology_id = Some(topology_id);

        match cmd {
            Command::Get { key } => {
                let segment = self.partitioner.segment_of(key);
                if topology.is_read_owner(segment, self.local)
                    && !self.consumer.is_segment_receiving(segment)
                {
                    return next.run(ctx, cmd).await;
                }
                self.remote_get(&topology, segment, cmd).await
            }
            Command::Put { .. } | Command::Remove { .. } => {
                let segment = self.segment(cmd)?;
                let primary = topology
                    .primary_owner(segment)
                    .ok_or_else(|| TopologyError::NotInstalled(self.cache.clone()))?;
                if primary == self.local {
                    self.execute_primary(ctx, cmd, next, segment, topology_id).await
                } else {
                    self.invoke_remote(primary, cmd.clone(), topology_id, InvocationRole::Primary)
                        .await
                }
            }
            Command::Clear => {
                let targets: BTreeSet<NodeId> = topology
                    .write_ch()
                    .members()
                    .iter()
                    .copied()
                    .chain(std::iter::once(self.local))
                    .collect();
                let (_, error) = self
                    .invoke_on(ctx, cmd, next, &targets, topology_id, InvocationRole::Backup)
                    .await;
                error.map_or(Ok(CommandResult::Done), Err)
            }
            Command::Prepare { gtx, modifications } => {
                let targets = self.tx_targets(&topology, modifications);
                let (prepared, error) = self
                    .invoke_on(ctx, cmd, next, &targets, topology_id, InvocationRole::TxParticipant)
                    .await;
                self.transactions.mark_prepared(gtx, prepared, topology_id);
                error.map_or(Ok(CommandResult::Done), Err)
            }
            Command::Commit { gtx } => {
                let tx = self.transactions.get(gtx)?;
                let targets = self.tx_targets(&topology, &tx.modifications);

                // owners that never saw the prepare get it replayed first
                let missing: BTreeSet<NodeId> =
                    targets.difference(&tx.prepared_on).copied().collect();
                if !missing.is_empty() {
                    debug!(%gtx, ?missing, "Replaying prepare on new owners");
                    let prepare = Command::Prepare {
                        gtx: *gtx,
                        modifications: tx.modifications.clone(),
                    };
                    let (prepared, error) = self
                        .invoke_on(
                            ctx,
                            &prepare,
                            next,
                            &missing,
                            topology_id,
                            InvocationRole::TxParticipant,
                        )
                        .await;
                    self.transactions.mark_prepared(gtx, prepared, topology_id);
                    if let Some(e) = error {
                        return Err(e);
                    }
                }

                let participants = self.participants(&topology, &targets, &tx.prepared_on);
                let (_, error) = self
                    .invoke_on(ctx, cmd, next, &participants, topology_id, InvocationRole::TxParticipant)
                    .await;
                error.map_or(Ok(CommandResult::Done), Err)
            }
            Command::Rollback { gtx } => {
                let tx = self.transactions.get(gtx)?;
                let targets = self.tx_targets(&topology, &tx.modifications);
                let participants = self.participants(&topology, &targets, &tx.prepared_on);
                let (_, error) = self
                    .invoke_on(ctx, cmd, next, &participants, topology_id, InvocationRole::TxParticipant)
                    .await;
                error.map_or(Ok(CommandResult::Done), Err)
            }
        }
    }

    fn segment(&self, cmd: &Command) -> Result<SegmentId> {
        cmd.key()
            .map(|k| self.partitioner.segment_of(k))
            .ok_or_else(|| Error::Internal(format!("{} has no key", cmd.name())))
    }

    /// Write owners of every key a transaction touches.
    fn tx_targets(&self, topology: &CacheTopology, modifications: &[Mutation]) -> BTreeSet<NodeId> {
        modifications
            .iter()
            .flat_map(|m| {
                topology
                    .write_owners(self.partitioner.segment_of(m.key()))
                    .iter()
                    .copied()
            })
            .collect()
    }

    /// Current owners plus the nodes already prepared that are still members.
    fn participants(
        &self,
        topology: &CacheTopology,
        targets: &BTreeSet<NodeId>,
        prepared_on: &BTreeSet<NodeId>,
    ) -> BTreeSet<NodeId> {
        targets
            .iter()
            .chain(prepared_on.iter().filter(|n| {
                **n == self.local || topology.is_member(**n) || topology.write_ch().is_member(**n)
            }))
            .copied()
            .collect()
    }

    /// Read owners first, then current owners not among them. During a
    /// rebalance the current owners still hold segments the read owners
    /// are receiving.
    fn read_candidates(&self, topology: &CacheTopology, segment: SegmentId) -> Vec<NodeId> {
        let mut candidates: Vec<NodeId> = Vec::new();
        let owners = topology
            .read_owners(segment)
            .iter()
            .chain(topology.current_ch.locate_owners(segment));
        for &owner in owners {
            if owner != self.local && !candidates.contains(&owner) {
                candidates.push(owner);
            }
        }
        candidates
    }

    async fn remote_get(
        &self,
        topology: &CacheTopology,
        segment: SegmentId,
        cmd: &Command,
    ) -> Result<CommandResult> {
        let candidates = self.read_candidates(topology, segment);
        let receiving_locally = self.consumer.is_segment_receiving(segment);
        let mut last = None;
        for owner in candidates {
            match self
                .invoke_remote(owner, cmd.clone(), topology.topology_id, InvocationRole::ReadOwner)
                .await
            {
                Ok(result) => return Ok(result),
                Err(e) if e.is_outdated_topology() => return Err(e),
                Err(e) => {
                    debug!(owner, segment, error = %e, "Remote read failed, trying next owner");
                    last = Some(e);
                }
            }
        }
        match last {
            Some(e) => Err(e),
            None if receiving_locally => Err(TransferError::SegmentReceiving {
                node: self.local,
                segment,
            }
            .into()),
            // every owner that ever held the segment is gone
            None => Ok(CommandResult::Value(None)),
        }
    }

    async fn execute_primary(
        &self,
        ctx: &mut InvocationContext,
        cmd: &Command,
        next: Next<'_>,
        segment: SegmentId,
        topology_id: TopologyId,
    ) -> Result<CommandResult> {
        let (result, backups) = {
            let _guard = self.lock.acquire_shared().await;
            let topology = self.topology()?;
            if topology.topology_id > topology_id
                || topology.primary_owner(segment) != Some(self.local)
            {
                return Err(Self::outdated(topology_id, topology.topology_id));
            }
            let backups: BTreeSet<NodeId> = topology
                .write_owners(segment)
                .iter()
                .copied()
                .filter(|n| *n != self.local)
                .collect();
            (next.run(ctx, cmd).await?, backups)
        };

        let replicas = backups.iter().map(|&backup| {
            let cmd = cmd.clone();
            async move {
                self.invoke_remote(backup, cmd, topology_id, InvocationRole::Backup)
                    .await
            }
        });
        for result in join_all(replicas).await {
            result?;
        }
        Ok(result)
    }

    async fn handle_owner(
        &self,
        ctx: &mut InvocationContext,
        cmd: &Command,
        next: Next<'_>,
    ) -> Result<CommandResult> {
        let _guard = self.lock.acquire_shared().await;
        let topology = self.topology()?;
        // the sender picked owners from an older topology; new owners may miss the write
        if let Some(requested) = ctx.topology_id {
            if topology.topology_id > requested {
                return Err(Self::outdated(requested, topology.topology_id));
            }
        }
        if let Some(key) = cmd.key() {
            let segment = self.partitioner.segment_of(key);
            if !topology.is_write_owner(segment, self.local) {
                trace!(segment, "Ignoring write for a segment this node does not own");
                return Ok(CommandResult::Done);
            }
        }
        next.run(ctx, cmd).await
    }

    async fn handle_remote_read(
        &self,
        ctx: &mut InvocationContext,
        cmd: &Command,
        next: Next<'_>,
    ) -> Result<CommandResult> {
        let topology = self.topology()?;
        let requested = ctx.topology_id.unwrap_or(topology.topology_id);
        let segment = self.segment(cmd)?;
        if topology.topology_id > requested && !topology.is_read_owner(segment, self.local) {
            return Err(Self::outdated(requested, topology.topology_id));
        }
        let result = next.run(ctx, cmd).await?;
        // a miss on an incomplete copy says nothing about the key
        if result == CommandResult::Value(None) && self.consumer.is_segment_receiving(segment) {
            return Err(TransferError::SegmentReceiving {
                node: self.local,
                segment,
            }
            .into());
        }
        Ok(result)
    }
}

#[async_trait]
impl CommandHandler for DistributionHandler {
    async fn handle(
        &self,
        ctx: &mut InvocationContext,
        cmd: &Command,
        next: Next<'_>,
    ) -> Result<CommandResult> {
        match ctx.role {
            InvocationRole::Originator => self.handle_originator(ctx, cmd, next).await,
            InvocationRole::Primary => {
                let topology = self.topology()?;
                let requested = ctx.topology_id.unwrap_or(topology.topology_id);
                let segment = self.segment(cmd)?;
                self.execute_primary(ctx, cmd, next, segment, requested).await
            }
            InvocationRole::Backup | InvocationRole::TxParticipant => {
                self.handle_owner(ctx, cmd, next).await
            }
            InvocationRole::ReadOwner => self.handle_remote_read(ctx, cmd, next).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheMode;
    use crate::interceptor::InterceptorChain;
    use crate::network::{InMemoryNetwork, MessageHandler};
    use crate::partitioning::ConsistentHashFactory;
    use crate::rebalancing::transfer::StateRequestKind;
    use crate::statetransfer::testing::context;
    use crate::statetransfer::TransferContext;
    use crate::topology::Phase;
    use crate::types::InternalEntry;
    use bytes::Bytes;

    /// A current owner that holds every key as "v" and never streams state.
    struct OldOwner;

    #[async_trait]
    impl MessageHandler for OldOwner {
        async fn handle(&self, _from: NodeId, msg: Message) -> Message {
            match msg {
                Message::Command(envelope) => {
                    let key = envelope.command.key().cloned().unwrap_or_default();
                    Message::CommandResult(CommandResult::Value(Some(InternalEntry::new(key, "v"))))
                }
                Message::StateRequest(r) if r.kind == StateRequestKind::GetTransactions => {
                    Message::Transactions(Vec::new())
                }
                _ => Message::Ack,
            }
        }
    }

    /// Local storage that has nothing yet.
    #[derive(Debug)]
    struct EmptyStore;

    #[async_trait]
    impl CommandHandler for EmptyStore {
        async fn handle(
            &self,
            _ctx: &mut InvocationContext,
            _cmd: &Command,
            _next: Next<'_>,
        ) -> Result<CommandResult> {
            Ok(CommandResult::Value(None))
        }
    }

    /// Node 1 owned everything with one owner; nodes 2 and 3 were taking
    /// over when node 2 left in `ReadNewWriteAll`, so node 3 is now the only
    /// read owner of every segment and has received none of them.
    fn leaver_topology() -> (Arc<CacheTopology>, SegmentId) {
        let factory = ConsistentHashFactory::new(CacheMode::Distributed, 1, 8).unwrap();
        let current = factory.create(&[1]).unwrap();
        let pending = factory.create(&[2, 3]).unwrap();
        let read_new = CacheTopology::stable(1, 1, current, vec![])
            .start_rebalance(&factory, pending)
            .advance_phase()
            .advance_phase();
        assert_eq!(read_new.phase, Phase::ReadNewWriteAll);
        let segment = *read_new
            .pending_ch
            .as_ref()
            .unwrap()
            .segments_for_owner(2)
            .iter()
            .next()
            .unwrap();

        let topology = read_new.without_members(&factory, &[2]);
        assert_eq!(topology.phase, Phase::ReadNewWriteAll);
        assert_eq!(topology.read_owners(segment), &[3]);
        assert_eq!(topology.current_ch.locate_owners(segment), &[1]);
        (Arc::new(topology), segment)
    }

    fn receiving_node(
        network: &Arc<InMemoryNetwork>,
        topology: &Arc<CacheTopology>,
    ) -> (InterceptorChain, TransferContext) {
        let ctx = context(3, network.transport(3), 4);
        ctx.lock.notify_topology_installed(topology.clone());
        let consumer = Arc::new(StateConsumer::new(ctx.clone()));
        consumer.on_topology_update(topology.clone(), true);
        let handler = DistributionHandler::new(
            "c",
            3,
            ctx.partitioner,
            ctx.lock.clone(),
            consumer,
            network.transport(3),
            Arc::new(LocalTransactionTable::new(3)),
            Duration::from_secs(2),
        );
        let chain = InterceptorChain::new(vec![Arc::new(handler), Arc::new(EmptyStore)]);
        (chain, ctx)
    }

    fn key_in(ctx: &TransferContext, segment: SegmentId) -> Bytes {
        (0..1000)
            .map(|i| Bytes::from(format!("key{i}")))
            .find(|k| ctx.partitioner.segment_of(k) == segment)
            .unwrap()
    }

    #[tokio::test]
    async fn test_read_falls_back_to_current_owner_after_leaver() {
        let network = InMemoryNetwork::new();
        network.register(1, Arc::new(OldOwner));
        let (topology, segment) = leaver_topology();
        let (chain, ctx) = receiving_node(&network, &topology);
        let key = key_in(&ctx, segment);

        let entry = chain
            .invoke(InvocationContext::local(3), &Command::Get { key })
            .await
            .unwrap()
            .into_value()
            .expect("read must not miss while the old owner holds the key");
        assert_eq!(entry.value.as_ref(), b"v");
    }

    #[tokio::test]
    async fn test_incomplete_read_owner_refuses_to_report_a_miss() {
        let network = InMemoryNetwork::new();
        network.register(1, Arc::new(OldOwner));
        let (topology, segment) = leaver_topology();
        let (chain, ctx) = receiving_node(&network, &topology);
        let key = key_in(&ctx, segment);

        let remote = InvocationContext {
            origin: 1,
            role: InvocationRole::ReadOwner,
            topology_id: Some(topology.topology_id),
        };
        let err = chain.invoke(remote, &Command::Get { key }).await.unwrap_err();
        assert!(err.is_segment_receiving());
    }

    #[tokio::test]
    async fn test_read_with_old_owner_unreachable_is_retryable() {
        // node 1 is gone as well; the error must send the read round again
        let network = InMemoryNetwork::new();
        let (topology, segment) = leaver_topology();
        let (chain, ctx) = receiving_node(&network, &topology);
        let key = key_in(&ctx, segment);

        let err = chain
            .invoke(InvocationContext::local(3), &Command::Get { key })
            .await
            .unwrap_err();
        assert!(err.is_suspect());
    }
}
