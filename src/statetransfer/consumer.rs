//! Receiving side of state transfer.
//!
//! On every topology update the consumer computes the segments the local
//! node is about to own but does not own yet, and pulls them from owners in
//! the current hash. Per provider it first fetches the open transactions of
//! those segments, then starts the entry stream. Segments that stop being
//! needed are cancelled; transfers whose provider left are restarted
//! against another owner.

use crate::error::{Error, Result};
use crate::network::rpc::unexpected;
use crate::network::Message;
use crate::rebalancing::transfer::{StateRequest, StateRequestKind, StateResponse, TransactionInfo};
use crate::statetransfer::TransferContext;
use crate::topology::CacheTopology;
use crate::types::{Flag, Mutation, NodeId, SegmentId, TopologyId};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Pause before asking a provider that already failed once.
const RETRY_DELAY: Duration = Duration::from_millis(200);

#[derive(Debug)]
struct InboundTransfer {
    source: NodeId,
    /// Segments not received yet.
    segments: BTreeSet<SegmentId>,
    /// Providers that already failed for these segments.
    failed: BTreeSet<NodeId>,
    awaiting_transactions: bool,
    cancel: CancellationToken,
    done: Arc<Notify>,
}

#[derive(Debug, Default)]
struct ConsumerState {
    topology: Option<Arc<CacheTopology>>,
    transfers: HashMap<u64, InboundTransfer>,
    segment_transfers: HashMap<SegmentId, u64>,
    /// Segments received (or given up) during the current rebalance.
    completed: BTreeSet<SegmentId>,
    pending_transactions: usize,
    next_id: u64,
}

impl ConsumerState {
    fn take_transfer(&mut self, id: u64) -> Option<InboundTransfer> {
        let transfer = self.transfers.remove(&id)?;
        for segment in &transfer.segments {
            if self.segment_transfers.get(segment) == Some(&id) {
                self.segment_transfers.remove(segment);
            }
        }
        if transfer.awaiting_transactions {
            self.pending_transactions -= 1;
        }
        transfer.cancel.cancel();
        Some(transfer)
    }

    fn topology_id(&self) -> TopologyId {
        self.topology.as_ref().map_or(0, |t| t.topology_id)
    }
}

/// A transfer ready to run.
#[derive(Debug)]
struct TransferTask {
    id: u64,
    source: NodeId,
    topology_id: TopologyId,
    segments: BTreeSet<SegmentId>,
    cancel: CancellationToken,
    done: Arc<Notify>,
    delay: Option<Duration>,
}

#[derive(Debug)]
pub struct StateConsumer {
    ctx: TransferContext,
    state: Mutex<ConsumerState>,
    active_segments: AtomicUsize,
}

impl StateConsumer {
    pub fn new(ctx: TransferContext) -> Self {
        Self {
            ctx,
            state: Mutex::new(ConsumerState::default()),
            active_segments: AtomicUsize::new(0),
        }
    }

    /// Some segment is still being received.
    pub fn has_active_transfers(&self) -> bool {
        self.active_segments.load(Ordering::Acquire) > 0
    }

    /// The segment's data is still incomplete on this node.
    pub fn is_segment_receiving(&self, segment: SegmentId) -> bool {
        self.state.lock().segment_transfers.contains_key(&segment)
    }

    fn needed_segments(&self, topology: &CacheTopology) -> BTreeSet<SegmentId> {
        if !self.ctx.config.enabled {
            return BTreeSet::new();
        }
        match &topology.pending_ch {
            Some(pending) => {
                let owned = topology.current_ch.segments_for_owner(self.ctx.local);
                pending
                    .segments_for_owner(self.ctx.local)
                    .difference(&owned)
                    .copied()
                    .collect()
            }
            None => BTreeSet::new(),
        }
    }

    /// Called with the topology lock held exclusively.
    pub fn on_topology_update(self: &Arc<Self>, topology: Arc<CacheTopology>, is_rebalance_start: bool) {
        let mut cancels = Vec::new();
        let (tasks, transactions_ready) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            state.topology = Some(topology.clone());
            if is_rebalance_start {
                state.completed.clear();
            }
            let needed = self.needed_segments(&topology);

            let stale: BTreeSet<SegmentId> = state
                .segment_transfers
                .keys()
                .filter(|s| !needed.contains(s))
                .copied()
                .collect();
            if !stale.is_empty() {
                self.cancel_segments(state, &stale, &mut cancels);
            }
            state.completed.retain(|s| needed.contains(s));

            let mut tasks = Vec::new();
            let orphaned: Vec<u64> = state
                .transfers
                .iter()
                .filter(|(_, t)| !topology.current_ch.is_member(t.source))
                .map(|(id, _)| *id)
                .collect();
            for id in orphaned {
                if let Some(transfer) = state.take_transfer(id) {
                    info!(
                        cache = %self.ctx.cache,
                        source = transfer.source,
                        segments = ?transfer.segments,
                        "Provider left, restarting transfer"
                    );
                    tasks.extend(self.assign(state, &topology, transfer.segments, transfer.failed));
                }
            }

            let missing: BTreeSet<SegmentId> = needed
                .iter()
                .filter(|s| !state.completed.contains(s) && !state.segment_transfers.contains_key(s))
                .copied()
                .collect();
            if !missing.is_empty() {
                info!(
                    cache = %self.ctx.cache,
                    topology_id = topology.topology_id,
                    segments = missing.len(),
                    "Requesting segments"
                );
                self.ctx
                    .commit_manager
                    .start_track(Flag::PutForStateTransfer, &missing);
                self.ctx
                    .metrics
                    .segments_requested
                    .inc_by(missing.len() as u64);
                tasks.extend(self.assign(state, &topology, missing, BTreeSet::new()));
            }
            self.sync_gauges(state);
            (tasks, state.pending_transactions == 0)
        };

        self.invalidate(&topology);
        if transactions_ready {
            self.ctx
                .lock
                .notify_transaction_data_received(topology.topology_id);
        }
        for (source, segments) in cancels {
            self.send_cancel(source, topology.topology_id, segments);
        }
        for task in tasks {
            self.spawn(task);
        }
        self.ctx
            .tracker
            .consumer_update(topology.topology_id, self.has_active_transfers());
    }

    /// Group segments by provider, preferring owners that have not failed.
    fn assign(
        &self,
        state: &mut ConsumerState,
        topology: &CacheTopology,
        segments: BTreeSet<SegmentId>,
        failed: BTreeSet<NodeId>,
    ) -> Vec<TransferTask> {
        let local = self.ctx.local;
        let mut groups: BTreeMap<NodeId, (BTreeSet<SegmentId>, bool)> = BTreeMap::new();
        let mut lost = BTreeSet::new();
        for segment in segments {
            let mut candidates = topology
                .current_ch
                .locate_owners(segment)
                .iter()
                .copied()
                .filter(|o| *o != local);
            let all: Vec<NodeId> = candidates.clone().collect();
            match candidates.find(|o| !failed.contains(o)) {
                Some(source) => {
                    groups.entry(source).or_default().0.insert(segment);
                }
                // every owner failed once: go round again after a pause
                None => match all.first() {
                    Some(&source) => {
                        let group = groups.entry(source).or_default();
                        group.0.insert(segment);
                        group.1 = true;
                    }
                    None => {
                        lost.insert(segment);
                    }
                },
            }
        }

        if !lost.is_empty() {
            warn!(
                cache = %self.ctx.cache,
                segments = ?lost,
                "No owner left to transfer segments from, data is lost"
            );
            self.ctx.metrics.segments_lost.inc_by(lost.len() as u64);
            self.ctx
                .commit_manager
                .stop_track(Flag::PutForStateTransfer, &lost);
            state.completed.extend(lost);
        }

        groups
            .into_iter()
            .map(|(source, (segments, retry))| {
                state.next_id += 1;
                let id = state.next_id;
                let transfer = InboundTransfer {
                    source,
                    segments: segments.clone(),
                    failed: if retry { BTreeSet::new() } else { failed.clone() },
                    awaiting_transactions: true,
                    cancel: CancellationToken::new(),
                    done: Arc::new(Notify::new()),
                };
                for segment in &segments {
                    state.segment_transfers.insert(*segment, id);
                }
                state.pending_transactions += 1;
                let task = TransferTask {
                    id,
                    source,
                    topology_id: topology.topology_id,
                    segments,
                    cancel: transfer.cancel.clone(),
                    done: transfer.done.clone(),
                    delay: retry.then_some(RETRY_DELAY),
                };
                state.transfers.insert(id, transfer);
                task
            })
            .collect()
    }

    fn cancel_segments(
        &self,
        state: &mut ConsumerState,
        segments: &BTreeSet<SegmentId>,
        cancels: &mut Vec<(NodeId, BTreeSet<SegmentId>)>,
    ) {
        let mut by_source: BTreeMap<NodeId, BTreeSet<SegmentId>> = BTreeMap::new();
        for segment in segments {
            let Some(id) = state.segment_transfers.remove(segment) else {
                continue;
            };
            let emptied = match state.transfers.get_mut(&id) {
                Some(transfer) => {
                    transfer.segments.remove(segment);
                    by_source.entry(transfer.source).or_default().insert(*segment);
                    transfer.segments.is_empty()
                }
                None => false,
            };
            if emptied {
                state.take_transfer(id);
            }
        }
        self.ctx
            .commit_manager
            .stop_track(Flag::PutForStateTransfer, segments);
        self.ctx
            .metrics
            .segments_cancelled
            .inc_by(segments.len() as u64);
        debug!(cache = %self.ctx.cache, ?segments, "Cancelled inbound segments");
        cancels.extend(by_source);
    }

    /// Drop data of segments this node no longer writes.
    fn invalidate(&self, topology: &CacheTopology) {
        let local = self.ctx.local;
        let segments: BTreeSet<SegmentId> = (0..topology.num_segments() as SegmentId)
            .filter(|s| !topology.is_write_owner(*s, local))
            .collect();
        if segments.is_empty() {
            return;
        }
        let removed = self.ctx.data.remove_segments(&segments);
        if removed > 0 {
            self.ctx.metrics.entries_invalidated.inc_by(removed as u64);
            debug!(
                cache = %self.ctx.cache,
                topology_id = topology.topology_id,
                removed,
                "Invalidated entries of segments no longer owned"
            );
        }
    }

    fn spawn(self: &Arc<Self>, task: TransferTask) {
        let this = self.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                _ = task.cancel.cancelled() => return,
                result = this.fetch(&task) => result,
            };
            if let Err(e) = result {
                this.transfer_failed(task.id, e);
            }
        });
    }

    async fn fetch(&self, task: &TransferTask) -> Result<()> {
        if let Some(delay) = task.delay {
            tokio::time::sleep(delay).await;
        }
        let request = |kind| {
            Message::StateRequest(StateRequest::new(
                kind,
                self.ctx.cache.clone(),
                self.ctx.local,
                task.topology_id,
                task.segments.clone(),
            ))
        };
        debug!(
            cache = %self.ctx.cache,
            source = task.source,
            segments = ?task.segments,
            "Fetching transactions"
        );
        let reply = self
            .ctx
            .transport
            .send(task.source, request(StateRequestKind::GetTransactions), self.ctx.rpc_timeout)
            .await?;
        match reply {
            Message::Transactions(transactions) => self.transactions_received(task.id, transactions),
            other => return Err(unexpected(&other)),
        }

        self.ctx
            .transport
            .send(task.source, request(StateRequestKind::StartStateTransfer), self.ctx.rpc_timeout)
            .await?
            .expect_ack()?;
        tokio::time::timeout(self.ctx.config.timeout, task.done.notified())
            .await
            .map_err(|_| Error::Timeout)
    }

    fn transactions_received(&self, id: u64, transactions: Vec<TransactionInfo>) {
        let mut added = 0;
        for tx in transactions {
            if self.ctx.registry.add_from_state_transfer(tx.into_remote()) {
                added += 1;
            }
        }
        self.ctx.metrics.transactions_received.inc_by(added);

        let mut guard = self.state.lock();
        let state = &mut *guard;
        let settled = state
            .transfers
            .get_mut(&id)
            .is_some_and(|t| std::mem::replace(&mut t.awaiting_transactions, false));
        if settled {
            state.pending_transactions -= 1;
        }
        self.settle_transactions(state);
        self.sync_gauges(state);
    }

    fn transfer_failed(self: &Arc<Self>, id: u64, error: Error) {
        let (tasks, source, segments, topology_id) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let Some(transfer) = state.take_transfer(id) else {
                return;
            };
            let Some(topology) = state.topology.clone() else {
                return;
            };
            warn!(
                cache = %self.ctx.cache,
                source = transfer.source,
                segments = ?transfer.segments,
                error = %error,
                "Segment transfer failed, retrying"
            );
            let mut failed = transfer.failed;
            failed.insert(transfer.source);
            let tasks = self.assign(state, &topology, transfer.segments.clone(), failed);
            self.settle_transactions(state);
            self.sync_gauges(state);
            (tasks, transfer.source, transfer.segments, topology.topology_id)
        };
        self.send_cancel(source, topology_id, segments);
        for task in tasks {
            self.spawn(task);
        }
    }

    /// Apply a chunk pushed by a provider.
    pub async fn apply_state(&self, sender: NodeId, response: StateResponse) -> Result<()> {
        let _guard = self.ctx.lock.acquire_shared().await;
        for chunk in response.chunks {
            let segment = chunk.segment;
            let expected = {
                let state = self.state.lock();
                state
                    .segment_transfers
                    .get(&segment)
                    .and_then(|id| state.transfers.get(id))
                    .is_some_and(|t| t.source == sender)
            };
            if !expected {
                debug!(
                    cache = %self.ctx.cache,
                    segment,
                    sender,
                    "Discarding chunk for a segment not expected from this provider"
                );
                continue;
            }

            let last = chunk.is_last_chunk;
            let (mut applied, mut discarded) = (0u64, 0u64);
            for entry in chunk.filter_expired().entries {
                let mutation = Mutation::Put(entry);
                if self
                    .ctx
                    .commit_manager
                    .commit(mutation, Some(Flag::PutForStateTransfer), segment)
                {
                    applied += 1;
                } else {
                    discarded += 1;
                }
            }
            self.ctx.metrics.entries_applied.inc_by(applied);
            self.ctx.metrics.stale_writes_discarded.inc_by(discarded);
            trace!(segment, sender, applied, discarded, last, "Applied chunk");
            if last {
                self.segment_completed(segment);
            }
        }
        Ok(())
    }

    fn segment_completed(&self, segment: SegmentId) {
        let (idle, topology_id) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let Some(id) = state.segment_transfers.remove(&segment) else {
                return;
            };
            state.completed.insert(segment);
            let emptied = state.transfers.get_mut(&id).is_some_and(|t| {
                t.segments.remove(&segment);
                t.segments.is_empty()
            });
            if emptied {
                if let Some(transfer) = state.take_transfer(id) {
                    transfer.done.notify_one();
                }
            }
            self.settle_transactions(state);
            self.sync_gauges(state);
            (state.segment_transfers.is_empty(), state.topology_id())
        };
        self.ctx
            .commit_manager
            .stop_track(Flag::PutForStateTransfer, &BTreeSet::from([segment]));
        self.ctx.metrics.segments_completed.inc();
        if idle {
            info!(cache = %self.ctx.cache, topology_id, "Finished receiving segments");
            self.ctx.tracker.consumer_update(topology_id, false);
        }
    }

    /// Cancel every inbound transfer.
    pub fn stop(&self) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let ids: Vec<u64> = state.transfers.keys().copied().collect();
        for id in ids {
            state.take_transfer(id);
        }
        self.sync_gauges(state);
    }

    fn settle_transactions(&self, state: &ConsumerState) {
        if state.pending_transactions == 0 && state.topology.is_some() {
            self.ctx
                .lock
                .notify_transaction_data_received(state.topology_id());
        }
    }

    fn sync_gauges(&self, state: &ConsumerState) {
        let active = state.segment_transfers.len();
        self.active_segments.store(active, Ordering::Release);
        self.ctx.metrics.active_inbound_segments.set(active as i64);
        self.ctx
            .metrics
            .pending_transaction_requests
            .set(state.pending_transactions as i64);
    }

    fn send_cancel(&self, source: NodeId, topology_id: TopologyId, segments: BTreeSet<SegmentId>) {
        let transport = self.ctx.transport.clone();
        let timeout = self.ctx.rpc_timeout;
        let request = StateRequest::new(
            StateRequestKind::CancelStateTransfer,
            self.ctx.cache.clone(),
            self.ctx.local,
            topology_id,
            segments,
        );
        tokio::spawn(async move {
            if let Err(e) = transport
                .send(source, Message::StateRequest(request), timeout)
                .await
            {
                debug!(source, error = %e, "Cancel request not delivered");
            }
        });
    }
}
