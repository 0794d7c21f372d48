//! Serving state to new owners.
//!
//! A consumer first pulls the open transactions of the segments it is
//! about to own, then asks for the entries. Entries are pushed back in
//! chunks, one `StateResponse` at a time, each acknowledged before the
//! next is sent. A topology update that takes the segments away from the
//! consumer, or a cancel request, stops the stream.

use crate::error::{Result, TransferError};
use crate::network::Message;
use crate::rebalancing::transfer::{
    StateChunk, StateRequest, StateRequestKind, StateResponse, TransactionInfo,
};
use crate::statetransfer::TransferContext;
use crate::topology::CacheTopology;
use crate::types::{NodeId, SegmentId, TopologyId};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// One stream of segments to one consumer.
#[derive(Debug)]
struct OutboundTransfer {
    id: u64,
    destination: NodeId,
    topology_id: TopologyId,
    /// Segments not fully sent yet.
    segments: Mutex<BTreeSet<SegmentId>>,
    cancel: CancellationToken,
}

/// Sender side of state transfer for one cache.
#[derive(Debug)]
pub struct StateProvider {
    ctx: TransferContext,
    next_id: AtomicU64,
    outbound: Mutex<Vec<Arc<OutboundTransfer>>>,
}

impl StateProvider {
    pub fn new(ctx: TransferContext) -> Self {
        Self {
            ctx,
            next_id: AtomicU64::new(1),
            outbound: Mutex::new(Vec::new()),
        }
    }

    /// Answer a consumer request.
    pub async fn handle_request(self: &Arc<Self>, request: StateRequest) -> Result<Message> {
        match request.kind {
            StateRequestKind::GetTransactions => {
                self.validate(&request).await?;
                let transactions = self.transactions_for(&request.segments);
                self.ctx
                    .metrics
                    .transactions_sent
                    .inc_by(transactions.len() as u64);
                debug!(
                    cache = %self.ctx.cache,
                    destination = request.origin,
                    transactions = transactions.len(),
                    "Sending transactions"
                );
                Ok(Message::Transactions(transactions))
            }
            StateRequestKind::StartStateTransfer => {
                self.validate(&request).await?;
                self.start_outbound(request);
                Ok(Message::Ack)
            }
            StateRequestKind::CancelStateTransfer => {
                self.cancel_segments(request.origin, &request.segments);
                Ok(Message::Ack)
            }
        }
    }

    /// Wait for the consumer's topology and check every segment is served here.
    async fn validate(&self, request: &StateRequest) -> Result<Arc<CacheTopology>> {
        let topology = self
            .ctx
            .lock
            .wait_for_topology(request.topology_id, self.ctx.topology_wait_timeout)
            .await?;
        if let Some(&segment) = request
            .segments
            .iter()
            .find(|s| !topology.current_ch.is_owner(**s, self.ctx.local))
        {
            warn!(
                cache = %self.ctx.cache,
                requester = request.origin,
                segment,
                topology_id = topology.topology_id,
                "Rejecting request for a segment this node does not serve"
            );
            return Err(TransferError::InvalidSegmentRequest {
                node: self.ctx.local,
                segment,
                topology_id: topology.topology_id,
            }
            .into());
        }
        Ok(topology)
    }

    fn transactions_for(&self, segments: &BTreeSet<SegmentId>) -> Vec<TransactionInfo> {
        self.ctx
            .registry
            .transactions()
            .iter()
            .filter_map(|tx| TransactionInfo::for_segments(tx, &self.ctx.partitioner, segments))
            .collect()
    }

    fn start_outbound(self: &Arc<Self>, request: StateRequest) {
        let transfer = Arc::new(OutboundTransfer {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            destination: request.origin,
            topology_id: request.topology_id,
            segments: Mutex::new(request.segments.clone()),
            cancel: CancellationToken::new(),
        });
        self.ctx
            .metrics
            .active_outbound_segments
            .add(request.segments.len() as i64);
        self.outbound.lock().push(transfer.clone());
        self.ctx.tracker.provider_update(self.ctx.lock.topology_id(), true);
        debug!(
            cache = %self.ctx.cache,
            transfer = transfer.id,
            destination = transfer.destination,
            segments = ?request.segments,
            "Starting outbound transfer"
        );

        let this = self.clone();
        tokio::spawn(async move { this.run_outbound(transfer).await });
    }

    async fn run_outbound(self: Arc<Self>, transfer: Arc<OutboundTransfer>) {
        let segments: Vec<SegmentId> = transfer.segments.lock().iter().copied().collect();
        'segments: for segment in segments {
            if !transfer.segments.lock().contains(&segment) {
                continue;
            }
            let entries = self.ctx.data.segment_entries(segment);
            for chunk in StateChunk::split(segment, entries, self.ctx.config.chunk_size) {
                if !transfer.segments.lock().contains(&segment) {
                    continue 'segments;
                }
                let entries = chunk.len() as u64;
                let response = StateResponse {
                    cache: self.ctx.cache.clone(),
                    origin: self.ctx.local,
                    topology_id: transfer.topology_id,
                    chunks: vec![chunk],
                };
                let send = self.ctx.transport.send(
                    transfer.destination,
                    Message::StateResponse(response),
                    self.ctx.rpc_timeout,
                );
                let result = tokio::select! {
                    _ = transfer.cancel.cancelled() => break 'segments,
                    result = send => result.and_then(Message::expect_ack),
                };
                match result {
                    Ok(()) => {
                        self.ctx.metrics.chunks_sent.inc();
                        self.ctx.metrics.entries_sent.inc_by(entries);
                        trace!(segment, entries, destination = transfer.destination, "Chunk sent");
                    }
                    Err(e) => {
                        warn!(
                            cache = %self.ctx.cache,
                            destination = transfer.destination,
                            segment,
                            error = %e,
                            "Outbound transfer failed"
                        );
                        break 'segments;
                    }
                }
            }
            if transfer.segments.lock().remove(&segment) {
                self.ctx.metrics.active_outbound_segments.sub(1);
            }
        }
        self.finish_outbound(&transfer);
    }

    fn finish_outbound(&self, transfer: &OutboundTransfer) {
        let leftover = std::mem::take(&mut *transfer.segments.lock());
        self.ctx
            .metrics
            .active_outbound_segments
            .sub(leftover.len() as i64);
        let idle = {
            let mut outbound = self.outbound.lock();
            outbound.retain(|t| t.id != transfer.id);
            outbound.is_empty()
        };
        debug!(
            cache = %self.ctx.cache,
            transfer = transfer.id,
            destination = transfer.destination,
            unsent = leftover.len(),
            "Outbound transfer finished"
        );
        if idle {
            self.ctx
                .tracker
                .provider_update(self.ctx.lock.topology_id(), false);
        }
    }

    /// Stop sending `segments` to `destination`.
    pub fn cancel_segments(&self, destination: NodeId, segments: &BTreeSet<SegmentId>) {
        for transfer in self.outbound.lock().iter() {
            if transfer.destination != destination {
                continue;
            }
            let now_empty = {
                let mut remaining = transfer.segments.lock();
                let before = remaining.len();
                remaining.retain(|s| !segments.contains(s));
                self.ctx
                    .metrics
                    .active_outbound_segments
                    .sub((before - remaining.len()) as i64);
                remaining.is_empty()
            };
            if now_empty {
                transfer.cancel.cancel();
            }
        }
        debug!(cache = %self.ctx.cache, destination, ?segments, "Cancelled outbound segments");
    }

    /// Drop segments whose destination no longer becomes their owner.
    pub fn on_topology_update(&self, topology: &CacheTopology) {
        let outbound = self.outbound.lock();
        for transfer in outbound.iter() {
            let pending = topology.pending_ch.as_ref();
            let now_empty = {
                let mut remaining = transfer.segments.lock();
                let before = remaining.len();
                remaining.retain(|s| pending.is_some_and(|p| p.is_owner(*s, transfer.destination)));
                let dropped = before - remaining.len();
                if dropped > 0 {
                    debug!(
                        cache = %self.ctx.cache,
                        destination = transfer.destination,
                        dropped,
                        topology_id = topology.topology_id,
                        "Dropping outbound segments after topology change"
                    );
                    self.ctx.metrics.active_outbound_segments.sub(dropped as i64);
                }
                remaining.is_empty()
            };
            if now_empty {
                transfer.cancel.cancel();
            }
        }
        self.ctx
            .tracker
            .provider_update(topology.topology_id, !outbound.is_empty());
    }

    /// Number of running outbound transfers.
    pub fn active_transfers(&self) -> usize {
        self.outbound.lock().len()
    }
}
