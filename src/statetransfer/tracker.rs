//! Combined "state transfer in progress" signal.
//!
//! Three inputs feed it: inbound work of the consumer, outbound work of the
//! provider, and whether the installed topology is stable. Each input is
//! reported together with the topology it belongs to; reports for a
//! topology older than the latest one are ignored.

use crate::error::{Error, Result};
use crate::topology::CacheTopology;
use crate::types::{NodeId, TopologyId};
use parking_lot::Mutex;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tracing::debug;

/// Snapshot of the tracked signals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferState {
    pub topology_id: TopologyId,
    pub consumer_active: bool,
    pub provider_active: bool,
    pub stable: bool,
    /// The local node owns segments in the current hash.
    pub local_member: bool,
}

impl TransferState {
    pub fn in_progress(&self) -> bool {
        self.consumer_active || self.provider_active || !self.stable
    }
}

/// Per-cache tracker.
#[derive(Debug)]
pub struct StateTransferTracker {
    local: NodeId,
    state: watch::Sender<TransferState>,
    listeners: Mutex<Vec<(TopologyId, oneshot::Sender<TopologyId>)>>,
}

impl StateTransferTracker {
    pub fn new(local: NodeId) -> Self {
        Self {
            local,
            state: watch::channel(TransferState::default()).0,
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn state(&self) -> TransferState {
        *self.state.borrow()
    }

    /// Non-blocking.
    pub fn is_state_transfer_in_progress(&self) -> bool {
        self.state().in_progress()
    }

    /// A topology was received.
    pub fn topology_update(&self, topology: &CacheTopology) {
        let local = self.local;
        self.update(topology.topology_id, |s| {
            s.topology_id = topology.topology_id;
            s.stable = topology.is_stable();
            s.local_member = topology.current_ch.is_member(local);
        });
    }

    pub fn consumer_update(&self, topology_id: TopologyId, active: bool) {
        self.update(topology_id, |s| s.consumer_active = active);
    }

    pub fn provider_update(&self, topology_id: TopologyId, active: bool) {
        self.update(topology_id, |s| s.provider_active = active);
    }

    fn update(&self, topology_id: TopologyId, f: impl FnOnce(&mut TransferState)) {
        let mut applied = false;
        self.state.send_if_modified(|s| {
            if topology_id < s.topology_id {
                return false;
            }
            let before = *s;
            f(s);
            applied = *s != before;
            applied
        });
        if applied {
            self.fire_listeners();
        }
    }

    /// Fires once, when nothing is in progress for a topology at or above the
    /// one installed now.
    pub fn add_completion_listener(&self) -> oneshot::Receiver<TopologyId> {
        let (tx, rx) = oneshot::channel();
        let mut listeners = self.listeners.lock();
        let state = self.state();
        if !state.in_progress() {
            let _ = tx.send(state.topology_id);
        } else {
            listeners.push((state.topology_id, tx));
        }
        rx
    }

    fn fire_listeners(&self) {
        let mut listeners = self.listeners.lock();
        let state = self.state();
        if state.in_progress() {
            return;
        }
        let (ready, waiting): (Vec<_>, Vec<_>) = listeners
            .drain(..)
            .partition(|(min, _)| state.topology_id >= *min);
        *listeners = waiting;
        drop(listeners);
        if ready.is_empty() {
            return;
        }
        debug!(
            topology_id = state.topology_id,
            listeners = ready.len(),
            "State transfer complete"
        );
        for (_, tx) in ready {
            let _ = tx.send(state.topology_id);
        }
    }

    async fn wait_until(
        &self,
        timeout: Duration,
        condition: impl FnMut(&TransferState) -> bool,
    ) -> Result<TransferState> {
        let mut rx = self.state.subscribe();
        let result = match tokio::time::timeout(timeout, rx.wait_for(condition)).await {
            Ok(Ok(state)) => Ok(*state),
            Ok(Err(_)) => Err(Error::Cancelled),
            Err(_) => Err(Error::Timeout),
        };
        result
    }

    /// Wait until the local node owns data in a stable topology and nothing
    /// is being received.
    pub async fn wait_for_initial_transfer(&self, timeout: Duration) -> Result<()> {
        self.wait_until(timeout, |s| {
            s.local_member && s.stable && !s.consumer_active
        })
        .await
        .map(|_| ())
    }

    /// Wait until inbound transfers finished for `topology_id`. Returns false
    /// when a newer topology arrived first.
    pub async fn wait_for_consumer_idle(
        &self,
        topology_id: TopologyId,
        timeout: Duration,
    ) -> Result<bool> {
        let state = self
            .wait_until(timeout, |s| {
                s.topology_id > topology_id || (s.topology_id == topology_id && !s.consumer_active)
            })
            .await?;
        Ok(state.topology_id == topology_id)
    }
}
