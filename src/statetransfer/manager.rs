//! Topology installation for one cache.

use crate::error::{Error, Result};
use crate::statetransfer::{StateConsumer, StateProvider, TransferContext};
use crate::topology::{CacheTopology, CacheTopologyHandler, Phase, PhaseConfirmation};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Installs topologies handed over by the local topology manager and
/// confirms the `ReadAllWriteAll` phase once inbound transfers are done.
#[derive(Debug)]
pub struct StateTransferManager {
    ctx: TransferContext,
    provider: Arc<StateProvider>,
    consumer: Arc<StateConsumer>,
    confirmations: mpsc::UnboundedSender<PhaseConfirmation>,
}

impl StateTransferManager {
    pub fn new(
        ctx: TransferContext,
        provider: Arc<StateProvider>,
        consumer: Arc<StateConsumer>,
        confirmations: mpsc::UnboundedSender<PhaseConfirmation>,
    ) -> Self {
        Self {
            ctx,
            provider,
            consumer,
            confirmations,
        }
    }

    /// Confirm `topology_id` once nothing is received for it any more.
    fn confirm_when_idle(&self, topology_id: u64) {
        let tracker = self.ctx.tracker.clone();
        let lock = self.ctx.lock.clone();
        let confirmations = self.confirmations.clone();
        let cache = self.ctx.cache.clone();
        let timeout = self.ctx.config.timeout;
        tokio::spawn(async move {
            loop {
                match tracker.wait_for_consumer_idle(topology_id, timeout).await {
                    Ok(true) if lock.topology_id() == topology_id => {
                        debug!(%cache, topology_id, "Inbound transfers done, confirming phase");
                        let _ = confirmations.send(PhaseConfirmation { cache, topology_id });
                        return;
                    }
                    Ok(_) => {
                        debug!(%cache, topology_id, "Topology superseded before transfers finished");
                        return;
                    }
                    Err(Error::Timeout) => {
                        warn!(%cache, topology_id, "Still receiving state, phase not confirmed yet");
                    }
                    Err(_) => return,
                }
            }
        });
    }
}

#[async_trait]
impl CacheTopologyHandler for StateTransferManager {
    async fn update_topology(&self, topology: Arc<CacheTopology>, is_rebalance_start: bool) -> Result<()> {
        self.ctx.tracker.topology_update(&topology);
        {
            let _exclusive = self.ctx.lock.acquire_exclusive().await;
            self.provider.on_topology_update(&topology);
            self.consumer
                .on_topology_update(topology.clone(), is_rebalance_start);
            self.ctx.lock.notify_topology_installed(topology.clone());
        }
        self.ctx.metrics.topologies_applied.inc();
        info!(
            cache = %self.ctx.cache,
            topology_id = topology.topology_id,
            rebalance_id = topology.rebalance_id,
            phase = ?topology.phase,
            members = ?topology.members(),
            "Installed topology"
        );

        if topology.phase == Phase::ReadAllWriteAll && topology.is_member(self.ctx.local) {
            self.confirm_when_idle(topology.topology_id);
        }
        Ok(())
    }
}
