//! Coordinator-side state of one cache.
//!
//! All decisions are taken synchronously under the cache's lock; the
//! resulting messages are queued on an ordered broadcaster so every member
//! sees topologies in the order the coordinator produced them.

use crate::error::{Error, Result};
use crate::network::{Message, Transport};
use crate::partitioning::{ConsistentHash, ConsistentHashFactory};
use crate::rebalancing::confirmation::ConfirmationCollector;
use crate::rebalancing::policy::{RebalanceContext, RebalancePolicy, RebalancingStatus};
use crate::topology::{AvailabilityMode, CacheJoinInfo, CacheStatusResponse, CacheTopology, Phase};
use crate::types::{NodeId, SegmentId, ViewId};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Inputs of coordinator decisions that live outside the cache.
#[derive(Clone, Copy)]
pub struct CoordinatorContext<'a> {
    pub policy: &'a dyn RebalancePolicy,
    /// Cluster-wide rebalancing flag.
    pub cluster_enabled: bool,
    pub view_id: ViewId,
}

#[derive(Debug)]
struct Broadcast {
    targets: Vec<NodeId>,
    message: Message,
}

#[derive(Debug)]
struct CacheStatusInner {
    join_info: CacheJoinInfo,
    factory: ConsistentHashFactory,
    /// Members the cache should have: joined and still in the view.
    expected_members: Vec<NodeId>,
    uuids: Vec<(NodeId, Uuid)>,
    topology: Option<CacheTopology>,
    stable_topology: Option<CacheTopology>,
    availability: AvailabilityMode,
    rebalancing_enabled: bool,
    confirmations: ConfirmationCollector,
}

impl CacheStatusInner {
    fn uuids_for(&self, members: &[NodeId]) -> Vec<(NodeId, Uuid)> {
        self.uuids
            .iter()
            .filter(|(n, _)| members.contains(n))
            .copied()
            .collect()
    }

    fn response(&self) -> CacheStatusResponse {
        CacheStatusResponse {
            join_info: self.join_info.clone(),
            topology: self.topology.clone(),
            stable_topology: self.stable_topology.clone(),
            availability: self.availability,
        }
    }
}

fn sorted(members: &[NodeId]) -> Vec<NodeId> {
    let mut members = members.to_vec();
    members.sort_unstable();
    members
}

/// Some segment had all of its owners among `leavers`.
fn loses_segments(ch: &ConsistentHash, leavers: &[NodeId]) -> bool {
    (0..ch.num_segments() as SegmentId).any(|s| {
        let owners = ch.locate_owners(s);
        !owners.is_empty() && owners.iter().all(|o| leavers.contains(o))
    })
}

#[derive(Debug)]
pub struct ClusterCacheStatus {
    name: String,
    inner: Mutex<CacheStatusInner>,
    broadcasts: mpsc::UnboundedSender<Broadcast>,
}

impl ClusterCacheStatus {
    pub fn new(
        name: &str,
        join_info: CacheJoinInfo,
        transport: Arc<dyn Transport>,
        rpc_timeout: Duration,
    ) -> Result<Self> {
        let factory = join_info.factory()?;
        Ok(Self {
            name: name.to_string(),
            inner: Mutex::new(CacheStatusInner {
                join_info,
                factory,
                expected_members: Vec::new(),
                uuids: Vec::new(),
                topology: None,
                stable_topology: None,
                availability: AvailabilityMode::Available,
                rebalancing_enabled: true,
                confirmations: ConfirmationCollector::new(),
            }),
            broadcasts: Self::spawn_broadcaster(name.to_string(), transport, rpc_timeout),
        })
    }

    /// One message at a time, each acknowledged by every target before the next.
    fn spawn_broadcaster(
        cache: String,
        transport: Arc<dyn Transport>,
        timeout: Duration,
    ) -> mpsc::UnboundedSender<Broadcast> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Broadcast>();
        tokio::spawn(async move {
            while let Some(Broadcast { targets, message }) = rx.recv().await {
                let kind = message.kind();
                for (node, result) in transport.broadcast(&targets, message, timeout).await {
                    if let Err(e) = result.and_then(Message::expect_ack) {
                        warn!(%cache, node, kind, error = %e, "Topology message not acknowledged");
                    }
                }
            }
        });
        tx
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn topology(&self) -> Option<CacheTopology> {
        self.inner.lock().topology.clone()
    }

    pub fn stable_topology(&self) -> Option<CacheTopology> {
        self.inner.lock().stable_topology.clone()
    }

    pub fn expected_members(&self) -> Vec<NodeId> {
        self.inner.lock().expected_members.clone()
    }

    pub fn availability(&self) -> AvailabilityMode {
        self.inner.lock().availability
    }

    fn send(&self, inner: &CacheStatusInner, message: Message) {
        let mut targets = inner.expected_members.clone();
        if let Some(topology) = &inner.topology {
            for node in topology.members().iter().chain(topology.current_ch.members()) {
                if !targets.contains(node) {
                    targets.push(*node);
                }
            }
        }
        if self.broadcasts.send(Broadcast { targets, message }).is_err() {
            warn!(cache = %self.name, "Broadcaster stopped, topology message dropped");
        }
    }

    /// Make `topology` current and push it to every member.
    fn publish(&self, inner: &mut CacheStatusInner, topology: CacheTopology, ctx: &CoordinatorContext<'_>) {
        if topology.phase.is_rebalance() {
            inner.confirmations.reset(topology.topology_id, topology.members());
        } else {
            inner.confirmations.clear();
        }
        inner.topology = Some(topology.clone());
        let message = Message::TopologyUpdate {
            cache: self.name.clone(),
            topology,
            availability: inner.availability,
            view_id: ctx.view_id,
        };
        self.send(inner, message);
    }

    fn send_stable(&self, inner: &CacheStatusInner, topology: CacheTopology, ctx: &CoordinatorContext<'_>) {
        let message = Message::StableTopologyUpdate {
            cache: self.name.clone(),
            topology,
            view_id: ctx.view_id,
        };
        self.send(inner, message);
    }

    pub fn join(
        &self,
        joiner: NodeId,
        join_info: &CacheJoinInfo,
        ctx: &CoordinatorContext<'_>,
    ) -> Result<CacheStatusResponse> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if !inner.join_info.is_compatible(join_info) {
            warn!(cache = %self.name, joiner, "Rejecting joiner with different placement settings");
            return Err(Error::Config(format!(
                "node {joiner} uses placement settings incompatible with cache {}",
                self.name
            )));
        }
        inner.uuids.retain(|(n, _)| *n != joiner);
        inner.uuids.push((joiner, join_info.persistent_uuid));
        if !inner.expected_members.contains(&joiner) {
            inner.expected_members.push(joiner);
        }

        if inner.topology.is_none() {
            let ch = inner.factory.create(&[joiner])?;
            let topology = CacheTopology::stable(1, 1, ch, inner.uuids_for(&[joiner]));
            info!(cache = %self.name, joiner, "Created initial topology");
            inner.stable_topology = Some(topology.clone());
            inner.topology = Some(topology);
        } else {
            debug!(cache = %self.name, joiner, "Node joined cache");
            self.maybe_rebalance_locked(inner, ctx, false);
        }
        Ok(inner.response())
    }

    /// Remove members that left the cache or the cluster. Returns true when
    /// nobody is left and the cache should be forgotten.
    pub fn remove_members(&self, leavers: &[NodeId], ctx: &CoordinatorContext<'_>) -> bool {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.expected_members.retain(|m| !leavers.contains(m));
        let Some(topology) = inner.topology.clone() else {
            return inner.expected_members.is_empty();
        };
        let affected: Vec<NodeId> = leavers
            .iter()
            .copied()
            .filter(|l| topology.is_member(*l) || topology.current_ch.is_member(*l))
            .collect();
        if affected.is_empty() {
            return false;
        }

        let remaining = |ch: &ConsistentHash| -> Vec<NodeId> {
            ch.members()
                .iter()
                .copied()
                .filter(|m| !affected.contains(m))
                .collect()
        };
        let current = remaining(&topology.current_ch);
        let pending = topology
            .pending_ch
            .as_deref()
            .map(|p| remaining(p))
            .unwrap_or_default();
        if current.is_empty() && pending.is_empty() {
            info!(cache = %self.name, "Last member left, dropping cache");
            return true;
        }

        if inner.join_info.partition_handling && loses_segments(&topology.current_ch, &affected) {
            warn!(cache = %self.name, leavers = ?affected, "Segments lost all owners, cache is degraded");
            inner.availability = AvailabilityMode::Degraded;
        }

        let next = if current.is_empty() {
            // only joiners without data remain
            warn!(cache = %self.name, "Every owner left, restarting from the remaining joiners");
            match inner.factory.create(&pending) {
                Ok(ch) => CacheTopology::stable(
                    topology.topology_id + 1,
                    topology.rebalance_id,
                    ch,
                    inner.uuids_for(&pending),
                ),
                Err(e) => {
                    warn!(cache = %self.name, error = %e, "Cannot rebuild topology");
                    return true;
                }
            }
        } else {
            topology.without_members(&inner.factory, &affected)
        };
        info!(
            cache = %self.name,
            leavers = ?affected,
            topology_id = next.topology_id,
            phase = ?next.phase,
            "Removed members from topology"
        );
        self.publish(inner, next, ctx);
        self.maybe_rebalance_locked(inner, ctx, false);
        false
    }

    /// Record a phase confirmation and advance once every member confirmed.
    pub fn confirm(&self, node: NodeId, topology_id: u64, ctx: &CoordinatorContext<'_>) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if !inner.confirmations.confirm(node, topology_id) {
            debug!(
                cache = %self.name,
                node,
                topology_id,
                awaiting = ?inner.confirmations.awaiting(),
                "Phase confirmation recorded"
            );
            return;
        }
        let Some(topology) = inner.topology.clone() else {
            return;
        };
        let next = topology.advance_phase();
        if next.phase == Phase::NoRebalance {
            info!(
                cache = %self.name,
                topology_id = next.topology_id,
                rebalance_id = next.rebalance_id,
                members = ?next.members(),
                "Rebalance finished"
            );
            inner.stable_topology = Some(next.clone());
            self.publish(inner, next.clone(), ctx);
            self.send_stable(inner, next, ctx);
            self.maybe_rebalance_locked(inner, ctx, false);
        } else {
            debug!(cache = %self.name, topology_id = next.topology_id, phase = ?next.phase, "Advancing rebalance phase");
            self.publish(inner, next, ctx);
        }
    }

    fn rebalance_context<'a>(
        &'a self,
        inner: &CacheStatusInner,
        topology: &CacheTopology,
        expected: &'a [NodeId],
        current: &'a [NodeId],
        ctx: &CoordinatorContext<'_>,
    ) -> RebalanceContext<'a> {
        RebalanceContext {
            cache: &self.name,
            cluster_enabled: ctx.cluster_enabled,
            cache_enabled: inner.rebalancing_enabled,
            phase: topology.phase,
            availability: inner.availability,
            expected_members: expected,
            current_members: current,
            unbalanced: inner.factory.rebalance(&topology.current_ch) != *topology.current_ch,
        }
    }

    fn maybe_rebalance_locked(&self, inner: &mut CacheStatusInner, ctx: &CoordinatorContext<'_>, force: bool) {
        let Some(topology) = inner.topology.clone() else {
            return;
        };
        if topology.phase.is_rebalance() || inner.expected_members.is_empty() {
            return;
        }
        let expected = sorted(&inner.expected_members);
        let current = sorted(topology.current_ch.members());
        let policy_ctx = self.rebalance_context(inner, &topology, &expected, &current, ctx);
        if !force && !ctx.policy.should_rebalance(&policy_ctx) {
            debug!(cache = %self.name, ?expected, ?current, "Not rebalancing");
            return;
        }

        let pending = inner.factory.rebalance(
            &inner
                .factory
                .update_members(&topology.current_ch, &inner.expected_members),
        );
        if pending == *topology.current_ch {
            debug!(cache = %self.name, "Already balanced");
            return;
        }
        let mut next = topology.start_rebalance(&inner.factory, pending);
        next.persistent_uuids = inner.uuids_for(next.members());
        info!(
            cache = %self.name,
            topology_id = next.topology_id,
            rebalance_id = next.rebalance_id,
            members = ?next.members(),
            "Starting rebalance"
        );
        inner.confirmations.reset(next.topology_id, next.members());
        inner.topology = Some(next.clone());
        let message = Message::RebalanceStart {
            cache: self.name.clone(),
            topology: next,
            view_id: ctx.view_id,
        };
        self.send(inner, message);
    }

    /// Start a rebalance if the policy asks for one.
    pub fn maybe_rebalance(&self, ctx: &CoordinatorContext<'_>) {
        let mut guard = self.inner.lock();
        self.maybe_rebalance_locked(&mut guard, ctx, false);
    }

    /// Start a rebalance towards the expected members whatever the policy says.
    pub fn force_rebalance(&self, ctx: &CoordinatorContext<'_>) {
        info!(cache = %self.name, "Forced rebalance");
        let mut guard = self.inner.lock();
        self.maybe_rebalance_locked(&mut guard, ctx, true);
    }

    pub fn set_rebalancing_enabled(&self, enabled: bool, ctx: &CoordinatorContext<'_>) {
        let mut guard = self.inner.lock();
        guard.rebalancing_enabled = enabled;
        info!(cache = %self.name, enabled, "Cache rebalancing toggled");
        if enabled {
            self.maybe_rebalance_locked(&mut guard, ctx, false);
        }
    }

    pub fn is_rebalancing_enabled(&self) -> bool {
        self.inner.lock().rebalancing_enabled
    }

    pub fn rebalancing_status(&self, ctx: &CoordinatorContext<'_>) -> RebalancingStatus {
        let inner = self.inner.lock();
        let Some(topology) = inner.topology.as_ref() else {
            return RebalancingStatus::Complete;
        };
        let expected = sorted(&inner.expected_members);
        let current = sorted(topology.current_ch.members());
        let policy_ctx = self.rebalance_context(&inner, topology, &expected, &current, ctx);
        ctx.policy.status(&policy_ctx)
    }

    /// Change the availability mode; members get a topology with a new id.
    pub fn set_availability(&self, mode: AvailabilityMode, ctx: &CoordinatorContext<'_>) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if inner.availability == mode {
            return;
        }
        info!(cache = %self.name, ?mode, "Availability mode changed");
        inner.availability = mode;
        if let Some(topology) = inner.topology.clone() {
            let next = topology.with_ids(topology.topology_id + 1, topology.rebalance_id);
            self.publish(inner, next, ctx);
        }
        if mode == AvailabilityMode::Available {
            self.maybe_rebalance_locked(inner, ctx, false);
        }
    }

    /// Rebuild the status from what the members reported to a new
    /// coordinator, and push the recovered topology.
    ///
    /// Without a merge the most recent topology wins, minus members that are
    /// gone. After a merge the current hashes of every partition are joined
    /// and a fresh rebalance sorts out ownership.
    pub fn recover(
        name: &str,
        statuses: Vec<(NodeId, CacheStatusResponse)>,
        merge: bool,
        transport: Arc<dyn Transport>,
        rpc_timeout: Duration,
        ctx: &CoordinatorContext<'_>,
    ) -> Result<Self> {
        let join_info = statuses
            .first()
            .map(|(_, s)| s.join_info.clone())
            .ok_or_else(|| Error::Internal(format!("no member reported cache {name}")))?;
        let status = Self::new(name, join_info, transport, rpc_timeout)?;
        {
            let mut guard = status.inner.lock();
            let inner = &mut *guard;
            inner.expected_members = statuses.iter().map(|(n, _)| *n).collect();
            inner.uuids = statuses
                .iter()
                .map(|(n, s)| (*n, s.join_info.persistent_uuid))
                .collect();
            inner.stable_topology = statuses
                .iter()
                .filter_map(|(_, s)| s.stable_topology.clone())
                .max_by_key(|t| t.topology_id);
            if statuses
                .iter()
                .any(|(_, s)| s.availability == AvailabilityMode::Degraded)
            {
                inner.availability = AvailabilityMode::Degraded;
            }

            let topologies: Vec<&CacheTopology> =
                statuses.iter().filter_map(|(_, s)| s.topology.as_ref()).collect();
            let max_rebalance = topologies.iter().map(|t| t.rebalance_id).max().unwrap_or(1);
            let latest = topologies.iter().copied().max_by_key(|t| t.topology_id);
            let expected = inner.expected_members.clone();

            let recovered = match latest {
                None => CacheTopology::stable(
                    1,
                    1,
                    inner.factory.create(&expected)?,
                    inner.uuids_for(&expected),
                ),
                Some(latest) if !merge => {
                    let leavers: Vec<NodeId> = latest
                        .members()
                        .iter()
                        .chain(latest.current_ch.members())
                        .copied()
                        .filter(|m| !expected.contains(m))
                        .collect();
                    if inner.join_info.partition_handling && loses_segments(&latest.current_ch, &leavers) {
                        warn!(cache = name, ?leavers, "Segments lost all owners, cache is degraded");
                        inner.availability = AvailabilityMode::Degraded;
                    }
                    let survivors = latest
                        .current_ch
                        .members()
                        .iter()
                        .any(|m| !leavers.contains(m));
                    let topology = if leavers.is_empty() {
                        latest.clone()
                    } else if survivors {
                        latest.without_members(&inner.factory, &leavers)
                    } else {
                        CacheTopology::stable(
                            latest.topology_id,
                            latest.rebalance_id,
                            inner.factory.create(&expected)?,
                            inner.uuids_for(&expected),
                        )
                    };
                    topology.with_ids(latest.topology_id + 1, max_rebalance)
                }
                Some(latest) => {
                    let mut union = (*latest.current_ch).clone();
                    for topology in &topologies {
                        union = inner.factory.union(&union, &topology.current_ch);
                    }
                    let ch = inner.factory.update_members(&union, &expected);
                    let topology = CacheTopology::stable(
                        latest.topology_id + 1,
                        max_rebalance,
                        ch,
                        inner.uuids_for(&expected),
                    );
                    inner.stable_topology = Some(topology.clone());
                    topology
                }
            };
            info!(
                cache = name,
                merge,
                topology_id = recovered.topology_id,
                phase = ?recovered.phase,
                members = ?recovered.members(),
                "Recovered cache topology"
            );
            status.publish(inner, recovered.clone(), ctx);
            if merge {
                status.send_stable(inner, recovered, ctx);
            }
            status.maybe_rebalance_locked(inner, ctx, false);
        }
        Ok(status)
    }
}
