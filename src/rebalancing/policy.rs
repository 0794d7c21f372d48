//! Rebalance trigger policy.

use crate::topology::{AvailabilityMode, Phase};
use crate::types::NodeId;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// Rebalancing status of a cache as reported to operational tooling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RebalancingStatus {
    /// Rebalancing is disabled and the cache is not balanced.
    Suspended,
    /// A rebalance is running.
    InProgress,
    /// Nothing to do.
    Complete,
}

/// Everything a policy may look at for one cache.
#[derive(Debug, Clone)]
pub struct RebalanceContext<'a> {
    pub cache: &'a str,
    /// Cluster-wide flag.
    pub cluster_enabled: bool,
    /// Per-cache flag.
    pub cache_enabled: bool,
    pub phase: Phase,
    pub availability: AvailabilityMode,
    /// Members the cache should have.
    pub expected_members: &'a [NodeId],
    /// Members of the current consistent hash.
    pub current_members: &'a [NodeId],
    /// The balanced hash over the current members differs from the current one.
    pub unbalanced: bool,
}

impl RebalanceContext<'_> {
    pub fn is_enabled(&self) -> bool {
        self.cluster_enabled && self.cache_enabled
    }

    /// Membership or placement differs from the ideal.
    pub fn needs_rebalance(&self) -> bool {
        self.expected_members != self.current_members || self.unbalanced
    }
}

/// Decides whether the coordinator starts a rebalance now.
pub trait RebalancePolicy: Send + Sync + Debug + 'static {
    fn should_rebalance(&self, ctx: &RebalanceContext<'_>) -> bool;

    /// Status reported for a cache in this context.
    fn status(&self, ctx: &RebalanceContext<'_>) -> RebalancingStatus {
        if ctx.phase.is_rebalance() {
            RebalancingStatus::InProgress
        } else if ctx.needs_rebalance() && !ctx.expected_members.is_empty() {
            if self.should_rebalance(ctx) {
                RebalancingStatus::InProgress
            } else {
                RebalancingStatus::Suspended
            }
        } else {
            RebalancingStatus::Complete
        }
    }
}

/// Rebalance whenever the cache is stable, available, enabled and not balanced.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultRebalancePolicy;

impl RebalancePolicy for DefaultRebalancePolicy {
    fn should_rebalance(&self, ctx: &RebalanceContext<'_>) -> bool {
        ctx.is_enabled()
            && ctx.phase == Phase::NoRebalance
            && ctx.availability == AvailabilityMode::Available
            && !ctx.expected_members.is_empty()
            && ctx.needs_rebalance()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx<'a>(expected: &'a [NodeId], current: &'a [NodeId]) -> RebalanceContext<'a> {
        RebalanceContext {
            cache: "c",
            cluster_enabled: true,
            cache_enabled: true,
            phase: Phase::NoRebalance,
            availability: AvailabilityMode::Available,
            expected_members: expected,
            current_members: current,
            unbalanced: false,
        }
    }

    #[test]
    fn test_membership_change_triggers() {
        let policy = DefaultRebalancePolicy;
        assert!(policy.should_rebalance(&ctx(&[1, 2, 3], &[1, 2])));
        assert!(!policy.should_rebalance(&ctx(&[1, 2], &[1, 2])));
        assert_eq!(policy.status(&ctx(&[1, 2], &[1, 2])), RebalancingStatus::Complete);
    }

    #[test]
    fn test_disabled_defers() {
        let policy = DefaultRebalancePolicy;
        let mut c = ctx(&[1, 2, 3], &[1, 2]);
        c.cluster_enabled = false;
        assert!(!policy.should_rebalance(&c));
        assert_eq!(policy.status(&c), RebalancingStatus::Suspended);

        let mut c = ctx(&[1, 2, 3], &[1, 2]);
        c.cache_enabled = false;
        assert!(!policy.should_rebalance(&c));
    }

    #[test]
    fn test_no_rebalance_while_running_or_degraded() {
        let policy = DefaultRebalancePolicy;
        let mut c = ctx(&[1, 2, 3], &[1, 2]);
        c.phase = Phase::ReadAllWriteAll;
        assert!(!policy.should_rebalance(&c));
        assert_eq!(policy.status(&c), RebalancingStatus::InProgress);

        let mut c = ctx(&[1, 2, 3], &[1, 2]);
        c.availability = AvailabilityMode::Degraded;
        assert!(!policy.should_rebalance(&c));
    }

    #[test]
    fn test_unbalanced_triggers() {
        let mut c = ctx(&[1, 2], &[1, 2]);
        c.unbalanced = true;
        assert!(DefaultRebalancePolicy.should_rebalance(&c));
    }
}
