//! Builds, updates, rebalances and unions consistent hashes.
//!
//! All operations are pure and deterministic: the same inputs always give
//! the same table, so every node can recompute a hash independently.
//!
//! Placement is sticky. `update_members` keeps every surviving owner in
//! its original position and only fills segments that lost all of their
//! owners. `rebalance` moves the minimum it can: it prefers promoting an
//! existing backup to primary over moving data, and only touches backups
//! once primaries are balanced.

use super::ConsistentHash;
use crate::config::{CacheConfig, CacheMode};
use crate::error::{Error, Result};
use crate::types::NodeId;
use std::collections::HashMap;

/// Creates and transforms [`ConsistentHash`] tables for one cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsistentHashFactory {
    num_owners: usize,
    num_segments: usize,
    replicated: bool,
}

impl ConsistentHashFactory {
    /// Create a factory, failing on impossible settings.
    pub fn new(mode: CacheMode, num_owners: usize, num_segments: usize) -> Result<Self> {
        if num_segments < 1 {
            return Err(Error::Config(format!(
                "num_segments must be at least 1, got {num_segments}"
            )));
        }
        if mode == CacheMode::Distributed && num_owners < 1 {
            return Err(Error::Config(format!(
                "num_owners must be at least 1, got {num_owners}"
            )));
        }
        Ok(Self {
            num_owners: num_owners.max(1),
            num_segments,
            replicated: mode == CacheMode::Replicated,
        })
    }

    pub fn from_config(config: &CacheConfig) -> Result<Self> {
        Self::new(config.mode, config.num_owners, config.num_segments)
    }

    pub fn num_segments(&self) -> usize {
        self.num_segments
    }

    /// Initial assignment over `members`.
    pub fn create(&self, members: &[NodeId]) -> Result<ConsistentHash> {
        let members = dedup(members);
        if members.is_empty() {
            return Err(Error::Config(
                "cannot create a consistent hash without members".into(),
            ));
        }
        let empty = ConsistentHash::from_parts(
            self.num_owners,
            self.replicated,
            members,
            vec![Vec::new(); self.num_segments],
        );
        Ok(self.rebalance(&empty))
    }

    /// Recompute ownership for a changed member list.
    ///
    /// Owners that remain members keep their order. A segment left with no
    /// owner gets the new member with the fewest primary segments. Joiners
    /// get nothing else; they only receive segments through `rebalance`.
    pub fn update_members(&self, ch: &ConsistentHash, new_members: &[NodeId]) -> ConsistentHash {
        let members = dedup(new_members);
        let mut owners: Vec<Vec<NodeId>> = ch
            .segment_owners()
            .iter()
            .map(|seg| seg.iter().copied().filter(|o| members.contains(o)).collect())
            .collect();

        if !members.is_empty() {
            let mut primaries: HashMap<NodeId, usize> = members.iter().map(|&m| (m, 0)).collect();
            for seg in &owners {
                if let Some(p) = seg.first() {
                    *primaries.entry(*p).or_insert(0) += 1;
                }
            }
            for seg in owners.iter_mut().filter(|seg| seg.is_empty()) {
                // min_by_key keeps the first minimum, so ties go to member order
                let Some(&pick) = members.iter().min_by_key(|m| primaries[*m]) else {
                    break;
                };
                seg.push(pick);
                *primaries.entry(pick).or_insert(0) += 1;
            }
        }

        ConsistentHash::from_parts(ch.num_owners(), ch.is_replicated(), members, owners)
    }

    /// Compute a balanced assignment over the same members.
    pub fn rebalance(&self, ch: &ConsistentHash) -> ConsistentHash {
        if ch.members().is_empty() {
            return ch.clone();
        }
        let mut balancer = Balancer::new(ch);
        balancer.trim();
        balancer.fill();
        balancer.balance_primaries();
        balancer.balance_backups();
        balancer.finish(ch)
    }

    /// Per segment, owners of `ch1` followed by the extra owners of `ch2`.
    pub fn union(&self, ch1: &ConsistentHash, ch2: &ConsistentHash) -> ConsistentHash {
        let mut members = ch1.members().to_vec();
        for m in ch2.members() {
            if !members.contains(m) {
                members.push(*m);
            }
        }
        let owners = ch1
            .segment_owners()
            .iter()
            .enumerate()
            .map(|(segment, first)| {
                let mut merged = first.clone();
                for o in ch2.locate_owners(segment as u32) {
                    if !merged.contains(o) {
                        merged.push(*o);
                    }
                }
                merged
            })
            .collect();
        ConsistentHash::from_parts(ch1.num_owners(), ch1.is_replicated(), members, owners)
    }
}

fn dedup(members: &[NodeId]) -> Vec<NodeId> {
    let mut out = Vec::with_capacity(members.len());
    for m in members {
        if !out.contains(m) {
            out.push(*m);
        }
    }
    out
}

/// Working state for one `rebalance` call. Counts are indexed by member
/// position so ties resolve by member order.
struct Balancer {
    members: Vec<NodeId>,
    index: HashMap<NodeId, usize>,
    owners: Vec<Vec<NodeId>>,
    primaries: Vec<usize>,
    owned: Vec<usize>,
    target_owners: usize,
}

impl Balancer {
    fn new(ch: &ConsistentHash) -> Self {
        let members = ch.members().to_vec();
        let index: HashMap<NodeId, usize> =
            members.iter().enumerate().map(|(i, &m)| (m, i)).collect();
        let owners: Vec<Vec<NodeId>> = ch
            .segment_owners()
            .iter()
            .map(|seg| {
                let mut kept = Vec::with_capacity(seg.len());
                for o in seg {
                    if index.contains_key(o) && !kept.contains(o) {
                        kept.push(*o);
                    }
                }
                kept
            })
            .collect();

        let mut primaries = vec![0; members.len()];
        let mut owned = vec![0; members.len()];
        for seg in &owners {
            for (pos, o) in seg.iter().enumerate() {
                let i = index[o];
                owned[i] += 1;
                if pos == 0 {
                    primaries[i] += 1;
                }
            }
        }

        Self {
            target_owners: ch.effective_num_owners(),
            members,
            index,
            owners,
            primaries,
            owned,
        }
    }

    /// Remove surplus backups, most loaded first.
    fn trim(&mut self) {
        for s in 0..self.owners.len() {
            while self.owners[s].len() > self.target_owners {
                if !self.drop_heaviest_backup(s) {
                    break;
                }
            }
        }
    }

    /// Give every segment enough owners, least loaded first.
    fn fill(&mut self) {
        for s in 0..self.owners.len() {
            while self.owners[s].len() < self.target_owners {
                let orphan = self.owners[s].is_empty();
                let candidate = (0..self.members.len())
                    .filter(|&i| !self.owners[s].contains(&self.members[i]))
                    .min_by_key(|&i| {
                        if orphan {
                            (self.primaries[i], self.owned[i])
                        } else {
                            (self.owned[i], self.primaries[i])
                        }
                    });
                let Some(i) = candidate else { break };
                self.owners[s].push(self.members[i]);
                self.owned[i] += 1;
                if orphan {
                    self.primaries[i] += 1;
                }
            }
        }
    }

    /// Move primaries until every member has floor or ceil of the average.
    fn balance_primaries(&mut self) {
        // every move lowers the spread of primary counts, so this terminates
        loop {
            let (over, under) = extremes(&self.primaries);
            if self.primaries[over] <= self.primaries[under] + 1 {
                return;
            }
            let over_node = self.members[over];
            let under_node = self.members[under];

            let promote = self
                .owners
                .iter()
                .position(|seg| seg.first() == Some(&over_node) && seg.contains(&under_node));
            if let Some(s) = promote {
                let pos = self.owners[s]
                    .iter()
                    .position(|o| *o == under_node)
                    .unwrap_or(0);
                self.owners[s].swap(0, pos);
            } else if let Some(s) = self
                .owners
                .iter()
                .position(|seg| seg.first() == Some(&over_node))
            {
                self.owners[s].insert(0, under_node);
                self.owned[under] += 1;
                if self.owners[s].len() > self.target_owners {
                    self.drop_heaviest_backup(s);
                }
            } else {
                return;
            }
            self.primaries[over] -= 1;
            self.primaries[under] += 1;
        }
    }

    /// Move backup copies from the most to the least loaded member.
    fn balance_backups(&mut self) {
        loop {
            let (over, under) = extremes(&self.owned);
            if self.owned[over] <= self.owned[under] + 1 {
                return;
            }
            let over_node = self.members[over];
            let under_node = self.members[under];
            let candidate = self.owners.iter().position(|seg| {
                !seg.contains(&under_node) && seg.iter().skip(1).any(|o| *o == over_node)
            });
            let Some(s) = candidate else { return };
            for o in self.owners[s].iter_mut().skip(1) {
                if *o == over_node {
                    *o = under_node;
                }
            }
            self.owned[over] -= 1;
            self.owned[under] += 1;
        }
    }

    /// Remove the backup with the highest load from segment `s`.
    fn drop_heaviest_backup(&mut self, s: usize) -> bool {
        let victim = self.owners[s]
            .iter()
            .enumerate()
            .skip(1)
            .max_by_key(|(_, o)| {
                let i = self.index[*o];
                (self.owned[i], i)
            })
            .map(|(pos, _)| pos);
        match victim {
            Some(pos) => {
                let removed = self.owners[s].remove(pos);
                self.owned[self.index[&removed]] -= 1;
                true
            }
            None => false,
        }
    }

    fn finish(self, ch: &ConsistentHash) -> ConsistentHash {
        ConsistentHash::from_parts(ch.num_owners(), ch.is_replicated(), self.members, self.owners)
    }
}

/// Index of the highest count (last on ties) and the lowest (first on ties).
fn extremes(counts: &[usize]) -> (usize, usize) {
    let mut over = 0;
    let mut under = 0;
    for (i, &c) in counts.iter().enumerate() {
        if c >= counts[over] {
            over = i;
        }
        if c < counts[under] {
            under = i;
        }
    }
    (over, under)
}
