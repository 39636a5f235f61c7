//! Witness-group diversity finality

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use tessera_patch::StatePatch;
use tessera_primitives::{BlockHash, GroupId};
use tracing::{debug, info, trace};

use crate::{PendingBlockGraph, PendingGraphError};

/// What a finality step hands to storage
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalityOutcome {
    /// Cumulative patch to apply to durable storage
    pub patch: StatePatch,
    /// Blocks now final, ascending height
    pub finalized: Vec<BlockHash>,
    /// Blocks on branches incompatible with the final state, ascending height.
    /// Their transactions go back to the mempool.
    pub rollback: Vec<BlockHash>,
    /// New top-stable set, seeds the next graph instance
    pub top_stable: Vec<BlockHash>,
}

impl PendingBlockGraph {
    /// Re-evaluate finality after `new_vertex` was added.
    ///
    /// Walks every downward path from `new_vertex` accumulating distinct
    /// witness groups; the vertex where the count first reaches
    /// `floor(committee_count / 2) + 1` is top-stable for that path. Returns
    /// `None` while no path reaches that diversity.
    pub fn check_finality(
        &mut self,
        new_vertex: &BlockHash,
        committee_count: usize,
    ) -> Result<Option<FinalityOutcome>, PendingGraphError> {
        if !self.contains(new_vertex) {
            return Err(PendingGraphError::UnknownVertex(*new_vertex));
        }

        let majority = committee_count / 2 + 1;
        let mut candidates = BTreeSet::new();
        self.collect_top_stable(
            *new_vertex,
            &mut BTreeSet::new(),
            majority,
            &mut HashSet::new(),
            &mut candidates,
        );

        if candidates.is_empty() {
            trace!(target: "tessera::pending", %new_vertex, majority, "No path reached majority");
            return Ok(None);
        }

        // a candidate below another candidate is subsumed by it
        let below = self.closure_below(
            candidates.iter().flat_map(|c| self.parents_of(c).iter().copied()),
        );
        let top_stable: Vec<BlockHash> =
            candidates.into_iter().filter(|c| !below.contains(c)).collect();

        let mut cumulative = StatePatch::new();
        for hash in &top_stable {
            if let Some(patch) = self.patch(hash) {
                cumulative = cumulative.merge(patch)?;
            }
        }

        let mut finalized: Vec<_> = self.closure_below(top_stable.iter().copied()).into_iter().collect();
        self.sort_by_height(&mut finalized);
        for hash in &finalized {
            self.remove_vertex(hash);
        }

        let (compatible, incompatible): (Vec<_>, Vec<_>) = self
            .tips()
            .into_iter()
            .partition(|tip| self.patch(tip).is_none_or(|patch| patch.merge(&cumulative).is_ok()));

        let keep = self.closure_below(compatible);
        let mut rollback: Vec<_> = self
            .closure_below(incompatible)
            .into_iter()
            .filter(|hash| !keep.contains(hash))
            .collect();
        self.sort_by_height(&mut rollback);
        for hash in &rollback {
            debug!(target: "tessera::pending", %hash, "Rolling back incompatible block");
            self.remove_vertex(hash);
        }

        for vertex in self.vertices.values_mut() {
            if let Some(patch) = vertex.patch.as_mut() {
                patch.purge(&cumulative);
            }
        }
        self.top_stable = top_stable.clone();

        info!(
            target: "tessera::pending",
            finalized = finalized.len(),
            rolled_back = rollback.len(),
            pending = self.len(),
            top_stable = ?top_stable,
            "Blocks became final"
        );

        Ok(Some(FinalityOutcome { patch: cumulative, finalized, rollback, top_stable }))
    }

    /// Depth-first walk collecting the first vertex on each path where group
    /// diversity reaches `majority`. `seen` skips (vertex, group set) pairs
    /// already explored through another path.
    fn collect_top_stable(
        &self,
        hash: BlockHash,
        groups: &mut BTreeSet<GroupId>,
        majority: usize,
        seen: &mut HashSet<(BlockHash, Vec<GroupId>)>,
        candidates: &mut BTreeSet<BlockHash>,
    ) {
        let Some(group) = self.header(&hash).map(|h| h.group_id) else { return };
        let inserted = groups.insert(group);

        if seen.insert((hash, groups.iter().copied().collect())) {
            if groups.len() >= majority {
                candidates.insert(hash);
            } else {
                for parent in self.parents_of(&hash) {
                    self.collect_top_stable(*parent, groups, majority, seen, candidates);
                }
            }
        }

        if inserted {
            groups.remove(&group);
        }
    }
}
