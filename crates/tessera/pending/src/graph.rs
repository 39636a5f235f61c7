//! DAG structure, tips and parent selection

use std::{
    cmp::Reverse,
    collections::{BTreeSet, HashMap, HashSet},
};
use tessera_patch::StatePatch;
use tessera_primitives::{BlockHash, BlockHeader, GroupId};
use tracing::{trace, warn};

use crate::PendingGraphError;

/// A block waiting for finality
#[derive(Debug, Clone)]
pub struct PendingVertex {
    /// Block header
    pub header: BlockHeader,
    /// Cumulative patch of the branch ending here; `None` once applied to storage
    pub patch: Option<StatePatch>,
}

/// DAG of committed but not yet final blocks.
///
/// Edges run from a child to each of its parents that is still pending.
/// Parents that already graduated (or genesis) are simply not in the graph.
#[derive(Debug)]
pub struct PendingBlockGraph {
    pub(crate) genesis: BlockHash,
    pub(crate) vertices: HashMap<BlockHash, PendingVertex>,
    /// child -> pending parents
    pub(crate) parents: HashMap<BlockHash, Vec<BlockHash>>,
    /// parent -> pending children
    pub(crate) children: HashMap<BlockHash, HashSet<BlockHash>>,
    /// Top-stable set of the last finality step
    pub(crate) top_stable: Vec<BlockHash>,
}

impl PendingBlockGraph {
    /// Create an empty graph rooted at `genesis`
    pub fn new(genesis: BlockHash) -> Self {
        Self::with_top_stable(genesis, Vec::new())
    }

    /// Create an empty graph seeded with the top-stable set of a previous instance
    pub fn with_top_stable(genesis: BlockHash, top_stable: Vec<BlockHash>) -> Self {
        Self {
            genesis,
            vertices: HashMap::new(),
            parents: HashMap::new(),
            children: HashMap::new(),
            top_stable,
        }
    }

    /// Genesis hash
    pub const fn genesis(&self) -> BlockHash {
        self.genesis
    }

    /// Top-stable set recorded by the last finality step
    pub fn top_stable(&self) -> &[BlockHash] {
        &self.top_stable
    }

    /// Number of pending blocks
    pub fn len(&self) -> usize {
        self.vertices.len()
    }

    /// Whether no blocks are pending
    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }

    /// Whether a block is pending
    pub fn contains(&self, hash: &BlockHash) -> bool {
        self.vertices.contains_key(hash)
    }

    /// Get a pending vertex
    pub fn vertex(&self, hash: &BlockHash) -> Option<&PendingVertex> {
        self.vertices.get(hash)
    }

    /// Header of a pending block
    pub fn header(&self, hash: &BlockHash) -> Option<&BlockHeader> {
        self.vertices.get(hash).map(|v| &v.header)
    }

    /// Patch of a pending block
    pub fn patch(&self, hash: &BlockHash) -> Option<&StatePatch> {
        self.vertices.get(hash).and_then(|v| v.patch.as_ref())
    }

    /// Insert a block, wiring edges to every pending parent (and to pending
    /// children that arrived before it).
    pub fn add_vertex(
        &mut self,
        header: BlockHeader,
        patch: StatePatch,
    ) -> Result<BlockHash, PendingGraphError> {
        let hash = header.hash();
        if self.vertices.contains_key(&hash) {
            return Err(PendingGraphError::DuplicateVertex(hash));
        }

        let mut present = Vec::with_capacity(header.parent_hashes.len());
        for parent in &header.parent_hashes {
            if self.vertices.contains_key(parent) && !present.contains(parent) {
                present.push(*parent);
                self.children.entry(*parent).or_default().insert(hash);
            }
        }

        let early_children: Vec<BlockHash> = self
            .vertices
            .iter()
            .filter(|(_, v)| v.header.parent_hashes.contains(&hash))
            .map(|(child, _)| *child)
            .collect();
        for child in early_children {
            self.parents.entry(child).or_default().push(hash);
            self.children.entry(hash).or_default().insert(child);
        }

        trace!(
            target: "tessera::pending",
            %hash,
            height = header.height,
            group = header.group_id,
            parents = present.len(),
            "Added pending vertex"
        );

        self.parents.insert(hash, present);
        self.vertices.insert(hash, PendingVertex { header, patch: Some(patch) });
        Ok(hash)
    }

    /// Blocks with no pending children, sorted by hash
    pub fn tips(&self) -> Vec<BlockHash> {
        let mut tips: Vec<_> = self
            .vertices
            .keys()
            .filter(|hash| self.children.get(*hash).is_none_or(HashSet::is_empty))
            .copied()
            .collect();
        tips.sort_unstable();
        tips
    }

    /// Pick the tips to extend and the merged patch spanning them.
    ///
    /// Tips are ranked by (distinct witness groups on their best downward
    /// path, that path's length, patch complexity), highest first, then by
    /// hash. They are merged greedily; a tip whose patch conflicts with what
    /// was merged so far is skipped. Never returns an empty parent list.
    pub fn best_parents(&self) -> (Vec<BlockHash>, StatePatch) {
        let tips = self.tips();
        if tips.is_empty() {
            let fallback =
                if self.top_stable.is_empty() { vec![self.genesis] } else { self.top_stable.clone() };
            return (fallback, StatePatch::new());
        }

        let mut memo = HashMap::new();
        let mut ranked: Vec<_> = tips
            .into_iter()
            .map(|tip| {
                let (groups, length) = self.best_path(&tip, &mut BTreeSet::new(), &mut memo);
                let complexity = self.patch(&tip).map(StatePatch::complexity).unwrap_or(0);
                (Reverse(groups), Reverse(length), Reverse(complexity), tip)
            })
            .collect();
        ranked.sort_unstable();

        let empty = StatePatch::new();
        let mut selected = Vec::new();
        let mut merged: Option<StatePatch> = None;
        for (_, _, _, tip) in ranked {
            let patch = self.patch(&tip).unwrap_or(&empty);
            let next = match &merged {
                Some(acc) => acc.merge(patch),
                None => Ok(patch.clone()),
            };
            match next {
                Ok(next) => {
                    merged = Some(next);
                    selected.push(tip);
                }
                Err(err) => {
                    warn!(target: "tessera::pending", %tip, %err, "Skipping conflicting tip");
                }
            }
        }

        (selected, merged.unwrap_or_default())
    }

    /// Best (distinct groups, length) over all downward paths from `hash`,
    /// given the groups already seen above it.
    ///
    /// The answer only depends on `hash` and that group set, so it is memoized
    /// per pair; shared ancestry of many tips is walked once per set.
    fn best_path(
        &self,
        hash: &BlockHash,
        groups: &mut BTreeSet<GroupId>,
        memo: &mut HashMap<(BlockHash, Vec<GroupId>), (usize, usize)>,
    ) -> (usize, usize) {
        let Some(vertex) = self.vertices.get(hash) else { return (groups.len(), 0) };
        let group = vertex.header.group_id;
        let inserted = groups.insert(group);

        let key = (*hash, groups.iter().copied().collect::<Vec<_>>());
        let score = match memo.get(&key).copied() {
            Some(score) => score,
            None => {
                let parents = self.parents_of(hash);
                let (distinct, below) = if parents.is_empty() {
                    (groups.len(), 0)
                } else {
                    parents
                        .iter()
                        .map(|parent| self.best_path(parent, groups, memo))
                        .fold((0, 0), std::cmp::max)
                };
                let score = (distinct, below + 1);
                memo.insert(key, score);
                score
            }
        };

        if inserted {
            groups.remove(&group);
        }
        score
    }

    /// Pending parents of a vertex
    pub(crate) fn parents_of(&self, hash: &BlockHash) -> &[BlockHash] {
        self.parents.get(hash).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Everything reachable downward from `roots`, roots included
    pub(crate) fn closure_below<I>(&self, roots: I) -> HashSet<BlockHash>
    where
        I: IntoIterator<Item = BlockHash>,
    {
        let mut reached = HashSet::new();
        let mut stack: Vec<_> = roots.into_iter().collect();
        while let Some(hash) = stack.pop() {
            if self.vertices.contains_key(&hash) && reached.insert(hash) {
                stack.extend_from_slice(self.parents_of(&hash));
            }
        }
        reached
    }

    /// Sort hashes by ascending height, then hash
    pub(crate) fn sort_by_height(&self, hashes: &mut [BlockHash]) {
        hashes.sort_unstable_by_key(|hash| (self.header(hash).map(|h| h.height).unwrap_or(0), *hash));
    }

    /// Remove a vertex and every edge touching it
    pub(crate) fn remove_vertex(&mut self, hash: &BlockHash) -> Option<PendingVertex> {
        let vertex = self.vertices.remove(hash)?;

        for parent in self.parents.remove(hash).unwrap_or_default() {
            if let Some(children) = self.children.get_mut(&parent) {
                children.remove(hash);
            }
        }
        for child in self.children.remove(hash).unwrap_or_default() {
            if let Some(parents) = self.parents.get_mut(&child) {
                parents.retain(|parent| parent != hash);
            }
        }

        Some(vertex)
    }
}
