//! The mergeable state delta

use alloy_primitives::Address;
use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use std::collections::{BTreeMap, btree_map::Entry};
use tessera_primitives::{Coin, GroupId, OutPoint, TxHash};
use tracing::{trace, warn};

use crate::{CoinSet, ContractState, PatchError};

/// Speculative UTXO and contract state on top of durable storage.
///
/// Invariants:
/// - a coin set present here is owned by this patch and supersedes storage
/// - `spent` only records spends made through this patch (or merged into it)
/// - group levels never decrease
#[serde_as]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatePatch {
    /// Owned coin sets, keyed by creating transaction
    coins: BTreeMap<TxHash, CoinSet>,
    /// Spent output -> spending transaction. Only used for conflict detection.
    #[serde_as(as = "Vec<(_, _)>")]
    spent: BTreeMap<OutPoint, TxHash>,
    /// Per witness-group level, used to order contract state
    levels: BTreeMap<GroupId, u64>,
    /// Contract address -> state
    contracts: BTreeMap<Address, ContractState>,
}

impl StatePatch {
    /// Create an empty patch
    pub fn new() -> Self {
        Self::default()
    }

    /// Spend `outpoint` on behalf of `spending_tx`.
    ///
    /// When the patch does not own the coin set yet, `resolve` is asked for it
    /// (parent patch, then storage) and the result is cloned into the patch.
    pub fn spend_coin<F>(
        &mut self,
        outpoint: OutPoint,
        spending_tx: TxHash,
        resolve: F,
    ) -> Result<(), PatchError>
    where
        F: FnOnce(&TxHash) -> Option<CoinSet>,
    {
        let owned = match self.coins.entry(outpoint.tx_hash) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let source =
                    resolve(&outpoint.tx_hash).ok_or(PatchError::UnknownCoinSet(outpoint.tx_hash))?;
                if source.get(outpoint.index).is_none() {
                    return Err(PatchError::CoinNotFound(outpoint));
                }
                entry.insert(source)
            }
        };

        owned.remove(outpoint.index).ok_or(PatchError::CoinNotFound(outpoint))?;
        self.spent.insert(outpoint, spending_tx);
        Ok(())
    }

    /// Add a new output created by `tx_hash`
    pub fn create_coin(&mut self, tx_hash: TxHash, index: u32, coin: Coin) {
        self.coins.entry(tx_hash).or_insert_with(|| CoinSet::new(tx_hash)).add(index, coin);
    }

    /// Set the state of a contract
    pub fn set_contract(&mut self, address: Address, state: ContractState) {
        self.contracts.insert(address, state);
    }

    /// Raise the level of `group_id` by one, returning the new level.
    ///
    /// Called once per block built by that group, so later state on the same
    /// group's branch outranks the state it superseded.
    pub fn bump_level(&mut self, group_id: GroupId) -> u64 {
        let level = self.levels.entry(group_id).or_default();
        *level += 1;
        *level
    }

    /// Current level of a group (zero if never bumped)
    pub fn level(&self, group_id: GroupId) -> u64 {
        self.levels.get(&group_id).copied().unwrap_or(0)
    }

    /// Owned coin set for a transaction
    pub fn coin_set(&self, tx_hash: &TxHash) -> Option<&CoinSet> {
        self.coins.get(tx_hash)
    }

    /// All owned coin sets
    pub fn coins(&self) -> impl Iterator<Item = &CoinSet> {
        self.coins.values()
    }

    /// Transaction recorded as spending `outpoint`
    pub fn spent_by(&self, outpoint: &OutPoint) -> Option<TxHash> {
        self.spent.get(outpoint).copied()
    }

    /// Contract state at `address`
    pub fn contract(&self, address: &Address) -> Option<&ContractState> {
        self.contracts.get(address)
    }

    /// All contract states
    pub fn contracts(&self) -> impl Iterator<Item = (&Address, &ContractState)> {
        self.contracts.iter()
    }

    /// Number of spent-output records; cheap proxy for how much work the patch carries
    pub fn complexity(&self) -> usize {
        self.spent.len()
    }

    /// Whether the patch carries no coin, spend or contract entries (levels aside)
    pub fn is_empty(&self) -> bool {
        self.coins.is_empty() && self.spent.is_empty() && self.contracts.is_empty()
    }

    /// Produce a new patch with the effects of both `self` and `other`.
    ///
    /// Fails only when both sides spent the same output with different
    /// transactions.
    pub fn merge(&self, other: &Self) -> Result<Self, PatchError> {
        let mut spent = self.spent.clone();
        for (outpoint, spender) in &other.spent {
            match spent.entry(*outpoint) {
                Entry::Occupied(entry) if entry.get() != spender => {
                    return Err(PatchError::DoubleSpend {
                        outpoint: *outpoint,
                        first: *entry.get(),
                        second: *spender,
                    });
                }
                Entry::Occupied(_) => {}
                Entry::Vacant(entry) => {
                    entry.insert(*spender);
                }
            }
        }

        let mut coins = BTreeMap::new();
        for (tx_hash, set) in &self.coins {
            let merged = match other.coins.get(tx_hash) {
                Some(other_set) => set.intersect(other_set),
                None => set.clone(),
            };
            coins.insert(*tx_hash, merged);
        }
        for (tx_hash, set) in &other.coins {
            coins.entry(*tx_hash).or_insert_with(|| set.clone());
        }

        let mut levels = self.levels.clone();
        for (group_id, level) in &other.levels {
            let entry = levels.entry(*group_id).or_default();
            *entry = (*entry).max(*level);
        }

        let mut contracts = BTreeMap::new();
        for (address, state) in &self.contracts {
            let chosen = match other.contracts.get(address) {
                Some(other_state) => self.resolve_contract(address, state, other, other_state),
                None => state,
            };
            contracts.insert(*address, chosen.clone());
        }
        for (address, state) in &other.contracts {
            contracts.entry(*address).or_insert_with(|| state.clone());
        }

        trace!(
            target: "tessera::patch",
            coin_sets = coins.len(),
            spent = spent.len(),
            contracts = contracts.len(),
            "Merged patches"
        );

        Ok(Self { coins, spent, levels, contracts })
    }

    /// Pick between two states of the same contract: the higher group level wins.
    ///
    /// Equal levels with different contents are not expected and have no
    /// principled answer; the larger content hash is taken so the result does
    /// not depend on merge order, and the tie is reported.
    fn resolve_contract<'a>(
        &self,
        address: &Address,
        ours: &'a ContractState,
        other: &Self,
        theirs: &'a ContractState,
    ) -> &'a ContractState {
        if ours == theirs {
            return ours;
        }

        let our_level = self.level(ours.group_id);
        let their_level = other.level(theirs.group_id);
        match our_level.cmp(&their_level) {
            std::cmp::Ordering::Greater => ours,
            std::cmp::Ordering::Less => theirs,
            std::cmp::Ordering::Equal => {
                warn!(
                    target: "tessera::patch",
                    %address,
                    level = our_level,
                    "Unresolved contract state tie, picking by content hash"
                );
                if ours.content_hash() >= theirs.content_hash() { ours } else { theirs }
            }
        }
    }

    /// Drop every entry that is identical in `applied`.
    ///
    /// Used once `applied` reached durable storage so long-lived patches only
    /// keep what storage does not already reflect. Coin sets that diverge from
    /// `applied` lose every output `applied` spent, so a sibling branch cannot
    /// hand a final spend back out. Levels are kept.
    pub fn purge(&mut self, applied: &Self) {
        for (tx_hash, set) in &mut self.coins {
            if let Some(final_set) = applied.coins.get(tx_hash) {
                *set = set.intersect(final_set);
            }
        }
        for outpoint in applied.spent.keys() {
            if let Some(set) = self.coins.get_mut(&outpoint.tx_hash) {
                set.remove(outpoint.index);
            }
        }

        self.coins.retain(|tx_hash, set| applied.coins.get(tx_hash) != Some(set));
        self.spent.retain(|outpoint, spender| applied.spent.get(outpoint) != Some(spender));
        self.contracts.retain(|address, state| applied.contracts.get(address) != Some(state));
    }
}
