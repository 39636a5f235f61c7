//! Durable state collaborator

use alloy_primitives::Address;
use std::collections::HashMap;
use tessera_patch::{CoinSet, ContractState, StatePatch};
use tessera_primitives::{Coin, OutPoint, Transaction, TxHash};
use tracing::debug;

use crate::NodeError;

/// Storage that final patches are promoted into
pub trait CoinStore {
    /// Unspent outputs of `tx_hash`, if any are left
    fn coin_set(&self, tx_hash: &TxHash) -> Option<CoinSet>;

    /// Apply a final patch. Coin sets in the patch replace the stored ones,
    /// but never bring back an output the stored set already lost; empty sets
    /// are deleted.
    fn apply(&mut self, patch: &StatePatch) -> Result<(), NodeError>;
}

/// In-memory [`CoinStore`]
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    coins: HashMap<TxHash, CoinSet>,
    contracts: HashMap<Address, ContractState>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Store seeded with the outputs of genesis transactions
    pub fn with_genesis<I>(transactions: I) -> Self
    where
        I: IntoIterator<Item = Transaction>,
    {
        let mut store = Self::new();
        for tx in transactions {
            let set = CoinSet::from_transaction(&tx);
            store.coins.insert(set.tx_hash, set);
        }
        store
    }

    /// An unspent output
    pub fn unspent(&self, outpoint: &OutPoint) -> Option<Coin> {
        self.coins.get(&outpoint.tx_hash).and_then(|set| set.get(outpoint.index)).copied()
    }

    /// Stored contract state
    pub fn contract(&self, address: &Address) -> Option<&ContractState> {
        self.contracts.get(address)
    }

    /// Number of transactions with unspent outputs
    pub fn len(&self) -> usize {
        self.coins.len()
    }

    /// Whether nothing is stored
    pub fn is_empty(&self) -> bool {
        self.coins.is_empty() && self.contracts.is_empty()
    }
}

impl CoinStore for MemoryStore {
    fn coin_set(&self, tx_hash: &TxHash) -> Option<CoinSet> {
        self.coins.get(tx_hash).cloned()
    }

    fn apply(&mut self, patch: &StatePatch) -> Result<(), NodeError> {
        for set in patch.coins() {
            let applied = match self.coins.get(&set.tx_hash) {
                Some(stored) => {
                    let mut kept = CoinSet::new(set.tx_hash);
                    for (outpoint, coin) in set.outputs() {
                        if stored.get(outpoint.index).is_some() {
                            kept.add(outpoint.index, *coin);
                        }
                    }
                    kept
                }
                None => set.clone(),
            };
            if applied.is_empty() {
                self.coins.remove(&set.tx_hash);
            } else {
                self.coins.insert(set.tx_hash, applied);
            }
        }
        for (address, state) in patch.contracts() {
            self.contracts.insert(*address, state.clone());
        }

        debug!(
            target: "tessera::node",
            coin_sets = self.coins.len(),
            contracts = self.contracts.len(),
            "Applied final patch"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_replaces_and_deletes() {
        let genesis = Transaction::new(
            vec![],
            vec![Coin::new(10, Address::repeat_byte(1)), Coin::new(20, Address::repeat_byte(2))],
        );
        let mut store = MemoryStore::with_genesis([genesis.clone()]);
        let spend = |index| OutPoint::new(genesis.hash(), index);

        let mut patch = StatePatch::new();
        patch.spend_coin(spend(0), TxHash::repeat_byte(9), |hash| store.coin_set(hash)).unwrap();
        store.apply(&patch).unwrap();
        assert_eq!(store.unspent(&spend(0)), None);
        assert_eq!(store.unspent(&spend(1)).map(|c| c.amount), Some(20));

        let mut patch = StatePatch::new();
        patch.spend_coin(spend(1), TxHash::repeat_byte(9), |hash| store.coin_set(hash)).unwrap();
        patch.set_contract(Address::ZERO, ContractState::new(0, vec![1], vec![2]));
        store.apply(&patch).unwrap();
        assert_eq!(store.len(), 0);
        assert!(store.contract(&Address::ZERO).is_some());
    }

    #[test]
    fn test_apply_never_restores_spent_output() {
        let genesis = Transaction::new(
            vec![],
            vec![Coin::new(10, Address::repeat_byte(1)), Coin::new(20, Address::repeat_byte(2))],
        );
        let mut store = MemoryStore::with_genesis([genesis.clone()]);
        let spend = |index| OutPoint::new(genesis.hash(), index);

        // copy taken before output 0 was spent elsewhere
        let mut stale = StatePatch::new();
        stale.spend_coin(spend(1), TxHash::repeat_byte(8), |hash| store.coin_set(hash)).unwrap();

        let mut first = StatePatch::new();
        first.spend_coin(spend(0), TxHash::repeat_byte(9), |hash| store.coin_set(hash)).unwrap();
        store.apply(&first).unwrap();

        store.apply(&stale).unwrap();
        assert_eq!(store.unspent(&spend(0)), None);
        assert_eq!(store.unspent(&spend(1)), None);
        assert_eq!(store.len(), 0);
    }
}
