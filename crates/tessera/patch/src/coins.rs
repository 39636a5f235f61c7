//! Unspent outputs of one transaction

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tessera_primitives::{Coin, OutPoint, Transaction, TxHash};

/// The still-unspent outputs of one transaction.
///
/// An empty set means every output was spent; storage deletes it on apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoinSet {
    /// Transaction that created the outputs
    pub tx_hash: TxHash,
    outputs: BTreeMap<u32, Coin>,
}

impl CoinSet {
    /// Create an empty coin set
    pub const fn new(tx_hash: TxHash) -> Self {
        Self { tx_hash, outputs: BTreeMap::new() }
    }

    /// All outputs created by `tx`
    pub fn from_transaction(tx: &Transaction) -> Self {
        let mut set = Self::new(tx.hash());
        for (index, coin) in tx.indexed_outputs() {
            set.add(index, *coin);
        }
        set
    }

    /// Add an output
    pub fn add(&mut self, index: u32, coin: Coin) {
        self.outputs.insert(index, coin);
    }

    /// Get an unspent output
    pub fn get(&self, index: u32) -> Option<&Coin> {
        self.outputs.get(&index)
    }

    /// Remove an output, returning it if it was unspent
    pub fn remove(&mut self, index: u32) -> Option<Coin> {
        self.outputs.remove(&index)
    }

    /// Iterate over unspent outputs
    pub fn outputs(&self) -> impl Iterator<Item = (OutPoint, &Coin)> {
        self.outputs.iter().map(|(index, coin)| (OutPoint::new(self.tx_hash, *index), coin))
    }

    /// Number of unspent outputs
    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    /// Whether every output is spent
    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }

    /// Outputs both sets still regard as unspent
    pub(crate) fn intersect(&self, other: &Self) -> Self {
        let outputs = self
            .outputs
            .iter()
            .filter(|(index, coin)| other.outputs.get(index) == Some(coin))
            .map(|(index, coin)| (*index, *coin))
            .collect();
        Self { tx_hash: self.tx_hash, outputs }
    }
}
