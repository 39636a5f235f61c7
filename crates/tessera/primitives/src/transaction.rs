//! UTXO transactions

use alloy_primitives::{Address, keccak256};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::TxHash;

/// Reference to one output of a previous transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OutPoint {
    /// Transaction that created the output
    pub tx_hash: TxHash,
    /// Output index within that transaction
    pub index: u32,
}

impl OutPoint {
    /// Create a new outpoint
    pub const fn new(tx_hash: TxHash, index: u32) -> Self {
        Self { tx_hash, index }
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.tx_hash, self.index)
    }
}

/// A spendable output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Coin {
    /// Amount in base units
    pub amount: u64,
    /// Receiver address
    pub receiver: Address,
}

impl Coin {
    /// Create a new coin
    pub const fn new(amount: u64, receiver: Address) -> Self {
        Self { amount, receiver }
    }
}

/// A transaction spending existing outputs and creating new ones.
///
/// A transaction without inputs only mints; the node layer decides whether that is allowed.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Transaction {
    /// Outputs being spent
    pub inputs: Vec<OutPoint>,
    /// Outputs being created, indexed by position
    pub outputs: Vec<Coin>,
}

impl Transaction {
    /// Create a new transaction
    pub fn new(inputs: Vec<OutPoint>, outputs: Vec<Coin>) -> Self {
        Self { inputs, outputs }
    }

    /// Compute the transaction hash
    pub fn hash(&self) -> TxHash {
        let mut data = Vec::with_capacity(16 + self.inputs.len() * 36 + self.outputs.len() * 28);
        data.extend_from_slice(b"TESSERA_TX:");
        data.extend_from_slice(&(self.inputs.len() as u32).to_be_bytes());
        for input in &self.inputs {
            data.extend_from_slice(input.tx_hash.as_slice());
            data.extend_from_slice(&input.index.to_be_bytes());
        }
        data.extend_from_slice(&(self.outputs.len() as u32).to_be_bytes());
        for output in &self.outputs {
            data.extend_from_slice(&output.amount.to_be_bytes());
            data.extend_from_slice(output.receiver.as_slice());
        }

        keccak256(&data)
    }

    /// Iterate over `(index, coin)` for every created output
    pub fn indexed_outputs(&self) -> impl Iterator<Item = (u32, &Coin)> {
        self.outputs.iter().enumerate().map(|(i, coin)| (i as u32, coin))
    }
}
