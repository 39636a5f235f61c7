//! Blocks and block headers

use alloy_primitives::{B256, keccak256};
use serde::{Deserialize, Serialize};

use crate::{BlockHash, GroupId, Transaction};

/// Header of a block produced by one witness group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    /// Blocks this one extends (one or more)
    pub parent_hashes: Vec<BlockHash>,
    /// Height above genesis
    pub height: u64,
    /// Witness group that produced the block
    pub group_id: GroupId,
    /// Unix timestamp in milliseconds
    pub timestamp: u64,
    /// Commitment to the block's transactions
    pub tx_root: B256,
}

impl BlockHeader {
    /// Compute the block hash
    pub fn hash(&self) -> BlockHash {
        let mut data = Vec::with_capacity(64 + self.parent_hashes.len() * 32);
        data.extend_from_slice(b"TESSERA_BLOCK:");
        data.extend_from_slice(&(self.parent_hashes.len() as u32).to_be_bytes());
        for parent in &self.parent_hashes {
            data.extend_from_slice(parent.as_slice());
        }
        data.extend_from_slice(&self.height.to_be_bytes());
        data.extend_from_slice(&self.group_id.to_be_bytes());
        data.extend_from_slice(&self.timestamp.to_be_bytes());
        data.extend_from_slice(self.tx_root.as_slice());

        keccak256(&data)
    }
}

/// A block: header plus transactions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Block header
    pub header: BlockHeader,
    /// Transactions in execution order
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Build a block, computing the transaction root
    pub fn new(
        parent_hashes: Vec<BlockHash>,
        height: u64,
        group_id: GroupId,
        timestamp: u64,
        transactions: Vec<Transaction>,
    ) -> Self {
        let tx_root = Self::compute_tx_root(&transactions);
        Self {
            header: BlockHeader { parent_hashes, height, group_id, timestamp, tx_root },
            transactions,
        }
    }

    /// Block hash (the header hash)
    pub fn hash(&self) -> BlockHash {
        self.header.hash()
    }

    /// Compute the commitment over the ordered transaction hashes
    pub fn compute_tx_root(transactions: &[Transaction]) -> B256 {
        if transactions.is_empty() {
            return B256::ZERO;
        }

        let mut data = Vec::with_capacity(transactions.len() * 32);
        for tx in transactions {
            data.extend_from_slice(tx.hash().as_slice());
        }
        keccak256(&data)
    }

    /// Check the header commits to the carried transactions
    pub fn tx_root_matches(&self) -> bool {
        self.header.tx_root == Self::compute_tx_root(&self.transactions)
    }
}
