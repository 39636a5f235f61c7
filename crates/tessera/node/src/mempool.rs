//! Pending transactions

use std::collections::{HashMap, VecDeque};
use tessera_primitives::{Transaction, TxHash};

/// FIFO of transactions waiting for a block, deduplicated by hash
#[derive(Debug, Default)]
pub struct Mempool {
    order: VecDeque<TxHash>,
    transactions: HashMap<TxHash, Transaction>,
}

impl Mempool {
    /// Create an empty mempool
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a transaction; false if it is already queued
    pub fn push(&mut self, tx: Transaction) -> bool {
        let hash = tx.hash();
        if self.transactions.contains_key(&hash) {
            return false;
        }
        self.order.push_back(hash);
        self.transactions.insert(hash, tx);
        true
    }

    /// Take up to `max` transactions, oldest first
    pub fn take(&mut self, max: usize) -> Vec<Transaction> {
        let mut taken = Vec::with_capacity(max.min(self.order.len()));
        while taken.len() < max {
            let Some(hash) = self.order.pop_front() else { break };
            if let Some(tx) = self.transactions.remove(&hash) {
                taken.push(tx);
            }
        }
        taken
    }

    /// Put transactions of rolled-back blocks back at the front, keeping their order
    pub fn return_transactions<I>(&mut self, transactions: I)
    where
        I: IntoIterator<Item = Transaction>,
    {
        let mut returned = Vec::new();
        for tx in transactions {
            let hash = tx.hash();
            if self.transactions.insert(hash, tx).is_none() {
                returned.push(hash);
            }
        }
        for hash in returned.into_iter().rev() {
            self.order.push_front(hash);
        }
    }

    /// Drop transactions that were included elsewhere
    pub fn remove<'a, I>(&mut self, hashes: I)
    where
        I: IntoIterator<Item = &'a TxHash>,
    {
        for hash in hashes {
            self.transactions.remove(hash);
        }
        self.order.retain(|hash| self.transactions.contains_key(hash));
    }

    /// Whether a transaction is queued
    pub fn contains(&self, hash: &TxHash) -> bool {
        self.transactions.contains_key(hash)
    }

    /// Number of queued transactions
    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    /// Whether nothing is queued
    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }
}
