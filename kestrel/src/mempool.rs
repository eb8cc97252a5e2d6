// Copyright (c) 2025 Kestrel Foundation

//! The transaction pool: accepted, not-yet-externalized transactions.
//!
//! Insertion order is preserved so nomination stays fair; a spent-key
//! reservation set rejects double-spends inside the pool, and an
//! ever-accepted set suppresses gossip re-relay.

use crate::{
    crypto::Hash,
    error::{Error, Result},
    transaction::{Transaction, UtxoKey},
};
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::debug;

#[derive(Default)]
pub struct TxPool {
    /// Hashes in arrival order.
    order: VecDeque<Hash>,
    /// The transactions themselves.
    txs: HashMap<Hash, Transaction>,
    /// UTXO keys consumed by pooled transactions.
    spent: HashSet<UtxoKey>,
    /// Everything ever admitted, for gossip suppression.
    ever_accepted: HashSet<Hash>,
}

impl TxPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.txs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.txs.is_empty()
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.txs.contains_key(hash)
    }

    /// Has this hash ever been admitted (even if since externalized)?
    pub fn was_accepted(&self, hash: &Hash) -> bool {
        self.ever_accepted.contains(hash)
    }

    pub fn get(&self, hash: &Hash) -> Option<&Transaction> {
        self.txs.get(hash)
    }

    /// Admit a transaction. The caller has already validated it against
    /// the UTXO set; the pool only guards against duplicates and
    /// intra-pool double-spends.
    pub fn add(&mut self, tx: Transaction) -> Result<Hash> {
        let hash = tx.hash();
        if self.txs.contains_key(&hash) {
            return Err(Error::InvalidTransaction(
                "already in the pool".to_string(),
            ));
        }
        for input in &tx.inputs {
            if self.spent.contains(&input.utxo_key()) {
                return Err(Error::InvalidTransaction(format!(
                    "input {} already spent by a pooled transaction",
                    input.utxo_key()
                )));
            }
        }
        for input in &tx.inputs {
            self.spent.insert(input.utxo_key());
        }
        self.order.push_back(hash);
        self.txs.insert(hash, tx);
        self.ever_accepted.insert(hash);
        debug!(tx = %hash, pooled = self.txs.len(), "transaction admitted");
        Ok(hash)
    }

    /// Remove one transaction (on externalization), releasing its
    /// input reservations.
    pub fn remove(&mut self, hash: &Hash) -> Option<Transaction> {
        let tx = self.txs.remove(hash)?;
        for input in &tx.inputs {
            self.spent.remove(&input.utxo_key());
        }
        self.order.retain(|h| h != hash);
        Some(tx)
    }

    /// Up to `limit` transactions in insertion order; zero means all.
    pub fn candidates(&self, limit: usize) -> Vec<Transaction> {
        let take = if limit == 0 { self.order.len() } else { limit };
        self.order
            .iter()
            .filter_map(|h| self.txs.get(h))
            .take(take)
            .cloned()
            .collect()
    }

    /// Hashes of the candidate set, in insertion order.
    pub fn candidate_hashes(&self, limit: usize) -> Vec<Hash> {
        let take = if limit == 0 { self.order.len() } else { limit };
        self.order.iter().take(take).copied().collect()
    }

    /// The pooled transactions in insertion order, for persistence.
    pub fn snapshot(&self) -> Vec<Transaction> {
        self.order
            .iter()
            .filter_map(|h| self.txs.get(h))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        crypto::KeyPair,
        transaction::{Input, Lock, Output, TxType, Unlock},
    };

    fn tx_spending(prev: &[u8], index: u32, amount: u64) -> Transaction {
        let kp = KeyPair::from_seed(b"recipient");
        Transaction::new(
            TxType::Payment,
            vec![Input::new(Hash::digest(prev), index, Unlock::default())],
            vec![Output::new(amount, Lock::Key(kp.public()))],
        )
    }

    #[test]
    fn insertion_order_preserved() {
        let mut pool = TxPool::new();
        let a = pool.add(tx_spending(b"a", 0, 1)).unwrap();
        let b = pool.add(tx_spending(b"b", 0, 2)).unwrap();
        let c = pool.add(tx_spending(b"c", 0, 3)).unwrap();

        assert_eq!(pool.candidate_hashes(0), vec![a, b, c]);
        assert_eq!(pool.candidate_hashes(2), vec![a, b]);
        assert_eq!(pool.candidates(0).len(), 3);
    }

    #[test]
    fn duplicate_rejected() {
        let mut pool = TxPool::new();
        pool.add(tx_spending(b"a", 0, 1)).unwrap();
        assert!(pool.add(tx_spending(b"a", 0, 1)).is_err());
    }

    #[test]
    fn pool_double_spend_rejected() {
        let mut pool = TxPool::new();
        pool.add(tx_spending(b"a", 0, 1)).unwrap();
        // Same input, different output amount: same UTXO spent twice.
        assert!(pool.add(tx_spending(b"a", 0, 2)).is_err());
        // A different output index of the same tx is fine.
        assert!(pool.add(tx_spending(b"a", 1, 2)).is_ok());
    }

    #[test]
    fn remove_releases_reservation() {
        let mut pool = TxPool::new();
        let hash = pool.add(tx_spending(b"a", 0, 1)).unwrap();
        pool.remove(&hash);
        assert!(pool.is_empty());
        // The input can be spent by a new transaction now.
        assert!(pool.add(tx_spending(b"a", 0, 2)).is_ok());
    }

    #[test]
    fn ever_accepted_survives_removal() {
        let mut pool = TxPool::new();
        let hash = pool.add(tx_spending(b"a", 0, 1)).unwrap();
        pool.remove(&hash);
        assert!(!pool.contains(&hash));
        assert!(pool.was_accepted(&hash));
    }
}
