// Copyright (c) 2025 Kestrel Foundation

//! UTXO set queries.
//!
//! Mutation only ever happens inside `apply_block`'s write transaction;
//! these are the read-side operations validation runs against.

use super::Ledger;
use crate::{
    error::{Error, Result},
    transaction::{Utxo, UtxoKey},
};

impl Ledger {
    /// Look up an unspent output without any spendability checks.
    pub fn peek_utxo(&self, key: &UtxoKey) -> Result<Option<Utxo>> {
        self.read_utxo(key)
    }

    /// Look up an output that must be spendable at `height`.
    pub fn find_spendable(&self, key: &UtxoKey, height: u64) -> Result<Utxo> {
        let utxo = self
            .read_utxo(key)?
            .ok_or_else(|| Error::InvalidTransaction(format!("utxo {key} not found")))?;
        if !utxo.spendable_at(height) {
            return Err(Error::InvalidTransaction(format!(
                "utxo {key} locked until height {} (at {height})",
                utxo.unlock_height
            )));
        }
        Ok(utxo)
    }

    pub fn contains_utxo(&self, key: &UtxoKey) -> Result<bool> {
        Ok(self.read_utxo(key)?.is_some())
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        block::Block,
        crypto::{Hash, KeyPair},
        genesis,
        ledger::Ledger,
        transaction::{compute_utxo_key, Input, Lock, Output, Transaction, TxType, Unlock},
    };
    use tempfile::tempdir;

    fn test_ledger() -> (tempfile::TempDir, Ledger, Vec<KeyPair>, Block) {
        let dir = tempdir().unwrap();
        let keys: Vec<KeyPair> = (0..3u8)
            .map(|i| KeyPair::from_seed(&[i + 1]))
            .collect();
        let genesis = genesis::test_genesis(&keys, 50_000, 20, &keys[0], 1_000_000, 8);
        let ledger = Ledger::open(dir.path(), &genesis).unwrap();
        (dir, ledger, keys, genesis)
    }

    #[test]
    fn genesis_outputs_are_present() {
        let (_dir, ledger, _keys, genesis) = test_ledger();
        let state = ledger.chain_state().unwrap();
        assert_eq!(state.height, 0);
        assert_eq!(state.tip_hash, genesis.hash());

        // Every genesis output exists as a UTXO.
        for tx in &genesis.txs {
            let tx_hash = tx.hash();
            for index in 0..tx.outputs.len() {
                let key = compute_utxo_key(&tx_hash, index as u32);
                assert!(ledger.contains_utxo(&key).unwrap());
            }
        }
    }

    #[test]
    fn frozen_stake_is_not_spendable() {
        let (_dir, ledger, _keys, genesis) = test_ledger();
        // The first enrollment's stake is locked for 2 * cycle blocks.
        let stake_key = genesis.header.enrollments[0].utxo_key;
        let utxo = ledger.peek_utxo(&stake_key).unwrap().unwrap();
        assert_eq!(utxo.unlock_height, 40);
        assert!(ledger.find_spendable(&stake_key, 1).is_err());
        assert!(ledger.find_spendable(&stake_key, 40).is_ok());
    }

    #[test]
    fn apply_block_spends_and_creates() {
        let (_dir, ledger, keys, genesis) = test_ledger();

        // Spend the first payment output of genesis.
        let payment_tx = genesis
            .txs
            .iter()
            .find(|tx| tx.tx_type == TxType::Payment)
            .unwrap();
        let spent_key = compute_utxo_key(&payment_tx.hash(), 0);
        let amount = payment_tx.outputs[0].amount;

        let mut tx = Transaction::new(
            TxType::Payment,
            vec![Input::new(payment_tx.hash(), 0, Unlock::default())],
            vec![Output::new(amount - 1_000, Lock::Key(keys[1].public()))],
        );
        let sig = keys[0].sign(tx.signing_hash().as_ref());
        tx.inputs[0].unlock = crate::script::key_unlock(&sig);

        let block = Block::build(&genesis.hash(), 1, 1000, vec![tx.clone()], vec![], vec![], 3);
        ledger.apply_block(&block, &[]).unwrap();

        assert!(!ledger.contains_utxo(&spent_key).unwrap());
        let new_key = compute_utxo_key(&tx.hash(), 0);
        assert!(ledger.contains_utxo(&new_key).unwrap());

        let state = ledger.chain_state().unwrap();
        assert_eq!(state.height, 1);
        assert_eq!(state.fee_pool, 1_000);
    }

    #[test]
    fn apply_block_is_atomic() {
        let (_dir, ledger, keys, genesis) = test_ledger();

        let payment_tx = genesis
            .txs
            .iter()
            .find(|tx| tx.tx_type == TxType::Payment)
            .unwrap();

        let good = Transaction::new(
            TxType::Payment,
            vec![Input::new(payment_tx.hash(), 0, Unlock::default())],
            vec![Output::new(100, Lock::Key(keys[1].public()))],
        );
        // This one spends a UTXO that does not exist.
        let bad = Transaction::new(
            TxType::Payment,
            vec![Input::new(Hash::digest(b"nonexistent"), 0, Unlock::default())],
            vec![Output::new(100, Lock::Key(keys[1].public()))],
        );

        let block = Block::build(&genesis.hash(), 1, 1000, vec![good.clone(), bad], vec![], vec![], 3);
        assert!(ledger.apply_block(&block, &[]).is_err());

        // Nothing moved: the good tx's input is still unspent, its
        // output never created, the tip unchanged.
        let state = ledger.chain_state().unwrap();
        assert_eq!(state.height, 0);
        assert!(ledger
            .contains_utxo(&compute_utxo_key(&payment_tx.hash(), 0))
            .unwrap());
        assert!(!ledger.contains_utxo(&compute_utxo_key(&good.hash(), 0)).unwrap());
    }

    #[test]
    fn intra_block_double_spend_rejected() {
        let (_dir, ledger, keys, genesis) = test_ledger();
        let payment_tx = genesis
            .txs
            .iter()
            .find(|tx| tx.tx_type == TxType::Payment)
            .unwrap();

        let spend_a = Transaction::new(
            TxType::Payment,
            vec![Input::new(payment_tx.hash(), 0, Unlock::default())],
            vec![Output::new(100, Lock::Key(keys[1].public()))],
        );
        let spend_b = Transaction::new(
            TxType::Payment,
            vec![Input::new(payment_tx.hash(), 0, Unlock::default())],
            vec![Output::new(200, Lock::Key(keys[2].public()))],
        );

        let block = Block::build(&genesis.hash(), 1, 1000, vec![spend_a, spend_b], vec![], vec![], 3);
        let err = ledger.apply_block(&block, &[]).unwrap_err();
        assert!(err.to_string().contains("spent twice"));
    }

    #[test]
    fn penalties_deduct_stake() {
        let (_dir, ledger, _keys, genesis) = test_ledger();
        let stake_key = genesis.header.enrollments[0].utxo_key;
        let before = ledger.peek_utxo(&stake_key).unwrap().unwrap().output.amount;

        let block = Block::build(&genesis.hash(), 1, 1000, vec![], vec![], vec![], 3);
        ledger.apply_block(&block, &[(stake_key, 10_000)]).unwrap();

        let after = ledger.peek_utxo(&stake_key).unwrap().unwrap().output.amount;
        assert_eq!(after, before - 10_000);
    }

    #[test]
    fn range_query_stops_at_tip() {
        let (_dir, ledger, _keys, genesis) = test_ledger();
        let mut prev = genesis.hash();
        for height in 1..=4u64 {
            let block = Block::build(&prev, height, 1000 + height, vec![], vec![], vec![], 3);
            ledger.apply_block(&block, &[]).unwrap();
            prev = block.hash();
        }
        let blocks = ledger.get_blocks_from(2, 100).unwrap();
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[0].height(), 2);
        assert_eq!(blocks[2].height(), 4);
    }
}
