// Copyright (c) 2025 Kestrel Foundation

//! Genesis construction.
//!
//! Genesis is an explicit parameter of every ledger: nodes are handed
//! the same genesis block (or the inputs to rebuild it) at startup, and
//! tests parameterise it directly. There is no process-wide default.

use crate::{
    block::Block,
    crypto::{Hash, KeyPair},
    enrollment::{Enrollment, PreImageChain},
    transaction::{compute_utxo_key, Lock, Output, Transaction, TxType, UtxoKey},
};

const DOMAIN_GENESIS_SEED: &[u8] = b"kestrel.genesis.preimage.v1";

/// The pre-image seed a genesis validator derives from its signing key,
/// so every restart rebuilds the same chain.
pub fn genesis_seed(key_pair: &KeyPair) -> Hash {
    Hash::digest_with_domain(DOMAIN_GENESIS_SEED, &key_pair.secret_bytes())
}

/// Build a genesis block: one freeze output and enrollment per
/// validator, plus the given spendable payment outputs.
///
/// Deterministic in its inputs; every node handed the same validators
/// and payments derives a byte-identical block.
pub fn build_genesis(
    validators: &[KeyPair],
    stake_amount: u64,
    cycle_length: u32,
    payments: Vec<Output>,
    timestamp: u64,
) -> Block {
    let freeze_tx = Transaction::new(
        TxType::Freeze,
        vec![],
        validators
            .iter()
            .map(|kp| Output::new(stake_amount, Lock::Key(kp.public())))
            .collect(),
    );
    let freeze_hash = freeze_tx.hash();

    let mut enrollments: Vec<Enrollment> = validators
        .iter()
        .enumerate()
        .map(|(index, kp)| {
            let stake_key = compute_utxo_key(&freeze_hash, index as u32);
            let chain = PreImageChain::generate(genesis_seed(kp), cycle_length);
            Enrollment::sign(kp, stake_key, chain.commitment(), cycle_length)
        })
        .collect();
    enrollments.sort_by_key(|e| e.utxo_key);

    let mut txs = vec![freeze_tx];
    if !payments.is_empty() {
        txs.push(Transaction::new(TxType::Payment, vec![], payments));
    }

    Block::build(
        &Hash::ZERO,
        0,
        timestamp,
        txs,
        enrollments,
        vec![],
        validators.len(),
    )
}

/// Recover this node's genesis stake key and pre-image chain from the
/// genesis block, by matching the deterministic commitment.
pub fn own_genesis_stake(
    genesis: &Block,
    key_pair: &KeyPair,
    cycle_length: u32,
) -> Option<(UtxoKey, PreImageChain)> {
    let chain = PreImageChain::generate(genesis_seed(key_pair), cycle_length);
    let commitment = chain.commitment();
    genesis
        .header
        .enrollments
        .iter()
        .find(|e| e.commitment == commitment)
        .map(|e| (e.utxo_key, chain))
}

/// Genesis used across the test suites: `payment_count` equal payment
/// outputs owned by `payment_owner` next to the validator stakes.
pub fn test_genesis(
    validators: &[KeyPair],
    stake_amount: u64,
    cycle_length: u32,
    payment_owner: &KeyPair,
    payment_amount: u64,
    payment_count: usize,
) -> Block {
    let payments = (0..payment_count)
        .map(|_| Output::new(payment_amount, Lock::Key(payment_owner.public())))
        .collect();
    build_genesis(validators, stake_amount, cycle_length, payments, 1_700_000_000)
}
