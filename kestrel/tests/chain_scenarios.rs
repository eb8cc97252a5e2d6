// Copyright (c) 2025 Kestrel Foundation

//! Chain-level scenario tests: enrollment edge cases, externalisation
//! idempotence and the catchup verification path, all without spinning
//! up node threads.

use kestrel::{
    chain::Chain,
    consensus::ConsensusPayload,
    crypto::{Hash, KeyPair},
    enrollment::{Enrollment, PreImageChain},
    genesis,
    script,
    transaction::{Input, Lock, Output, Transaction, TxType, Unlock},
    Config, Error,
};
use tempfile::tempdir;

fn six_keys() -> Vec<KeyPair> {
    (0..6u8).map(|i| KeyPair::from_seed(&[i + 10])).collect()
}

fn open_chain(
    dir: &std::path::Path,
    key: &KeyPair,
    keys: &[KeyPair],
    config: Config,
) -> (Chain, kestrel::Block) {
    let genesis = genesis::test_genesis(keys, 50_000, config.validator_cycle, &keys[0], 500_000, 8);
    let chain = Chain::open(config, key.clone(), dir, &genesis).unwrap();
    (chain, genesis)
}

fn signed_payment(genesis: &kestrel::Block, owner: &KeyPair, index: u32, fee: u64) -> Transaction {
    let payment_tx = genesis
        .txs
        .iter()
        .find(|tx| tx.tx_type == TxType::Payment)
        .unwrap();
    let amount = payment_tx.outputs[index as usize].amount;
    let mut tx = Transaction::new(
        TxType::Payment,
        vec![Input::new(payment_tx.hash(), index, Unlock::default())],
        vec![Output::new(amount - fee, Lock::Key(owner.public()))],
    );
    let sig = owner.sign(tx.signing_hash().as_ref());
    tx.inputs[0].unlock = script::key_unlock(&sig);
    tx
}

/// Re-enrolling the height-0 commitment again must not validate: the
/// chain cannot accept a cycle whose reveals were already public.
#[test]
fn stale_commitment_reenrollment_is_rejected() {
    let keys = six_keys();
    let dir = tempdir().unwrap();
    let (mut chain, genesis) = open_chain(dir.path(), &keys[0], &keys, Config::test_config());

    // Rebuild the exact genesis chain and try to enroll it again.
    let stake_key = genesis
        .header
        .enrollments
        .iter()
        .find(|e| {
            let expected =
                PreImageChain::generate(genesis::genesis_seed(&keys[0]), 20).commitment();
            e.commitment == expected
        })
        .map(|e| e.utxo_key)
        .expect("validator 0 has a genesis enrollment");
    let stale_chain = PreImageChain::generate(genesis::genesis_seed(&keys[0]), 20);
    let stale = Enrollment::sign(&keys[0], stake_key, stale_chain.commitment(), 20);

    let err = chain.add_enrollment(stale.clone()).unwrap_err();
    assert!(matches!(err, Error::InvalidEnrollment(_)));
    assert!(err.to_string().contains("stale commitment"));

    // The same enrollment inside a candidate payload is equally dead,
    // so a block carrying it can never externalize.
    let payload = ConsensusPayload::new(vec![], vec![stale], vec![]);
    assert!(chain.validate_payload(20, &payload).is_err());
}

/// The per-block enrollment cap spreads a full cycle turnover across
/// consecutive blocks.
#[test]
fn enrollment_cap_spreads_over_consecutive_blocks() {
    let keys = six_keys();
    let dir = tempdir().unwrap();
    let mut config = Config::test_config();
    config.max_enrollments_per_block = 3;
    let (mut chain, _genesis) = open_chain(dir.path(), &keys[0], &keys, config);

    // All six validators renew at the cycle boundary (tip 19).
    for kp in &keys {
        let expected = PreImageChain::generate(genesis::genesis_seed(kp), 20).commitment();
        let stake_key = chain
            .manager
            .validators
            .enrolled_entries(1)
            .iter()
            .find(|(_, info)| info.commitment == expected)
            .map(|(key, _)| **key)
            .expect("genesis validator present");
        let fresh = PreImageChain::generate(Hash::digest(&kp.secret_bytes()), 20);
        let renewal = Enrollment::sign(kp, stake_key, fresh.commitment(), 20);
        let ledger = &chain.ledger;
        chain
            .manager
            .add_enrollment(19, renewal, |key| ledger.peek_utxo(key).ok().flatten())
            .unwrap();
    }
    assert_eq!(chain.manager.pool_len(), 6);

    // First block takes three, in strictly ascending key order.
    let first = chain.manager.unregistered_enrollments(3);
    assert_eq!(first.len(), 3);
    assert!(first.windows(2).all(|w| w[0].utxo_key < w[1].utxo_key));

    let stakers = chain.staker_keys(&first).unwrap();
    chain
        .manager
        .on_block_externalized(20, &first, &stakers)
        .unwrap();
    assert_eq!(chain.manager.pool_len(), 3);

    // The remainder lands in the next block.
    let second = chain.manager.unregistered_enrollments(3);
    assert_eq!(second.len(), 3);
    assert!(second
        .iter()
        .all(|e| !first.iter().any(|f| f.utxo_key == e.utxo_key)));
    let stakers = chain.staker_keys(&second).unwrap();
    chain
        .manager
        .on_block_externalized(21, &second, &stakers)
        .unwrap();
    assert_eq!(chain.manager.pool_len(), 0);
}

/// Applying the same externalized block twice cannot move the chain
/// twice or corrupt state.
#[test]
fn externalization_is_idempotent() {
    let keys = six_keys();
    let dir = tempdir().unwrap();
    let mut config = Config::test_config();
    config.min_fee = 100;
    let (mut chain, genesis) = open_chain(dir.path(), &keys[0], &keys, config);

    let tx = signed_payment(&genesis, &keys[0], 0, 500);
    chain.accept_tx(tx).unwrap();

    let payload = ConsensusPayload::new(chain.pool.candidate_hashes(0), vec![], vec![]);
    let block = chain.build_block(1, &payload, 2000).unwrap();
    chain.apply_externalized(&block).unwrap();
    assert_eq!(chain.height(), 1);

    let set_after = chain.manager.validators.clone();
    // The duplicate is reported as benign and changes nothing.
    let err = chain.apply_externalized(&block).unwrap_err();
    assert!(matches!(err, Error::SlotAlreadyExternalized(1)));
    assert_eq!(chain.height(), 1);
    assert_eq!(chain.manager.validators, set_after);
}

/// A block signed by a validator verifies on another node's catchup
/// path and converges its tip.
#[test]
fn catchup_verifies_and_applies_peer_blocks() {
    let keys = six_keys();
    let dir_a = tempdir().unwrap();
    let dir_b = tempdir().unwrap();
    let mut config = Config::test_config();
    config.min_fee = 100;
    let (mut chain_a, genesis) = open_chain(dir_a.path(), &keys[0], &keys, config.clone());
    let (mut chain_b, _) = open_chain(dir_b.path(), &keys[1], &keys, config);

    let tx = signed_payment(&genesis, &keys[0], 1, 500);
    chain_a.accept_tx(tx).unwrap();
    let payload = ConsensusPayload::new(chain_a.pool.candidate_hashes(0), vec![], vec![]);
    let mut block = chain_a.build_block(1, &payload, 2000).unwrap();

    // Validator 0 contributes its signature share.
    let stake = *chain_a.manager.stake_utxo().unwrap();
    let index = chain_a
        .manager
        .validators
        .enrolled_entries(1)
        .iter()
        .position(|(key, _)| **key == stake)
        .unwrap();
    block.header.signature = keys[0].sign_share(block.hash().as_ref());
    block.header.validators.set(index);

    chain_a.apply_externalized(&block).unwrap();

    // Node b never saw the consensus traffic; it verifies the block
    // cold and applies it.
    chain_b.verify_catchup_block(&block).unwrap();
    chain_b.apply_externalized(&block).unwrap();
    assert_eq!(chain_b.height(), 1);
    assert_eq!(
        chain_b.state().unwrap().tip_hash,
        chain_a.state().unwrap().tip_hash
    );

    // A corrupted signature is rejected before application.
    let tx2 = signed_payment(&genesis, &keys[0], 2, 500);
    chain_a.accept_tx(tx2).unwrap();
    let payload2 = ConsensusPayload::new(chain_a.pool.candidate_hashes(0), vec![], vec![]);
    let mut block2 = chain_a.build_block(2, &payload2, 3000).unwrap();
    block2.header.signature = keys[3].sign_share(block2.hash().as_ref());
    block2.header.validators.set(index);
    let err = chain_b.verify_catchup_block(&block2).unwrap_err();
    assert!(matches!(err, Error::InvalidBlock(_)));
}
