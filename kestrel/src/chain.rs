// Copyright (c) 2025 Kestrel Foundation

//! Chain state: the ledger, pool and validator set behind one façade.
//!
//! Everything consensus needs to judge a candidate value or apply an
//! externalized one lives here; the node event loop and the driver
//! callbacks share it behind a lock.

use crate::{
    block::Block,
    config::Config,
    consensus::ConsensusPayload,
    crypto::{Hash, KeyPair, PublicKey},
    enrollment::{Enrollment, EnrollmentManager, NodeEnrollData, PreImage},
    error::{Error, Result},
    genesis,
    ledger::{ChainState, Ledger},
    mempool::TxPool,
    script::Engine,
    transaction::{Lock, Transaction, Utxo, UtxoKey},
};
use kestrel_consensus_scp::{NodeId, QuorumSet};
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, info, warn};

const BLOB_VALIDATOR_SET: &[u8] = b"validator_set";
const BLOB_ENROLL_DATA: &[u8] = b"node_enroll_data";
const BLOB_TX_POOL: &[u8] = b"tx_pool";

/// The ledger coordinator's state.
pub struct Chain {
    pub config: Config,
    pub ledger: Ledger,
    pub pool: TxPool,
    pub manager: EnrollmentManager,
    engine: Engine,
}

impl Chain {
    /// Open the chain at `path` with an explicit genesis block.
    pub fn open(config: Config, key_pair: KeyPair, path: &Path, genesis: &Block) -> Result<Self> {
        let ledger = Ledger::open_with_maturity(path, genesis, config.payout_period)?;
        let mut manager = EnrollmentManager::new(key_pair.clone(), config.validator_cycle);

        // Restore the validator set, or seed it from genesis.
        match ledger.get_blob(BLOB_VALIDATOR_SET)? {
            Some(bytes) => {
                manager.validators =
                    bincode::deserialize(&bytes).map_err(|e| Error::storage("decode validator set", e))?;
            }
            None => {
                for enrollment in &genesis.header.enrollments {
                    let staker = staker_key_of(&ledger, &enrollment.utxo_key)?;
                    manager.validators.enroll(enrollment, staker, 0)?;
                }
            }
        }

        // Restore our own enrollment state, or recover it from the
        // deterministic genesis seed.
        match ledger.get_blob(BLOB_ENROLL_DATA)? {
            Some(bytes) => {
                let data: NodeEnrollData =
                    bincode::deserialize(&bytes).map_err(|e| Error::storage("decode enroll data", e))?;
                manager.restore(data);
            }
            None => {
                if let Some((stake_key, chain)) =
                    genesis::own_genesis_stake(genesis, &key_pair, config.validator_cycle)
                {
                    manager.adopt_chain(stake_key, chain);
                }
            }
        }

        let mut chain = Self {
            config,
            ledger,
            pool: TxPool::new(),
            manager,
            engine: Engine::default(),
        };

        // Re-admit the persisted pool; anything no longer valid against
        // the restored UTXO set is silently dropped.
        if let Some(bytes) = chain.ledger.get_blob(BLOB_TX_POOL)? {
            let pending: Vec<Transaction> =
                bincode::deserialize(&bytes).map_err(|e| Error::storage("decode tx pool", e))?;
            for tx in pending {
                if let Err(e) = chain.accept_tx(tx) {
                    debug!("persisted transaction dropped on restore: {e}");
                }
            }
        }
        Ok(chain)
    }

    pub fn state(&self) -> Result<ChainState> {
        self.ledger.chain_state()
    }

    pub fn height(&self) -> u64 {
        self.ledger.chain_state().map(|s| s.height).unwrap_or(0)
    }

    fn utxo_lookup(&self) -> impl Fn(&UtxoKey) -> Option<Utxo> + '_ {
        |key| self.ledger.peek_utxo(key).ok().flatten()
    }

    // --- transactions ---------------------------------------------------

    /// Validate a transaction against the UTXO set at `height`.
    pub fn validate_tx(&self, tx: &Transaction, height: u64) -> Result<()> {
        tx.validate_structure()?;
        if tx.is_coinbase() {
            return Err(Error::InvalidTransaction(
                "coinbase cannot be submitted".to_string(),
            ));
        }
        let mut input_total: u64 = 0;
        for input in &tx.inputs {
            let utxo = self.ledger.find_spendable(&input.utxo_key(), height)?;
            self.engine
                .execute(&utxo.output.lock, &input.unlock, tx)
                .map_err(Error::ScriptFailed)?;
            input_total = input_total.saturating_add(utxo.output.amount);
        }
        let fee = input_total
            .checked_sub(tx.output_sum())
            .ok_or_else(|| Error::InvalidTransaction("outputs exceed inputs".to_string()))?;
        if fee < self.config.min_fee {
            return Err(Error::InvalidTransaction(format!(
                "fee {fee} below minimum {}",
                self.config.min_fee
            )));
        }
        Ok(())
    }

    /// Admit a transaction into the pool (validating at tip + 1).
    pub fn accept_tx(&mut self, tx: Transaction) -> Result<Hash> {
        let next_height = self.height() + 1;
        self.validate_tx(&tx, next_height)?;
        self.pool.add(tx)
    }

    // --- fee payout -----------------------------------------------------

    /// The deterministic Coinbase due at `height`, if any: a
    /// `validator_tx_fee_cut` percent share of the fee pool split
    /// equally over the enrolled validators.
    pub fn expected_coinbase(&self, height: u64) -> Result<Option<Transaction>> {
        if self.config.payout_period == 0 || height % self.config.payout_period != 0 {
            return Ok(None);
        }
        let fee_pool = self.state()?.fee_pool;
        let payout = fee_pool * u64::from(self.config.validator_tx_fee_cut.min(100)) / 100;
        let recipients = self.manager.validators.enrolled_entries(height);
        if payout == 0 || recipients.is_empty() {
            return Ok(None);
        }
        let share = payout / recipients.len() as u64;
        if share == 0 {
            return Ok(None);
        }
        let outputs = recipients
            .iter()
            .map(|(_, info)| {
                crate::transaction::Output::new(share, Lock::Key(info.public_key))
            })
            .collect();
        Ok(Some(Transaction::new(
            crate::transaction::TxType::Coinbase,
            vec![],
            outputs,
        )))
    }

    // --- consensus value validation ------------------------------------

    /// Validate a candidate payload for the slot at `height`.
    /// This is the `validate_value` callback's substance.
    pub fn validate_payload(&self, height: u64, payload: &ConsensusPayload) -> Result<()> {
        if payload.tx_hashes.windows(2).any(|w| w[0] >= w[1]) {
            return Err(Error::InvalidTransaction(
                "candidate tx set not in canonical order".to_string(),
            ));
        }

        let expected_coinbase = self.expected_coinbase(height)?;
        let expected_coinbase_hash = expected_coinbase.as_ref().map(Transaction::hash);

        let mut spent: HashSet<UtxoKey> = HashSet::new();
        let mut saw_coinbase = false;
        for tx_hash in &payload.tx_hashes {
            let coinbase_match = expected_coinbase
                .as_ref()
                .filter(|_| expected_coinbase_hash == Some(*tx_hash));
            let tx = if let Some(coinbase) = coinbase_match {
                saw_coinbase = true;
                coinbase
            } else {
                self.pool.get(tx_hash).ok_or_else(|| {
                    Error::InvalidTransaction(format!("candidate tx {tx_hash} not known"))
                })?
            };
            if tx.is_coinbase() && Some(*tx_hash) != expected_coinbase_hash {
                return Err(Error::InvalidTransaction(
                    "unexpected coinbase in candidate set".to_string(),
                ));
            }
            for input in &tx.inputs {
                if !spent.insert(input.utxo_key()) {
                    return Err(Error::InvalidTransaction(
                        "double-spend within candidate set".to_string(),
                    ));
                }
            }
            if !tx.is_coinbase() {
                self.validate_tx(tx, height)?;
            }
        }
        if expected_coinbase_hash.is_some() && !saw_coinbase && !payload.tx_hashes.is_empty() {
            return Err(Error::InvalidTransaction(
                "fee payout due but candidate set omits the coinbase".to_string(),
            ));
        }

        if payload.enrollments.len() > self.config.max_enrollments_per_block {
            return Err(Error::InvalidEnrollment(format!(
                "{} enrollments exceed the per-block cap of {}",
                payload.enrollments.len(),
                self.config.max_enrollments_per_block
            )));
        }
        let keys: Vec<UtxoKey> = payload.enrollments.iter().map(|e| e.utxo_key).collect();
        if keys.windows(2).any(|w| w[0] >= w[1]) {
            return Err(Error::InvalidEnrollment(
                "candidate enrollments not in key order".to_string(),
            ));
        }
        let tip = height.saturating_sub(1);
        for enrollment in &payload.enrollments {
            self.manager
                .validate_enrollment(tip, enrollment, self.utxo_lookup())?;
        }

        let enrolled = self.manager.validators.count_enrolled(height) as u32;
        if payload.missing_validators.iter().any(|i| *i >= enrolled) {
            return Err(Error::InvalidEnvelope(
                "missing-validator index out of range".to_string(),
            ));
        }
        Ok(())
    }

    // --- block assembly and application --------------------------------

    /// Materialise the block for an externalized payload.
    pub fn build_block(
        &self,
        height: u64,
        payload: &ConsensusPayload,
        timestamp: u64,
    ) -> Result<Block> {
        let state = self.state()?;
        let expected_coinbase = self.expected_coinbase(height)?;
        let expected_coinbase_hash = expected_coinbase.as_ref().map(Transaction::hash);

        let mut txs = Vec::with_capacity(payload.tx_hashes.len());
        for tx_hash in &payload.tx_hashes {
            let coinbase_match = expected_coinbase
                .as_ref()
                .filter(|_| expected_coinbase_hash == Some(*tx_hash));
            if let Some(coinbase) = coinbase_match {
                txs.push(coinbase.clone());
            } else {
                let tx = self.pool.get(tx_hash).ok_or_else(|| {
                    Error::InvalidBlock(format!("externalized tx {tx_hash} not in pool"))
                })?;
                txs.push(tx.clone());
            }
        }

        Ok(Block::build(
            &state.tip_hash,
            height,
            timestamp,
            txs,
            payload.enrollments.clone(),
            payload.missing_validators.clone(),
            self.manager.validators.count_enrolled(height),
        ))
    }

    /// Resolve the staker key behind each enrollment's freeze output.
    pub fn staker_keys(&self, enrollments: &[Enrollment]) -> Result<Vec<PublicKey>> {
        enrollments
            .iter()
            .map(|e| staker_key_of(&self.ledger, &e.utxo_key))
            .collect()
    }

    /// Apply an externalized (or catchup-verified) block: slash the
    /// agreed missing validators, append atomically, advance the
    /// validator set and prune the pool.
    pub fn apply_externalized(&mut self, block: &Block) -> Result<()> {
        let height = block.height();
        if height <= self.height() {
            // Benign duplicate: the slot's block is already in.
            return Err(Error::SlotAlreadyExternalized(height));
        }
        let missing_keys = self
            .manager
            .validators
            .keys_for_indices(height, &block.header.missing_validators);
        let stakers = self.staker_keys(&block.header.enrollments)?;
        let penalties = self.manager.validators.expiring_penalties(height);

        // The store append commits (or aborts) first; the validator-set
        // and pool updates below are infallible, which is what makes
        // the whole application atomic.
        self.ledger.apply_block(block, &penalties)?;

        for key in &missing_keys {
            warn!(key = %key, height, "validator missed its reveal; slashing");
            self.manager
                .validators
                .slash(key, self.config.slash_penalty_amount);
        }

        self.manager
            .on_block_externalized(height, &block.header.enrollments, &stakers)?;
        for tx in &block.txs {
            self.pool.remove(&tx.hash());
        }
        self.persist()?;

        info!(
            height,
            active = self.manager.validators.count_active(height + 1),
            "chain advanced"
        );
        Ok(())
    }

    /// Verify a block fetched from a peer before applying it: chain
    /// linkage is checked inside `apply_block`; here we check the
    /// aggregate signature and the enrollments.
    pub fn verify_catchup_block(&self, block: &Block) -> Result<()> {
        let height = block.height();
        let enrolled = self.manager.validators.enrolled_entries(height);
        if block.header.validators.len() != enrolled.len() {
            return Err(Error::InvalidBlock(format!(
                "bitfield over {} validators, {} enrolled",
                block.header.validators.len(),
                enrolled.len()
            )));
        }
        let signers: Vec<PublicKey> = block
            .header
            .validators
            .set_indices()
            .into_iter()
            .map(|i| enrolled[i].1.public_key)
            .collect();
        if signers.is_empty() {
            return Err(Error::InvalidBlock("no validator signatures".to_string()));
        }
        if !crate::crypto::verify_multisig(
            &signers,
            block.hash().as_ref(),
            &block.header.signature,
        ) {
            return Err(Error::InvalidBlock(
                "aggregate signature does not verify".to_string(),
            ));
        }
        let tip = height.saturating_sub(1);
        for enrollment in &block.header.enrollments {
            self.manager
                .validate_enrollment(tip, enrollment, self.utxo_lookup())?;
        }
        Ok(())
    }

    // --- validator wiring ----------------------------------------------

    /// Record a gossiped reveal.
    pub fn add_preimage(&mut self, preimage: &PreImage) -> Result<bool> {
        self.manager.validators.add_preimage(preimage)
    }

    /// Admit a gossiped enrollment into the pending pool.
    pub fn add_enrollment(&mut self, enrollment: Enrollment) -> Result<()> {
        let tip = self.height();
        let lookup = |key: &UtxoKey| self.ledger.peek_utxo(key).ok().flatten();
        self.manager.add_enrollment(tip, enrollment, lookup)
    }

    /// The active validators at `height` as protocol node ids, in
    /// stake-key order.
    pub fn active_node_ids(&self, height: u64) -> Vec<NodeId> {
        self.manager
            .validators
            .active_entries(height)
            .into_iter()
            .map(|(_, v)| NodeId(v.public_key.0))
            .collect()
    }

    /// Derive the quorum set for `height`. Insanity here is fatal for
    /// this node's own configuration.
    pub fn quorum_for(&self, height: u64) -> Result<QuorumSet> {
        let ids = self.active_node_ids(height);
        let seed = self.manager.validators.random_seed(height);
        crate::quorum::build_quorum_set(
            &ids,
            &seed,
            self.config.max_quorum_nodes,
            self.config.quorum_threshold,
        )
    }

    /// Does the network need emergency enrollments for `height`?
    /// True when fewer validators would remain active than the quorum
    /// threshold requires.
    pub fn not_enough_validators(&self, height: u64) -> bool {
        let enrolled_now = self.manager.validators.count_enrolled(self.height() + 1);
        let projected = self
            .manager
            .validators
            .enrolled_entries(height)
            .len()
            + self.manager.pool_len();
        let required = (u64::from(self.config.quorum_threshold.min(100))
            * enrolled_now as u64)
            .div_ceil(100)
            .max(1) as usize;
        projected < required
    }

    /// Persist the validator set and our enrollment state.
    pub fn persist(&self) -> Result<()> {
        let set_bytes = bincode::serialize(&self.manager.validators)
            .map_err(|e| Error::storage("encode validator set", e))?;
        self.ledger.put_blob(BLOB_VALIDATOR_SET, &set_bytes)?;
        if let Some(data) = self.manager.enroll_data() {
            let bytes =
                bincode::serialize(&data).map_err(|e| Error::storage("encode enroll data", e))?;
            self.ledger.put_blob(BLOB_ENROLL_DATA, &bytes)?;
        }
        let pool_bytes = bincode::serialize(&self.pool.snapshot())
            .map_err(|e| Error::storage("encode tx pool", e))?;
        self.ledger.put_blob(BLOB_TX_POOL, &pool_bytes)?;
        Ok(())
    }

    /// The payload this node would nominate right now, if any.
    pub fn nomination_candidate(&self, height: u64) -> Result<Option<ConsensusPayload>> {
        let cap = self.config.txs_to_nominate;
        let mut tx_hashes = self.pool.candidate_hashes(cap);
        // With a nonzero cap, wait for a full set before nominating.
        if cap > 0 && tx_hashes.len() < cap {
            let enrollments_due = self
                .manager
                .unregistered_enrollments(self.config.max_enrollments_per_block);
            if enrollments_due.is_empty() {
                debug!(
                    pooled = tx_hashes.len(),
                    cap, "deferring nomination until the set fills"
                );
                return Ok(None);
            }
        }
        if let Some(coinbase) = self.expected_coinbase(height)? {
            tx_hashes.push(coinbase.hash());
        }
        let enrollments = self
            .manager
            .unregistered_enrollments(self.config.max_enrollments_per_block);
        let missing = self.manager.validators.missing_reveals(height);
        let payload = ConsensusPayload::new(tx_hashes, enrollments, missing);
        if payload.is_empty() {
            return Ok(None);
        }
        Ok(Some(payload))
    }
}

fn staker_key_of(ledger: &Ledger, stake: &UtxoKey) -> Result<PublicKey> {
    let utxo = ledger
        .peek_utxo(stake)?
        .ok_or_else(|| Error::InvalidEnrollment(format!("stake utxo {stake} not found")))?;
    match utxo.output.lock {
        Lock::Key(public) => Ok(public),
        _ => Err(Error::InvalidEnrollment(
            "stake utxo must be locked to a plain key".to_string(),
        )),
    }
}
