// Copyright (c) 2025 Kestrel Foundation

//! LMDB-backed ledger storage using heed.
//!
//! Block application runs inside a single write transaction: if any
//! check fails, the transaction is dropped and the store is left
//! byte-identical to its pre-application state.

use heed::types::{Bytes, U64};
use heed::{Database, Env, EnvOpenOptions, RwTxn};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

use super::{ChainState, MAX_BLOCKS_PER_RANGE};
use crate::{
    block::{BitMask, Block},
    crypto::{Hash, Signature},
    error::{Error, Result},
    transaction::{Utxo, UtxoKey},
};

// Metadata keys.
const META_HEIGHT: &[u8] = b"height";
const META_TIP_HASH: &[u8] = b"tip_hash";
const META_FEE_POOL: &[u8] = b"fee_pool";

/// The canonical store: blocks, UTXOs and node metadata.
pub struct Ledger {
    env: Env,
    /// blocks: height (u64) -> Block (bytes)
    blocks_db: Database<U64<heed::byteorder::LE>, Bytes>,
    /// utxos: UtxoKey (64 bytes) -> Utxo (bytes)
    utxo_db: Database<Bytes, Bytes>,
    /// metadata and persisted blobs: key (bytes) -> value (bytes)
    meta_db: Database<Bytes, Bytes>,
    /// Blocks a coinbase output stays locked after its payout height.
    coinbase_maturity: u64,
}

impl Ledger {
    /// Open or create a ledger at `path`, injecting `genesis` if the
    /// store is empty. The genesis block is immutable afterwards.
    pub fn open(path: &Path, genesis: &Block) -> Result<Self> {
        Self::open_with_maturity(path, genesis, 0)
    }

    /// As [`Self::open`], with coinbase outputs locked for
    /// `coinbase_maturity` blocks past their creation height.
    pub fn open_with_maturity(
        path: &Path,
        genesis: &Block,
        coinbase_maturity: u64,
    ) -> Result<Self> {
        fs::create_dir_all(path).map_err(|e| Error::storage("create ledger directory", e))?;

        let env = unsafe {
            EnvOpenOptions::new()
                .max_dbs(3)
                .map_size(1024 * 1024 * 1024)
                .open(path)
        }
        .map_err(|e| Error::storage("open environment", e))?;

        let mut wtxn = env
            .write_txn()
            .map_err(|e| Error::storage("start write txn", e))?;
        let blocks_db = env
            .create_database(&mut wtxn, Some("blocks"))
            .map_err(|e| Error::storage("create blocks db", e))?;
        let utxo_db = env
            .create_database(&mut wtxn, Some("utxos"))
            .map_err(|e| Error::storage("create utxos db", e))?;
        let meta_db = env
            .create_database(&mut wtxn, Some("meta"))
            .map_err(|e| Error::storage("create meta db", e))?;
        wtxn.commit()
            .map_err(|e| Error::storage("commit db creation", e))?;

        let ledger = Self {
            env,
            blocks_db,
            utxo_db,
            meta_db,
            coinbase_maturity,
        };

        if ledger.is_uninitialized()? {
            info!(hash = %genesis.hash(), "initializing ledger with genesis block");
            ledger.init_genesis(genesis)?;
        }
        Ok(ledger)
    }

    fn is_uninitialized(&self) -> Result<bool> {
        let rtxn = self
            .env
            .read_txn()
            .map_err(|e| Error::storage("start read txn", e))?;
        let height = self
            .meta_db
            .get(&rtxn, META_HEIGHT)
            .map_err(|e| Error::storage("get height", e))?;
        Ok(height.is_none())
    }

    fn init_genesis(&self, genesis: &Block) -> Result<()> {
        if genesis.height() != 0 {
            return Err(Error::InvalidBlock(
                "genesis block must be at height 0".to_string(),
            ));
        }
        let mut wtxn = self
            .env
            .write_txn()
            .map_err(|e| Error::storage("start write txn", e))?;

        self.put_block(&mut wtxn, genesis)?;
        self.insert_outputs(&mut wtxn, genesis)?;
        self.apply_enrollment_locks(&mut wtxn, genesis)?;

        self.put_meta_u64(&mut wtxn, META_HEIGHT, 0)?;
        self.put_meta(&mut wtxn, META_TIP_HASH, genesis.hash().as_ref())?;
        self.put_meta_u64(&mut wtxn, META_FEE_POOL, 0)?;

        wtxn.commit()
            .map_err(|e| Error::storage("commit genesis", e))
    }

    /// Current chain tip summary.
    pub fn chain_state(&self) -> Result<ChainState> {
        let rtxn = self
            .env
            .read_txn()
            .map_err(|e| Error::storage("start read txn", e))?;
        let height = self.get_meta_u64(&rtxn, META_HEIGHT)?.ok_or_else(|| {
            Error::StorageFailure("ledger not initialized".to_string())
        })?;
        let tip_hash = self
            .meta_db
            .get(&rtxn, META_TIP_HASH)
            .map_err(|e| Error::storage("get tip hash", e))?
            .and_then(Hash::from_slice)
            .ok_or_else(|| Error::StorageFailure("tip hash missing".to_string()))?;
        let fee_pool = self.get_meta_u64(&rtxn, META_FEE_POOL)?.unwrap_or(0);
        Ok(ChainState {
            height,
            tip_hash,
            fee_pool,
        })
    }

    /// Fetch a block by height.
    pub fn get_block(&self, height: u64) -> Result<Block> {
        let rtxn = self
            .env
            .read_txn()
            .map_err(|e| Error::storage("start read txn", e))?;
        let bytes = self
            .blocks_db
            .get(&rtxn, &height)
            .map_err(|e| Error::storage("get block", e))?
            .ok_or_else(|| Error::InvalidBlock(format!("no block at height {height}")))?;
        bincode::deserialize(bytes).map_err(|e| Error::storage("decode block", e))
    }

    /// Blocks `[from, from + limit)`, capped at the range limit; stops
    /// at the tip.
    pub fn get_blocks_from(&self, from: u64, limit: usize) -> Result<Vec<Block>> {
        let capped = limit.min(MAX_BLOCKS_PER_RANGE);
        let rtxn = self
            .env
            .read_txn()
            .map_err(|e| Error::storage("start read txn", e))?;
        let mut blocks = Vec::with_capacity(capped);
        for height in from..from.saturating_add(capped as u64) {
            match self
                .blocks_db
                .get(&rtxn, &height)
                .map_err(|e| Error::storage("get block", e))?
            {
                Some(bytes) => blocks.push(
                    bincode::deserialize(bytes).map_err(|e| Error::storage("decode block", e))?,
                ),
                None => break,
            }
        }
        Ok(blocks)
    }

    /// Apply a block atomically.
    ///
    /// Every input must exist and be spendable at the block height with
    /// no double-spend inside the block; all outputs are inserted,
    /// enrollment stakes re-locked, the listed penalties deducted and
    /// the fee pool advanced. Any failure aborts the whole transaction.
    pub fn apply_block(&self, block: &Block, penalties: &[(UtxoKey, u64)]) -> Result<()> {
        let mut wtxn = self
            .env
            .write_txn()
            .map_err(|e| Error::storage("start write txn", e))?;

        let height = self.get_meta_u64(&wtxn, META_HEIGHT)?.ok_or_else(|| {
            Error::StorageFailure("ledger not initialized".to_string())
        })?;
        let tip_hash = self
            .meta_db
            .get(&wtxn, META_TIP_HASH)
            .map_err(|e| Error::storage("get tip hash", e))?
            .and_then(Hash::from_slice)
            .ok_or_else(|| Error::StorageFailure("tip hash missing".to_string()))?;
        let fee_pool = self.get_meta_u64(&wtxn, META_FEE_POOL)?.unwrap_or(0);

        block.verify_chain(&tip_hash, height)?;

        // Spend inputs and collect fees.
        let mut spent_in_block: HashSet<UtxoKey> = HashSet::new();
        let mut fees: u64 = 0;
        let mut coinbase_total: u64 = 0;
        for tx in &block.txs {
            let mut input_total: u64 = 0;
            for input in &tx.inputs {
                let key = input.utxo_key();
                if !spent_in_block.insert(key) {
                    return Err(Error::InvalidBlock(format!(
                        "utxo {key} spent twice within the block"
                    )));
                }
                let utxo = self.get_utxo_txn(&wtxn, &key)?.ok_or_else(|| {
                    Error::InvalidBlock(format!("input utxo {key} not found"))
                })?;
                if !utxo.spendable_at(block.height()) {
                    return Err(Error::InvalidBlock(format!(
                        "utxo {key} locked until height {}",
                        utxo.unlock_height
                    )));
                }
                input_total = input_total.saturating_add(utxo.output.amount);
                self.utxo_db
                    .delete(&mut wtxn, key.as_ref())
                    .map_err(|e| Error::storage("delete utxo", e))?;
            }
            let output_total = tx.output_sum();
            if tx.is_coinbase() {
                coinbase_total = coinbase_total.saturating_add(output_total);
            } else {
                let fee = input_total.checked_sub(output_total).ok_or_else(|| {
                    Error::InvalidBlock("outputs exceed inputs".to_string())
                })?;
                fees = fees.saturating_add(fee);
            }
        }

        self.insert_outputs(&mut wtxn, block)?;
        self.apply_enrollment_locks(&mut wtxn, block)?;

        // Stake penalties settled at this height.
        for (key, amount) in penalties {
            if let Some(mut utxo) = self.get_utxo_txn(&wtxn, key)? {
                utxo.output.amount = utxo.output.amount.saturating_sub(*amount);
                debug!(key = %key, amount, "stake penalty deducted");
                if utxo.output.amount == 0 {
                    self.utxo_db
                        .delete(&mut wtxn, key.as_ref())
                        .map_err(|e| Error::storage("delete slashed utxo", e))?;
                } else {
                    self.put_utxo_txn(&mut wtxn, key, &utxo)?;
                }
            }
        }

        let new_fee_pool = fee_pool
            .saturating_add(fees)
            .checked_sub(coinbase_total)
            .ok_or_else(|| Error::InvalidBlock("coinbase exceeds fee pool".to_string()))?;

        self.put_block(&mut wtxn, block)?;
        self.put_meta_u64(&mut wtxn, META_HEIGHT, block.height())?;
        self.put_meta(&mut wtxn, META_TIP_HASH, block.hash().as_ref())?;
        self.put_meta_u64(&mut wtxn, META_FEE_POOL, new_fee_pool)?;

        wtxn.commit()
            .map_err(|e| Error::storage("commit block", e))?;

        info!(
            height = block.height(),
            hash = %block.hash(),
            txs = block.txs.len(),
            enrollments = block.header.enrollments.len(),
            "block appended"
        );
        Ok(())
    }

    /// Replace a stored block's aggregate signature and bitfield as
    /// late shares arrive. The block identity is unchanged.
    pub fn update_block_signature(
        &self,
        height: u64,
        signature: Signature,
        validators: BitMask,
    ) -> Result<()> {
        let mut block = self.get_block(height)?;
        block.header.signature = signature;
        block.header.validators = validators;
        let mut wtxn = self
            .env
            .write_txn()
            .map_err(|e| Error::storage("start write txn", e))?;
        self.put_block(&mut wtxn, &block)?;
        wtxn.commit()
            .map_err(|e| Error::storage("commit signature update", e))
    }

    /// Persist an opaque blob (validator set, enrollment data).
    pub fn put_blob(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut wtxn = self
            .env
            .write_txn()
            .map_err(|e| Error::storage("start write txn", e))?;
        self.meta_db
            .put(&mut wtxn, key, value)
            .map_err(|e| Error::storage("put blob", e))?;
        wtxn.commit().map_err(|e| Error::storage("commit blob", e))
    }

    pub fn get_blob(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let rtxn = self
            .env
            .read_txn()
            .map_err(|e| Error::storage("start read txn", e))?;
        Ok(self
            .meta_db
            .get(&rtxn, key)
            .map_err(|e| Error::storage("get blob", e))?
            .map(<[u8]>::to_vec))
    }

    // --- shared txn helpers --------------------------------------------

    fn put_block(&self, wtxn: &mut RwTxn, block: &Block) -> Result<()> {
        let bytes = bincode::serialize(block).map_err(|e| Error::storage("encode block", e))?;
        self.blocks_db
            .put(wtxn, &block.height(), &bytes)
            .map_err(|e| Error::storage("put block", e))
    }

    fn insert_outputs(&self, wtxn: &mut RwTxn, block: &Block) -> Result<()> {
        for tx in &block.txs {
            let tx_hash = tx.hash();
            let unlock_height = if tx.is_coinbase() {
                block.height() + self.coinbase_maturity
            } else {
                block.height()
            };
            for (index, output) in tx.outputs.iter().enumerate() {
                let key = crate::transaction::compute_utxo_key(&tx_hash, index as u32);
                let utxo = Utxo {
                    output: output.clone(),
                    tx_type: tx.tx_type,
                    unlock_height,
                };
                self.put_utxo_txn(wtxn, &key, &utxo)?;
            }
        }
        Ok(())
    }

    /// A freeze output staking an enrollment at height `h` is locked
    /// until `h + 2 * cycle_length`.
    fn apply_enrollment_locks(&self, wtxn: &mut RwTxn, block: &Block) -> Result<()> {
        for enrollment in &block.header.enrollments {
            let mut utxo = self
                .get_utxo_txn(wtxn, &enrollment.utxo_key)?
                .ok_or_else(|| {
                    Error::InvalidBlock(format!(
                        "enrollment stake {} not found",
                        enrollment.utxo_key
                    ))
                })?;
            utxo.unlock_height =
                block.height() + 2 * u64::from(enrollment.cycle_length);
            self.put_utxo_txn(wtxn, &enrollment.utxo_key, &utxo)?;
        }
        Ok(())
    }

    pub(super) fn get_utxo_txn(&self, txn: &RwTxn, key: &UtxoKey) -> Result<Option<Utxo>> {
        match self
            .utxo_db
            .get(txn, key.as_ref())
            .map_err(|e| Error::storage("get utxo", e))?
        {
            Some(bytes) => Ok(Some(
                bincode::deserialize(bytes).map_err(|e| Error::storage("decode utxo", e))?,
            )),
            None => Ok(None),
        }
    }

    fn put_utxo_txn(&self, wtxn: &mut RwTxn, key: &UtxoKey, utxo: &Utxo) -> Result<()> {
        let bytes = bincode::serialize(utxo).map_err(|e| Error::storage("encode utxo", e))?;
        self.utxo_db
            .put(wtxn, key.as_ref(), &bytes)
            .map_err(|e| Error::storage("put utxo", e))
    }

    pub(super) fn read_utxo(&self, key: &UtxoKey) -> Result<Option<Utxo>> {
        let rtxn = self
            .env
            .read_txn()
            .map_err(|e| Error::storage("start read txn", e))?;
        match self
            .utxo_db
            .get(&rtxn, key.as_ref())
            .map_err(|e| Error::storage("get utxo", e))?
        {
            Some(bytes) => Ok(Some(
                bincode::deserialize(bytes).map_err(|e| Error::storage("decode utxo", e))?,
            )),
            None => Ok(None),
        }
    }

    fn put_meta(&self, wtxn: &mut RwTxn, key: &[u8], value: &[u8]) -> Result<()> {
        self.meta_db
            .put(wtxn, key, value)
            .map_err(|e| Error::storage("put meta", e))
    }

    fn put_meta_u64(&self, wtxn: &mut RwTxn, key: &[u8], value: u64) -> Result<()> {
        self.put_meta(wtxn, key, &value.to_le_bytes())
    }

    fn get_meta_u64(&self, txn: &heed::RoTxn, key: &[u8]) -> Result<Option<u64>> {
        Ok(self
            .meta_db
            .get(txn, key)
            .map_err(|e| Error::storage("get meta", e))?
            .and_then(|b| b.try_into().ok())
            .map(u64::from_le_bytes))
    }
}
