// Copyright (c) 2025 Kestrel Foundation

//! Transactions, outputs, locks and the UTXO record.
//!
//! The canonical byte form (length-prefixed fields, little-endian
//! integers) is what gets hashed and signed; it is identical on every
//! node and independent of the wire serialisation.

use crate::{
    config::MIN_FREEZE_AMOUNT,
    crypto::{Hash, PublicKey},
    error::{Error, Result},
};
use serde::{Deserialize, Serialize};
use std::fmt;

const DOMAIN_TX: &[u8] = b"kestrel.tx.v1";
const DOMAIN_TX_SIGN: &[u8] = b"kestrel.tx.sign.v1";
const DOMAIN_UTXO_KEY: &[u8] = b"kestrel.utxo.v1";

/// What a transaction does.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub enum TxType {
    /// Moves value between outputs.
    Payment,
    /// Creates stake: its outputs back validator enrollments.
    Freeze,
    /// Pays pooled fees out to validators; only valid inside a block.
    Coinbase,
}

/// The condition an output is locked under.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub enum Lock {
    /// Spendable by a signature from this key.
    Key(PublicKey),
    /// Spendable by revealing a key hashing to this digest, plus a
    /// signature from it.
    KeyHash(Hash),
    /// Spendable by satisfying the embedded script.
    Script(Vec<u8>),
    /// Spendable by revealing a script hashing to this digest and
    /// satisfying it.
    Redeem(Hash),
}

impl Lock {
    fn tag(&self) -> u8 {
        match self {
            Lock::Key(_) => 0,
            Lock::KeyHash(_) => 1,
            Lock::Script(_) => 2,
            Lock::Redeem(_) => 3,
        }
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        out.push(self.tag());
        match self {
            Lock::Key(pk) => out.extend_from_slice(&pk.0),
            Lock::KeyHash(h) | Lock::Redeem(h) => out.extend_from_slice(h.as_ref()),
            Lock::Script(bytes) => {
                out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
                out.extend_from_slice(bytes);
            }
        }
    }
}

/// The witness satisfying a lock; interpretation depends on the lock's
/// tag.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default, Serialize, Deserialize)]
pub struct Unlock {
    pub witness: Vec<u8>,
}

impl Unlock {
    pub fn new(witness: Vec<u8>) -> Self {
        Self { witness }
    }
}

/// A reference to a previous output plus the witness spending it.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub struct Input {
    pub prev_tx: Hash,
    pub output_index: u32,
    pub unlock: Unlock,
}

impl Input {
    pub fn new(prev_tx: Hash, output_index: u32, unlock: Unlock) -> Self {
        Self {
            prev_tx,
            output_index,
            unlock,
        }
    }

    /// The key of the UTXO this input consumes.
    pub fn utxo_key(&self) -> UtxoKey {
        compute_utxo_key(&self.prev_tx, self.output_index)
    }
}

/// An amount under a lock.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub struct Output {
    pub amount: u64,
    pub lock: Lock,
}

impl Output {
    pub fn new(amount: u64, lock: Lock) -> Self {
        Self { amount, lock }
    }
}

/// UTXOs are keyed by `H(tx_hash ‖ output_index)`.
pub type UtxoKey = Hash;

pub fn compute_utxo_key(tx_hash: &Hash, output_index: u32) -> UtxoKey {
    Hash::digest_parts(
        DOMAIN_UTXO_KEY,
        &[tx_hash.as_ref(), &output_index.to_le_bytes()],
    )
}

/// An unspent output as tracked by the UTXO set.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Utxo {
    pub output: Output,
    pub tx_type: TxType,
    /// First height at which this output may be spent. Regular outputs
    /// unlock at their creation height; a freeze output staking an
    /// enrollment is pushed out to `enroll_height + 2 * cycle_length`.
    pub unlock_height: u64,
}

impl Utxo {
    pub fn spendable_at(&self, height: u64) -> bool {
        height >= self.unlock_height
    }
}

/// A transaction: tagged inputs and outputs.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub struct Transaction {
    pub tx_type: TxType,
    pub inputs: Vec<Input>,
    pub outputs: Vec<Output>,
}

impl Transaction {
    pub fn new(tx_type: TxType, inputs: Vec<Input>, outputs: Vec<Output>) -> Self {
        Self {
            tx_type,
            inputs,
            outputs,
        }
    }

    pub fn is_coinbase(&self) -> bool {
        self.tx_type == TxType::Coinbase
    }

    /// Canonical byte form; `with_witnesses` is false for the signing
    /// hash so witnesses can commit to the rest of the transaction.
    fn canonical_bytes(&self, with_witnesses: bool) -> Vec<u8> {
        let mut out = Vec::new();
        out.push(match self.tx_type {
            TxType::Payment => 0u8,
            TxType::Freeze => 1,
            TxType::Coinbase => 2,
        });
        out.extend_from_slice(&(self.inputs.len() as u32).to_le_bytes());
        for input in &self.inputs {
            out.extend_from_slice(input.prev_tx.as_ref());
            out.extend_from_slice(&input.output_index.to_le_bytes());
            if with_witnesses {
                out.extend_from_slice(&(input.unlock.witness.len() as u32).to_le_bytes());
                out.extend_from_slice(&input.unlock.witness);
            }
        }
        out.extend_from_slice(&(self.outputs.len() as u32).to_le_bytes());
        for output in &self.outputs {
            out.extend_from_slice(&output.amount.to_le_bytes());
            output.lock.encode_into(&mut out);
        }
        out
    }

    /// The canonical fingerprint of this transaction.
    pub fn hash(&self) -> Hash {
        Hash::digest_with_domain(DOMAIN_TX, &self.canonical_bytes(true))
    }

    /// What input witnesses sign: the transaction minus the witnesses.
    pub fn signing_hash(&self) -> Hash {
        Hash::digest_with_domain(DOMAIN_TX_SIGN, &self.canonical_bytes(false))
    }

    /// Sum of output amounts, saturating.
    pub fn output_sum(&self) -> u64 {
        self.outputs
            .iter()
            .fold(0u64, |acc, o| acc.saturating_add(o.amount))
    }

    /// Structural checks that need no chain state.
    pub fn validate_structure(&self) -> Result<()> {
        match self.tx_type {
            TxType::Coinbase => {
                if !self.inputs.is_empty() {
                    return Err(Error::InvalidTransaction(
                        "coinbase must not have inputs".to_string(),
                    ));
                }
            }
            TxType::Payment | TxType::Freeze => {
                if self.inputs.is_empty() {
                    return Err(Error::InvalidTransaction("no inputs".to_string()));
                }
            }
        }
        if self.outputs.is_empty() {
            return Err(Error::InvalidTransaction("no outputs".to_string()));
        }
        for output in &self.outputs {
            if output.amount == 0 {
                return Err(Error::InvalidTransaction("zero-amount output".to_string()));
            }
            if self.tx_type == TxType::Freeze && output.amount < MIN_FREEZE_AMOUNT {
                return Err(Error::InvalidTransaction(format!(
                    "freeze output below minimum stake ({} < {MIN_FREEZE_AMOUNT})",
                    output.amount
                )));
            }
        }
        // Duplicate inputs are a self-double-spend.
        let mut keys: Vec<UtxoKey> = self.inputs.iter().map(Input::utxo_key).collect();
        keys.sort();
        if keys.windows(2).any(|w| w[0] == w[1]) {
            return Err(Error::InvalidTransaction(
                "duplicate input within transaction".to_string(),
            ));
        }
        Ok(())
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} tx {} ({} in, {} out)",
            self.tx_type,
            self.hash(),
            self.inputs.len(),
            self.outputs.len()
        )
    }
}
