// Copyright (c) 2025 Kestrel Foundation

//! Blocks: header, validator bitfield and the merkle tree.
//!
//! The block hash covers everything except the validator bitfield and
//! the aggregated signature; those two fields are filled in as
//! signature shares arrive, without changing the block's identity.

use crate::{
    crypto::{Hash, Signature},
    enrollment::Enrollment,
    error::{Error, Result},
    transaction::Transaction,
};
use serde::{Deserialize, Serialize};
use std::fmt;

const DOMAIN_BLOCK: &[u8] = b"kestrel.block.v1";
const DOMAIN_MERKLE: &[u8] = b"kestrel.merkle.v1";

/// One bit per enrolled validator, ordered by stake utxo-key ascending.
#[derive(Clone, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct BitMask {
    count: usize,
    bits: Vec<u8>,
}

impl BitMask {
    pub fn new(count: usize) -> Self {
        Self {
            count,
            bits: vec![0u8; count.div_ceil(8)],
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn set(&mut self, index: usize) {
        if index < self.count {
            self.bits[index / 8] |= 1 << (index % 8);
        }
    }

    pub fn get(&self, index: usize) -> bool {
        index < self.count && (self.bits[index / 8] >> (index % 8)) & 1 == 1
    }

    pub fn count_set(&self) -> usize {
        (0..self.count).filter(|i| self.get(*i)).count()
    }

    /// Indices of the set bits.
    pub fn set_indices(&self) -> Vec<usize> {
        (0..self.count).filter(|i| self.get(*i)).collect()
    }
}

impl fmt::Display for BitMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for i in 0..self.count {
            write!(f, "{}", u8::from(self.get(i)))?;
        }
        Ok(())
    }
}

/// Block header.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct BlockHeader {
    /// Hash of the parent block.
    pub prev_block: Hash,

    /// Monotonic height; genesis is 0.
    pub height: u64,

    /// Merkle root over the block's transaction hashes.
    pub merkle_root: Hash,

    /// Unix seconds.
    pub timestamp: u64,

    /// Which enrolled validators contributed a signature share.
    pub validators: BitMask,

    /// Aggregated Schnorr signature of the bit-flagged validators.
    pub signature: Signature,

    /// Enrollments taking effect at this height, utxo-key ascending.
    pub enrollments: Vec<Enrollment>,

    /// Indices (into the enrolled ordering) of validators the network
    /// agreed saw no reveal from; they are slashed on application.
    pub missing_validators: Vec<u32>,
}

impl BlockHeader {
    /// The header's identity: everything except the bitfield and the
    /// aggregate signature, which accumulate after the fact.
    pub fn hash(&self) -> Hash {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(self.prev_block.as_ref());
        bytes.extend_from_slice(&self.height.to_le_bytes());
        bytes.extend_from_slice(self.merkle_root.as_ref());
        bytes.extend_from_slice(&self.timestamp.to_le_bytes());
        bytes.extend_from_slice(&(self.enrollments.len() as u32).to_le_bytes());
        for enrollment in &self.enrollments {
            bytes.extend_from_slice(enrollment.hash().as_ref());
        }
        bytes.extend_from_slice(&(self.missing_validators.len() as u32).to_le_bytes());
        for index in &self.missing_validators {
            bytes.extend_from_slice(&index.to_le_bytes());
        }
        Hash::digest_with_domain(DOMAIN_BLOCK, &bytes)
    }
}

/// A block: header plus its transactions in canonical (hash) order.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub txs: Vec<Transaction>,
}

impl Block {
    /// Assemble a block at `height` on top of `prev_block`.
    ///
    /// Transactions are sorted into canonical hash order and the merkle
    /// root computed over them; the bitfield and signature start empty.
    pub fn build(
        prev_block: &Hash,
        height: u64,
        timestamp: u64,
        mut txs: Vec<Transaction>,
        enrollments: Vec<Enrollment>,
        missing_validators: Vec<u32>,
        validator_count: usize,
    ) -> Self {
        txs.sort_by_key(Transaction::hash);
        let tx_hashes: Vec<Hash> = txs.iter().map(Transaction::hash).collect();
        Self {
            header: BlockHeader {
                prev_block: *prev_block,
                height,
                merkle_root: merkle_root(&tx_hashes),
                timestamp,
                validators: BitMask::new(validator_count),
                signature: Signature::default(),
                enrollments,
                missing_validators,
            },
            txs,
        }
    }

    pub fn hash(&self) -> Hash {
        self.header.hash()
    }

    pub fn height(&self) -> u64 {
        self.header.height
    }

    /// Structural checks against the parent header.
    pub fn verify_chain(&self, prev_hash: &Hash, prev_height: u64) -> Result<()> {
        if self.header.height != prev_height + 1 {
            return Err(Error::InvalidBlock(format!(
                "height {} does not follow {prev_height}",
                self.header.height
            )));
        }
        if self.header.prev_block != *prev_hash {
            return Err(Error::InvalidBlock("previous hash mismatch".to_string()));
        }
        let tx_hashes: Vec<Hash> = self.txs.iter().map(Transaction::hash).collect();
        if tx_hashes.windows(2).any(|w| w[0] >= w[1]) {
            return Err(Error::InvalidBlock(
                "transactions not in canonical order".to_string(),
            ));
        }
        if merkle_root(&tx_hashes) != self.header.merkle_root {
            return Err(Error::InvalidBlock("merkle root mismatch".to_string()));
        }
        let enroll_keys: Vec<_> = self.header.enrollments.iter().map(|e| e.utxo_key).collect();
        if enroll_keys.windows(2).any(|w| w[0] >= w[1]) {
            return Err(Error::InvalidBlock(
                "enrollments not in utxo-key order".to_string(),
            ));
        }
        Ok(())
    }
}

/// Binary SHA-512 merkle tree; a lone leaf is paired with itself.
pub fn merkle_root(hashes: &[Hash]) -> Hash {
    if hashes.is_empty() {
        return Hash::ZERO;
    }
    let mut level = hashes.to_vec();
    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        for pair in level.chunks(2) {
            let left = &pair[0];
            let right = pair.get(1).unwrap_or(left);
            next.push(Hash::digest_parts(
                DOMAIN_MERKLE,
                &[left.as_ref(), right.as_ref()],
            ));
        }
        level = next;
    }
    level[0]
}
