// Copyright (c) 2025 Kestrel Foundation

//! The bridge between the ledger and the agreement protocol.

mod driver;
mod timer;

pub use driver::{ConsensusDriver, Envelope};
pub use timer::{TimerKind, TimerSet};

use crate::{crypto::Hash, enrollment::Enrollment};
use serde::{Deserialize, Serialize};
use std::fmt;

const DOMAIN_PAYLOAD: &[u8] = b"kestrel.consensus.payload.v1";

/// What one slot agrees on: a transaction set, the enrollments taking
/// effect, and which validators the network saw no reveal from (so
/// slashing is itself consensus-agreed).
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub struct ConsensusPayload {
    /// Hashes of the transactions, strictly ascending.
    pub tx_hashes: Vec<Hash>,

    /// Enrollments for the block header, utxo-key ascending.
    pub enrollments: Vec<Enrollment>,

    /// Indices into the enrolled-validator ordering whose reveal was
    /// missing for this height.
    pub missing_validators: Vec<u32>,
}

impl ConsensusPayload {
    pub fn new(
        mut tx_hashes: Vec<Hash>,
        mut enrollments: Vec<Enrollment>,
        mut missing_validators: Vec<u32>,
    ) -> Self {
        tx_hashes.sort();
        tx_hashes.dedup();
        enrollments.sort_by_key(|e| e.utxo_key);
        missing_validators.sort_unstable();
        missing_validators.dedup();
        Self {
            tx_hashes,
            enrollments,
            missing_validators,
        }
    }

    /// Fingerprint of just the transaction set; candidate combining
    /// picks the smallest.
    pub fn tx_set_fingerprint(&self) -> Hash {
        let mut bytes = Vec::with_capacity(self.tx_hashes.len() * 64);
        for hash in &self.tx_hashes {
            bytes.extend_from_slice(hash.as_ref());
        }
        Hash::digest_with_domain(DOMAIN_PAYLOAD, &bytes)
    }

    /// Fingerprint of the whole payload, used as the combine tie-break.
    pub fn hash(&self) -> Hash {
        let mut bytes = Vec::new();
        for hash in &self.tx_hashes {
            bytes.extend_from_slice(hash.as_ref());
        }
        for enrollment in &self.enrollments {
            bytes.extend_from_slice(enrollment.hash().as_ref());
        }
        for index in &self.missing_validators {
            bytes.extend_from_slice(&index.to_le_bytes());
        }
        Hash::digest_with_domain(DOMAIN_PAYLOAD, &bytes)
    }

    pub fn is_empty(&self) -> bool {
        self.tx_hashes.is_empty() && self.enrollments.is_empty()
    }
}

impl fmt::Display for ConsensusPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "payload({} txs, {} enrollments, {} missing)",
            self.tx_hashes.len(),
            self.enrollments.len(),
            self.missing_validators.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructor_normalizes() {
        let a = Hash::digest(b"a");
        let b = Hash::digest(b"b");
        let payload = ConsensusPayload::new(vec![b, a, a], vec![], vec![3, 1, 3]);
        assert!(payload.tx_hashes.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(payload.missing_validators, vec![1, 3]);
    }

    #[test]
    fn fingerprint_ignores_missing_list() {
        let a = Hash::digest(b"a");
        let x = ConsensusPayload::new(vec![a], vec![], vec![]);
        let y = ConsensusPayload::new(vec![a], vec![], vec![2]);
        assert_eq!(x.tx_set_fingerprint(), y.tx_set_fingerprint());
        assert_ne!(x.hash(), y.hash());
    }
}
