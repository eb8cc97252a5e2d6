// Copyright (c) 2025 Kestrel Foundation

//! Validator enrollment: stake-backed admission, pre-image chains,
//! reveal tracking, re-enrollment and slashing.

mod manager;
mod preimage;
mod validator_set;

pub use manager::{EnrollmentManager, NodeEnrollData};
pub use preimage::PreImageChain;
pub use validator_set::{PreImageInfo, ValidatorInfo, ValidatorSet};

use crate::{
    crypto::{self, Hash, KeyPair, PublicKey, Signature},
    transaction::UtxoKey,
};
use serde::{Deserialize, Serialize};
use std::fmt;

const DOMAIN_ENROLLMENT: &[u8] = b"kestrel.enroll.v1";

/// A request to become a validator, staked by a frozen output.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub struct Enrollment {
    /// Key of the freeze output backing this validator.
    pub utxo_key: UtxoKey,

    /// Final pre-image of the hash chain: `h[N-1]`.
    pub commitment: Hash,

    /// Chain length `N`: how many blocks the enrollment is valid for.
    pub cycle_length: u32,

    /// Staker's signature binding the fields above.
    pub signature: Signature,
}

impl Enrollment {
    fn signing_bytes(utxo_key: &UtxoKey, commitment: &Hash, cycle_length: u32) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(64 + 64 + 4);
        bytes.extend_from_slice(utxo_key.as_ref());
        bytes.extend_from_slice(commitment.as_ref());
        bytes.extend_from_slice(&cycle_length.to_le_bytes());
        bytes
    }

    /// Create and sign an enrollment with the staker's key.
    pub fn sign(
        key_pair: &KeyPair,
        utxo_key: UtxoKey,
        commitment: Hash,
        cycle_length: u32,
    ) -> Self {
        let bytes = Self::signing_bytes(&utxo_key, &commitment, cycle_length);
        let digest = Hash::digest_with_domain(DOMAIN_ENROLLMENT, &bytes);
        Self {
            utxo_key,
            commitment,
            cycle_length,
            signature: key_pair.sign(digest.as_ref()),
        }
    }

    /// Verify the signature against the staker's key.
    pub fn verify(&self, staker: &PublicKey) -> bool {
        let bytes = Self::signing_bytes(&self.utxo_key, &self.commitment, self.cycle_length);
        let digest = Hash::digest_with_domain(DOMAIN_ENROLLMENT, &bytes);
        crypto::verify(staker, digest.as_ref(), &self.signature)
    }

    pub fn hash(&self) -> Hash {
        let mut bytes = Self::signing_bytes(&self.utxo_key, &self.commitment, self.cycle_length);
        bytes.extend_from_slice(&self.signature.r);
        bytes.extend_from_slice(&self.signature.s);
        Hash::digest_with_domain(DOMAIN_ENROLLMENT, &bytes)
    }
}

impl fmt::Display for Enrollment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "enrollment {} (cycle {})",
            self.utxo_key, self.cycle_length
        )
    }
}

/// A revealed link of a validator's pre-image chain.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct PreImage {
    /// Which validator (by stake utxo) this reveal belongs to.
    pub utxo_key: UtxoKey,

    /// The revealed hash `h[N-1-distance]`.
    pub hash: Hash,

    /// Blocks since enrollment this reveal covers.
    pub distance: u32,
}

impl PreImage {
    /// Check `hash^distance(revealed) == commitment`.
    pub fn verifies_against(&self, commitment: &Hash) -> bool {
        let mut current = self.hash;
        for _ in 0..self.distance {
            current = current.rehash();
        }
        current == *commitment
    }
}
