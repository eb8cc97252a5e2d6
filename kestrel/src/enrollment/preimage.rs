// Copyright (c) 2025 Kestrel Foundation

//! Pre-image hash chains.
//!
//! From a random seed `s` the chain is `h[0] = H(s)`,
//! `h[i] = H(h[i-1])`; the validator commits to `h[N-1]` and reveals
//! one step back per block. Whoever knows `h[N-1-k]` at block offset
//! `k` must have known the seed, which proves liveness.

use crate::crypto::Hash;
use serde::{Deserialize, Serialize};

/// A fully materialised pre-image chain.
///
/// The seed is kept so the chain (and the table itself) can be
/// persisted and rebuilt after a crash; reusing a seed across stakes is
/// rejected at enrollment validation.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct PreImageChain {
    seed: Hash,
    hashes: Vec<Hash>,
}

impl PreImageChain {
    /// Build a chain of `length` hashes from `seed`.
    pub fn generate(seed: Hash, length: u32) -> Self {
        assert!(length > 0, "pre-image chain needs at least one link");
        let mut hashes = Vec::with_capacity(length as usize);
        let mut current = seed.rehash();
        hashes.push(current);
        for _ in 1..length {
            current = current.rehash();
            hashes.push(current);
        }
        Self { seed, hashes }
    }

    pub fn seed(&self) -> &Hash {
        &self.seed
    }

    pub fn length(&self) -> u32 {
        self.hashes.len() as u32
    }

    /// The enrollment commitment: the last link `h[N-1]`.
    pub fn commitment(&self) -> Hash {
        *self.hashes.last().expect("chain is never empty")
    }

    /// The reveal for block offset `distance`: `h[N-1-distance]`.
    pub fn at_distance(&self, distance: u32) -> Option<Hash> {
        let n = self.hashes.len() as u32;
        if distance >= n {
            return None;
        }
        Some(self.hashes[(n - 1 - distance) as usize])
    }
}
