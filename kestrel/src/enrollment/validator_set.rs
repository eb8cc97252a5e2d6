// Copyright (c) 2025 Kestrel Foundation

//! The active validator set and its reveal bookkeeping.

use crate::{
    crypto::{Hash, PublicKey},
    enrollment::{Enrollment, PreImage},
    error::{Error, Result},
    transaction::UtxoKey,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Latest revealed pre-image of one validator.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct PreImageInfo {
    pub hash: Hash,
    pub distance: u32,
}

/// One enrolled validator.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct ValidatorInfo {
    pub public_key: PublicKey,
    pub enrolled_height: u64,
    pub cycle_length: u32,
    pub commitment: Hash,
    /// Latest reveal; starts at the commitment (distance 0).
    pub revealed: PreImageInfo,
    /// Accrued stake penalty, settled when the stake unlocks.
    pub penalty: u64,
    /// Slashed validators are excluded from the active set.
    pub slashed: bool,
}

impl ValidatorInfo {
    /// The reveal distance required to be active at `height`.
    pub fn required_distance(&self, height: u64) -> u32 {
        height.saturating_sub(self.enrolled_height + 1) as u32
    }

    /// Active at `height` iff inside the cycle window with a fresh
    /// enough reveal and not slashed.
    pub fn is_active(&self, height: u64) -> bool {
        let start = self.enrolled_height;
        let end = self.enrolled_height + u64::from(self.cycle_length);
        if height <= start || height > end {
            return false;
        }
        if self.slashed {
            return false;
        }
        self.revealed.distance >= self.required_distance(height)
    }

    /// True once the cycle window has passed entirely.
    pub fn expired(&self, height: u64) -> bool {
        height > self.enrolled_height + u64::from(self.cycle_length)
    }
}

/// Mapping from stake utxo-key to validator state, ordered by key.
#[derive(Clone, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct ValidatorSet {
    validators: BTreeMap<UtxoKey, ValidatorInfo>,
    /// Every commitment ever enrolled, by any stake. Re-enrolling one
    /// would let old reveals satisfy the new cycle, and a shared seed
    /// across stakes would leak one validator's chain to another.
    used_commitments: BTreeSet<Hash>,
}

impl ValidatorSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    pub fn get(&self, key: &UtxoKey) -> Option<&ValidatorInfo> {
        self.validators.get(key)
    }

    /// Has any stake ever enrolled with this commitment before?
    pub fn commitment_reused(&self, commitment: &Hash) -> bool {
        self.used_commitments.contains(commitment)
    }

    /// Enroll (or re-enroll) a validator at `height`.
    ///
    /// Re-enrollment replaces the old record; the fresh commitment
    /// counts as the distance-0 reveal.
    pub fn enroll(
        &mut self,
        enrollment: &Enrollment,
        public_key: PublicKey,
        height: u64,
    ) -> Result<()> {
        if self.commitment_reused(&enrollment.commitment) {
            return Err(Error::InvalidEnrollment(format!(
                "stale commitment re-enrolled for {}",
                enrollment.utxo_key
            )));
        }
        self.used_commitments.insert(enrollment.commitment);
        self.validators.insert(
            enrollment.utxo_key,
            ValidatorInfo {
                public_key,
                enrolled_height: height,
                cycle_length: enrollment.cycle_length,
                commitment: enrollment.commitment,
                revealed: PreImageInfo {
                    hash: enrollment.commitment,
                    distance: 0,
                },
                penalty: 0,
                slashed: false,
            },
        );
        debug!(key = %enrollment.utxo_key, height, "validator enrolled");
        Ok(())
    }

    /// Record a reveal. Returns true when it advanced the validator's
    /// state, false for an already-known distance.
    pub fn add_preimage(&mut self, preimage: &PreImage) -> Result<bool> {
        let info = self.validators.get_mut(&preimage.utxo_key).ok_or_else(|| {
            Error::InvalidEnrollment(format!("reveal for unknown validator {}", preimage.utxo_key))
        })?;
        if preimage.distance <= info.revealed.distance {
            return Ok(false);
        }
        if preimage.distance >= info.cycle_length {
            return Err(Error::PreImageMismatch(format!(
                "distance {} beyond cycle {}",
                preimage.distance, info.cycle_length
            )));
        }
        if !preimage.verifies_against(&info.commitment) {
            return Err(Error::PreImageMismatch(format!(
                "reveal for {} does not hash to its commitment",
                preimage.utxo_key
            )));
        }
        info.revealed = PreImageInfo {
            hash: preimage.hash,
            distance: preimage.distance,
        };
        Ok(true)
    }

    /// Validators whose cycle window covers `height` and who are not
    /// slashed, regardless of reveals. This ordering backs the block
    /// bitfield and the fee payout split: it is derivable from chain
    /// state alone, where reveal knowledge depends on gossip timing.
    pub fn enrolled_entries(&self, height: u64) -> Vec<(&UtxoKey, &ValidatorInfo)> {
        self.validators
            .iter()
            .filter(|(_, v)| !v.expired(height) && height > v.enrolled_height && !v.slashed)
            .collect()
    }

    pub fn count_enrolled(&self, height: u64) -> usize {
        self.enrolled_entries(height).len()
    }

    /// Penalties that would settle if `height` were applied now; the
    /// non-mutating preview of [`Self::expire`].
    pub fn expiring_penalties(&self, height: u64) -> Vec<(UtxoKey, u64)> {
        self.validators
            .iter()
            .filter(|(_, v)| v.expired(height) && v.penalty > 0)
            .map(|(k, v)| (*k, v.penalty))
            .collect()
    }

    /// Validators active at `height`, ordered by stake key.
    pub fn active_entries(&self, height: u64) -> Vec<(&UtxoKey, &ValidatorInfo)> {
        self.validators
            .iter()
            .filter(|(_, v)| v.is_active(height))
            .collect()
    }

    pub fn active_keys(&self, height: u64) -> Vec<PublicKey> {
        self.active_entries(height)
            .into_iter()
            .map(|(_, v)| v.public_key)
            .collect()
    }

    pub fn count_active(&self, height: u64) -> usize {
        self.active_entries(height).len()
    }

    /// Index of a validator within the active ordering at `height`.
    pub fn active_index(&self, height: u64, key: &UtxoKey) -> Option<usize> {
        self.active_entries(height)
            .iter()
            .position(|(k, _)| *k == key)
    }

    /// Enrolled validators whose reveal is too old for `height`,
    /// reported by index into the [`Self::enrolled_entries`] ordering
    /// so consensus can agree on them. Already-slashed validators are
    /// not in that ordering and are not re-reported.
    ///
    /// One block of grace: a validator only counts as missing once it
    /// is two reveals behind, so ordinary gossip latency never gets
    /// anyone slashed.
    pub fn missing_reveals(&self, height: u64) -> Vec<u32> {
        self.enrolled_entries(height)
            .into_iter()
            .enumerate()
            .filter(|(_, (_, v))| v.revealed.distance + 1 < v.required_distance(height))
            .map(|(i, _)| i as u32)
            .collect()
    }

    /// Resolve [`Self::enrolled_entries`]-ordering indices back to
    /// stake keys.
    pub fn keys_for_indices(&self, height: u64, indices: &[u32]) -> Vec<UtxoKey> {
        let enrolled = self.enrolled_entries(height);
        indices
            .iter()
            .filter_map(|i| enrolled.get(*i as usize).map(|(key, _)| **key))
            .collect()
    }

    /// Slash a validator: exclude it from the active set and accrue the
    /// stake penalty.
    pub fn slash(&mut self, key: &UtxoKey, penalty: u64) {
        if let Some(info) = self.validators.get_mut(key) {
            if !info.slashed {
                debug!(key = %key, penalty, "validator slashed");
                info.slashed = true;
                info.penalty = info.penalty.saturating_add(penalty);
            }
        }
    }

    /// Drop validators whose cycle has fully passed, returning the
    /// stake penalties to settle against their freeze outputs.
    pub fn expire(&mut self, height: u64) -> Vec<(UtxoKey, u64)> {
        let expired: Vec<UtxoKey> = self
            .validators
            .iter()
            .filter(|(_, v)| v.expired(height))
            .map(|(k, _)| *k)
            .collect();
        let mut penalties = Vec::new();
        for key in expired {
            if let Some(info) = self.validators.remove(&key) {
                if info.penalty > 0 {
                    penalties.push((key, info.penalty));
                }
                debug!(key = %key, height, "validator cycle ended");
            }
        }
        penalties
    }

    /// The quorum shuffle seed for `height`: XOR-fold of the active
    /// validators' latest revealed pre-images.
    pub fn random_seed(&self, height: u64) -> Hash {
        let mut seed = Hash::ZERO;
        for (_, info) in self.active_entries(height) {
            seed.fold(&info.revealed.hash);
        }
        seed
    }
}
