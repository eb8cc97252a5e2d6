// Copyright (c) 2025 Kestrel Foundation

//! The enrollment manager: pending-enrollment pool, this node's own
//! pre-image chain, re-enrollment and the reveal lifecycle.

use crate::{
    config::MIN_FREEZE_AMOUNT,
    crypto::{Hash, KeyPair, PublicKey},
    enrollment::{Enrollment, PreImage, PreImageChain, ValidatorSet},
    error::{Error, Result},
    transaction::{Lock, TxType, Utxo, UtxoKey},
};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// This node's persisted enrollment state: the seed makes the chain
/// recoverable after a crash, so a restart never reuses pre-images.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct NodeEnrollData {
    pub stake_utxo: UtxoKey,
    pub chain: PreImageChain,
    pub pending_chain: Option<PreImageChain>,
}

/// Validator lifecycle management.
pub struct EnrollmentManager {
    cycle_length: u32,
    key_pair: KeyPair,

    /// Our stake, if this node is (or intends to be) a validator.
    stake_utxo: Option<UtxoKey>,
    /// The chain behind our current enrollment.
    chain: Option<PreImageChain>,
    /// The chain behind a submitted but not yet externalized
    /// re-enrollment.
    pending_chain: Option<PreImageChain>,

    /// Admitted, not-yet-externalized enrollments, utxo-key ascending.
    pool: BTreeMap<UtxoKey, Enrollment>,

    /// The enrolled validator set.
    pub validators: ValidatorSet,
}

impl EnrollmentManager {
    pub fn new(key_pair: KeyPair, cycle_length: u32) -> Self {
        Self {
            cycle_length,
            key_pair,
            stake_utxo: None,
            chain: None,
            pending_chain: None,
            pool: BTreeMap::new(),
            validators: ValidatorSet::new(),
        }
    }

    pub fn cycle_length(&self) -> u32 {
        self.cycle_length
    }

    pub fn stake_utxo(&self) -> Option<&UtxoKey> {
        self.stake_utxo.as_ref()
    }

    pub fn public_key(&self) -> PublicKey {
        self.key_pair.public()
    }

    /// Restore persisted enrollment state.
    pub fn restore(&mut self, data: NodeEnrollData) {
        self.stake_utxo = Some(data.stake_utxo);
        self.chain = Some(data.chain);
        self.pending_chain = data.pending_chain;
    }

    /// Snapshot for persistence.
    pub fn enroll_data(&self) -> Option<NodeEnrollData> {
        Some(NodeEnrollData {
            stake_utxo: self.stake_utxo?,
            chain: self.chain.clone()?,
            pending_chain: self.pending_chain.clone(),
        })
    }

    /// Adopt a chain generated outside the manager (genesis setup).
    pub fn adopt_chain(&mut self, stake_utxo: UtxoKey, chain: PreImageChain) {
        self.stake_utxo = Some(stake_utxo);
        self.chain = Some(chain);
    }

    /// Produce a fresh enrollment for our stake with a brand-new seed.
    pub fn create_enrollment(&mut self, stake_utxo: UtxoKey) -> Result<Enrollment> {
        let mut seed_bytes = [0u8; 64];
        rand::rngs::OsRng.fill_bytes(&mut seed_bytes);
        let seed = Hash::digest_with_domain(b"kestrel.enroll.seed.v1", &seed_bytes);
        self.create_enrollment_with_seed(stake_utxo, seed)
    }

    /// Deterministic-seed variant, used for genesis enrollments.
    pub fn create_enrollment_with_seed(
        &mut self,
        stake_utxo: UtxoKey,
        seed: Hash,
    ) -> Result<Enrollment> {
        let chain = PreImageChain::generate(seed, self.cycle_length);
        let enrollment = Enrollment::sign(
            &self.key_pair,
            stake_utxo,
            chain.commitment(),
            self.cycle_length,
        );
        self.stake_utxo = Some(stake_utxo);
        if self.chain.is_some() {
            self.pending_chain = Some(chain);
        } else {
            self.chain = Some(chain);
        }
        info!(stake = %stake_utxo, "created enrollment");
        Ok(enrollment)
    }

    /// Full admission validation for an enrollment seen at `tip_height`.
    pub fn validate_enrollment<F>(
        &self,
        tip_height: u64,
        enrollment: &Enrollment,
        utxo_lookup: F,
    ) -> Result<PublicKey>
    where
        F: Fn(&UtxoKey) -> Option<Utxo>,
    {
        if enrollment.cycle_length != self.cycle_length {
            return Err(Error::InvalidEnrollment(format!(
                "cycle length {} does not match protocol ({})",
                enrollment.cycle_length, self.cycle_length
            )));
        }

        let utxo = utxo_lookup(&enrollment.utxo_key).ok_or_else(|| {
            Error::InvalidEnrollment(format!("stake utxo {} not found", enrollment.utxo_key))
        })?;
        if utxo.tx_type != TxType::Freeze {
            return Err(Error::InvalidEnrollment(
                "stake utxo is not a freeze output".to_string(),
            ));
        }
        if utxo.output.amount < MIN_FREEZE_AMOUNT {
            return Err(Error::InvalidEnrollment(format!(
                "stake {} below minimum {MIN_FREEZE_AMOUNT}",
                utxo.output.amount
            )));
        }
        let staker = match utxo.output.lock {
            Lock::Key(public) => public,
            _ => {
                return Err(Error::InvalidEnrollment(
                    "stake utxo must be locked to a plain key".to_string(),
                ))
            }
        };
        if !enrollment.verify(&staker) {
            return Err(Error::InvalidEnrollment(
                "signature does not verify against the staker key".to_string(),
            ));
        }

        // A staker mid-cycle may not enroll again, except at the exact
        // cycle boundary, which is how renewal works.
        if let Some(info) = self.validators.get(&enrollment.utxo_key) {
            let cycle_end = info.enrolled_height + u64::from(info.cycle_length);
            if tip_height + 1 < cycle_end {
                return Err(Error::InvalidEnrollment(format!(
                    "staker {} still active until height {cycle_end}",
                    enrollment.utxo_key
                )));
            }
        }
        if self.validators.commitment_reused(&enrollment.commitment) {
            return Err(Error::InvalidEnrollment(format!(
                "stale commitment re-enrolled for {}",
                enrollment.utxo_key
            )));
        }
        Ok(staker)
    }

    /// Admit an enrollment into the pending pool.
    pub fn add_enrollment<F>(
        &mut self,
        tip_height: u64,
        enrollment: Enrollment,
        utxo_lookup: F,
    ) -> Result<()>
    where
        F: Fn(&UtxoKey) -> Option<Utxo>,
    {
        self.validate_enrollment(tip_height, &enrollment, utxo_lookup)?;
        if self.pool.contains_key(&enrollment.utxo_key) {
            debug!(key = %enrollment.utxo_key, "enrollment already pooled");
            return Ok(());
        }
        debug!(key = %enrollment.utxo_key, "enrollment admitted to pool");
        self.pool.insert(enrollment.utxo_key, enrollment);
        Ok(())
    }

    /// Pending enrollments in strictly ascending utxo-key order, capped
    /// at `limit` per block.
    pub fn unregistered_enrollments(&self, limit: usize) -> Vec<Enrollment> {
        self.pool.values().take(limit).cloned().collect()
    }

    pub fn pool_len(&self) -> usize {
        self.pool.len()
    }

    pub fn get_pooled(&self, key: &UtxoKey) -> Option<&Enrollment> {
        self.pool.get(key)
    }

    /// Apply an externalized block's enrollments and expiry.
    ///
    /// Returns the stake penalties of validators whose cycle ended at
    /// this height, for settlement against their freeze outputs.
    pub fn on_block_externalized(
        &mut self,
        height: u64,
        enrollments: &[Enrollment],
        stakers: &[PublicKey],
    ) -> Result<Vec<(UtxoKey, u64)>> {
        for (enrollment, staker) in enrollments.iter().zip(stakers) {
            self.validators.enroll(enrollment, *staker, height)?;
            self.pool.remove(&enrollment.utxo_key);
            if Some(enrollment.utxo_key) == self.stake_utxo {
                if let Some(chain) = self.pending_chain.take() {
                    self.chain = Some(chain);
                }
            }
        }
        Ok(self.validators.expire(height))
    }

    /// Our reveal for `height`, if we are enrolled and have one to give.
    pub fn reveal_for(&self, height: u64) -> Option<PreImage> {
        let stake = self.stake_utxo?;
        let info = self.validators.get(&stake)?;
        let chain = self.chain.as_ref()?;
        if chain.commitment() != info.commitment {
            // The set has rolled to a newer enrollment than our chain;
            // nothing sensible to reveal.
            warn!("local chain does not match enrolled commitment");
            return None;
        }
        let distance = height.saturating_sub(info.enrolled_height) as u32;
        let hash = chain.at_distance(distance)?;
        Some(PreImage {
            utxo_key: stake,
            hash,
            distance,
        })
    }

    /// Does our cycle end at `tip_height + 1`?
    pub fn cycle_ending(&self, tip_height: u64) -> bool {
        let Some(stake) = self.stake_utxo else {
            return false;
        };
        let Some(info) = self.validators.get(&stake) else {
            return false;
        };
        info.enrolled_height + u64::from(info.cycle_length) == tip_height + 1
    }
}
