// Copyright (c) 2025 Kestrel Foundation

//! Quorum construction: shuffle the active validators with the
//! per-height seed, partition into groups and derive one quorum set,
//! then run the sanity and normalisation passes.
//!
//! The shuffle is a Fisher-Yates walk driven by a SHA-512 counter
//! stream of the seed, so any two nodes agreeing on (seed, set,
//! parameters) derive byte-identical normalised quorum sets.

use crate::{
    crypto::Hash,
    error::{Error, Result},
};
use kestrel_consensus_scp::{NodeId, QuorumSet};

const DOMAIN_SHUFFLE: &[u8] = b"kestrel.quorum.shuffle.v1";

/// A keyed stream of u64s: `H(seed ‖ counter)` truncated.
struct SeedStream {
    seed: Hash,
    counter: u64,
}

impl SeedStream {
    fn new(seed: &Hash) -> Self {
        Self {
            seed: *seed,
            counter: 0,
        }
    }

    fn next_u64(&mut self) -> u64 {
        let digest = Hash::digest_parts(
            DOMAIN_SHUFFLE,
            &[self.seed.as_ref(), &self.counter.to_le_bytes()],
        );
        self.counter += 1;
        u64::from_le_bytes(digest.as_ref()[..8].try_into().expect("eight bytes"))
    }

    /// Uniform-enough index in `[0, bound)`; determinism is what
    /// matters here, the modulo bias over 2^64 is negligible.
    fn next_index(&mut self, bound: usize) -> usize {
        (self.next_u64() % bound as u64) as usize
    }
}

/// Fisher-Yates with a keyed stream.
fn shuffle(nodes: &mut [NodeId], seed: &Hash) {
    let mut stream = SeedStream::new(seed);
    for i in (1..nodes.len()).rev() {
        let j = stream.next_index(i + 1);
        nodes.swap(i, j);
    }
}

fn group_threshold(size: usize, threshold_pct: u8) -> u32 {
    let pct = u64::from(threshold_pct.min(100));
    let threshold = (pct * size as u64).div_ceil(100);
    threshold.max(1) as u32
}

/// Derive the quorum set for the given active validator list.
///
/// `validators` must be the active set in its canonical (stake-key)
/// order; `seed` is the XOR-fold of the height's revealed pre-images.
/// Fails with a configuration error if the result cannot pass the
/// strict sanity check.
pub fn build_quorum_set(
    validators: &[NodeId],
    seed: &Hash,
    max_quorum_nodes: usize,
    threshold_pct: u8,
) -> Result<QuorumSet> {
    if validators.is_empty() {
        return Err(Error::QuorumSetInsane(
            "no active validators to build a quorum from".to_string(),
        ));
    }
    let max_group = max_quorum_nodes.max(1);

    let mut shuffled = validators.to_vec();
    shuffle(&mut shuffled, seed);

    let mut quorum_set = if shuffled.len() <= max_group {
        QuorumSet::new_with_node_ids(group_threshold(shuffled.len(), threshold_pct), shuffled)
    } else {
        let groups: Vec<QuorumSet> = shuffled
            .chunks(max_group)
            .map(|group| {
                QuorumSet::new_with_node_ids(
                    group_threshold(group.len(), threshold_pct),
                    group.to_vec(),
                )
            })
            .collect();
        let top_threshold = group_threshold(groups.len(), threshold_pct);
        QuorumSet::new(top_threshold, vec![], groups)
    };

    // Strict mode: a threshold that a minority could block is a
    // configuration error, not something to limp along with.
    quorum_set
        .sanity_check(true)
        .map_err(Error::QuorumSetInsane)?;
    quorum_set.normalize(None);
    Ok(quorum_set)
}
