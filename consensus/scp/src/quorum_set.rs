// Copyright (c) 2024-2025 The Kestrel Foundation

//! Quorum sets: each node's trust structure over other validators.
//!
//! A quorum set is a threshold over a list of validators and inner
//! quorum sets, nested at most two levels deep. The sanity and
//! normalisation passes give every structurally-equal quorum set one
//! canonical byte form, which is what gets hashed and compared across
//! nodes.

use crate::core_types::NodeId;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use std::{cmp::Ordering, collections::BTreeSet};

/// Hard cap on the number of validator leaves in one quorum set.
pub const MAX_VALIDATOR_LEAVES: usize = 1000;

/// Maximum nesting depth for inner quorum sets.
pub const MAX_DEPTH: u32 = 2;

/// A threshold over validators and inner quorum sets.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Serialize, Deserialize, Default)]
pub struct QuorumSet {
    /// How many entries (validators + inner sets) must agree.
    pub threshold: u32,

    /// Validator leaves.
    pub validators: Vec<NodeId>,

    /// Nested quorum sets.
    pub inner_sets: Vec<QuorumSet>,
}

impl QuorumSet {
    pub fn new(threshold: u32, validators: Vec<NodeId>, inner_sets: Vec<QuorumSet>) -> Self {
        Self {
            threshold,
            validators,
            inner_sets,
        }
    }

    /// Flat quorum set over a list of node ids.
    pub fn new_with_node_ids(threshold: u32, node_ids: Vec<NodeId>) -> Self {
        Self::new(threshold, node_ids, Vec::new())
    }

    /// Total number of direct entries.
    pub fn entry_count(&self) -> usize {
        self.validators.len() + self.inner_sets.len()
    }

    /// All validator leaves, recursively.
    pub fn nodes(&self) -> BTreeSet<NodeId> {
        let mut out: BTreeSet<NodeId> = self.validators.iter().copied().collect();
        for inner in &self.inner_sets {
            out.extend(inner.nodes());
        }
        out
    }

    /// Check the structural rules every quorum set must obey.
    ///
    /// With `extra_checks` the threshold must also be at least as large
    /// as the blocking-set size `entries - threshold + 1`, which keeps a
    /// minority from vetoing the majority.
    pub fn sanity_check(&self, extra_checks: bool) -> Result<(), String> {
        let mut known_nodes = BTreeSet::new();
        let mut leaf_count = 0usize;
        self.check_sanity(0, extra_checks, &mut known_nodes, &mut leaf_count)?;
        if leaf_count < 1 {
            return Err("Number of validator nodes is zero".to_string());
        }
        if leaf_count > MAX_VALIDATOR_LEAVES {
            return Err(format!(
                "Number of validator nodes exceeds the limit of {MAX_VALIDATOR_LEAVES}"
            ));
        }
        Ok(())
    }

    fn check_sanity(
        &self,
        depth: u32,
        extra_checks: bool,
        known_nodes: &mut BTreeSet<NodeId>,
        leaf_count: &mut usize,
    ) -> Result<(), String> {
        if depth > MAX_DEPTH {
            return Err(format!(
                "Cannot have sub-quorums with depth exceeding {MAX_DEPTH} levels"
            ));
        }
        if self.threshold < 1 {
            return Err("The threshold for a quorum must equal at least 1".to_string());
        }

        let entries = self.entry_count();
        let blocking_size = entries.saturating_sub(self.threshold as usize) + 1;
        *leaf_count += self.validators.len();

        if self.threshold as usize > entries {
            return Err("The threshold for a quorum exceeds total number of entries".to_string());
        }
        if extra_checks && (self.threshold as usize) < blocking_size {
            return Err("Extra check: the threshold for a quorum is too low".to_string());
        }

        for node in &self.validators {
            if !known_nodes.insert(*node) {
                return Err("A duplicate node was configured within another quorum".to_string());
            }
        }
        for inner in &self.inner_sets {
            inner.check_sanity(depth + 1, extra_checks, known_nodes, leaf_count)?;
        }
        Ok(())
    }

    /// Rewrite the quorum set into its canonical form.
    ///
    /// Optionally removes one node (the usual self-filter), merges
    /// `{t:1, [v]}` inner singletons into the parent validator list,
    /// collapses an outer `{t:1, no validators, one inner}` into the
    /// inner set, and sorts everything.
    pub fn normalize(&mut self, id_to_remove: Option<&NodeId>) {
        self.simplify(id_to_remove);
        self.reorder();
    }

    fn simplify(&mut self, id_to_remove: Option<&NodeId>) {
        if let Some(id) = id_to_remove {
            let before = self.validators.len();
            self.validators.retain(|v| v != id);
            let removed = (before - self.validators.len()) as u32;
            self.threshold = self.threshold.saturating_sub(removed);
        }

        let mut i = 0;
        while i < self.inner_sets.len() {
            self.inner_sets[i].simplify(id_to_remove);
            let inner = &self.inner_sets[i];
            if inner.threshold == 1 && inner.validators.len() == 1 && inner.inner_sets.is_empty() {
                let v = inner.validators[0];
                self.validators.push(v);
                self.inner_sets.remove(i);
            } else {
                i += 1;
            }
        }

        if self.threshold == 1 && self.validators.is_empty() && self.inner_sets.len() == 1 {
            *self = self.inner_sets.pop().expect("checked length");
        }
    }

    fn reorder(&mut self) {
        self.validators.sort();
        for inner in &mut self.inner_sets {
            inner.reorder();
        }
        self.inner_sets.sort_by(Self::structural_cmp);
    }

    /// Lexicographic comparison looking at, in order: validators, inner
    /// sets, threshold.
    fn structural_cmp(left: &QuorumSet, right: &QuorumSet) -> Ordering {
        left.validators
            .cmp(&right.validators)
            .then_with(|| {
                for (l, r) in left.inner_sets.iter().zip(right.inner_sets.iter()) {
                    let c = Self::structural_cmp(l, r);
                    if c != Ordering::Equal {
                        return c;
                    }
                }
                left.inner_sets.len().cmp(&right.inner_sets.len())
            })
            .then_with(|| left.threshold.cmp(&right.threshold))
    }

    /// Canonical encoding used for hashing.
    fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.threshold.to_le_bytes());
        out.extend_from_slice(&(self.validators.len() as u32).to_le_bytes());
        for v in &self.validators {
            out.extend_from_slice(&v.0);
        }
        out.extend_from_slice(&(self.inner_sets.len() as u32).to_le_bytes());
        for inner in &self.inner_sets {
            inner.encode_into(out);
        }
    }

    /// Stable 32-byte identifier of the normalised quorum set.
    pub fn id(&self) -> [u8; 32] {
        let mut normalised = self.clone();
        normalised.normalize(None);
        let mut bytes = Vec::new();
        normalised.encode_into(&mut bytes);
        let digest = Sha512::digest(&bytes);
        let mut id = [0u8; 32];
        id.copy_from_slice(&digest[..32]);
        id
    }

    /// Does `members` satisfy one of this node's quorum slices?
    ///
    /// At least `threshold` entries must be satisfied, where a validator
    /// is satisfied by membership and an inner set recursively.
    pub fn is_quorum_slice(&self, members: &BTreeSet<NodeId>) -> bool {
        let mut satisfied = 0usize;
        for v in &self.validators {
            if members.contains(v) {
                satisfied += 1;
            }
        }
        for inner in &self.inner_sets {
            if inner.is_quorum_slice(members) {
                satisfied += 1;
            }
        }
        satisfied >= self.threshold as usize
    }

    /// Is `members` a blocking set for this quorum set?
    ///
    /// A set blocks when it intersects every slice: at least
    /// `entries - threshold + 1` entries must be blocked.
    pub fn is_blocking_set(&self, members: &BTreeSet<NodeId>) -> bool {
        let entries = self.entry_count();
        if entries == 0 {
            return false;
        }
        let needed = entries - (self.threshold as usize).min(entries) + 1;
        let mut blocked = 0usize;
        for v in &self.validators {
            if members.contains(v) {
                blocked += 1;
            }
        }
        for inner in &self.inner_sets {
            if inner.is_blocking_set(members) {
                blocked += 1;
            }
        }
        blocked >= needed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(byte: u8) -> NodeId {
        NodeId([byte; 32])
    }

    #[test]
    fn sanity_rejects_zero_threshold() {
        let qs = QuorumSet::new(0, vec![node(1)], vec![]);
        assert!(qs.sanity_check(false).is_err());
    }

    #[test]
    fn sanity_rejects_threshold_above_entries() {
        let qs = QuorumSet::new(3, vec![node(1), node(2)], vec![]);
        assert!(qs.sanity_check(false).is_err());
    }

    #[test]
    fn sanity_rejects_duplicates_across_branches() {
        let inner = QuorumSet::new(1, vec![node(1), node(9)], vec![]);
        let qs = QuorumSet::new(2, vec![node(1), node(2)], vec![inner]);
        assert!(qs.sanity_check(false).is_err());
    }

    #[test]
    fn sanity_rejects_depth_three() {
        let level3 = QuorumSet::new(1, vec![node(1)], vec![]);
        let level2 = QuorumSet::new(1, vec![node(2)], vec![level3]);
        let level1 = QuorumSet::new(1, vec![node(3)], vec![level2]);
        let root = QuorumSet::new(1, vec![node(4)], vec![level1]);
        assert!(root.sanity_check(false).is_err());
    }

    #[test]
    fn sanity_extra_checks_blocking_bound() {
        // 1-of-4 fails the blocking-set bound: threshold 1 < 4.
        let qs = QuorumSet::new(1, (1..=4).map(node).collect(), vec![]);
        assert!(qs.sanity_check(false).is_ok());
        assert!(qs.sanity_check(true).is_err());

        // 3-of-4 passes: 3 >= 4 - 3 + 1.
        let qs = QuorumSet::new(3, (1..=4).map(node).collect(), vec![]);
        assert!(qs.sanity_check(true).is_ok());
    }

    #[test]
    fn normalize_removes_node_and_decrements_threshold() {
        let mut qs = QuorumSet::new(3, vec![node(3), node(1), node(2)], vec![]);
        qs.normalize(Some(&node(2)));
        assert_eq!(qs.threshold, 2);
        assert_eq!(qs.validators, vec![node(1), node(3)]);
    }

    #[test]
    fn normalize_collapses_singleton_inner() {
        let inner = QuorumSet::new(1, vec![node(5)], vec![]);
        let mut qs = QuorumSet::new(2, vec![node(1)], vec![inner]);
        qs.normalize(None);
        assert!(qs.inner_sets.is_empty());
        assert_eq!(qs.validators, vec![node(1), node(5)]);
    }

    #[test]
    fn normalize_collapses_singleton_outer() {
        let inner = QuorumSet::new(2, vec![node(1), node(2), node(3)], vec![]);
        let mut qs = QuorumSet::new(1, vec![], vec![inner.clone()]);
        qs.normalize(None);
        assert_eq!(qs, inner);
    }

    #[test]
    fn normalized_sets_share_an_id() {
        let a = QuorumSet::new(2, vec![node(1), node(2), node(3)], vec![]);
        let b = QuorumSet::new(2, vec![node(3), node(1), node(2)], vec![]);
        assert_eq!(a.id(), b.id());

        let c = QuorumSet::new(3, vec![node(1), node(2), node(3)], vec![]);
        assert_ne!(a.id(), c.id());
    }

    #[test]
    fn quorum_slice_and_blocking() {
        let qs = QuorumSet::new(3, (1..=4).map(node).collect(), vec![]);

        let three: BTreeSet<_> = [node(1), node(2), node(3)].into();
        let two: BTreeSet<_> = [node(1), node(2)].into();
        assert!(qs.is_quorum_slice(&three));
        assert!(!qs.is_quorum_slice(&two));

        // Blocking needs entries - threshold + 1 = 2 members.
        assert!(qs.is_blocking_set(&two));
        let one: BTreeSet<_> = [node(4)].into();
        assert!(!qs.is_blocking_set(&one));
    }

    #[test]
    fn nested_quorum_slice() {
        let inner_a = QuorumSet::new(2, vec![node(1), node(2), node(3)], vec![]);
        let inner_b = QuorumSet::new(2, vec![node(4), node(5), node(6)], vec![]);
        let qs = QuorumSet::new(2, vec![], vec![inner_a, inner_b]);

        let members: BTreeSet<_> = [node(1), node(2), node(4), node(5)].into();
        assert!(qs.is_quorum_slice(&members));

        let only_a: BTreeSet<_> = [node(1), node(2), node(3)].into();
        assert!(!qs.is_quorum_slice(&only_a));
    }
}
