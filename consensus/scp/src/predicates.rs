// Copyright (c) 2024-2025 The Kestrel Foundation

//! Federated voting predicates.
//!
//! Agreement is established over dynamic node sets: a statement is
//! *accepted* once a quorum votes for it or a blocking set accepts it,
//! and *confirmed* once a quorum accepts it. The quorum search is a
//! greatest-fixpoint pruning over the advertised quorum sets.

use crate::{core_types::NodeId, quorum_set::QuorumSet};
use std::collections::BTreeSet;

/// Find whether `candidates` contains a quorum including `local_id`.
///
/// Starting from every candidate node, repeatedly discard nodes whose
/// own quorum set is not satisfied by the survivors. What remains (if
/// anything that still satisfies the local quorum set) is a quorum.
pub fn contains_quorum<F>(
    local_id: &NodeId,
    local_quorum_set: &QuorumSet,
    candidates: &BTreeSet<NodeId>,
    quorum_set_of: F,
) -> bool
where
    F: Fn(&NodeId) -> Option<QuorumSet>,
{
    if !candidates.contains(local_id) {
        return false;
    }

    let mut members = candidates.clone();
    loop {
        let mut pruned = false;
        let snapshot: Vec<NodeId> = members.iter().copied().collect();
        for node in snapshot {
            let satisfied = if node == *local_id {
                local_quorum_set.is_quorum_slice(&members)
            } else {
                match quorum_set_of(&node) {
                    Some(qs) => qs.is_quorum_slice(&members),
                    // A node whose trust structure we have never seen
                    // cannot contribute to a quorum.
                    None => false,
                }
            };
            if !satisfied {
                members.remove(&node);
                pruned = true;
            }
        }
        if !pruned {
            break;
        }
    }

    members.contains(local_id) && local_quorum_set.is_quorum_slice(&members)
}

/// Is `nodes` a blocking set for the local quorum set?
pub fn is_blocking(local_quorum_set: &QuorumSet, nodes: &BTreeSet<NodeId>) -> bool {
    local_quorum_set.is_blocking_set(nodes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(byte: u8) -> NodeId {
        NodeId([byte; 32])
    }

    /// A symmetric mesh: everyone trusts k of the same n nodes.
    fn mesh(n: u8, k: u32) -> (Vec<NodeId>, QuorumSet) {
        let ids: Vec<NodeId> = (1..=n).map(node).collect();
        let qs = QuorumSet::new_with_node_ids(k, ids.clone());
        (ids, qs)
    }

    #[test]
    fn mesh_quorum_found() {
        let (ids, qs) = mesh(6, 5);
        let five: BTreeSet<NodeId> = ids[..5].iter().copied().collect();
        let lookup = |_: &NodeId| Some(qs.clone());
        assert!(contains_quorum(&ids[0], &qs, &five, lookup));
    }

    #[test]
    fn mesh_quorum_too_small() {
        let (ids, qs) = mesh(6, 5);
        let four: BTreeSet<NodeId> = ids[..4].iter().copied().collect();
        let lookup = |_: &NodeId| Some(qs.clone());
        assert!(!contains_quorum(&ids[0], &qs, &four, lookup));
    }

    #[test]
    fn unknown_quorum_sets_prune_out() {
        let (ids, qs) = mesh(4, 3);
        let all: BTreeSet<NodeId> = ids.iter().copied().collect();
        // Nobody else's quorum set is known: only the local node
        // survives the pruning, which cannot satisfy a 3-threshold.
        let lookup = |_: &NodeId| None;
        assert!(!contains_quorum(&ids[0], &qs, &all, lookup));
    }

    #[test]
    fn local_node_must_be_candidate() {
        let (ids, qs) = mesh(4, 3);
        let others: BTreeSet<NodeId> = ids[1..].iter().copied().collect();
        let lookup = |_: &NodeId| Some(qs.clone());
        assert!(!contains_quorum(&ids[0], &qs, &others, lookup));
    }
}
