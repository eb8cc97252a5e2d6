// Copyright (c) 2024-2025 The Kestrel Foundation

//! Protocol messages exchanged between nodes.
//!
//! Each node re-broadcasts a single message summarising its current
//! state for the slot; a newer message from the same sender supersedes
//! the older one. Messages carry the sender's quorum set so receivers
//! can evaluate transitive quorums without a directory service.

use crate::{
    ballot::Ballot,
    core_types::{NodeId, SlotIndex, Value},
    quorum_set::QuorumSet,
};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeSet, fmt};

/// Nomination state: the values this node votes for and has accepted.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct NominatePayload<V: Value> {
    pub voted: BTreeSet<V>,
    pub accepted: BTreeSet<V>,
}

/// Ballot-phase statement: voting to prepare `ballot`, optionally
/// carrying the highest ballot this node has accepted as prepared.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct PreparePayload<V: Value> {
    pub ballot: Ballot<V>,
    pub prepared: Option<Ballot<V>>,
}

/// The node accepts `commit(ballot)`.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct CommitPayload<V: Value> {
    pub ballot: Ballot<V>,
}

/// The node has confirmed `commit(ballot)`: the slot is decided.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct ExternalizePayload<V: Value> {
    pub commit: Ballot<V>,
}

/// Which phase the sender is in, with the phase's state.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(bound = "")]
pub enum Topic<V: Value> {
    Nominate(NominatePayload<V>),
    Prepare(PreparePayload<V>),
    Commit(CommitPayload<V>),
    Externalize(ExternalizePayload<V>),
}

impl<V: Value> Topic<V> {
    /// Phase rank used to decide whether one message supersedes another.
    pub fn rank(&self) -> u8 {
        match self {
            Topic::Nominate(_) => 0,
            Topic::Prepare(_) => 1,
            Topic::Commit(_) => 2,
            Topic::Externalize(_) => 3,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Topic::Nominate(_) => "nominate",
            Topic::Prepare(_) => "prepare",
            Topic::Commit(_) => "commit",
            Topic::Externalize(_) => "externalize",
        }
    }
}

/// A statement from one node about one slot.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct Msg<V: Value> {
    pub sender: NodeId,
    pub slot_index: SlotIndex,
    pub quorum_set: QuorumSet,
    pub topic: Topic<V>,
}

impl<V: Value> Msg<V> {
    pub fn new(sender: NodeId, slot_index: SlotIndex, quorum_set: QuorumSet, topic: Topic<V>) -> Self {
        Self {
            sender,
            slot_index,
            quorum_set,
            topic,
        }
    }

    /// Does this message supersede `older` from the same sender?
    ///
    /// Later phases win; within a phase, larger state wins.
    pub fn supersedes(&self, older: &Msg<V>) -> bool {
        if self.slot_index != older.slot_index {
            return self.slot_index > older.slot_index;
        }
        let (new_rank, old_rank) = (self.topic.rank(), older.topic.rank());
        if new_rank != old_rank {
            return new_rank > old_rank;
        }
        match (&self.topic, &older.topic) {
            (Topic::Nominate(new), Topic::Nominate(old)) => {
                new.voted.len() + new.accepted.len() > old.voted.len() + old.accepted.len()
                    || (new.accepted.len() > old.accepted.len())
            }
            (Topic::Prepare(new), Topic::Prepare(old)) => {
                new.ballot > old.ballot || new.prepared > old.prepared
            }
            (Topic::Commit(new), Topic::Commit(old)) => new.ballot > old.ballot,
            (Topic::Externalize(_), Topic::Externalize(_)) => false,
            _ => false,
        }
    }

    /// The values this message votes to nominate or has accepted
    /// nominated, if it is a nomination statement.
    pub fn nominated_values(&self) -> Option<(&BTreeSet<V>, &BTreeSet<V>)> {
        match &self.topic {
            Topic::Nominate(payload) => Some((&payload.voted, &payload.accepted)),
            _ => None,
        }
    }
}

impl<V: Value> fmt::Display for Msg<V> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}@{} {}",
            self.sender,
            self.slot_index,
            self.topic.name()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(byte: u8) -> NodeId {
        NodeId([byte; 32])
    }

    fn qs() -> QuorumSet {
        QuorumSet::new_with_node_ids(1, vec![node(1)])
    }

    fn nominate(voted: &[u32], accepted: &[u32]) -> Msg<u32> {
        Msg::new(
            node(1),
            5,
            qs(),
            Topic::Nominate(NominatePayload {
                voted: voted.iter().copied().collect(),
                accepted: accepted.iter().copied().collect(),
            }),
        )
    }

    #[test]
    fn later_phase_supersedes() {
        let nom = nominate(&[1], &[]);
        let prep = Msg::new(
            node(1),
            5,
            qs(),
            Topic::Prepare(PreparePayload {
                ballot: Ballot::new(1, &[1u32]),
                prepared: None,
            }),
        );
        assert!(prep.supersedes(&nom));
        assert!(!nom.supersedes(&prep));
    }

    #[test]
    fn bigger_nomination_supersedes() {
        let small = nominate(&[1], &[]);
        let big = nominate(&[1, 2], &[]);
        assert!(big.supersedes(&small));
        assert!(!small.supersedes(&big));
    }

    #[test]
    fn higher_ballot_supersedes() {
        let low = Msg::new(
            node(1),
            5,
            qs(),
            Topic::Prepare(PreparePayload {
                ballot: Ballot::new(1, &[7u32]),
                prepared: None,
            }),
        );
        let high = Msg::new(
            node(1),
            5,
            qs(),
            Topic::Prepare(PreparePayload {
                ballot: Ballot::new(2, &[7u32]),
                prepared: None,
            }),
        );
        assert!(high.supersedes(&low));
    }
}
