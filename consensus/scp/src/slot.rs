// Copyright (c) 2024-2025 The Kestrel Foundation

//! Per-slot protocol state machine.
//!
//! A slot moves through nomination and balloting. Nomination is
//! federated voting over individual values: a value is accepted once a
//! quorum votes for it or a blocking set accepts it, and confirmed once
//! a quorum accepts it. Confirmed candidates are merged by the
//! driver-supplied combine function into a ballot, which then runs
//! through prepare, commit and externalize with the same federated
//! accept/confirm rules.

use crate::{
    ballot::Ballot,
    core_types::{NodeId, SlotIndex, Value},
    error::{ScpError, ScpResult},
    msg::{CommitPayload, ExternalizePayload, Msg, NominatePayload, PreparePayload, Topic},
    predicates::{contains_quorum, is_blocking},
    quorum_set::QuorumSet,
};
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::{debug, trace, warn};

/// Decides whether a value may be voted for at all.
pub type ValidityFn<V> = Arc<dyn Fn(&V) -> Result<(), String> + Send + Sync>;

/// Merges confirmed nomination candidates into the ballot value set.
pub type CombineFn<V> = Arc<dyn Fn(&[V]) -> Result<Vec<V>, String> + Send + Sync>;

/// Round back-off is linear in the round number, capped here.
/// With a one-second timebase the cap is thirty minutes.
pub const MAX_TIMEOUT_ROUNDS: u32 = 30 * 60;

/// Linear round timeout: `min(round, cap)` timebase units.
pub fn compute_timeout(round: u32, timebase: Duration) -> Duration {
    timebase * round.clamp(1, MAX_TIMEOUT_ROUNDS)
}

/// State for a single consensus slot.
pub struct Slot<V: Value> {
    slot_index: SlotIndex,
    local_id: NodeId,
    local_quorum_set: QuorumSet,
    validity_fn: ValidityFn<V>,
    combine_fn: CombineFn<V>,

    /// Latest message per peer; older statements are superseded.
    msgs: BTreeMap<NodeId, Msg<V>>,

    /// Nomination: what we vote for, have accepted, have confirmed.
    voted: BTreeSet<V>,
    accepted_nominated: BTreeSet<V>,
    confirmed_nominated: BTreeSet<V>,

    /// Ballot phase.
    ballot: Option<Ballot<V>>,
    prepared: Option<Ballot<V>>,
    confirmed_prepared: Option<Ballot<V>>,
    accepted_commit: Option<Ballot<V>>,
    externalized: Option<Vec<V>>,

    round: u32,
    timebase: Duration,
    deadline: Option<Instant>,
}

/// Snapshot used to detect state changes worth re-broadcasting.
#[derive(PartialEq, Eq)]
struct StateDigest {
    voted: usize,
    accepted: usize,
    confirmed: usize,
    ballot: bool,
    prepared: bool,
    confirmed_prepared: bool,
    committed: bool,
    externalized: bool,
}

impl<V: Value> Slot<V> {
    pub fn new(
        slot_index: SlotIndex,
        local_id: NodeId,
        local_quorum_set: QuorumSet,
        validity_fn: ValidityFn<V>,
        combine_fn: CombineFn<V>,
        timebase: Duration,
    ) -> Self {
        Self {
            slot_index,
            local_id,
            local_quorum_set,
            validity_fn,
            combine_fn,
            msgs: BTreeMap::new(),
            voted: BTreeSet::new(),
            accepted_nominated: BTreeSet::new(),
            confirmed_nominated: BTreeSet::new(),
            ballot: None,
            prepared: None,
            confirmed_prepared: None,
            accepted_commit: None,
            externalized: None,
            round: 0,
            timebase,
            deadline: None,
        }
    }

    pub fn slot_index(&self) -> SlotIndex {
        self.slot_index
    }

    /// Adopt a new round timebase; applies to deadlines set after this.
    pub fn sync_timebase(&mut self, timebase: Duration) {
        self.timebase = timebase;
    }

    pub fn externalized_values(&self) -> Option<Vec<V>> {
        self.externalized.clone()
    }

    /// Vote to nominate `values`. Invalid values are dropped silently.
    pub fn propose_values(&mut self, values: BTreeSet<V>) -> ScpResult<Option<Msg<V>>> {
        if self.externalized.is_some() {
            return Ok(None);
        }
        let mut grew = false;
        for v in values {
            if (self.validity_fn)(&v).is_ok() && self.voted.insert(v) {
                grew = true;
            }
        }
        if self.deadline.is_none() {
            self.round = 1;
            self.deadline = Some(Instant::now() + compute_timeout(self.round, self.timebase));
        }
        let out = self.update();
        if out.is_none() && grew {
            return Ok(Some(self.current_msg()));
        }
        Ok(out.map(|()| self.current_msg()))
    }

    /// Feed a peer message into the slot.
    pub fn handle_message(&mut self, msg: &Msg<V>) -> ScpResult<Option<Msg<V>>> {
        if msg.slot_index != self.slot_index {
            return Err(ScpError::InvalidSlotState(format!(
                "message for slot {} fed to slot {}",
                msg.slot_index, self.slot_index
            )));
        }
        if msg.sender == self.local_id {
            return Ok(None);
        }
        msg.quorum_set
            .sanity_check(false)
            .map_err(ScpError::InsaneQuorumSet)?;
        if let Topic::Prepare(p) = &msg.topic {
            if !p.ballot.is_values_sorted() {
                return Err(ScpError::InvalidBallot(
                    "ballot values not in canonical order".to_string(),
                ));
            }
        }

        match self.msgs.get(&msg.sender) {
            Some(existing) if !msg.supersedes(existing) => {
                trace!(sender = %msg.sender, "stale message ignored");
                return Ok(None);
            }
            _ => {
                self.msgs.insert(msg.sender, msg.clone());
            }
        }

        Ok(self.update().map(|()| self.current_msg()))
    }

    /// Fire the round timer if due, returning a re-broadcast.
    pub fn process_timeout(&mut self, now: Instant) -> Option<Msg<V>> {
        if self.externalized.is_some() {
            self.deadline = None;
            return None;
        }
        let deadline = self.deadline?;
        if now < deadline {
            return None;
        }
        self.round += 1;
        self.deadline = Some(now + compute_timeout(self.round, self.timebase));
        debug!(slot = self.slot_index, round = self.round, "round timeout");

        // A timed-out ballot that never got prepared may widen to pick
        // up candidates confirmed since it was formed.
        if self.confirmed_prepared.is_none() && !self.confirmed_nominated.is_empty() {
            self.rebuild_ballot();
        }
        if let Some(ballot) = &mut self.ballot {
            ballot.counter = self.round.max(ballot.counter + 1);
        }
        self.update();
        Some(self.current_msg())
    }

    /// Re-evaluate the federated voting state after any input.
    /// Returns `Some(())` when the externally visible state changed.
    fn update(&mut self) -> Option<()> {
        let before = self.digest();
        self.step_nomination();
        self.step_ballot();
        let after = self.digest();
        (before != after).then_some(())
    }

    fn digest(&self) -> StateDigest {
        StateDigest {
            voted: self.voted.len(),
            accepted: self.accepted_nominated.len(),
            confirmed: self.confirmed_nominated.len(),
            ballot: self.ballot.is_some(),
            prepared: self.prepared.is_some(),
            confirmed_prepared: self.confirmed_prepared.is_some(),
            committed: self.accepted_commit.is_some(),
            externalized: self.externalized.is_some(),
        }
    }

    fn quorum_set_of(&self, node: &NodeId) -> Option<QuorumSet> {
        self.msgs.get(node).map(|m| m.quorum_set.clone())
    }

    // --- nomination -----------------------------------------------------

    fn step_nomination(&mut self) {
        // Echo every valid value any peer nominates. Nomination is
        // permissive; the combine function is what narrows the result.
        let mut seen: BTreeSet<V> = BTreeSet::new();
        for msg in self.msgs.values() {
            if let Some((voted, accepted)) = msg.nominated_values() {
                seen.extend(voted.iter().cloned());
                seen.extend(accepted.iter().cloned());
            }
        }
        if self.ballot.is_none() {
            for v in &seen {
                if !self.voted.contains(v) && (self.validity_fn)(v).is_ok() {
                    self.voted.insert(v.clone());
                }
            }
        }
        seen.extend(self.voted.iter().cloned());

        for v in seen {
            if !self.accepted_nominated.contains(&v) {
                let mut accepters = self.nomination_supporters(&v, true);
                accepters.remove(&self.local_id);
                let accepted = if is_blocking(&self.local_quorum_set, &accepters) {
                    true
                } else {
                    let mut voters = self.nomination_supporters(&v, false);
                    if self.voted.contains(&v) {
                        voters.insert(self.local_id);
                    }
                    contains_quorum(&self.local_id, &self.local_quorum_set, &voters, |n| {
                        self.quorum_set_of(n)
                    })
                };
                if accepted && (self.validity_fn)(&v).is_ok() {
                    self.voted.insert(v.clone());
                    self.accepted_nominated.insert(v.clone());
                }
            }

            if self.accepted_nominated.contains(&v) && !self.confirmed_nominated.contains(&v) {
                let mut accepters = self.nomination_supporters(&v, true);
                accepters.insert(self.local_id);
                if contains_quorum(&self.local_id, &self.local_quorum_set, &accepters, |n| {
                    self.quorum_set_of(n)
                }) {
                    self.confirmed_nominated.insert(v.clone());
                }
            }
        }
    }

    /// Peers supporting nomination of `v`: accepted-only, or
    /// voted-or-accepted.
    fn nomination_supporters(&self, v: &V, accepted_only: bool) -> BTreeSet<NodeId> {
        let mut out = BTreeSet::new();
        for (node, msg) in &self.msgs {
            if let Some((voted, accepted)) = msg.nominated_values() {
                if accepted.contains(v) || (!accepted_only && voted.contains(v)) {
                    out.insert(*node);
                }
            } else {
                // A node already balloting values that include v has
                // implicitly accepted its nomination.
                let in_ballot = match &msg.topic {
                    Topic::Prepare(p) => p.ballot.values.contains(v),
                    Topic::Commit(c) => c.ballot.values.contains(v),
                    Topic::Externalize(e) => e.commit.values.contains(v),
                    Topic::Nominate(_) => false,
                };
                if in_ballot {
                    out.insert(*node);
                }
            }
        }
        out
    }

    // --- balloting ------------------------------------------------------

    fn rebuild_ballot(&mut self) {
        let candidates: Vec<V> = self.confirmed_nominated.iter().cloned().collect();
        match (self.combine_fn)(&candidates) {
            Ok(mut combined) if !combined.is_empty() => {
                combined.sort();
                combined.dedup();
                let counter = self.round.max(1);
                self.ballot = Some(Ballot::new(counter, &combined));
            }
            Ok(_) => {}
            Err(e) => warn!(slot = self.slot_index, "combine failed: {e}"),
        }
    }

    fn step_ballot(&mut self) {
        if self.externalized.is_some() {
            return;
        }

        if self.ballot.is_none() {
            if !self.confirmed_nominated.is_empty() {
                self.rebuild_ballot();
            } else {
                self.try_adopt_peer_ballot();
            }
        }

        // Absorbing externalize: a blocking set that already decided
        // drags us along, whatever our own phase.
        if let Some(values) = self.blocking_externalized() {
            self.finalize(values);
            return;
        }

        let Some(ballot) = self.ballot.clone() else {
            return;
        };

        // accept prepared
        if self.prepared.is_none() {
            let mut accepters = self.prepare_supporters(&ballot, true);
            accepters.remove(&self.local_id);
            let accepted = if is_blocking(&self.local_quorum_set, &accepters) {
                true
            } else {
                let mut voters = self.prepare_supporters(&ballot, false);
                voters.insert(self.local_id);
                contains_quorum(&self.local_id, &self.local_quorum_set, &voters, |n| {
                    self.quorum_set_of(n)
                })
            };
            if accepted {
                self.prepared = Some(ballot.clone());
            }
        }

        // confirm prepared, which is also our vote-and-accept of commit
        if self.prepared.is_some() && self.confirmed_prepared.is_none() {
            let mut accepters = self.prepare_supporters(&ballot, true);
            accepters.insert(self.local_id);
            if contains_quorum(&self.local_id, &self.local_quorum_set, &accepters, |n| {
                self.quorum_set_of(n)
            }) {
                self.confirmed_prepared = Some(ballot.clone());
                self.accepted_commit = Some(ballot.clone());
            }
        }

        // confirm commit => externalize
        if self.accepted_commit.is_some() {
            let mut committers = self.commit_supporters(&ballot);
            committers.insert(self.local_id);
            if contains_quorum(&self.local_id, &self.local_quorum_set, &committers, |n| {
                self.quorum_set_of(n)
            }) {
                self.finalize(ballot.values);
            }
        }
    }

    /// If we never confirmed candidates but a blocking set is already
    /// balloting one value set, adopt it.
    fn try_adopt_peer_ballot(&mut self) {
        let mut by_values: BTreeMap<Vec<V>, (BTreeSet<NodeId>, u32)> = BTreeMap::new();
        for (node, msg) in &self.msgs {
            let ballot = match &msg.topic {
                Topic::Prepare(p) => &p.ballot,
                Topic::Commit(c) => &c.ballot,
                Topic::Externalize(e) => &e.commit,
                Topic::Nominate(_) => continue,
            };
            let entry = by_values
                .entry(ballot.values.clone())
                .or_insert_with(|| (BTreeSet::new(), 0));
            entry.0.insert(*node);
            entry.1 = entry.1.max(ballot.counter);
        }
        for (values, (supporters, counter)) in by_values {
            if is_blocking(&self.local_quorum_set, &supporters)
                && values.iter().all(|v| (self.validity_fn)(v).is_ok())
            {
                debug!(slot = self.slot_index, "adopting ballot from blocking set");
                self.ballot = Some(Ballot {
                    counter: counter.max(self.round.max(1)),
                    values,
                });
                return;
            }
        }
    }

    fn blocking_externalized(&self) -> Option<Vec<V>> {
        let mut by_values: BTreeMap<Vec<V>, BTreeSet<NodeId>> = BTreeMap::new();
        for (node, msg) in &self.msgs {
            if let Topic::Externalize(e) = &msg.topic {
                by_values
                    .entry(e.commit.values.clone())
                    .or_default()
                    .insert(*node);
            }
        }
        by_values
            .into_iter()
            .find(|(_, nodes)| is_blocking(&self.local_quorum_set, nodes))
            .map(|(values, _)| values)
    }

    /// Peers supporting prepare of a ballot compatible with `ballot`:
    /// accepted-prepared only, or voting-prepare as well.
    fn prepare_supporters(&self, ballot: &Ballot<V>, accepted_only: bool) -> BTreeSet<NodeId> {
        let mut out = BTreeSet::new();
        for (node, msg) in &self.msgs {
            let supports = match &msg.topic {
                Topic::Prepare(p) => {
                    if accepted_only {
                        p.prepared
                            .as_ref()
                            .map(|prep| prep.compatible(ballot))
                            .unwrap_or(false)
                    } else {
                        p.ballot.compatible(ballot)
                    }
                }
                Topic::Commit(c) => c.ballot.compatible(ballot),
                Topic::Externalize(e) => e.commit.compatible(ballot),
                Topic::Nominate(_) => false,
            };
            if supports {
                out.insert(*node);
            }
        }
        out
    }

    /// Peers accepting commit of a ballot compatible with `ballot`.
    fn commit_supporters(&self, ballot: &Ballot<V>) -> BTreeSet<NodeId> {
        let mut out = BTreeSet::new();
        for (node, msg) in &self.msgs {
            let supports = match &msg.topic {
                Topic::Commit(c) => c.ballot.compatible(ballot),
                Topic::Externalize(e) => e.commit.compatible(ballot),
                _ => false,
            };
            if supports {
                out.insert(*node);
            }
        }
        out
    }

    fn finalize(&mut self, values: Vec<V>) {
        debug!(
            slot = self.slot_index,
            count = values.len(),
            "slot externalized"
        );
        let counter = self.ballot.as_ref().map(|b| b.counter).unwrap_or(1);
        self.ballot = Some(Ballot {
            counter,
            values: values.clone(),
        });
        self.externalized = Some(values);
        self.deadline = None;
    }

    /// The message summarising our current state.
    pub fn current_msg(&self) -> Msg<V> {
        let topic = if let Some(values) = &self.externalized {
            Topic::Externalize(ExternalizePayload {
                commit: Ballot {
                    counter: self.ballot.as_ref().map(|b| b.counter).unwrap_or(1),
                    values: values.clone(),
                },
            })
        } else if let Some(ballot) = &self.accepted_commit {
            Topic::Commit(CommitPayload {
                ballot: ballot.clone(),
            })
        } else if let Some(ballot) = &self.ballot {
            Topic::Prepare(PreparePayload {
                ballot: ballot.clone(),
                prepared: self.prepared.clone(),
            })
        } else {
            Topic::Nominate(NominatePayload {
                voted: self.voted.clone(),
                accepted: self.accepted_nominated.clone(),
            })
        };
        Msg::new(
            self.local_id,
            self.slot_index,
            self.local_quorum_set.clone(),
            topic,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(byte: u8) -> NodeId {
        NodeId([byte; 32])
    }

    fn accept_all() -> ValidityFn<u32> {
        Arc::new(|_| Ok(()))
    }

    fn union_combine() -> CombineFn<u32> {
        Arc::new(|values| {
            let mut out = values.to_vec();
            out.sort();
            out.dedup();
            Ok(out)
        })
    }

    fn make_slot(local: NodeId, qs: &QuorumSet) -> Slot<u32> {
        Slot::new(
            1,
            local,
            qs.clone(),
            accept_all(),
            union_combine(),
            Duration::from_millis(100),
        )
    }

    /// Drive a fully-connected set of slots until quiescent.
    fn run_to_fixpoint(slots: &mut [Slot<u32>]) {
        let mut outbox: Vec<Msg<u32>> = slots.iter().map(|s| s.current_msg()).collect();
        for _ in 0..50 {
            let mut next = Vec::new();
            for msg in &outbox {
                for slot in slots.iter_mut() {
                    if let Ok(Some(reply)) = slot.handle_message(msg) {
                        next.push(reply);
                    }
                }
            }
            if next.is_empty() {
                break;
            }
            outbox = next;
        }
    }

    #[test]
    fn three_node_mesh_externalizes() {
        let ids: Vec<NodeId> = (1..=3).map(node).collect();
        let qs = QuorumSet::new_with_node_ids(2, ids.clone());
        let mut slots: Vec<Slot<u32>> = ids.iter().map(|id| make_slot(*id, &qs)).collect();

        for slot in slots.iter_mut() {
            slot.propose_values([7u32, 9u32].into()).unwrap();
        }
        run_to_fixpoint(&mut slots);

        for slot in &slots {
            assert_eq!(slot.externalized_values(), Some(vec![7, 9]));
        }
    }

    #[test]
    fn disjoint_proposals_merge() {
        let ids: Vec<NodeId> = (1..=3).map(node).collect();
        let qs = QuorumSet::new_with_node_ids(2, ids.clone());
        let mut slots: Vec<Slot<u32>> = ids.iter().map(|id| make_slot(*id, &qs)).collect();

        slots[0].propose_values([1u32].into()).unwrap();
        slots[1].propose_values([2u32].into()).unwrap();
        slots[2].propose_values([3u32].into()).unwrap();
        run_to_fixpoint(&mut slots);

        let expected = slots[0].externalized_values().expect("externalized");
        assert!(!expected.is_empty());
        for slot in &slots[1..] {
            assert_eq!(slot.externalized_values(), Some(expected.clone()));
        }
    }

    #[test]
    fn invalid_values_never_voted() {
        let ids: Vec<NodeId> = (1..=3).map(node).collect();
        let qs = QuorumSet::new_with_node_ids(2, ids.clone());
        let reject_odd: ValidityFn<u32> = Arc::new(|v| {
            if v % 2 == 1 {
                Err("odd".to_string())
            } else {
                Ok(())
            }
        });
        let mut slot = Slot::new(
            1,
            ids[0],
            qs,
            reject_odd,
            union_combine(),
            Duration::from_millis(100),
        );
        slot.propose_values([1u32, 2u32, 3u32].into()).unwrap();
        let msg = slot.current_msg();
        match msg.topic {
            Topic::Nominate(payload) => {
                assert_eq!(payload.voted.into_iter().collect::<Vec<_>>(), vec![2])
            }
            other => panic!("expected nominate, got {}", other.name()),
        }
    }

    #[test]
    fn timeout_bumps_round() {
        let ids: Vec<NodeId> = (1..=3).map(node).collect();
        let qs = QuorumSet::new_with_node_ids(2, ids.clone());
        let mut slot = make_slot(ids[0], &qs);
        slot.propose_values([5u32].into()).unwrap();

        let later = Instant::now() + Duration::from_secs(10);
        let rebroadcast = slot.process_timeout(later);
        assert!(rebroadcast.is_some());
        // Not due yet right after.
        assert!(slot.process_timeout(later).is_none());
    }

    #[test]
    fn timeout_policy_is_linear_and_capped() {
        let base = Duration::from_secs(1);
        assert_eq!(compute_timeout(1, base), Duration::from_secs(1));
        assert_eq!(compute_timeout(17, base), Duration::from_secs(17));
        assert_eq!(
            compute_timeout(1_000_000, base),
            Duration::from_secs(u64::from(MAX_TIMEOUT_ROUNDS))
        );
    }

    #[test]
    fn straggler_adopts_externalized_value() {
        let ids: Vec<NodeId> = (1..=3).map(node).collect();
        let qs = QuorumSet::new_with_node_ids(2, ids.clone());
        let mut straggler = make_slot(ids[0], &qs);

        // Two peers (a blocking set for 2-of-3) announce externalize.
        for peer in &ids[1..] {
            let msg = Msg::new(
                *peer,
                1,
                qs.clone(),
                Topic::Externalize(ExternalizePayload {
                    commit: Ballot::new(3, &[42u32]),
                }),
            );
            straggler.handle_message(&msg).unwrap();
        }
        assert_eq!(straggler.externalized_values(), Some(vec![42]));
    }
}
