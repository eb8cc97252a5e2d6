// Copyright (c) 2025 Kestrel Foundation

//! The consensus driver: the ledger's face toward the agreement
//! protocol.
//!
//! It owns the protocol node, supplies the validity and combine
//! callbacks (both backed by the shared chain state), signs and
//! verifies envelopes, caches peer quorum sets by id, and keeps
//! externalisation idempotent per slot.

use crate::{
    chain::Chain,
    consensus::{ConsensusPayload, TimerSet},
    crypto::{self, KeyPair, PublicKey, Signature},
    error::{Error, Result},
};
use kestrel_consensus_scp::{Msg, Node, NodeId, QuorumSet, ScpNode, SlotIndex};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeSet, HashMap},
    sync::{Arc, RwLock},
    time::Duration,
};
use tracing::{debug, trace, warn};

/// A signed consensus message.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Envelope {
    pub msg: Msg<ConsensusPayload>,
    pub signature: Signature,
}

impl Envelope {
    fn canonical_bytes(msg: &Msg<ConsensusPayload>) -> Result<Vec<u8>> {
        bincode::serialize(msg)
            .map_err(|e| Error::InvalidEnvelope(format!("encode envelope: {e}")))
    }

    pub fn sign(key_pair: &KeyPair, msg: Msg<ConsensusPayload>) -> Result<Self> {
        let bytes = Self::canonical_bytes(&msg)?;
        let signature = key_pair.sign(&bytes);
        Ok(Self { msg, signature })
    }

    /// Verify against the sender id, which is its public key.
    pub fn verify(&self) -> Result<()> {
        let public = PublicKey(self.msg.sender.0);
        if !public.is_valid_point() {
            return Err(Error::InvalidEnvelope(
                "sender key is not a valid point".to_string(),
            ));
        }
        let bytes = Self::canonical_bytes(&self.msg)?;
        if !crypto::verify(&public, &bytes, &self.signature) {
            return Err(Error::InvalidEnvelope(
                "envelope signature does not verify".to_string(),
            ));
        }
        Ok(())
    }

    pub fn slot_index(&self) -> SlotIndex {
        self.msg.slot_index
    }
}

/// Deterministic candidate merge: drop invalid candidates, keep the one
/// whose transaction-set fingerprint sorts smallest. Among candidates
/// with the same transaction set, the one carrying more enrollments
/// wins (so cycle-boundary blocks converge on the fullest renewal
/// set), then the payload hash settles what is left.
fn combine_candidates(candidates: &[ConsensusPayload]) -> Option<ConsensusPayload> {
    candidates
        .iter()
        .min_by_key(|p| {
            (
                p.tx_set_fingerprint(),
                std::cmp::Reverse(p.enrollments.len()),
                p.hash(),
            )
        })
        .cloned()
}

/// Bridge between the ledger and the protocol engine.
pub struct ConsensusDriver {
    key_pair: KeyPair,
    scp: Node<ConsensusPayload>,

    /// Slots this node has already applied a block for; everything
    /// below the watermark is implicitly done (set after catchup).
    externalized: BTreeSet<SlotIndex>,
    externalized_below: SlotIndex,

    /// Known quorum sets by id, ours included.
    quorum_cache: HashMap<[u8; 32], QuorumSet>,

    /// Driver-level timers (nomination kicks, catchup probes).
    pub timers: TimerSet,
}

impl ConsensusDriver {
    pub fn new(
        key_pair: KeyPair,
        chain: Arc<RwLock<Chain>>,
        quorum_set: QuorumSet,
        initial_slot: SlotIndex,
        timebase: Duration,
    ) -> Self {
        let node_id = NodeId(key_pair.public().0);

        let validity_chain = chain.clone();
        let validity_fn = Arc::new(move |payload: &ConsensusPayload| {
            let chain = validity_chain
                .read()
                .map_err(|_| "chain lock poisoned".to_string())?;
            let height = chain.height() + 1;
            chain
                .validate_payload(height, payload)
                .map_err(|e| e.to_string())
        });

        let combine_chain = chain;
        let combine_fn = Arc::new(move |candidates: &[ConsensusPayload]| {
            let chain = combine_chain
                .read()
                .map_err(|_| "chain lock poisoned".to_string())?;
            let height = chain.height() + 1;
            let valid: Vec<ConsensusPayload> = candidates
                .iter()
                .filter(|p| chain.validate_payload(height, p).is_ok())
                .cloned()
                .collect();
            match combine_candidates(&valid) {
                Some(winner) => Ok(vec![winner]),
                None => Err("no valid candidate to combine".to_string()),
            }
        });

        let mut scp = Node::new(node_id, quorum_set.clone(), validity_fn, combine_fn, initial_slot);
        scp.scp_timebase = timebase;

        let mut quorum_cache = HashMap::new();
        quorum_cache.insert(quorum_set.id(), quorum_set);

        Self {
            key_pair,
            scp,
            externalized: BTreeSet::new(),
            externalized_below: initial_slot,
            quorum_cache,
            timers: TimerSet::new(),
        }
    }

    pub fn node_id(&self) -> NodeId {
        *self.scp.node_id()
    }

    pub fn current_slot(&self) -> SlotIndex {
        self.scp.current_slot_index()
    }

    pub fn quorum_set(&self) -> QuorumSet {
        self.scp.quorum_set().clone()
    }

    /// Propose a payload for the current slot.
    pub fn propose(&mut self, payload: ConsensusPayload) -> Result<Option<Envelope>> {
        debug!(slot = self.current_slot(), %payload, "proposing");
        let out = self
            .scp
            .propose_values(BTreeSet::from([payload]))
            .map_err(|e| Error::InvalidEnvelope(e.to_string()))?;
        out.map(|msg| Envelope::sign(&self.key_pair, msg)).transpose()
    }

    /// Feed a peer envelope in. Envelopes for already-externalized
    /// slots are accepted but never re-externalize anything.
    pub fn receive_envelope(&mut self, envelope: &Envelope) -> Result<Option<Envelope>> {
        envelope.verify()?;
        self.quorum_cache
            .entry(envelope.msg.quorum_set.id())
            .or_insert_with(|| envelope.msg.quorum_set.clone());

        if self.externalized.contains(&envelope.slot_index()) {
            trace!(
                slot = envelope.slot_index(),
                "envelope for externalized slot"
            );
            return Ok(None);
        }

        let out = self
            .scp
            .handle_message(&envelope.msg)
            .map_err(|e| Error::InvalidEnvelope(e.to_string()))?;
        out.map(|msg| Envelope::sign(&self.key_pair, msg)).transpose()
    }

    /// Fire protocol round timers.
    pub fn process_timeouts(&mut self) -> Vec<Envelope> {
        self.scp
            .process_timeouts()
            .into_iter()
            .filter_map(|msg| match Envelope::sign(&self.key_pair, msg) {
                Ok(env) => Some(env),
                Err(e) => {
                    warn!("failed to sign timeout envelope: {e}");
                    None
                }
            })
            .collect()
    }

    /// The agreed payload of `slot`, if decided.
    pub fn externalized_values(&self, slot: SlotIndex) -> Option<Vec<ConsensusPayload>> {
        self.scp.get_externalized_values(slot)
    }

    /// Record that `slot`'s block has been applied. Returns false if it
    /// already was, making externalisation idempotent.
    pub fn mark_externalized(&mut self, slot: SlotIndex) -> bool {
        if slot < self.externalized_below {
            return false;
        }
        self.externalized.insert(slot)
    }

    pub fn is_externalized(&self, slot: SlotIndex) -> bool {
        slot < self.externalized_below || self.externalized.contains(&slot)
    }

    /// Jump to `slot` (after catchup), dropping stale timers; every
    /// slot below it counts as decided.
    pub fn reset_slot(&mut self, slot: SlotIndex) {
        self.scp.reset_slot_index(slot);
        self.timers.cancel_all();
        self.externalized_below = self.externalized_below.max(slot);
        self.externalized.retain(|s| *s >= self.externalized_below);
    }

    /// Adopt a re-derived quorum set for future slots.
    pub fn update_quorum_set(&mut self, quorum_set: QuorumSet) {
        self.quorum_cache
            .insert(quorum_set.id(), quorum_set.clone());
        self.scp.set_quorum_set(quorum_set);
    }

    /// Look up a quorum set by id in the driver's cache.
    pub fn get_quorum_set(&self, id: &[u8; 32]) -> Option<&QuorumSet> {
        self.quorum_cache.get(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Hash;
    use kestrel_consensus_scp::Topic;

    #[test]
    fn envelope_sign_verify_round_trip() {
        let kp = KeyPair::from_seed(b"driver");
        let msg = Msg::new(
            NodeId(kp.public().0),
            1,
            QuorumSet::new_with_node_ids(1, vec![NodeId(kp.public().0)]),
            Topic::Nominate(kestrel_consensus_scp::msg::NominatePayload {
                voted: BTreeSet::from([ConsensusPayload::new(
                    vec![Hash::digest(b"tx")],
                    vec![],
                    vec![],
                )]),
                accepted: BTreeSet::new(),
            }),
        );
        let envelope = Envelope::sign(&kp, msg).unwrap();
        envelope.verify().unwrap();

        let mut tampered = envelope;
        tampered.msg.slot_index = 2;
        assert!(tampered.verify().is_err());
    }

    #[test]
    fn combine_picks_smallest_fingerprint() {
        let a = ConsensusPayload::new(vec![Hash::digest(b"a")], vec![], vec![]);
        let b = ConsensusPayload::new(vec![Hash::digest(b"b")], vec![], vec![]);
        let winner = combine_candidates(&[a.clone(), b.clone()]).unwrap();
        let expected = if a.tx_set_fingerprint() < b.tx_set_fingerprint() {
            a
        } else {
            b
        };
        assert_eq!(winner, expected);
        assert!(combine_candidates(&[]).is_none());
    }
}
