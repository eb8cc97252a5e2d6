// Copyright (c) 2025 Kestrel Foundation

//! The ledger coordinator: one node's event loop.
//!
//! Everything runs single-threaded: network pushes, RPC answers and
//! timers are drained from one channel and processed in arrival order.
//! The chain state is only ever mutated from inside this loop; the
//! consensus driver's validity callbacks take short read locks of
//! their own, so the loop never holds the chain lock across a driver
//! call.

use crate::{
    block::BitMask,
    chain::Chain,
    config::Config,
    consensus::{ConsensusDriver, ConsensusPayload, Envelope, TimerKind},
    crypto::{self, Hash, KeyPair, PublicKey, Signature},
    enrollment::PreImage,
    error::{Error, Result},
    ledger::MAX_BLOCKS_PER_RANGE,
    network::{
        BlockSignature, Identity, NodeInfo, NodeMessage, NodeState, PeerNetwork, Registry,
        Request, Response, RpcCall,
    },
    transaction::{Transaction, UtxoKey},
};
use crossbeam_channel::{unbounded, Receiver, Sender};
use kestrel_consensus_scp::{NodeId, SlotIndex};
use std::{
    collections::HashMap,
    path::Path,
    sync::{Arc, RwLock},
    thread,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};
use tracing::{debug, info, warn};

/// Signature-share collection for one appended block.
struct SigSession {
    block_hash: Hash,
    signers: Vec<(UtxoKey, PublicKey)>,
    mask: BitMask,
    aggregate: Signature,
}

/// How many finished sessions to keep around for late shares.
const SIG_SESSION_KEEP: usize = 8;

/// One running validator (or full) node.
pub struct LedgerNode {
    config: Config,
    key_pair: KeyPair,
    node_id: NodeId,
    chain: Arc<RwLock<Chain>>,
    driver: ConsensusDriver,
    network: PeerNetwork,
    receiver: Receiver<NodeMessage>,
    sig_sessions: HashMap<u64, SigSession>,
    /// Last time the chain advanced; catchup only probes peers once
    /// this goes stale, so healthy nodes never block on each other.
    last_progress: Instant,
    /// In-flight height probes, polled from the tick loop.
    pending_probes: Vec<HeightProbe>,
}

/// A non-blocking catchup probe awaiting its answer.
struct HeightProbe {
    peer: NodeId,
    reply: crossbeam_channel::Receiver<Response>,
    deadline: Instant,
}

/// Handle to a spawned node: its id, its inbox and the join handle.
pub struct NodeHandle {
    pub node_id: NodeId,
    sender: Sender<NodeMessage>,
    join: Option<thread::JoinHandle<()>>,
    rpc_timeout: Duration,
}

impl NodeHandle {
    pub fn sender(&self) -> Sender<NodeMessage> {
        self.sender.clone()
    }

    pub fn submit_transaction(&self, tx: Transaction) {
        let _ = self.sender.send(NodeMessage::PutTransaction(tx));
    }

    /// Issue one RPC against this node, as a peer would.
    pub fn request(&self, request: Request) -> Result<Response> {
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        self.sender
            .send(NodeMessage::Call(RpcCall {
                request,
                reply: reply_tx,
            }))
            .map_err(|_| Error::PeerUnreachable("node shut down".to_string()))?;
        reply_rx
            .recv_timeout(self.rpc_timeout)
            .map_err(|_| Error::PeerUnreachable("node did not answer".to_string()))
    }

    pub fn block_height(&self) -> Result<u64> {
        match self.request(Request::GetBlockHeight)? {
            Response::BlockHeight(h) => Ok(h),
            other => Err(Error::PeerUnreachable(format!(
                "unexpected response {other:?}"
            ))),
        }
    }

    /// Cooperative shutdown: ask the loop to stop and join the thread.
    pub fn shutdown(mut self) {
        let _ = self.sender.send(NodeMessage::Shutdown);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// Unregisters the node from the registry on every exit path,
/// including panics unwinding through the event loop.
struct RegistryGuard {
    registry: Registry,
    node_id: NodeId,
}

impl Drop for RegistryGuard {
    fn drop(&mut self) {
        self.registry.unregister(&self.node_id);
    }
}

impl LedgerNode {
    /// Build a node: open the chain, derive the initial quorum, wire
    /// the driver and register with the in-process network.
    pub fn new(
        config: Config,
        key_pair: KeyPair,
        path: &Path,
        genesis: &crate::block::Block,
        registry: Registry,
    ) -> Result<(Self, Sender<NodeMessage>)> {
        let chain = Chain::open(config.clone(), key_pair.clone(), path, genesis)?;
        let tip = chain.height();
        let quorum_set = chain.quorum_for(tip + 1)?;
        let chain = Arc::new(RwLock::new(chain));

        let timebase = Duration::from_secs(config.block_interval_sec.max(1));
        let driver = ConsensusDriver::new(
            key_pair.clone(),
            chain.clone(),
            quorum_set,
            tip + 1,
            timebase,
        );
        let node_id = driver.node_id();
        let network = PeerNetwork::new(registry.clone(), node_id, &config);

        let (sender, receiver) = unbounded();
        registry.register(node_id, sender.clone());

        Ok((
            Self {
                config,
                key_pair,
                node_id,
                chain,
                driver,
                network,
                receiver,
                sig_sessions: HashMap::new(),
                last_progress: Instant::now(),
                pending_probes: Vec::new(),
            },
            sender,
        ))
    }

    /// Spawn a node on its own thread.
    pub fn spawn(
        config: Config,
        key_pair: KeyPair,
        path: &Path,
        genesis: &crate::block::Block,
        registry: Registry,
    ) -> Result<NodeHandle> {
        let rpc_timeout = config.rpc_timeout();
        let (node, sender) = Self::new(config, key_pair, path, genesis, registry.clone())?;
        let node_id = node.node_id;
        let join = thread::Builder::new()
            .name(format!("kestrel-{node_id}"))
            .spawn(move || node.run(registry))
            .map_err(|e| Error::StorageFailure(format!("spawn node thread: {e}")))?;
        Ok(NodeHandle {
            node_id,
            sender,
            join: Some(join),
            rpc_timeout,
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// The event loop. Runs until shutdown; the registry guard cleans
    /// up on every exit path.
    pub fn run(mut self, registry: Registry) {
        let _guard = RegistryGuard {
            registry,
            node_id: self.node_id,
        };
        info!(node = %self.node_id, "node started");

        let first_slot = self.driver.current_slot();
        self.driver.timers.setup(
            first_slot,
            TimerKind::Nominate,
            Some(self.config.block_interval()),
        );
        self.driver.timers.setup(
            first_slot,
            TimerKind::Catchup,
            Some(self.config.catchup_interval()),
        );

        loop {
            match self.receiver.recv_timeout(Duration::from_millis(25)) {
                Ok(NodeMessage::Shutdown) => break,
                Ok(msg) => self.handle(msg),
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
            }
            self.tick();
        }

        // Flush persisted state on the way out.
        if let Ok(chain) = self.chain.read() {
            if let Err(e) = chain.persist() {
                warn!("failed to persist state at shutdown: {e}");
            }
        }
        info!(node = %self.node_id, "node stopped");
    }

    fn handle(&mut self, msg: NodeMessage) {
        match msg {
            NodeMessage::PutTransaction(tx) => self.accept_transaction(tx),
            NodeMessage::ReceiveEnvelope(envelope) => self.on_envelope(*envelope),
            NodeMessage::SendEnrollment(enrollment) => self.on_enrollment(enrollment),
            NodeMessage::SendPreImage(preimage) => self.on_preimage(preimage),
            NodeMessage::SendBlockSignature(share) => self.on_block_signature(share),
            NodeMessage::Call(call) => self.answer(call),
            // Consumed by the loop before dispatch.
            NodeMessage::Shutdown => {}
        }
    }

    fn tick(&mut self) {
        for envelope in self.driver.process_timeouts() {
            self.broadcast_envelope(envelope);
        }
        self.check_externalized();
        self.poll_probes();

        let fired = self.driver.timers.poll(Instant::now());
        for (slot, kind) in fired {
            match kind {
                TimerKind::Nominate => {
                    self.try_nominate(slot);
                    // Re-arm only while the slot is still open; stale
                    // slots just let their watermark die.
                    if slot == self.driver.current_slot() {
                        self.driver.timers.setup(
                            slot,
                            TimerKind::Nominate,
                            Some(self.config.block_interval()),
                        );
                    }
                }
                TimerKind::Catchup => {
                    self.catchup();
                    let slot = self.driver.current_slot();
                    self.driver.timers.setup(
                        slot,
                        TimerKind::Catchup,
                        Some(self.config.catchup_interval()),
                    );
                }
            }
        }
    }

    // --- transactions ---------------------------------------------------

    /// Validate, admit, gossip. Invalid transactions are dropped with a
    /// debug log only (anti-DoS).
    fn accept_transaction(&mut self, tx: Transaction) {
        let hash = tx.hash();
        {
            let chain = match self.chain.read() {
                Ok(chain) => chain,
                Err(_) => return,
            };
            if chain.pool.was_accepted(&hash) {
                return;
            }
        }
        let accepted = match self.chain.write() {
            Ok(mut chain) => chain.accept_tx(tx.clone()),
            Err(_) => return,
        };
        match accepted {
            Ok(_) => {
                let peers = self.network.peers();
                self.network
                    .broadcast(&peers, || NodeMessage::PutTransaction(tx.clone()));
                // Opportunistic nomination once a full set is waiting.
                let pooled = self.chain.read().map(|c| c.pool.len()).unwrap_or(0);
                if self.config.txs_to_nominate > 0 && pooled >= self.config.txs_to_nominate {
                    let slot = self.driver.current_slot();
                    self.try_nominate(slot);
                }
            }
            Err(e) => debug!(tx = %hash, "transaction dropped: {e}"),
        }
    }

    // --- consensus ------------------------------------------------------

    fn try_nominate(&mut self, slot: SlotIndex) {
        if slot != self.driver.current_slot() {
            return;
        }
        let candidate = {
            let chain = match self.chain.read() {
                Ok(chain) => chain,
                Err(_) => return,
            };
            // Only active validators nominate.
            let ours = chain
                .manager
                .stake_utxo()
                .and_then(|key| chain.manager.validators.get(key));
            match ours {
                Some(info) if info.is_active(slot) => {}
                _ => return,
            }
            match chain.nomination_candidate(slot) {
                Ok(candidate) => candidate,
                Err(e) => {
                    warn!("nomination candidate failed: {e}");
                    return;
                }
            }
        };
        let Some(payload) = candidate else {
            return;
        };
        match self.driver.propose(payload) {
            Ok(Some(envelope)) => self.broadcast_envelope(envelope),
            Ok(None) => {}
            Err(e) => warn!("proposal failed: {e}"),
        }
    }

    fn on_envelope(&mut self, envelope: Envelope) {
        match self.driver.receive_envelope(&envelope) {
            Ok(Some(response)) => self.broadcast_envelope(response),
            Ok(None) => {}
            Err(e) => {
                debug!(slot = envelope.slot_index(), "envelope dropped: {e}");
                return;
            }
        }
        self.check_externalized();
    }

    /// Broadcast to every peer inside our quorum.
    fn broadcast_envelope(&mut self, envelope: Envelope) {
        let targets: Vec<NodeId> = self.driver.quorum_set().nodes().into_iter().collect();
        self.network.broadcast(&targets, || {
            NodeMessage::ReceiveEnvelope(Box::new(envelope.clone()))
        });
    }

    /// If the next block's slot has decided, build and append it.
    fn check_externalized(&mut self) {
        let slot = match self.chain.read() {
            Ok(chain) => chain.height() + 1,
            Err(_) => return,
        };
        if self.driver.is_externalized(slot) {
            return;
        }
        let Some(mut payloads) = self.driver.externalized_values(slot) else {
            return;
        };
        let Some(payload) = payloads.pop() else {
            warn!(slot, "slot decided on an empty value list");
            return;
        };
        if let Err(e) = self.apply_externalized_payload(slot, &payload) {
            // Retried on the next tick; a persistent failure means the
            // chain is halted, which is the visible outcome we want.
            warn!(slot, "failed to apply externalized value: {e}");
        }
    }

    fn apply_externalized_payload(
        &mut self,
        slot: SlotIndex,
        payload: &ConsensusPayload,
    ) -> Result<()> {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        let (block, signers) = {
            let chain = self
                .chain
                .read()
                .map_err(|_| Error::StorageFailure("chain lock poisoned".to_string()))?;
            let block = chain.build_block(slot, payload, timestamp)?;
            let signers: Vec<(UtxoKey, PublicKey)> = chain
                .manager
                .validators
                .enrolled_entries(slot)
                .into_iter()
                .map(|(key, info)| (*key, info.public_key))
                .collect();
            (block, signers)
        };

        {
            let mut chain = self
                .chain
                .write()
                .map_err(|_| Error::StorageFailure("chain lock poisoned".to_string()))?;
            chain.apply_externalized(&block)?;
        }
        self.driver.mark_externalized(slot);
        self.last_progress = Instant::now();

        info!(
            slot,
            hash = %block.hash(),
            txs = block.txs.len(),
            "block externalized"
        );

        self.start_signature_session(slot, &block, signers);
        self.announce_reveal(slot + 1);
        self.refresh_quorum(slot);
        self.check_and_enroll(slot);

        // Open the next slot's nomination window.
        let next = self.driver.current_slot();
        self.driver.timers.setup(
            next,
            TimerKind::Nominate,
            Some(self.config.block_interval()),
        );
        Ok(())
    }

    // --- signature aggregation -----------------------------------------

    /// Sign our share, store it in the header and gossip it; peers'
    /// shares are folded in as they arrive.
    fn start_signature_session(
        &mut self,
        height: u64,
        block: &crate::block::Block,
        signers: Vec<(UtxoKey, PublicKey)>,
    ) {
        let block_hash = block.hash();
        let mut session = SigSession {
            block_hash,
            mask: BitMask::new(signers.len()),
            signers,
            aggregate: Signature::default(),
        };

        let our_share = {
            let chain = match self.chain.read() {
                Ok(chain) => chain,
                Err(_) => return,
            };
            chain.manager.stake_utxo().and_then(|stake| {
                session
                    .signers
                    .iter()
                    .position(|(key, _)| key == stake)
                    .map(|index| (index, *stake))
            })
        };

        if let Some((index, stake)) = our_share {
            let share = self.key_pair.sign_share(block_hash.as_ref());
            session.mask.set(index);
            session.aggregate = share;
            if let Ok(chain) = self.chain.read() {
                if let Err(e) = chain.ledger.update_block_signature(
                    height,
                    session.aggregate,
                    session.mask.clone(),
                ) {
                    warn!("failed to store own signature share: {e}");
                }
            }
            let peers = self.network.peers();
            self.network.broadcast(&peers, || {
                NodeMessage::SendBlockSignature(BlockSignature {
                    height,
                    utxo_key: stake,
                    share,
                })
            });
        }

        self.sig_sessions.insert(height, session);
        if self.sig_sessions.len() > SIG_SESSION_KEEP {
            let oldest = self.sig_sessions.keys().min().copied();
            if let Some(height) = oldest {
                self.sig_sessions.remove(&height);
            }
        }
    }

    /// Fold a peer's verified share into the stored header and flip its
    /// bit.
    fn on_block_signature(&mut self, share: BlockSignature) {
        let Some(session) = self.sig_sessions.get_mut(&share.height) else {
            debug!(height = share.height, "share for unknown session dropped");
            return;
        };
        let Some(index) = session
            .signers
            .iter()
            .position(|(key, _)| *key == share.utxo_key)
        else {
            debug!(height = share.height, "share from non-validator dropped");
            return;
        };
        if session.mask.get(index) {
            return;
        }
        let public = session.signers[index].1;
        if !crypto::verify_share(&public, session.block_hash.as_ref(), &share.share) {
            warn!(height = share.height, "invalid signature share dropped");
            return;
        }
        let Some(folded) = crypto::aggregate_signatures(&session.aggregate, &share.share) else {
            warn!(height = share.height, "share failed to aggregate");
            return;
        };
        session.aggregate = folded;
        session.mask.set(index);
        let (aggregate, mask) = (session.aggregate, session.mask.clone());

        if let Ok(chain) = self.chain.read() {
            if let Err(e) = chain
                .ledger
                .update_block_signature(share.height, aggregate, mask)
            {
                warn!("failed to update block signature: {e}");
            }
        }
    }

    // --- enrollment & reveals ------------------------------------------

    fn on_enrollment(&mut self, enrollment: crate::enrollment::Enrollment) {
        let result = match self.chain.write() {
            Ok(mut chain) => chain.add_enrollment(enrollment.clone()),
            Err(_) => return,
        };
        match result {
            Ok(()) => {
                let peers = self.network.peers();
                self.network
                    .broadcast(&peers, || NodeMessage::SendEnrollment(enrollment.clone()));
            }
            Err(e) => debug!("enrollment dropped: {e}"),
        }
    }

    fn on_preimage(&mut self, preimage: PreImage) {
        let result = match self.chain.write() {
            Ok(mut chain) => chain.add_preimage(&preimage),
            Err(_) => return,
        };
        match result {
            // Fresh information: relay it.
            Ok(true) => {
                let peers = self.network.peers();
                self.network
                    .broadcast(&peers, || NodeMessage::SendPreImage(preimage));
            }
            Ok(false) => {}
            Err(e) => debug!("pre-image dropped: {e}"),
        }
    }

    /// Reveal our pre-image for `height` locally and to the network.
    fn announce_reveal(&mut self, height: u64) {
        let reveal = {
            let mut chain = match self.chain.write() {
                Ok(chain) => chain,
                Err(_) => return,
            };
            let Some(reveal) = chain.manager.reveal_for(height) else {
                return;
            };
            if let Err(e) = chain.add_preimage(&reveal) {
                warn!("own reveal rejected: {e}");
                return;
            }
            reveal
        };
        let peers = self.network.peers();
        self.network
            .broadcast(&peers, || NodeMessage::SendPreImage(reveal));
    }

    /// Re-derive the quorum set at shuffle boundaries.
    fn refresh_quorum(&mut self, tip: u64) {
        let interval = self.config.quorum_shuffle_interval.max(1);
        if tip % interval != 0 {
            return;
        }
        let derived = match self.chain.read() {
            Ok(chain) => chain.quorum_for(tip + 1),
            Err(_) => return,
        };
        match derived {
            Ok(quorum_set) => self.driver.update_quorum_set(quorum_set),
            // No active validators means the chain is halting, not that
            // our configuration is broken; keep the old quorum.
            Err(e) => warn!(tip, "quorum derivation failed: {e}"),
        }
    }

    /// Renew our enrollment at the cycle boundary, or on the
    /// not-enough-validators emergency even when renewal is off.
    fn check_and_enroll(&mut self, tip: u64) {
        let enrollment = {
            let mut chain = match self.chain.write() {
                Ok(chain) => chain,
                Err(_) => return,
            };
            if !chain.manager.cycle_ending(tip) {
                return;
            }
            let renew = self.config.recurring_enrollment;
            let emergency = !renew && chain.not_enough_validators(tip + 2);
            if !renew && !emergency {
                return;
            }
            if emergency {
                info!(tip, "not enough validators; emergency re-enrollment");
            }
            let Some(stake) = chain.manager.stake_utxo().copied() else {
                return;
            };
            let enrollment = match chain.manager.create_enrollment(stake) {
                Ok(enrollment) => enrollment,
                Err(e) => {
                    warn!("re-enrollment failed: {e}");
                    return;
                }
            };
            if let Err(e) = chain.add_enrollment(enrollment.clone()) {
                warn!("own enrollment rejected: {e}");
                return;
            }
            if let Err(e) = chain.persist() {
                warn!("failed to persist enrollment state: {e}");
            }
            enrollment
        };
        let peers = self.network.peers();
        self.network
            .broadcast(&peers, || NodeMessage::SendEnrollment(enrollment.clone()));
    }

    // --- catchup --------------------------------------------------------

    /// Launch height probes toward every peer.
    ///
    /// Probes are fire-and-poll: the answers come back through
    /// [`Self::poll_probes`], so a silent peer never blocks the event
    /// loop. Only runs once the chain has visibly stalled.
    fn catchup(&mut self) {
        if self.last_progress.elapsed() < self.config.catchup_interval() {
            return;
        }
        if !self.pending_probes.is_empty() {
            return;
        }
        let deadline = Instant::now() + self.config.rpc_timeout();
        for peer in self.network.peers() {
            if let Some(reply) = self.network.send_request(&peer, Request::GetBlockHeight) {
                self.pending_probes.push(HeightProbe {
                    peer,
                    reply,
                    deadline,
                });
            }
        }
    }

    /// Poll outstanding height probes; fetch from the first live peer
    /// that is ahead of us.
    fn poll_probes(&mut self) {
        if self.pending_probes.is_empty() {
            return;
        }
        let tip = match self.chain.read() {
            Ok(chain) => chain.height(),
            Err(_) => return,
        };
        let now = Instant::now();
        let mut ahead: Option<NodeId> = None;
        let mut expired: Vec<NodeId> = Vec::new();
        self.pending_probes.retain(|probe| {
            if ahead.is_some() {
                return false;
            }
            match probe.reply.try_recv() {
                Ok(Response::BlockHeight(height)) => {
                    if height > tip {
                        ahead = Some(probe.peer);
                    }
                    false
                }
                Ok(_) => false,
                Err(crossbeam_channel::TryRecvError::Empty) => {
                    if now < probe.deadline {
                        true
                    } else {
                        expired.push(probe.peer);
                        false
                    }
                }
                Err(crossbeam_channel::TryRecvError::Disconnected) => false,
            }
        });
        for peer in expired {
            self.network.note_failure(&peer);
        }
        if let Some(peer) = ahead {
            self.pending_probes.clear();
            self.fetch_blocks_from(&peer, tip);
        }
    }

    /// Fetch, verify and append blocks past `tip` from a peer that
    /// answered a probe and is known to be ahead.
    fn fetch_blocks_from(&mut self, peer: &NodeId, tip: u64) {
        info!(peer = %peer, tip, "catching up");
        let blocks = match self.network.request(
            peer,
            Request::GetBlocksFrom {
                height: tip + 1,
                max: MAX_BLOCKS_PER_RANGE as u64,
            },
        ) {
            Ok(Response::Blocks(blocks)) => blocks,
            Ok(_) | Err(_) => return,
        };

        let mut applied = false;
        for block in blocks {
            let result = {
                let mut chain = match self.chain.write() {
                    Ok(chain) => chain,
                    Err(_) => return,
                };
                chain
                    .verify_catchup_block(&block)
                    .and_then(|()| chain.apply_externalized(&block))
            };
            match result {
                Ok(()) => applied = true,
                Err(e) => {
                    warn!(height = block.height(), "catchup block rejected: {e}");
                    break;
                }
            }
        }

        if applied {
            self.last_progress = Instant::now();
            self.resync_reveals(peer);
            let new_tip = self.chain.read().map(|c| c.height()).unwrap_or(tip);
            self.refresh_quorum(new_tip);
            self.driver.reset_slot(new_tip + 1);
            self.driver.timers.setup(
                new_tip + 1,
                TimerKind::Nominate,
                Some(self.config.block_interval()),
            );
            self.driver.timers.setup(
                new_tip + 1,
                TimerKind::Catchup,
                Some(self.config.catchup_interval()),
            );
            self.announce_reveal(new_tip + 1);
            self.check_and_enroll(new_tip);
        }
    }

    /// After catchup, pull the reveals we missed while away.
    fn resync_reveals(&mut self, peer: &NodeId) {
        let stale: Vec<UtxoKey> = match self.chain.read() {
            Ok(chain) => {
                let next = chain.height() + 1;
                chain
                    .manager
                    .validators
                    .enrolled_entries(next)
                    .into_iter()
                    .filter(|(_, info)| info.revealed.distance < info.required_distance(next))
                    .map(|(key, _)| *key)
                    .collect()
            }
            Err(_) => return,
        };
        for utxo_key in stale {
            if let Ok(Response::PreImage(Some(preimage))) =
                self.network.request(peer, Request::GetPreImage { utxo_key })
            {
                if let Ok(mut chain) = self.chain.write() {
                    if let Err(e) = chain.add_preimage(&preimage) {
                        debug!("resynced pre-image rejected: {e}");
                    }
                }
            }
        }
    }

    // --- RPC server side ------------------------------------------------

    fn answer(&mut self, call: RpcCall) {
        let response = self.answer_request(&call.request);
        let _ = call.reply.send(response);
    }

    fn answer_request(&mut self, request: &Request) -> Response {
        let chain = match self.chain.read() {
            Ok(chain) => chain,
            Err(_) => return Response::Error("chain lock poisoned".to_string()),
        };
        match request {
            Request::GetPublicKey => Response::PublicKey(Identity::new(&self.key_pair)),
            Request::GetNodeInfo => Response::NodeInfo(NodeInfo {
                state: NodeState::Complete,
                peers: self.network.peers(),
            }),
            Request::GetBlockHeight => Response::BlockHeight(chain.height()),
            Request::GetBlocksFrom { height, max } => {
                match chain
                    .ledger
                    .get_blocks_from(*height, (*max as usize).min(MAX_BLOCKS_PER_RANGE))
                {
                    Ok(blocks) => Response::Blocks(blocks),
                    Err(e) => Response::Error(e.to_string()),
                }
            }
            Request::GetPreImage { utxo_key } => {
                let preimage = chain.manager.validators.get(utxo_key).map(|info| PreImage {
                    utxo_key: *utxo_key,
                    hash: info.revealed.hash,
                    distance: info.revealed.distance,
                });
                Response::PreImage(preimage)
            }
            Request::GetEnrollment { utxo_key } => {
                Response::Enrollment(chain.manager.get_pooled(utxo_key).cloned())
            }
            Request::HasTransactionHash { hash } => {
                Response::HasTransactionHash(chain.pool.was_accepted(hash))
            }
        }
    }
}
