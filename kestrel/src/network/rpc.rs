// Copyright (c) 2025 Kestrel Foundation

//! The peer RPC surface and the registry-backed client.

use crate::{
    block::Block,
    config::Config,
    consensus::Envelope,
    crypto::{self, Hash, KeyPair, PublicKey, Signature},
    enrollment::{Enrollment, PreImage},
    error::{Error, Result},
    transaction::{Transaction, UtxoKey},
};
use crossbeam_channel::{bounded, Receiver, Sender};
use dashmap::DashMap;
use kestrel_consensus_scp::NodeId;
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::{debug, warn};

/// A node's advertised identity: its key plus a self-signature proving
/// possession.
#[derive(Clone, Debug)]
pub struct Identity {
    pub public_key: PublicKey,
    pub proof: Signature,
}

impl Identity {
    pub fn new(key_pair: &KeyPair) -> Self {
        let public_key = key_pair.public();
        Self {
            public_key,
            proof: key_pair.sign(&public_key.0),
        }
    }

    pub fn verify(&self) -> bool {
        crypto::verify(&self.public_key, &self.public_key.0, &self.proof)
    }
}

/// Whether a node considers itself caught up.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum NodeState {
    Incomplete,
    Complete,
}

#[derive(Clone, Debug)]
pub struct NodeInfo {
    pub state: NodeState,
    pub peers: Vec<NodeId>,
}

/// A validator's signature share over one block.
#[derive(Clone, Debug)]
pub struct BlockSignature {
    pub height: u64,
    pub utxo_key: UtxoKey,
    pub share: Signature,
}

/// Request half of the peer RPC surface.
#[derive(Clone, Debug)]
pub enum Request {
    GetPublicKey,
    GetNodeInfo,
    GetBlockHeight,
    GetBlocksFrom { height: u64, max: u64 },
    GetPreImage { utxo_key: UtxoKey },
    GetEnrollment { utxo_key: UtxoKey },
    HasTransactionHash { hash: Hash },
}

/// Response half; `Error` carries a reason string back to the caller.
#[derive(Clone, Debug)]
pub enum Response {
    PublicKey(Identity),
    NodeInfo(NodeInfo),
    BlockHeight(u64),
    Blocks(Vec<Block>),
    PreImage(Option<PreImage>),
    Enrollment(Option<Enrollment>),
    HasTransactionHash(bool),
    Error(String),
}

/// A request paired with where to send the answer.
pub struct RpcCall {
    pub request: Request,
    pub reply: Sender<Response>,
}

/// Everything a node's event loop consumes.
pub enum NodeMessage {
    PutTransaction(Transaction),
    ReceiveEnvelope(Box<Envelope>),
    SendEnrollment(Enrollment),
    SendPreImage(PreImage),
    SendBlockSignature(BlockSignature),
    Call(RpcCall),
    Shutdown,
}

/// Shared directory of running nodes.
#[derive(Clone, Default)]
pub struct Registry {
    nodes: Arc<DashMap<NodeId, Sender<NodeMessage>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: NodeId, sender: Sender<NodeMessage>) {
        self.nodes.insert(id, sender);
    }

    pub fn unregister(&self, id: &NodeId) {
        self.nodes.remove(id);
    }

    pub fn sender(&self, id: &NodeId) -> Option<Sender<NodeMessage>> {
        self.nodes.get(id).map(|entry| entry.value().clone())
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.iter().map(|entry| *entry.key()).collect()
    }
}

/// The client side: gossip pushes and timed request/response calls,
/// with a failure counter and ban list per peer.
pub struct PeerNetwork {
    registry: Registry,
    local: NodeId,
    rpc_timeout: Duration,
    max_retries: u32,
    retry_delay: Duration,
    max_failed_requests: u32,
    ban_duration: Duration,
    failures: HashMap<NodeId, u32>,
    banned: HashMap<NodeId, Instant>,
}

impl PeerNetwork {
    pub fn new(registry: Registry, local: NodeId, config: &Config) -> Self {
        Self {
            registry,
            local,
            rpc_timeout: config.rpc_timeout(),
            max_retries: config.max_retries,
            retry_delay: Duration::from_millis(config.retry_delay_ms),
            max_failed_requests: config.max_failed_requests,
            ban_duration: config.ban_duration(),
            failures: HashMap::new(),
            banned: HashMap::new(),
        }
    }

    /// Every registered peer except ourselves and the banned.
    pub fn peers(&mut self) -> Vec<NodeId> {
        let now = Instant::now();
        self.banned.retain(|_, until| *until > now);
        let banned = &self.banned;
        let local = self.local;
        self.registry
            .node_ids()
            .into_iter()
            .filter(|id| *id != local && !banned.contains_key(id))
            .collect()
    }

    pub fn is_banned(&self, id: &NodeId) -> bool {
        self.banned
            .get(id)
            .map(|until| *until > Instant::now())
            .unwrap_or(false)
    }

    /// Fire-and-forget push; send failures are ignored (optimistic
    /// gossip) beyond the failure counter.
    pub fn push(&mut self, peer: &NodeId, msg: NodeMessage) {
        match self.registry.sender(peer) {
            Some(sender) => {
                if sender.send(msg).is_err() {
                    self.record_failure(peer);
                }
            }
            None => debug!(peer = %peer, "push to unknown peer dropped"),
        }
    }

    /// Gossip to a target list.
    pub fn broadcast<F>(&mut self, targets: &[NodeId], make: F)
    where
        F: Fn() -> NodeMessage,
    {
        for peer in targets {
            if *peer == self.local || self.is_banned(peer) {
                continue;
            }
            self.push(peer, make());
        }
    }

    /// Fire a request without waiting: the caller polls the returned
    /// receiver. Used for liveness probes where blocking on a silent
    /// peer would stall the event loop.
    pub fn send_request(&mut self, peer: &NodeId, request: Request) -> Option<Receiver<Response>> {
        let sender = self.registry.sender(peer)?;
        let (reply_tx, reply_rx) = bounded(1);
        if sender
            .send(NodeMessage::Call(RpcCall {
                request,
                reply: reply_tx,
            }))
            .is_err()
        {
            self.record_failure(peer);
            return None;
        }
        Some(reply_rx)
    }

    /// Bump a peer's failure count from outside (e.g. an expired
    /// probe).
    pub fn note_failure(&mut self, peer: &NodeId) {
        self.record_failure(peer);
    }

    /// Request/response with the per-call timeout, retried up to the
    /// configured limit with a delay between attempts.
    pub fn request(&mut self, peer: &NodeId, request: Request) -> Result<Response> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.request_once(peer, request.clone()) {
                Ok(response) => {
                    self.failures.remove(peer);
                    return Ok(response);
                }
                Err(err) if attempts <= self.max_retries => {
                    debug!(peer = %peer, attempts, "peer call failed, retrying: {err}");
                    std::thread::sleep(self.retry_delay);
                }
                Err(err) => {
                    self.record_failure(peer);
                    return Err(err);
                }
            }
        }
    }

    fn request_once(&self, peer: &NodeId, request: Request) -> Result<Response> {
        let sender = self
            .registry
            .sender(peer)
            .ok_or_else(|| Error::PeerUnreachable(format!("peer {peer} not registered")))?;
        let (reply_tx, reply_rx): (Sender<Response>, Receiver<Response>) = bounded(1);
        sender
            .send(NodeMessage::Call(RpcCall {
                request,
                reply: reply_tx,
            }))
            .map_err(|_| Error::PeerUnreachable(format!("peer {peer} channel closed")))?;
        match reply_rx.recv_timeout(self.rpc_timeout) {
            Ok(response) => Ok(response),
            Err(_) => Err(Error::PeerUnreachable(format!(
                "peer {peer} did not answer within {:?}",
                self.rpc_timeout
            ))),
        }
    }

    fn record_failure(&mut self, peer: &NodeId) {
        let count = self.failures.entry(*peer).or_insert(0);
        *count += 1;
        if *count >= self.max_failed_requests {
            warn!(peer = %peer, failures = *count, "banning peer");
            self.banned.insert(*peer, Instant::now() + self.ban_duration);
            self.failures.remove(peer);
        }
    }
}
