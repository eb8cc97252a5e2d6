// Copyright (c) 2025 Kestrel Foundation

//! In-process peer networking.
//!
//! Nodes live on their own threads and talk through channel senders
//! held in a shared registry. Void methods are fire-and-forget pushes;
//! request/response methods carry a reply channel and a per-call
//! timeout. Persistent failures ban the peer for a while.

mod rpc;

pub use rpc::{
    BlockSignature, Identity, NodeInfo, NodeMessage, NodeState, PeerNetwork, Registry, Request,
    Response, RpcCall,
};
