// Copyright (c) 2024-2025 The Kestrel Foundation

//! Federated byzantine agreement engine.
//!
//! This crate implements the nomination/ballot protocol a ledger drives
//! through a small callback surface: the consumer supplies a validity
//! function and a combine function, proposes values per slot, feeds in
//! peer messages, and is told when a slot externalizes.

pub mod ballot;
pub mod core_types;
mod error;
pub mod msg;
pub mod node;
pub mod predicates;
pub mod quorum_set;
pub mod slot;

pub use crate::{
    ballot::Ballot,
    core_types::{NodeId, SlotIndex, Value},
    error::{ScpError, ScpResult},
    msg::{Msg, Topic},
    node::{Node, ScpNode},
    quorum_set::QuorumSet,
    slot::{CombineFn, ValidityFn, MAX_TIMEOUT_ROUNDS},
};
