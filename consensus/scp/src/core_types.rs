// Copyright (c) 2024-2025 The Kestrel Foundation

//! Fundamental types shared by every layer of the protocol.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{fmt, hash::Hash};

/// Slots are indexed by the block height they decide.
pub type SlotIndex = u64;

/// A node is identified by its 32-byte public signing key.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct NodeId(pub [u8; 32]);

impl NodeId {
    /// Abbreviated hex form used in logs.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.short())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.short())
    }
}

impl AsRef<[u8]> for NodeId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// The values the network agrees on.
///
/// Values must be totally ordered so that ballots and nomination sets
/// have one canonical form on every node.
pub trait Value:
    Clone + Eq + Ord + Hash + fmt::Debug + Serialize + DeserializeOwned + Send + 'static
{
}

impl<T> Value for T where
    T: Clone + Eq + Ord + Hash + fmt::Debug + Serialize + DeserializeOwned + Send + 'static
{
}
