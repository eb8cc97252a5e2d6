// Copyright (c) 2025 Kestrel Foundation

//! The ledger: append-only block store and authoritative UTXO set.

mod store;
mod utxo;

pub use store::Ledger;

use crate::crypto::Hash;

/// Hard cap on blocks returned by one range query.
pub const MAX_BLOCKS_PER_RANGE: usize = 1000;

/// Summary of the chain tip.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ChainState {
    /// Height of the tip block.
    pub height: u64,
    /// Hash of the tip block.
    pub tip_hash: Hash,
    /// Fees collected and not yet paid out.
    pub fee_pool: u64,
}
