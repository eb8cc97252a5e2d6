// Copyright (c) 2025 Kestrel Foundation

//! Error types for the ledger engine.
//!
//! Expected protocol outcomes never unwind; they travel as `Result`s.
//! Recovery policy per kind:
//! - log and drop: `InvalidTransaction`, `InvalidEnvelope`;
//!   `PeerUnreachable` is retried up to the configured limit first.
//! - drop with a side effect: `PreImageMismatch` slashes the offending
//!   validator; `SlotAlreadyExternalized` is a benign duplicate.
//! - surfaced to the caller: `ScriptFailed` carries the engine's reason.
//! - fatal: `StorageFailure` on the canonical store, `QuorumSetInsane`
//!   for this node's own quorum, and any invariant violation during
//!   block append.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// A transaction failed validation.
    #[error("invalid transaction: {0}")]
    InvalidTransaction(String),

    /// A block failed header or body validation.
    #[error("invalid block: {0}")]
    InvalidBlock(String),

    /// An enrollment failed admission checks.
    #[error("invalid enrollment: {0}")]
    InvalidEnrollment(String),

    /// A consensus envelope failed signature or structural checks.
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),

    /// A quorum set failed the sanity pass.
    #[error("quorum set insane: {0}")]
    QuorumSetInsane(String),

    /// A revealed pre-image does not hash back to its commitment.
    #[error("pre-image mismatch: {0}")]
    PreImageMismatch(String),

    /// The slot was already externalized; the duplicate is ignored.
    #[error("slot {0} already externalized")]
    SlotAlreadyExternalized(u64),

    /// A peer did not answer within the per-call timeout.
    #[error("peer unreachable: {0}")]
    PeerUnreachable(String),

    /// The canonical store failed; the node cannot continue.
    #[error("storage failure: {0}")]
    StorageFailure(String),

    /// The script engine rejected an unlock; the reason is surfaced.
    #[error("script failed: {0}")]
    ScriptFailed(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Storage helper used throughout the heed-backed store.
    pub fn storage(context: &str, err: impl std::fmt::Display) -> Self {
        Error::StorageFailure(format!("{context}: {err}"))
    }
}
