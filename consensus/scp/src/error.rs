// Copyright (c) 2024-2025 The Kestrel Foundation

//! Error types for the consensus protocol engine.

use thiserror::Error;

/// Errors that can occur while driving the protocol.
#[derive(Debug, Error)]
pub enum ScpError {
    /// A message failed structural or signature-level checks.
    #[error("message validation failed: {0}")]
    MessageValidation(String),

    /// The sender advertised a quorum set that fails the sanity pass.
    #[error("insane quorum set: {0}")]
    InsaneQuorumSet(String),

    /// A ballot violated the protocol's ordering rules.
    #[error("invalid ballot state: {0}")]
    InvalidBallot(String),

    /// The combine callback rejected the confirmed candidates.
    #[error("combine failed: {0}")]
    CombineFailed(String),

    /// A slot was driven outside its legal phase transitions.
    #[error("invalid slot state: {0}")]
    InvalidSlotState(String),
}

/// Result type for protocol operations.
pub type ScpResult<T> = Result<T, ScpError>;
