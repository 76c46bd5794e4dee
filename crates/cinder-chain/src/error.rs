//! Error types for the chain store.

use cinder_types::{Hash, TxError};
use thiserror::Error;

/// Chain-specific errors.
#[derive(Error, Debug)]
pub enum ChainError {
    /// Underlying storage error.
    #[error("Storage error: {0}")]
    Storage(#[from] cinder_storage::StorageError),

    /// State execution error.
    #[error("State error: {0}")]
    State(#[from] cinder_state::StateError),

    /// Block failed a structural or linkage check.
    #[error("Invalid block at height {height}: {reason}")]
    InvalidBlock {
        /// Height the block claims.
        height: u64,
        /// What failed.
        reason: String,
    },

    /// A transaction in the block failed validation.
    #[error("Invalid transaction {hash} at height {height}: {source}")]
    InvalidTransaction {
        /// Height of the containing block.
        height: u64,
        /// Hash of the offending transaction.
        hash: Hash,
        /// The validation failure.
        source: TxError,
    },

    /// Stored genesis differs from the configured genesis.
    #[error("Genesis mismatch: stored {stored}, configured {configured}")]
    GenesisMismatch {
        /// Genesis hash found in storage.
        stored: Hash,
        /// Genesis hash derived from configuration.
        configured: Hash,
    },

    /// The store contradicts itself.
    #[error("Chain store corrupt: {0}")]
    Corrupt(String),
}

/// Result type for chain operations.
pub type ChainResult<T> = Result<T, ChainError>;
