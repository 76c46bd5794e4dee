//! Error types for state management.

use cinder_types::Address;
use thiserror::Error;

/// State-specific errors.
#[derive(Error, Debug)]
pub enum StateError {
    /// Underlying storage error.
    #[error("Storage error: {0}")]
    Storage(#[from] cinder_storage::StorageError),

    /// Account record failed to decode.
    #[error("Account codec error: {0}")]
    Codec(String),

    /// Debit exceeds the account balance.
    #[error("Insufficient funds for account {address}")]
    InsufficientFunds {
        /// The debited account.
        address: Address,
    },

    /// Credit would overflow the account balance.
    #[error("Balance overflow for account {address}")]
    BalanceOverflow {
        /// The credited account.
        address: Address,
    },
}

/// Result type for state operations.
pub type StateResult<T> = Result<T, StateError>;
