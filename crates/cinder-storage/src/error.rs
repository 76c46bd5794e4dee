//! Storage error types.

use thiserror::Error;

/// Errors raised by the storage layer.
#[derive(Error, Debug)]
pub enum StorageError {
    /// The underlying RocksDB instance reported a failure.
    #[error("rocksdb: {0}")]
    Database(#[from] rocksdb::Error),

    /// A column family handle was missing from the opened database.
    #[error("missing column family: {0}")]
    ColumnFamilyNotFound(String),

    /// Filesystem-level failure while opening or writing the database.
    #[error("storage io: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
