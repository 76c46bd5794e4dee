//! # cinder-storage
//!
//! Storage layer for the Cinder blockchain node.
//!
//! This crate provides a RocksDB-based storage abstraction with support for:
//! - Column families for different data types (headers, blocks, accounts)
//! - Atomic batch writes
//! - Efficient key-value operations
//!
//! ## Column Families
//!
//! - `Headers`: Block headers indexed by header hash
//! - `Blocks`: Transaction lists indexed by header hash
//! - `HeightIndex`: Canonical chain mapping (height -> header hash)
//! - `Accounts`: Account state indexed by address
//! - `Metadata`: Chain head and configuration

mod batch;
mod database;
mod error;

pub use batch::{BatchOp, WriteBatch};
pub use database::{ColumnFamily, Database};
pub use error::{StorageError, StorageResult};

/// Storage trait for abstracting database operations.
///
/// This allows for easy testing with mock implementations.
pub trait Storage: Send + Sync {
    /// Get a value by key from a column family.
    fn get(&self, cf: ColumnFamily, key: &[u8]) -> StorageResult<Option<Vec<u8>>>;

    /// Put a key-value pair into a column family.
    fn put(&self, cf: ColumnFamily, key: &[u8], value: &[u8]) -> StorageResult<()>;

    /// Delete a key from a column family.
    fn delete(&self, cf: ColumnFamily, key: &[u8]) -> StorageResult<()>;

    /// Execute a batch of writes atomically.
    fn write_batch(&self, batch: WriteBatch) -> StorageResult<()>;

    /// Create an iterator over a column family.
    fn iter(
        &self,
        cf: ColumnFamily,
    ) -> StorageResult<Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + '_>>;
}
