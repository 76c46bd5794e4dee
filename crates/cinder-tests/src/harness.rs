//! Test harness for integration tests.
//!
//! Provides temporary chain stores and a storage wrapper with injectable
//! commit failures.

use cinder_chain::{Blockchain, Genesis};
use cinder_storage::{ColumnFamily, Database, Storage, StorageError, StorageResult, WriteBatch};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

/// A chain store over a temporary database.
pub struct TestChain {
    chain: Arc<Blockchain>,
    _temp_dir: TempDir,
}

impl TestChain {
    /// Initialize a chain with the given genesis in a temporary directory.
    pub fn new(genesis: &Genesis) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let storage: Arc<dyn Storage> =
            Arc::new(Database::open(temp_dir.path()).expect("Failed to open database"));
        let chain = Blockchain::init(storage, genesis).expect("Failed to init chain");
        Self {
            chain: Arc::new(chain),
            _temp_dir: temp_dir,
        }
    }

    /// Shared handle to the chain.
    pub fn chain(&self) -> Arc<Blockchain> {
        Arc::clone(&self.chain)
    }
}

/// Storage wrapper whose batch commits can be made to fail on demand.
///
/// Reads and single-key writes pass through untouched, so a failed commit
/// can be distinguished from a corrupted store.
pub struct FlakyStore {
    inner: Database,
    fail_batches: AtomicBool,
}

impl FlakyStore {
    /// Wrap a database with commits initially succeeding.
    pub fn new(inner: Database) -> Self {
        Self {
            inner,
            fail_batches: AtomicBool::new(false),
        }
    }

    /// Make every subsequent batch commit fail.
    pub fn fail_commits(&self, fail: bool) {
        self.fail_batches.store(fail, Ordering::SeqCst);
    }
}

impl Storage for FlakyStore {
    fn get(&self, cf: ColumnFamily, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        self.inner.get(cf, key)
    }

    fn put(&self, cf: ColumnFamily, key: &[u8], value: &[u8]) -> StorageResult<()> {
        self.inner.put(cf, key, value)
    }

    fn delete(&self, cf: ColumnFamily, key: &[u8]) -> StorageResult<()> {
        self.inner.delete(cf, key)
    }

    fn write_batch(&self, batch: WriteBatch) -> StorageResult<()> {
        if self.fail_batches.load(Ordering::SeqCst) {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "injected commit failure",
            )));
        }
        self.inner.write_batch(batch)
    }

    fn iter(
        &self,
        cf: ColumnFamily,
    ) -> StorageResult<Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + '_>> {
        self.inner.iter(cf)
    }
}
