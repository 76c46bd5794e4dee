//! RocksDB database implementation.

use crate::batch::BatchOp;
use crate::{Storage, StorageError, StorageResult, WriteBatch};
use parking_lot::RwLock;
use rocksdb::{ColumnFamilyDescriptor, DBWithThreadMode, MultiThreaded, Options};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Column families for organizing data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnFamily {
    /// Block headers indexed by header hash.
    Headers,
    /// Transaction lists indexed by header hash.
    Blocks,
    /// Canonical chain mapping (big-endian height -> header hash).
    HeightIndex,
    /// Account state indexed by address.
    Accounts,
    /// Chain head and configuration.
    Metadata,
    /// Default column family (required by RocksDB).
    Default,
}

impl ColumnFamily {
    /// Get the string name of the column family.
    pub fn name(&self) -> &'static str {
        match self {
            ColumnFamily::Headers => "headers",
            ColumnFamily::Blocks => "blocks",
            ColumnFamily::HeightIndex => "height_index",
            ColumnFamily::Accounts => "accounts",
            ColumnFamily::Metadata => "metadata",
            ColumnFamily::Default => "default",
        }
    }

    /// Get all column families.
    pub fn all() -> &'static [ColumnFamily] {
        &[
            ColumnFamily::Headers,
            ColumnFamily::Blocks,
            ColumnFamily::HeightIndex,
            ColumnFamily::Accounts,
            ColumnFamily::Metadata,
            ColumnFamily::Default,
        ]
    }
}

/// RocksDB database wrapper.
pub struct Database {
    db: Arc<RwLock<DBWithThreadMode<MultiThreaded>>>,
}

impl Database {
    /// Open or create a database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> StorageResult<Self> {
        let path = path.as_ref();
        info!("Opening database at {:?}", path);

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        opts.set_max_open_files(256);
        opts.set_keep_log_file_num(1);
        opts.set_max_total_wal_size(64 * 1024 * 1024); // 64MB

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = ColumnFamily::all()
            .iter()
            .map(|cf| {
                let mut cf_opts = Options::default();
                cf_opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
                ColumnFamilyDescriptor::new(cf.name(), cf_opts)
            })
            .collect();

        let db =
            DBWithThreadMode::<MultiThreaded>::open_cf_descriptors(&opts, path, cf_descriptors)?;

        debug!("Database opened successfully");

        Ok(Self {
            db: Arc::new(RwLock::new(db)),
        })
    }

}

impl Storage for Database {
    fn get(&self, cf: ColumnFamily, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        let db = self.db.read();
        let handle = db
            .cf_handle(cf.name())
            .ok_or_else(|| StorageError::ColumnFamilyNotFound(cf.name().to_string()))?;
        Ok(db.get_cf(&handle, key)?)
    }

    fn put(&self, cf: ColumnFamily, key: &[u8], value: &[u8]) -> StorageResult<()> {
        let db = self.db.read();
        let handle = db
            .cf_handle(cf.name())
            .ok_or_else(|| StorageError::ColumnFamilyNotFound(cf.name().to_string()))?;
        db.put_cf(&handle, key, value)?;
        Ok(())
    }

    fn delete(&self, cf: ColumnFamily, key: &[u8]) -> StorageResult<()> {
        let db = self.db.read();
        let handle = db
            .cf_handle(cf.name())
            .ok_or_else(|| StorageError::ColumnFamilyNotFound(cf.name().to_string()))?;
        db.delete_cf(&handle, key)?;
        Ok(())
    }

    fn write_batch(&self, batch: WriteBatch) -> StorageResult<()> {
        let db = self.db.read();
        let mut rocks_batch = rocksdb::WriteBatch::default();

        for op in &batch.ops {
            match op {
                BatchOp::Put { cf, key, value } => {
                    let handle = db
                        .cf_handle(cf.name())
                        .ok_or_else(|| StorageError::ColumnFamilyNotFound(cf.name().to_string()))?;
                    rocks_batch.put_cf(&handle, key, value);
                }
                BatchOp::Delete { cf, key } => {
                    let handle = db
                        .cf_handle(cf.name())
                        .ok_or_else(|| StorageError::ColumnFamilyNotFound(cf.name().to_string()))?;
                    rocks_batch.delete_cf(&handle, key);
                }
            }
        }

        db.write(rocks_batch)?;
        Ok(())
    }

    fn iter(
        &self,
        cf: ColumnFamily,
    ) -> StorageResult<Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + '_>> {
        let db = self.db.read();
        let handle = db
            .cf_handle(cf.name())
            .ok_or_else(|| StorageError::ColumnFamilyNotFound(cf.name().to_string()))?;

        let iter = db.iterator_cf(&handle, rocksdb::IteratorMode::Start);

        // Note: This is a simplified implementation. In production, we'd need
        // to handle the lifetime properly with a wrapper type.
        let collected: Vec<_> = iter
            .filter_map(|r| r.ok())
            .map(|(k, v)| (k.to_vec(), v.to_vec()))
            .collect();

        Ok(Box::new(collected.into_iter()))
    }
}

impl Clone for Database {
    fn clone(&self) -> Self {
        Self {
            db: Arc::clone(&self.db),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_database_open_and_write() {
        let tmp = TempDir::new().unwrap();
        let db = Database::open(tmp.path()).unwrap();

        db.put(ColumnFamily::Metadata, b"key1", b"value1").unwrap();
        let value = db.get(ColumnFamily::Metadata, b"key1").unwrap();
        assert_eq!(value, Some(b"value1".to_vec()));

        db.delete(ColumnFamily::Metadata, b"key1").unwrap();
        let value = db.get(ColumnFamily::Metadata, b"key1").unwrap();
        assert_eq!(value, None);
    }

    #[test]
    fn test_write_batch_is_atomic_across_families() {
        let tmp = TempDir::new().unwrap();
        let db = Database::open(tmp.path()).unwrap();

        let mut batch = WriteBatch::new();
        batch.put(ColumnFamily::Headers, b"h1", b"header1");
        batch.put(ColumnFamily::HeightIndex, &1u64.to_be_bytes()[..], b"h1");
        batch.put(ColumnFamily::Accounts, b"addr1", b"state");

        db.write_batch(batch).unwrap();

        assert_eq!(
            db.get(ColumnFamily::Headers, b"h1").unwrap(),
            Some(b"header1".to_vec())
        );
        assert_eq!(
            db.get(ColumnFamily::HeightIndex, &1u64.to_be_bytes())
                .unwrap(),
            Some(b"h1".to_vec())
        );
        assert_eq!(
            db.get(ColumnFamily::Accounts, b"addr1").unwrap(),
            Some(b"state".to_vec())
        );
    }

    #[test]
    fn test_iter_returns_all_entries() {
        let tmp = TempDir::new().unwrap();
        let db = Database::open(tmp.path()).unwrap();

        db.put(ColumnFamily::Accounts, b"a", b"1").unwrap();
        db.put(ColumnFamily::Accounts, b"b", b"2").unwrap();

        let entries: Vec<_> = db.iter(ColumnFamily::Accounts).unwrap().collect();
        assert_eq!(entries.len(), 2);
    }
}
