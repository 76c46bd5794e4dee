//! Write batch for atomic operations.

use crate::ColumnFamily;

/// One staged write.
#[derive(Debug, Clone)]
pub enum BatchOp {
    /// Store a key-value pair.
    Put {
        /// Target column family.
        cf: ColumnFamily,
        /// Key to store under.
        key: Vec<u8>,
        /// Value bytes.
        value: Vec<u8>,
    },
    /// Remove a key.
    Delete {
        /// Target column family.
        cf: ColumnFamily,
        /// Key to remove.
        key: Vec<u8>,
    },
}

/// A batch of writes executed atomically, in insertion order.
///
/// Block import stages account updates, the header, the body and the new
/// chain head into one batch so a crash cannot leave a partial block behind.
/// Later writes to the same key win.
#[derive(Debug, Default)]
pub struct WriteBatch {
    pub(crate) ops: Vec<BatchOp>,
}

impl WriteBatch {
    /// Create a new empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage a put.
    pub fn put(&mut self, cf: ColumnFamily, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Put {
            cf,
            key: key.into(),
            value: value.into(),
        });
    }

    /// Stage a delete.
    pub fn delete(&mut self, cf: ColumnFamily, key: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Delete {
            cf,
            key: key.into(),
        });
    }

    /// Number of staged writes.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Whether the batch holds no writes.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_keeps_insertion_order() {
        let mut batch = WriteBatch::new();
        assert!(batch.is_empty());

        batch.put(ColumnFamily::Headers, b"key1", b"value1");
        batch.put(ColumnFamily::Accounts, b"key2", b"value2");
        batch.delete(ColumnFamily::Headers, b"key1");

        assert_eq!(batch.len(), 3);
        assert!(matches!(batch.ops[2], BatchOp::Delete { .. }));
    }
}
