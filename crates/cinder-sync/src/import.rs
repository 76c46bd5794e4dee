//! Ordered block import.

use crate::error::{SyncError, SyncResult};
use cinder_chain::{Blockchain, ChainError};
use cinder_state::StateError;
use cinder_types::Block;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Commits downloaded blocks to the local chain in strict height order.
pub struct Importer {
    chain: Arc<Blockchain>,
}

impl Importer {
    /// Create an importer over the local chain.
    pub fn new(chain: Arc<Blockchain>) -> Self {
        Self { chain }
    }

    /// Import `blocks` in ascending height order.
    ///
    /// The range must be contiguous and start right above the current head;
    /// each block commits atomically, so a failure partway leaves every
    /// earlier block durable and nothing of the failed one.
    ///
    /// Returns the number of blocks imported.
    pub fn import(&self, blocks: BTreeMap<u64, Block>) -> SyncResult<u64> {
        let mut expected = self.chain.head_height() + 1;
        let mut imported = 0u64;

        for (height, block) in &blocks {
            if *height != expected {
                return Err(SyncError::Protocol(format!(
                    "download is missing block at height {expected}"
                )));
            }
            self.chain
                .write_block(block)
                .map_err(|e| match e {
                    ChainError::Storage(_) | ChainError::State(StateError::Storage(_)) => {
                        SyncError::Store(e)
                    }
                    other => SyncError::BlockRejected {
                        height: *height,
                        reason: other.to_string(),
                    },
                })?;
            debug!(height, hash = %block.header_hash, "imported block");
            expected += 1;
            imported += 1;
        }

        if imported > 0 {
            info!(imported, head = self.chain.head_height(), "import complete");
        }
        Ok(imported)
    }
}
