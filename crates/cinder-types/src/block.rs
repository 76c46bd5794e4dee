//! Block headers and blocks.

use crate::codec;
use crate::hash::{Address, Hash};
use crate::merkle::merkle_root;
use crate::transaction::Transaction;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Block rejection reasons detected from the block contents alone.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BlockError {
    /// The header transaction root does not match the transaction list.
    #[error("transaction root mismatch")]
    TxRootMismatch,

    /// The cached header hash does not match the header contents.
    #[error("header hash mismatch")]
    HeaderHashMismatch,
}

/// Block header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    /// Hash of the parent block header.
    pub previous_hash: Hash,
    /// Address credited with the block fees.
    pub creator: Address,
    /// Root of the account state after executing this block.
    pub state_root: Hash,
    /// Merkle root of the transaction list.
    pub tx_root: Hash,
    /// Root over the receipts produced by this block's transactions. Zero
    /// until an execution layer fills it in.
    pub receipt_root: Hash,
    /// Block difficulty.
    pub difficulty: u64,
    /// Block height; the genesis block is at height zero.
    pub height: u64,
    /// Creation time in unix seconds.
    pub timestamp: u64,
    /// Consensus nonce.
    pub nonce: u64,
    /// Arbitrary extra data.
    pub extra_data: Vec<u8>,
}

impl BlockHeader {
    /// Content hash of the header.
    pub fn hash(&self) -> Hash {
        Hash::of(&codec::encode(self))
    }
}

/// A block: header plus the full transaction list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Cached hash of the header.
    pub header_hash: Hash,
    /// The block header.
    pub header: BlockHeader,
    /// Ordered transactions covered by `header.tx_root`.
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Assemble a block from a header and its transactions.
    pub fn new(header: BlockHeader, transactions: Vec<Transaction>) -> Self {
        Self {
            header_hash: header.hash(),
            header,
            transactions,
        }
    }

    /// Block height, taken from the header.
    pub fn height(&self) -> u64 {
        self.header.height
    }

    /// Check the internal consistency of the block.
    ///
    /// Verifies the cached header hash and that the transaction list matches
    /// the header transaction root. Per-transaction validation against account
    /// state happens at import time.
    pub fn validate_body(&self) -> Result<(), BlockError> {
        if self.header_hash != self.header.hash() {
            return Err(BlockError::HeaderHashMismatch);
        }
        if merkle_root(&self.transactions) != self.header.tx_root {
            return Err(BlockError::TxRootMismatch);
        }
        Ok(())
    }
}
