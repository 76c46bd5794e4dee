//! Genesis configuration.

use cinder_types::{empty_tx_root, Address, Block, BlockHeader, Hash};

/// Parameters of the genesis block.
#[derive(Debug, Clone)]
pub struct Genesis {
    /// Genesis timestamp in unix seconds.
    pub timestamp: u64,
    /// Difficulty assigned to the genesis header.
    pub difficulty: u64,
    /// Extra data embedded in the genesis header.
    pub extra_data: Vec<u8>,
    /// Initial account balances.
    pub alloc: Vec<(Address, u64)>,
}

impl Default for Genesis {
    fn default() -> Self {
        Self {
            timestamp: 0,
            difficulty: 1,
            extra_data: b"cinder genesis".to_vec(),
            alloc: Vec::new(),
        }
    }
}

impl Genesis {
    /// Build the genesis block for this configuration.
    ///
    /// The genesis block sits at height zero with a zero parent hash and an
    /// empty transaction list. Its state root is left zero; the initial
    /// allocation is written directly at initialization.
    pub fn block(&self) -> Block {
        let header = BlockHeader {
            previous_hash: Hash::ZERO,
            creator: Address::ZERO,
            state_root: Hash::ZERO,
            tx_root: empty_tx_root(),
            receipt_root: Hash::ZERO,
            difficulty: self.difficulty,
            height: 0,
            timestamp: self.timestamp,
            nonce: 0,
            extra_data: self.extra_data.clone(),
        };
        Block::new(header, Vec::new())
    }

    /// Hash of the genesis block header.
    pub fn hash(&self) -> Hash {
        self.block().header_hash
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_genesis_block_shape() {
        let genesis = Genesis::default();
        let block = genesis.block();

        assert_eq!(block.height(), 0);
        assert_eq!(block.header.previous_hash, Hash::ZERO);
        assert!(block.transactions.is_empty());
        assert_eq!(block.validate_body(), Ok(()));
    }

    #[test]
    fn test_alloc_does_not_change_genesis_hash() {
        let base = Genesis::default();
        let funded = Genesis {
            alloc: vec![(Address::ZERO, 1_000)],
            ..Genesis::default()
        };
        assert_eq!(base.hash(), funded.hash());

        let other = Genesis {
            extra_data: b"other".to_vec(),
            ..Genesis::default()
        };
        assert_ne!(base.hash(), other.hash());
    }
}
