//! Canonical chain store.

use crate::{ChainError, ChainResult, Genesis};
use cinder_state::{Account, StateDb, StateTransition};
use cinder_storage::{ColumnFamily, Storage, WriteBatch};
use cinder_types::{codec, Address, Block, BlockHeader, Hash, Transaction};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, info, warn};

const HEAD_KEY: &[u8] = b"head";
const GENESIS_KEY: &[u8] = b"genesis";
const STATE_ROOT_KEY: &[u8] = b"state_root";

fn undo_key(height: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(5 + 8);
    key.extend_from_slice(b"undo:");
    key.extend_from_slice(&height.to_be_bytes());
    key
}

/// The current chain head.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct HeadInfo {
    /// Height of the head block.
    pub height: u64,
    /// Header hash of the head block.
    pub hash: Hash,
    /// Sum of block difficulties from genesis to the head.
    pub total_difficulty: u64,
}

/// The canonical block chain.
///
/// Blocks extend the chain strictly in order: each import must carry the
/// next height and reference the current head as its parent. Import
/// executes the block's transactions and commits everything in one batch,
/// so the store never holds a partially imported block. Each import also
/// records the prior value of every touched account, so [`rewind_to`] can
/// drop canonical blocks again when a heavier branch is adopted.
///
/// [`rewind_to`]: Blockchain::rewind_to
pub struct Blockchain {
    storage: Arc<dyn Storage>,
    state: StateDb,
    head: RwLock<HeadInfo>,
}

impl Blockchain {
    /// Open the chain store, writing the genesis block on first use.
    ///
    /// Re-opening an existing store verifies that the stored genesis matches
    /// the configured one and reloads the persisted head.
    pub fn init(storage: Arc<dyn Storage>, genesis: &Genesis) -> ChainResult<Self> {
        let state = StateDb::new(Arc::clone(&storage));
        let configured = genesis.hash();

        if let Some(stored) = storage.get(ColumnFamily::Metadata, GENESIS_KEY)? {
            let stored = Hash::from_slice(&stored)
                .ok_or_else(|| ChainError::Corrupt("bad genesis hash length".into()))?;
            if stored != configured {
                return Err(ChainError::GenesisMismatch {
                    stored,
                    configured,
                });
            }

            let head_bytes = storage
                .get(ColumnFamily::Metadata, HEAD_KEY)?
                .ok_or_else(|| ChainError::Corrupt("genesis present but head missing".into()))?;
            let head: HeadInfo = codec::decode(&head_bytes)
                .map_err(|e| ChainError::Corrupt(format!("bad head record: {e}")))?;

            debug!(height = head.height, hash = %head.hash, "reopened chain store");
            return Ok(Self {
                storage,
                state,
                head: RwLock::new(head),
            });
        }

        let block = genesis.block();
        let head = HeadInfo {
            height: 0,
            hash: block.header_hash,
            total_difficulty: block.header.difficulty,
        };

        let mut transition = StateTransition::new(&state);
        for (address, balance) in &genesis.alloc {
            transition.credit(*address, *balance)?;
        }
        let state_root = transition.root()?;

        let mut batch = WriteBatch::new();
        transition.stage(&mut batch);
        stage_block(&mut batch, &block);
        batch.put(ColumnFamily::Metadata, GENESIS_KEY, configured.as_bytes());
        batch.put(ColumnFamily::Metadata, HEAD_KEY, codec::encode(&head));
        batch.put(ColumnFamily::Metadata, STATE_ROOT_KEY, state_root.as_bytes());
        storage.write_batch(batch)?;

        info!(hash = %head.hash, accounts = genesis.alloc.len(), "wrote genesis block");
        Ok(Self {
            storage,
            state,
            head: RwLock::new(head),
        })
    }

    /// Read-only view over committed account state.
    pub fn state(&self) -> &StateDb {
        &self.state
    }

    /// The current chain head.
    pub fn head(&self) -> HeadInfo {
        *self.head.read()
    }

    /// Height of the chain head.
    pub fn head_height(&self) -> u64 {
        self.head.read().height
    }

    /// Header hash of the chain head.
    pub fn head_hash(&self) -> Hash {
        self.head.read().hash
    }

    /// Total difficulty accumulated up to the head.
    pub fn total_difficulty(&self) -> u64 {
        self.head.read().total_difficulty
    }

    /// Canonical header hash at a height, if the chain reaches it.
    pub fn hash_at(&self, height: u64) -> ChainResult<Option<Hash>> {
        match self
            .storage
            .get(ColumnFamily::HeightIndex, &height.to_be_bytes())?
        {
            Some(bytes) => Hash::from_slice(&bytes)
                .map(Some)
                .ok_or_else(|| ChainError::Corrupt("bad height index entry".into())),
            None => Ok(None),
        }
    }

    /// Load a header by its hash.
    pub fn header_by_hash(&self, hash: &Hash) -> ChainResult<Option<BlockHeader>> {
        match self.storage.get(ColumnFamily::Headers, hash.as_bytes())? {
            Some(bytes) => codec::decode(&bytes)
                .map(Some)
                .map_err(|e| ChainError::Corrupt(format!("bad header record: {e}"))),
            None => Ok(None),
        }
    }

    /// Load the canonical header at a height.
    pub fn header_at(&self, height: u64) -> ChainResult<Option<BlockHeader>> {
        match self.hash_at(height)? {
            Some(hash) => self.header_by_hash(&hash),
            None => Ok(None),
        }
    }

    /// Load a full block by its header hash.
    pub fn block_by_hash(&self, hash: &Hash) -> ChainResult<Option<Block>> {
        let Some(header) = self.header_by_hash(hash)? else {
            return Ok(None);
        };
        let transactions: Vec<Transaction> = match self
            .storage
            .get(ColumnFamily::Blocks, hash.as_bytes())?
        {
            Some(bytes) => codec::decode(&bytes)
                .map_err(|e| ChainError::Corrupt(format!("bad block body: {e}")))?,
            None => return Err(ChainError::Corrupt(format!("header {hash} has no body"))),
        };
        Ok(Some(Block::new(header, transactions)))
    }

    /// Load the canonical block at a height.
    pub fn block_at(&self, height: u64) -> ChainResult<Option<Block>> {
        match self.hash_at(height)? {
            Some(hash) => self.block_by_hash(&hash),
            None => Ok(None),
        }
    }

    /// Import one block on top of the current head.
    ///
    /// The block must carry height `head + 1` and reference the head as its
    /// parent. Every transaction is validated and executed; account changes,
    /// header, body, height index and the new head commit in a single batch.
    pub fn write_block(&self, block: &Block) -> ChainResult<()> {
        let mut head = self.head.write();

        let height = block.height();
        if height != head.height + 1 {
            return Err(ChainError::InvalidBlock {
                height,
                reason: format!("expected height {}", head.height + 1),
            });
        }
        if block.header.previous_hash != head.hash {
            return Err(ChainError::InvalidBlock {
                height,
                reason: format!(
                    "parent {} does not match head {}",
                    block.header.previous_hash, head.hash
                ),
            });
        }
        block.validate_body().map_err(|e| ChainError::InvalidBlock {
            height,
            reason: e.to_string(),
        })?;

        let creator = block.header.creator;
        let mut transition = StateTransition::new(&self.state);
        transition.load_for_block(creator, &block.transactions)?;

        for tx in &block.transactions {
            tx.validate(&transition)
                .map_err(|source| ChainError::InvalidTransaction {
                    height,
                    hash: tx.hash,
                    source,
                })?;
            transition.apply(tx)?;
            transition.credit(creator, tx.data.fee)?;
        }

        let state_root = transition.root()?;
        if state_root != block.header.state_root {
            // Creators are not required to pre-compute the root, so a
            // mismatch is logged rather than rejected.
            warn!(
                height,
                computed = %state_root,
                declared = %block.header.state_root,
                "state root mismatch"
            );
        }

        let new_head = HeadInfo {
            height,
            hash: block.header_hash,
            total_difficulty: head.total_difficulty.saturating_add(block.header.difficulty),
        };

        let mut batch = WriteBatch::new();
        transition.stage(&mut batch);
        stage_block(&mut batch, block);
        batch.put(
            ColumnFamily::Metadata,
            undo_key(height),
            codec::encode(&transition.undo_record()),
        );
        batch.put(ColumnFamily::Metadata, HEAD_KEY, codec::encode(&new_head));
        batch.put(ColumnFamily::Metadata, STATE_ROOT_KEY, state_root.as_bytes());
        self.storage.write_batch(batch)?;

        *head = new_head;
        debug!(height, hash = %new_head.hash, txs = block.transactions.len(), "imported block");
        Ok(())
    }

    /// Drop canonical blocks above `target`, restoring account state to what
    /// it was at that height. Returns the number of blocks removed.
    ///
    /// Headers and bodies of the removed blocks stay in storage under their
    /// hashes; only the canonical index, the undo records and the head move.
    /// State, index and head changes commit in a single batch.
    pub fn rewind_to(&self, target: u64) -> ChainResult<u64> {
        let mut head = self.head.write();
        if target >= head.height {
            return Ok(0);
        }

        let mut revert = StateTransition::new(&self.state);
        let mut difficulty_removed = 0u64;
        let mut batch = WriteBatch::new();

        for height in (target + 1..=head.height).rev() {
            let header = self
                .header_at(height)?
                .ok_or_else(|| ChainError::Corrupt(format!("no canonical header at {height}")))?;
            difficulty_removed = difficulty_removed.saturating_add(header.difficulty);

            let undo_bytes = self
                .storage
                .get(ColumnFamily::Metadata, &undo_key(height))?
                .ok_or_else(|| ChainError::Corrupt(format!("no undo record at {height}")))?;
            let undo: Vec<(Address, Option<Account>)> = codec::decode(&undo_bytes)
                .map_err(|e| ChainError::Corrupt(format!("bad undo record at {height}: {e}")))?;
            // Walking downward, so the lowest block's prior values land last
            // and win for accounts touched by several of the removed blocks.
            revert.restore(&undo);

            batch.delete(ColumnFamily::HeightIndex, &height.to_be_bytes()[..]);
            batch.delete(ColumnFamily::Metadata, undo_key(height));
        }

        let hash = self
            .hash_at(target)?
            .ok_or_else(|| ChainError::Corrupt(format!("no canonical header at {target}")))?;
        let new_head = HeadInfo {
            height: target,
            hash,
            total_difficulty: head.total_difficulty.saturating_sub(difficulty_removed),
        };
        let state_root = revert.root()?;

        revert.stage(&mut batch);
        batch.put(ColumnFamily::Metadata, HEAD_KEY, codec::encode(&new_head));
        batch.put(ColumnFamily::Metadata, STATE_ROOT_KEY, state_root.as_bytes());
        self.storage.write_batch(batch)?;

        let removed = head.height - target;
        *head = new_head;
        info!(target, removed, hash = %new_head.hash, "rewound chain head");
        Ok(removed)
    }
}

fn stage_block(batch: &mut WriteBatch, block: &Block) {
    let hash = block.header_hash;
    batch.put(
        ColumnFamily::Headers,
        hash.as_bytes(),
        codec::encode(&block.header),
    );
    batch.put(
        ColumnFamily::Blocks,
        hash.as_bytes(),
        codec::encode(&block.transactions),
    );
    batch.put(
        ColumnFamily::HeightIndex,
        &block.height().to_be_bytes()[..],
        hash.as_bytes(),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinder_storage::Database;
    use cinder_types::{empty_tx_root, Address};
    use tempfile::TempDir;

    fn open(tmp: &TempDir, genesis: &Genesis) -> ChainResult<Blockchain> {
        let storage: Arc<dyn Storage> = Arc::new(Database::open(tmp.path()).unwrap());
        Blockchain::init(storage, genesis)
    }

    fn empty_child(chain: &Blockchain) -> Block {
        let head = chain.head();
        let header = BlockHeader {
            previous_hash: head.hash,
            creator: Address::ZERO,
            state_root: Hash::ZERO,
            tx_root: empty_tx_root(),
            receipt_root: Hash::ZERO,
            difficulty: 2,
            height: head.height + 1,
            timestamp: 0,
            nonce: 0,
            extra_data: Vec::new(),
        };
        Block::new(header, Vec::new())
    }

    #[test]
    fn test_init_writes_genesis_once() {
        let tmp = TempDir::new().unwrap();
        let genesis = Genesis::default();

        let chain = open(&tmp, &genesis).unwrap();
        assert_eq!(chain.head_height(), 0);
        assert_eq!(chain.head_hash(), genesis.hash());
        drop(chain);

        // Reopen against the same files.
        let chain = open(&tmp, &genesis).unwrap();
        assert_eq!(chain.head_height(), 0);
        assert_eq!(chain.hash_at(0).unwrap(), Some(genesis.hash()));
    }

    #[test]
    fn test_init_rejects_different_genesis() {
        let tmp = TempDir::new().unwrap();
        open(&tmp, &Genesis::default()).unwrap();

        let other = Genesis {
            extra_data: b"different network".to_vec(),
            ..Genesis::default()
        };
        assert!(matches!(
            open(&tmp, &other).err(),
            Some(ChainError::GenesisMismatch { .. })
        ));
    }

    #[test]
    fn test_genesis_alloc_funds_accounts() {
        let tmp = TempDir::new().unwrap();
        let rich = Address([7u8; 20]);
        let genesis = Genesis {
            alloc: vec![(rich, 1_000)],
            ..Genesis::default()
        };

        let chain = open(&tmp, &genesis).unwrap();
        assert_eq!(chain.state().balance(&rich).unwrap(), 1_000);
    }

    #[test]
    fn test_write_block_extends_head() {
        let tmp = TempDir::new().unwrap();
        let chain = open(&tmp, &Genesis::default()).unwrap();

        let block = empty_child(&chain);
        chain.write_block(&block).unwrap();

        assert_eq!(chain.head_height(), 1);
        assert_eq!(chain.head_hash(), block.header_hash);
        assert_eq!(chain.total_difficulty(), 1 + 2);
        assert_eq!(chain.hash_at(1).unwrap(), Some(block.header_hash));
        assert_eq!(chain.block_at(1).unwrap().unwrap(), block);
    }

    #[test]
    fn test_write_block_rejects_height_gap() {
        let tmp = TempDir::new().unwrap();
        let chain = open(&tmp, &Genesis::default()).unwrap();

        let mut block = empty_child(&chain);
        block.header.height = 5;
        block.header_hash = block.header.hash();

        let err = chain.write_block(&block).unwrap_err();
        assert!(matches!(err, ChainError::InvalidBlock { height: 5, .. }));
        assert_eq!(chain.head_height(), 0);
    }

    #[test]
    fn test_write_block_rejects_unknown_parent() {
        let tmp = TempDir::new().unwrap();
        let chain = open(&tmp, &Genesis::default()).unwrap();

        let mut block = empty_child(&chain);
        block.header.previous_hash = Hash::of(b"elsewhere");
        block.header_hash = block.header.hash();

        let err = chain.write_block(&block).unwrap_err();
        assert!(matches!(err, ChainError::InvalidBlock { height: 1, .. }));
    }

    #[test]
    fn test_write_block_rejects_tampered_body() {
        let tmp = TempDir::new().unwrap();
        let chain = open(&tmp, &Genesis::default()).unwrap();

        let mut block = empty_child(&chain);
        block.header.tx_root = Hash::of(b"not the real root");
        // Header hash left stale on purpose.

        let err = chain.write_block(&block).unwrap_err();
        assert!(matches!(err, ChainError::InvalidBlock { .. }));
    }

    #[test]
    fn test_rewind_drops_blocks_and_difficulty() {
        let tmp = TempDir::new().unwrap();
        let chain = open(&tmp, &Genesis::default()).unwrap();

        let first = empty_child(&chain);
        chain.write_block(&first).unwrap();
        let second = empty_child(&chain);
        chain.write_block(&second).unwrap();
        assert_eq!(chain.total_difficulty(), 1 + 2 + 2);

        let removed = chain.rewind_to(1).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(chain.head_height(), 1);
        assert_eq!(chain.head_hash(), first.header_hash);
        assert_eq!(chain.total_difficulty(), 1 + 2);
        assert_eq!(chain.hash_at(2).unwrap(), None);
        // The removed block stays readable by hash.
        assert_eq!(
            chain.block_by_hash(&second.header_hash).unwrap(),
            Some(second)
        );

        // A different block can now take height 2.
        let mut replacement = empty_child(&chain);
        replacement.header.timestamp = 99;
        replacement.header_hash = replacement.header.hash();
        chain.write_block(&replacement).unwrap();
        assert_eq!(chain.head_hash(), replacement.header_hash);
    }

    #[test]
    fn test_rewind_at_or_above_head_is_a_no_op() {
        let tmp = TempDir::new().unwrap();
        let chain = open(&tmp, &Genesis::default()).unwrap();
        chain.write_block(&empty_child(&chain)).unwrap();
        let head = chain.head();

        assert_eq!(chain.rewind_to(1).unwrap(), 0);
        assert_eq!(chain.rewind_to(9).unwrap(), 0);
        assert_eq!(chain.head(), head);
    }

    #[test]
    fn test_head_survives_reopen() {
        let tmp = TempDir::new().unwrap();
        let genesis = Genesis::default();
        let chain = open(&tmp, &genesis).unwrap();

        let block = empty_child(&chain);
        chain.write_block(&block).unwrap();
        let head = chain.head();
        drop(chain);

        let chain = open(&tmp, &genesis).unwrap();
        assert_eq!(chain.head(), head);
    }
}
