//! Generators for keys, transactions, chains and scripted peers.

use cinder_chain::Genesis;
use cinder_sync::{RequestOrigin, PeerId, SyncEvent, SyncPeer, TransportError};
use cinder_types::{merkle_root, Address, Block, BlockHeader, Hash, Transaction};
use parking_lot::RwLock;
use secp256k1::{Secp256k1, SecretKey};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::mpsc;

/// A funded test identity.
pub struct TestAccount {
    secret: SecretKey,
    /// Address derived from the account's public key.
    pub address: Address,
}

impl TestAccount {
    /// Generate a fresh keypair.
    pub fn generate() -> Self {
        let secp = Secp256k1::new();
        let (secret, public) = secp.generate_keypair(&mut rand::thread_rng());
        Self {
            secret,
            address: Address::from_public_key(&public),
        }
    }

    /// Build a signed transfer from this account.
    pub fn signed_transfer(&self, to: Address, amount: u64, fee: u64, nonce: u64) -> Transaction {
        let mut tx = Transaction::transfer(self.address, to, amount, fee, nonce)
            .expect("empty payload cannot be oversized");
        tx.sign(&self.secret);
        tx
    }
}

/// Builds block chains for tests, including forks.
///
/// Index 0 of the block list is always the genesis block; block heights
/// equal their list index.
pub struct ChainBuilder {
    blocks: Vec<Block>,
    difficulty: u64,
    creator: Address,
}

impl ChainBuilder {
    /// Start a chain at the given genesis.
    pub fn new(genesis: &Genesis) -> Self {
        Self {
            blocks: vec![genesis.block()],
            difficulty: 1,
            creator: Address::ZERO,
        }
    }

    /// Set the creator credited with fees in subsequent blocks.
    pub fn creator(mut self, creator: Address) -> Self {
        self.creator = creator;
        self
    }

    /// Append a block carrying `txs`. The salt lands in the header nonce so
    /// forks built from the same parent get distinct hashes.
    pub fn add_block(&mut self, txs: Vec<Transaction>, salt: u64) -> &Block {
        let parent = self.blocks.last().expect("genesis always present");
        let header = BlockHeader {
            previous_hash: parent.header_hash,
            creator: self.creator,
            state_root: Hash::ZERO,
            tx_root: merkle_root(&txs),
            receipt_root: Hash::ZERO,
            difficulty: self.difficulty,
            height: parent.height() + 1,
            timestamp: 0,
            nonce: salt,
            extra_data: Vec::new(),
        };
        self.blocks.push(Block::new(header, txs));
        self.blocks.last().expect("just pushed")
    }

    /// Append one empty block.
    pub fn add_empty(&mut self) -> &Block {
        self.add_block(Vec::new(), 0)
    }

    /// Append `n` empty blocks.
    pub fn add_empty_n(&mut self, n: usize) {
        for _ in 0..n {
            self.add_empty();
        }
    }

    /// Start a new builder sharing this chain up to and including `height`.
    pub fn fork_at(&self, height: u64) -> Self {
        Self {
            blocks: self.blocks[..=height as usize].to_vec(),
            difficulty: self.difficulty,
            creator: self.creator,
        }
    }

    /// All blocks, genesis first.
    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// Blocks above genesis, in import order.
    pub fn body(&self) -> &[Block] {
        &self.blocks[1..]
    }

    /// The tip block.
    pub fn head(&self) -> &Block {
        self.blocks.last().expect("genesis always present")
    }

    /// Height of the tip.
    pub fn height(&self) -> u64 {
        self.head().height()
    }

    /// Sum of difficulties, genesis included.
    pub fn total_difficulty(&self) -> u64 {
        self.blocks.iter().map(|b| b.header.difficulty).sum()
    }
}

/// A scripted remote peer serving a fixed chain.
///
/// Requests are answered synchronously through the downloader's event
/// channel. Individual response kinds can be muted to simulate peers that
/// go silent, and batch requests can be made to fail at the transport.
pub struct ScriptedPeer {
    id: PeerId,
    chain: RwLock<Vec<Block>>,
    events: mpsc::Sender<SyncEvent>,
    respond_probes: AtomicBool,
    respond_headers: AtomicBool,
    respond_blocks: AtomicBool,
    truncate_batches: AtomicBool,
    shift_batches: AtomicUsize,
    fail_transport: AtomicUsize,
    header_requests: AtomicUsize,
    block_requests: AtomicUsize,
}

impl ScriptedPeer {
    /// Create a peer serving `blocks` (genesis first) that answers
    /// everything.
    pub fn new(id: PeerId, blocks: Vec<Block>, events: mpsc::Sender<SyncEvent>) -> Self {
        assert!(!blocks.is_empty(), "peer chain needs at least a genesis");
        Self {
            id,
            chain: RwLock::new(blocks),
            events,
            respond_probes: AtomicBool::new(true),
            respond_headers: AtomicBool::new(true),
            respond_blocks: AtomicBool::new(true),
            truncate_batches: AtomicBool::new(false),
            shift_batches: AtomicUsize::new(0),
            fail_transport: AtomicUsize::new(0),
            header_requests: AtomicUsize::new(0),
            block_requests: AtomicUsize::new(0),
        }
    }

    /// Mute or unmute single-header probe responses.
    pub fn respond_probes(&self, respond: bool) {
        self.respond_probes.store(respond, Ordering::SeqCst);
    }

    /// Mute or unmute batch header responses.
    pub fn respond_headers(&self, respond: bool) {
        self.respond_headers.store(respond, Ordering::SeqCst);
    }

    /// Mute or unmute block responses.
    pub fn respond_blocks(&self, respond: bool) {
        self.respond_blocks.store(respond, Ordering::SeqCst);
    }

    /// Drop one header from every batch response.
    pub fn truncate_batches(&self, truncate: bool) {
        self.truncate_batches.store(truncate, Ordering::SeqCst);
    }

    /// Answer every batch header request starting `delta` heights past the
    /// requested one, as a response to some earlier request would.
    pub fn shift_batches(&self, delta: u64) {
        self.shift_batches.store(delta as usize, Ordering::SeqCst);
    }

    /// Fail the next `count` batch requests at the transport.
    pub fn fail_next_requests(&self, count: usize) {
        self.fail_transport.store(count, Ordering::SeqCst);
    }

    /// Header requests seen so far, probes included.
    pub fn header_request_count(&self) -> usize {
        self.header_requests.load(Ordering::SeqCst)
    }

    /// Block requests seen so far.
    pub fn block_request_count(&self) -> usize {
        self.block_requests.load(Ordering::SeqCst)
    }

    fn take_transport_failure(&self) -> bool {
        self.fail_transport
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn headers_from(&self, from: u64, amount: usize, reverse: bool) -> Vec<BlockHeader> {
        let chain = self.chain.read();
        let mut out = Vec::new();
        let mut height = Some(from);
        while out.len() < amount {
            let Some(h) = height else { break };
            let Some(block) = chain.get(h as usize) else { break };
            out.push(block.header.clone());
            height = if reverse { h.checked_sub(1) } else { h.checked_add(1) };
        }
        if self.truncate_batches.load(Ordering::SeqCst) && out.len() > 1 {
            out.pop();
        }
        out
    }

    fn send(&self, event: SyncEvent) {
        // A full channel behaves like a lossy network; the scheduler's
        // timeout path covers it.
        let _ = self.events.try_send(event);
    }
}

impl SyncPeer for ScriptedPeer {
    fn head(&self) -> (Hash, u64) {
        let chain = self.chain.read();
        let tip = chain.last().expect("peer chain is never empty");
        let total: u64 = chain.iter().map(|b| b.header.difficulty).sum();
        (tip.header_hash, total)
    }

    fn request_headers(
        &self,
        origin: RequestOrigin,
        amount: usize,
        reverse: bool,
    ) -> Result<(), TransportError> {
        self.header_requests.fetch_add(1, Ordering::SeqCst);

        if amount == 1 {
            if !self.respond_probes.load(Ordering::SeqCst) {
                return Ok(());
            }
            let chain = self.chain.read();
            let header = match origin {
                RequestOrigin::Hash(hash) => chain
                    .iter()
                    .find(|b| b.header_hash == hash)
                    .map(|b| b.header.clone()),
                RequestOrigin::Height(height) => {
                    chain.get(height as usize).map(|b| b.header.clone())
                }
            };
            drop(chain);
            self.send(SyncEvent::HeadersReceived {
                peer: self.id.clone(),
                headers: header.into_iter().collect(),
            });
            return Ok(());
        }

        if self.take_transport_failure() {
            return Err(TransportError("connection reset".to_string()));
        }
        if !self.respond_headers.load(Ordering::SeqCst) {
            return Ok(());
        }
        let shift = self.shift_batches.load(Ordering::SeqCst) as u64;
        let headers = match origin {
            RequestOrigin::Height(from) => self.headers_from(from + shift, amount, reverse),
            RequestOrigin::Hash(_) => Vec::new(),
        };
        self.send(SyncEvent::HeadersReceived {
            peer: self.id.clone(),
            headers,
        });
        Ok(())
    }

    fn request_blocks(&self, origin: RequestOrigin, amount: usize) -> Result<(), TransportError> {
        self.block_requests.fetch_add(1, Ordering::SeqCst);

        if self.take_transport_failure() {
            return Err(TransportError("connection reset".to_string()));
        }
        if !self.respond_blocks.load(Ordering::SeqCst) {
            return Ok(());
        }

        let chain = self.chain.read();
        let from = match origin {
            RequestOrigin::Height(height) => Some(height),
            RequestOrigin::Hash(hash) => chain
                .iter()
                .position(|b| b.header_hash == hash)
                .map(|pos| pos as u64),
        };
        let mut blocks = Vec::new();
        if let Some(from) = from {
            let mut height = from;
            while blocks.len() < amount && (height as usize) < chain.len() {
                blocks.push(chain[height as usize].clone());
                height += 1;
            }
        }
        drop(chain);
        self.send(SyncEvent::BlocksReceived {
            peer: self.id.clone(),
            blocks,
        });
        Ok(())
    }
}
