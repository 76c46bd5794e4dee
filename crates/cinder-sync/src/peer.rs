//! Sync peers and the peer set.

use crate::error::TransportError;
use cinder_types::Hash;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Peer identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub String);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        PeerId(s.to_string())
    }
}

/// Where a header or block request starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOrigin {
    /// Start at the header with this hash.
    Hash(Hash),
    /// Start at this height on the peer's canonical chain.
    Height(u64),
}

/// Transport-facing view of a remote peer.
///
/// Requests are fire-and-forget; responses arrive asynchronously through
/// the downloader's event channel.
pub trait SyncPeer: Send + Sync {
    /// The peer's advertised head hash and total difficulty.
    fn head(&self) -> (Hash, u64);

    /// Request `amount` consecutive headers starting at `origin`, walking
    /// toward lower heights when `reverse` is set.
    fn request_headers(
        &self,
        origin: RequestOrigin,
        amount: usize,
        reverse: bool,
    ) -> Result<(), TransportError>;

    /// Request `amount` consecutive full blocks starting at `origin`.
    fn request_blocks(&self, origin: RequestOrigin, amount: usize) -> Result<(), TransportError>;
}

/// A registered peer with its sync bookkeeping.
///
/// A connection serves at most one outstanding request at a time; the busy
/// flag is claimed with [`PeerConnection::try_reserve`] before each request.
pub struct PeerConnection {
    id: PeerId,
    peer: Arc<dyn SyncPeer>,
    busy: AtomicBool,
    head_hash: RwLock<Hash>,
    total_difficulty: AtomicU64,
}

impl PeerConnection {
    /// Wrap a transport peer, snapshotting its advertised head.
    pub fn new(id: PeerId, peer: Arc<dyn SyncPeer>) -> Self {
        let (head_hash, total_difficulty) = peer.head();
        Self {
            id,
            peer,
            busy: AtomicBool::new(false),
            head_hash: RwLock::new(head_hash),
            total_difficulty: AtomicU64::new(total_difficulty),
        }
    }

    /// The peer's identifier.
    pub fn id(&self) -> &PeerId {
        &self.id
    }

    /// Last advertised head hash.
    pub fn head_hash(&self) -> Hash {
        *self.head_hash.read()
    }

    /// Last advertised total difficulty.
    pub fn total_difficulty(&self) -> u64 {
        self.total_difficulty.load(Ordering::Acquire)
    }

    /// Record a new advertised head.
    pub fn update_head(&self, hash: Hash, total_difficulty: u64) {
        *self.head_hash.write() = hash;
        self.total_difficulty
            .store(total_difficulty, Ordering::Release);
    }

    /// Claim the connection for one request. Returns false if it is busy.
    pub fn try_reserve(&self) -> bool {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Return the connection to the idle pool.
    pub fn release(&self) {
        self.busy.store(false, Ordering::Release);
    }

    /// Whether the connection has no outstanding request.
    pub fn is_idle(&self) -> bool {
        !self.busy.load(Ordering::Acquire)
    }

    /// Request an ascending batch of headers by starting height.
    pub fn request_headers(&self, from: u64, amount: usize) -> Result<(), TransportError> {
        self.peer
            .request_headers(RequestOrigin::Height(from), amount, false)
    }

    /// Request the single header at a height.
    pub fn request_header_at(&self, height: u64) -> Result<(), TransportError> {
        self.peer
            .request_headers(RequestOrigin::Height(height), 1, false)
    }

    /// Request the single header with a known hash.
    pub fn request_header_by_hash(&self, hash: Hash) -> Result<(), TransportError> {
        self.peer
            .request_headers(RequestOrigin::Hash(hash), 1, false)
    }

    /// Request a batch of full blocks by starting height.
    pub fn request_blocks(&self, from: u64, amount: usize) -> Result<(), TransportError> {
        self.peer.request_blocks(RequestOrigin::Height(from), amount)
    }
}

impl fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerConnection")
            .field("id", &self.id)
            .field("busy", &self.busy.load(Ordering::Relaxed))
            .field("head_hash", &self.head_hash.read())
            .field(
                "total_difficulty",
                &self.total_difficulty.load(Ordering::Relaxed),
            )
            .finish()
    }
}

/// How the scheduler picks the next idle peer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PeerSelection {
    /// Prefer the peer advertising the highest total difficulty.
    #[default]
    HighestDifficulty,
    /// Rotate through idle peers in registration-independent order.
    RoundRobin,
}

/// The set of peers available for synchronization.
pub struct PeerSet {
    selection: PeerSelection,
    peers: RwLock<HashMap<PeerId, Arc<PeerConnection>>>,
    next: AtomicUsize,
}

impl PeerSet {
    /// Create an empty set with the given selection policy.
    pub fn new(selection: PeerSelection) -> Self {
        Self {
            selection,
            peers: RwLock::new(HashMap::new()),
            next: AtomicUsize::new(0),
        }
    }

    /// Add a connection, replacing any previous one with the same id.
    pub fn register(&self, conn: Arc<PeerConnection>) {
        debug!(peer = %conn.id(), "registered sync peer");
        self.peers.write().insert(conn.id().clone(), conn);
    }

    /// Remove a connection.
    pub fn unregister(&self, id: &PeerId) -> Option<Arc<PeerConnection>> {
        let removed = self.peers.write().remove(id);
        if removed.is_some() {
            debug!(peer = %id, "unregistered sync peer");
        }
        removed
    }

    /// Look up a connection by id.
    pub fn get(&self, id: &PeerId) -> Option<Arc<PeerConnection>> {
        self.peers.read().get(id).cloned()
    }

    /// Reserve an idle connection according to the selection policy.
    pub fn acquire_idle(&self) -> Option<Arc<PeerConnection>> {
        let peers = self.peers.read();
        let mut idle: Vec<&Arc<PeerConnection>> =
            peers.values().filter(|c| c.is_idle()).collect();
        if idle.is_empty() {
            return None;
        }

        match self.selection {
            PeerSelection::HighestDifficulty => {
                idle.sort_by_key(|c| std::cmp::Reverse(c.total_difficulty()));
            }
            PeerSelection::RoundRobin => {
                idle.sort_by(|a, b| a.id().cmp(b.id()));
                let start = self.next.fetch_add(1, Ordering::Relaxed) % idle.len();
                idle.rotate_left(start);
            }
        }

        // Another task can reserve a peer between the scan and the claim, so
        // keep trying down the list.
        for conn in idle {
            if conn.try_reserve() {
                return Some(Arc::clone(conn));
            }
        }
        None
    }

    /// Release every connection. Used when a session ends.
    pub fn release_all(&self) {
        for conn in self.peers.read().values() {
            conn.release();
        }
    }

    /// Number of registered peers.
    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    /// Number of peers with no outstanding request.
    pub fn idle_count(&self) -> usize {
        self.peers.read().values().filter(|c| c.is_idle()).count()
    }
}
