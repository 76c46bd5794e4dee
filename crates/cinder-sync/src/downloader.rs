//! The sync session driver.

use crate::ancestor::AncestorFinder;
use crate::cancel::Cancellation;
use crate::error::{SyncError, SyncResult};
use crate::import::Importer;
use crate::peer::{PeerConnection, PeerId, PeerSelection, PeerSet, SyncPeer};
use crate::scheduler::Scheduler;
use crate::{HEADERS_BATCH_SIZE, MAX_RETRIES, REQUEST_TIMEOUT};
use cinder_chain::Blockchain;
use cinder_types::{Block, BlockHeader, Hash};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Where a sync session currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    /// No session running.
    Idle,
    /// Locating the common ancestor with the peer.
    FindingAncestor,
    /// Downloading headers above the ancestor.
    FetchingHeaders,
    /// Downloading block bodies for validated headers.
    FetchingBodies,
    /// Committing blocks to the local chain.
    Importing,
    /// The last session completed.
    Done,
    /// The last session aborted.
    Failed,
}

/// Observable state of the downloader.
#[derive(Debug, Clone)]
pub struct SyncStatus {
    /// Current phase.
    pub phase: SyncPhase,
    /// Every phase the current or last session passed through, in order.
    pub trace: Vec<SyncPhase>,
    /// Common ancestor found by the last session.
    pub ancestor: Option<u64>,
    /// Remote head height the last session aimed for.
    pub target_height: Option<u64>,
    /// Blocks committed by the last session.
    pub imported: u64,
    /// Why the last session failed.
    pub last_error: Option<String>,
}

impl SyncStatus {
    fn fresh() -> Self {
        Self {
            phase: SyncPhase::Idle,
            trace: Vec::new(),
            ancestor: None,
            target_height: None,
            imported: 0,
            last_error: None,
        }
    }

    fn enter(&mut self, phase: SyncPhase) {
        self.phase = phase;
        self.trace.push(phase);
    }
}

/// Downloader tuning knobs.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Headers or bodies per request.
    pub batch_size: usize,
    /// How long to wait for a peer to answer one request.
    pub request_timeout: Duration,
    /// How many times a failed request is reassigned before aborting.
    pub max_retries: u32,
    /// Capacity of the response event channel.
    pub event_buffer: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: HEADERS_BATCH_SIZE,
            request_timeout: REQUEST_TIMEOUT,
            max_retries: MAX_RETRIES,
            event_buffer: 256,
        }
    }
}

impl SyncConfig {
    fn validate(&self) -> SyncResult<()> {
        if self.batch_size == 0 {
            return Err(SyncError::Config("batch_size must be positive".into()));
        }
        if self.event_buffer == 0 {
            return Err(SyncError::Config("event_buffer must be positive".into()));
        }
        if self.request_timeout.is_zero() {
            return Err(SyncError::Config("request_timeout must be positive".into()));
        }
        Ok(())
    }
}

/// A response or peer lifecycle notification from the transport.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// A peer answered a header request.
    HeadersReceived {
        /// Responding peer.
        peer: PeerId,
        /// The headers, in the requested order.
        headers: Vec<BlockHeader>,
    },
    /// A peer answered a block request.
    BlocksReceived {
        /// Responding peer.
        peer: PeerId,
        /// The blocks, in the requested order.
        blocks: Vec<Block>,
    },
    /// A peer dropped its connection.
    PeerDisconnected {
        /// The departed peer.
        peer: PeerId,
    },
}

/// An announcement that arrived while a session was running.
#[derive(Debug, Clone)]
struct QueuedAnnounce {
    peer: PeerId,
    total_difficulty: u64,
}

/// Chain downloader.
///
/// Runs at most one sync session at a time. A session walks the phases
/// ancestor discovery, header fetch, body fetch and import; announcements
/// arriving mid-session are queued (best total difficulty wins) and served
/// once the running session finishes.
pub struct Downloader {
    config: SyncConfig,
    chain: Arc<Blockchain>,
    peers: PeerSet,
    status: RwLock<SyncStatus>,
    // Holding this receiver is holding the session slot.
    session: tokio::sync::Mutex<mpsc::Receiver<SyncEvent>>,
    event_tx: mpsc::Sender<SyncEvent>,
    cancel: Cancellation,
    queued: Mutex<Option<QueuedAnnounce>>,
}

impl Downloader {
    /// Create a downloader over the local chain.
    pub fn new(
        chain: Arc<Blockchain>,
        config: SyncConfig,
        selection: PeerSelection,
    ) -> SyncResult<Self> {
        config.validate()?;
        let (event_tx, event_rx) = mpsc::channel(config.event_buffer);
        Ok(Self {
            config,
            chain,
            peers: PeerSet::new(selection),
            status: RwLock::new(SyncStatus::fresh()),
            session: tokio::sync::Mutex::new(event_rx),
            event_tx,
            cancel: Cancellation::default(),
            queued: Mutex::new(None),
        })
    }

    /// Register a peer for synchronization.
    pub fn register_peer(&self, id: PeerId, peer: Arc<dyn SyncPeer>) {
        self.peers
            .register(Arc::new(PeerConnection::new(id, peer)));
    }

    /// Drop a peer, releasing any task it was serving.
    pub fn unregister_peer(&self, id: &PeerId) {
        if self.peers.unregister(id).is_some() {
            let _ = self.event_tx.try_send(SyncEvent::PeerDisconnected {
                peer: id.clone(),
            });
        }
    }

    /// Feed a header response from the transport.
    pub fn deliver_headers(&self, peer: PeerId, headers: Vec<BlockHeader>) {
        self.deliver(SyncEvent::HeadersReceived { peer, headers });
    }

    /// Feed a block response from the transport.
    pub fn deliver_blocks(&self, peer: PeerId, blocks: Vec<Block>) {
        self.deliver(SyncEvent::BlocksReceived { peer, blocks });
    }

    /// Sender for transports that push events directly.
    pub fn event_sender(&self) -> mpsc::Sender<SyncEvent> {
        self.event_tx.clone()
    }

    fn deliver(&self, event: SyncEvent) {
        if let Err(e) = self.event_tx.try_send(event) {
            debug!(error = %e, "dropping sync event");
        }
    }

    /// Current phase.
    pub fn phase(&self) -> SyncPhase {
        self.status.read().phase
    }

    /// Snapshot of the session status.
    pub fn status(&self) -> SyncStatus {
        self.status.read().clone()
    }

    /// Number of registered peers.
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Number of registered peers with no outstanding request.
    pub fn idle_peer_count(&self) -> usize {
        self.peers.idle_count()
    }

    /// Abort the running session, if any.
    pub fn cancel(&self) {
        self.cancel.trigger();
    }

    /// Run one sync session against the named peer.
    ///
    /// Fails with [`SyncError::AlreadySyncing`] when a session is running.
    pub async fn synchronise(&self, peer: &PeerId) -> SyncResult<()> {
        let mut rx = self
            .session
            .try_lock()
            .map_err(|_| SyncError::AlreadySyncing)?;
        self.run_session(&mut rx, peer).await
    }

    /// Handle a head announcement from a peer.
    ///
    /// Starts a session when the peer's chain is heavier than ours. If a
    /// session is already running the announcement is queued; only the
    /// heaviest queued announcement survives.
    pub async fn announce(&self, peer: &PeerId, head: Hash, total_difficulty: u64) -> SyncResult<()> {
        let conn = self
            .peers
            .get(peer)
            .ok_or_else(|| SyncError::UnknownPeer(peer.clone()))?;
        conn.update_head(head, total_difficulty);

        if total_difficulty <= self.chain.total_difficulty() {
            debug!(peer = %peer, total_difficulty, "ignoring announcement, not heavier than local chain");
            return Ok(());
        }

        let mut rx = match self.session.try_lock() {
            Ok(rx) => rx,
            Err(_) => {
                self.queue_announce(peer.clone(), total_difficulty);
                return Ok(());
            }
        };

        let mut result = self.run_session(&mut rx, peer).await;
        while let Some(next) = self.take_queued() {
            if next.total_difficulty <= self.chain.total_difficulty() {
                continue;
            }
            if let Err(e) = &result {
                debug!(error = %e, next = %next.peer, "previous session failed, serving queued announcement");
            }
            result = self.run_session(&mut rx, &next.peer).await;
        }
        result
    }

    /// Find the highest block height shared with a peer claiming
    /// `remote_height`.
    pub async fn common_ancestor(&self, peer: &PeerId, remote_height: u64) -> SyncResult<u64> {
        let mut rx = self
            .session
            .try_lock()
            .map_err(|_| SyncError::AlreadySyncing)?;
        let conn = self
            .peers
            .get(peer)
            .ok_or_else(|| SyncError::UnknownPeer(peer.clone()))?;

        self.cancel.reset();
        while rx.try_recv().is_ok() {}

        let finder = AncestorFinder::new(&self.config, &self.cancel);
        let result = finder.find(&conn, &mut rx, &self.chain, remote_height).await;
        self.peers.release_all();
        result
    }

    fn queue_announce(&self, peer: PeerId, total_difficulty: u64) {
        let mut slot = self.queued.lock();
        let replace = slot
            .as_ref()
            .map(|q| total_difficulty > q.total_difficulty)
            .unwrap_or(true);
        if replace {
            debug!(peer = %peer, total_difficulty, "queued announcement behind running session");
            *slot = Some(QueuedAnnounce {
                peer,
                total_difficulty,
            });
        }
    }

    fn take_queued(&self) -> Option<QueuedAnnounce> {
        self.queued.lock().take()
    }

    async fn run_session(
        &self,
        rx: &mut mpsc::Receiver<SyncEvent>,
        peer: &PeerId,
    ) -> SyncResult<()> {
        self.cancel.reset();
        *self.status.write() = SyncStatus::fresh();
        // Responses from an earlier session are meaningless now.
        while rx.try_recv().is_ok() {}

        info!(peer = %peer, "sync session started");
        let result = self.drive(rx, peer).await;
        self.peers.release_all();

        let mut status = self.status.write();
        match &result {
            Ok(()) => {
                status.enter(SyncPhase::Done);
                info!(peer = %peer, imported = status.imported, "sync session finished");
            }
            Err(e) => {
                status.last_error = Some(e.to_string());
                status.enter(SyncPhase::Failed);
                warn!(peer = %peer, error = %e, "sync session failed");
            }
        }
        result
    }

    async fn drive(&self, rx: &mut mpsc::Receiver<SyncEvent>, peer: &PeerId) -> SyncResult<()> {
        let conn = self
            .peers
            .get(peer)
            .ok_or_else(|| SyncError::UnknownPeer(peer.clone()))?;

        let remote_hash = conn.head_hash();
        if conn.total_difficulty() <= self.chain.total_difficulty()
            || remote_hash == self.chain.head_hash()
        {
            debug!(peer = %peer, "already up to date with peer");
            return Ok(());
        }

        self.status.write().enter(SyncPhase::FindingAncestor);
        let finder = AncestorFinder::new(&self.config, &self.cancel);
        let remote_head = finder.remote_head(&conn, rx).await?;
        let target = remote_head.height;

        let ancestor = finder.find(&conn, rx, &self.chain, target).await?;
        {
            let mut status = self.status.write();
            status.ancestor = Some(ancestor);
            status.target_height = Some(target);
        }
        if ancestor >= target {
            return Ok(());
        }

        self.status.write().enter(SyncPhase::FetchingHeaders);
        let scheduler = Scheduler::new(&self.peers, &self.config, &self.cancel);
        let headers = scheduler.fetch_headers(rx, ancestor + 1, target).await?;
        let expected = self.verify_linkage(ancestor, target, &headers)?;

        self.status.write().enter(SyncPhase::FetchingBodies);
        let blocks = scheduler
            .fetch_bodies(rx, ancestor + 1, target, &expected)
            .await?;

        self.status.write().enter(SyncPhase::Importing);
        if ancestor < self.chain.head_height() {
            // The local chain carries blocks the remote branch replaces.
            let removed = self.chain.rewind_to(ancestor)?;
            info!(peer = %peer, ancestor, removed, "dropped local blocks above common ancestor");
        }
        let imported = Importer::new(Arc::clone(&self.chain)).import(blocks)?;
        self.status.write().imported = imported;
        Ok(())
    }

    /// Check that downloaded headers form one chain hanging off the
    /// ancestor, and derive the expected hash for each height.
    fn verify_linkage(
        &self,
        ancestor: u64,
        target: u64,
        headers: &BTreeMap<u64, BlockHeader>,
    ) -> SyncResult<BTreeMap<u64, Hash>> {
        if headers.len() as u64 != target - ancestor {
            return Err(SyncError::Protocol(format!(
                "downloaded {} headers for range {}..={}",
                headers.len(),
                ancestor + 1,
                target
            )));
        }

        let mut previous = self.chain.hash_at(ancestor)?.ok_or_else(|| {
            SyncError::Protocol(format!("local chain has no hash at height {ancestor}"))
        })?;

        let mut expected = BTreeMap::new();
        for (height, header) in headers {
            if header.previous_hash != previous {
                return Err(SyncError::BlockRejected {
                    height: *height,
                    reason: format!(
                        "chain linkage mismatch: parent {} is not {previous}",
                        header.previous_hash
                    ),
                });
            }
            previous = header.hash();
            expected.insert(*height, previous);
        }
        Ok(expected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(SyncConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let config = SyncConfig {
            batch_size: 0,
            ..SyncConfig::default()
        };
        assert!(matches!(config.validate(), Err(SyncError::Config(_))));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let config = SyncConfig {
            request_timeout: Duration::ZERO,
            ..SyncConfig::default()
        };
        assert!(matches!(config.validate(), Err(SyncError::Config(_))));
    }

    #[test]
    fn test_status_trace_records_phase_order() {
        let mut status = SyncStatus::fresh();
        status.enter(SyncPhase::FindingAncestor);
        status.enter(SyncPhase::FetchingHeaders);
        status.enter(SyncPhase::Done);
        assert_eq!(status.phase, SyncPhase::Done);
        assert_eq!(
            status.trace,
            vec![
                SyncPhase::FindingAncestor,
                SyncPhase::FetchingHeaders,
                SyncPhase::Done
            ]
        );
    }
}
