//! Batched fetch scheduling over the peer set.

use crate::cancel::Cancellation;
use crate::downloader::{SyncConfig, SyncEvent};
use crate::error::{SyncError, SyncResult};
use crate::peer::{PeerId, PeerSet};
use crate::task::{DownloadTask, TaskKind, TaskQueue};
use cinder_types::{Block, BlockHeader, Hash};
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, trace, warn};

/// Drives one fetch phase: partitions a height range into batch tasks,
/// spreads them over idle peers and collects the responses.
///
/// Transport failures and timeouts reassign the task to another peer within
/// a bounded retry budget. Responses are matched to the range a peer was
/// assigned; one for a different range is stale and ignored, while a
/// malformed response for the right range aborts the phase immediately.
pub(crate) struct Scheduler<'a> {
    peers: &'a PeerSet,
    config: &'a SyncConfig,
    cancel: &'a Cancellation,
}

impl<'a> Scheduler<'a> {
    pub(crate) fn new(peers: &'a PeerSet, config: &'a SyncConfig, cancel: &'a Cancellation) -> Self {
        Self {
            peers,
            config,
            cancel,
        }
    }

    /// Fetch the headers for the inclusive height range `[from, to]`.
    pub async fn fetch_headers(
        &self,
        rx: &mut mpsc::Receiver<SyncEvent>,
        from: u64,
        to: u64,
    ) -> SyncResult<BTreeMap<u64, BlockHeader>> {
        let mut queue = TaskQueue::partition(TaskKind::Headers, from, to, self.config.batch_size);
        let mut collected = BTreeMap::new();
        debug!(from, to, tasks = queue.pending_len(), "fetching headers");

        while !queue.is_done() {
            self.dispatch(&mut queue)?;
            if queue.in_flight_len() == 0 {
                return Err(SyncError::NoPeers);
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return Err(SyncError::Cancelled),
                _ = sleep(queue.next_deadline(self.config.request_timeout)) => {
                    self.expire(&mut queue)?;
                }
                event = rx.recv() => match event {
                    Some(SyncEvent::HeadersReceived { peer, headers }) => {
                        self.accept_headers(&mut queue, &mut collected, peer, headers)?;
                    }
                    Some(SyncEvent::PeerDisconnected { peer }) => {
                        self.peer_lost(&mut queue, &peer)?;
                    }
                    Some(stale) => trace!(?stale, "ignoring event from another phase"),
                    None => return Err(SyncError::Protocol("event channel closed".to_string())),
                },
            }
        }

        Ok(collected)
    }

    /// Fetch full blocks for the inclusive height range `[from, to]`.
    ///
    /// `expected` maps each height to the hash of its already-fetched
    /// header; a body whose header hash differs is a protocol violation.
    pub async fn fetch_bodies(
        &self,
        rx: &mut mpsc::Receiver<SyncEvent>,
        from: u64,
        to: u64,
        expected: &BTreeMap<u64, Hash>,
    ) -> SyncResult<BTreeMap<u64, Block>> {
        let mut queue = TaskQueue::partition(TaskKind::Bodies, from, to, self.config.batch_size);
        let mut collected = BTreeMap::new();
        debug!(from, to, tasks = queue.pending_len(), "fetching block bodies");

        while !queue.is_done() {
            self.dispatch(&mut queue)?;
            if queue.in_flight_len() == 0 {
                return Err(SyncError::NoPeers);
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return Err(SyncError::Cancelled),
                _ = sleep(queue.next_deadline(self.config.request_timeout)) => {
                    self.expire(&mut queue)?;
                }
                event = rx.recv() => match event {
                    Some(SyncEvent::BlocksReceived { peer, blocks }) => {
                        self.accept_blocks(&mut queue, &mut collected, peer, blocks, expected)?;
                    }
                    Some(SyncEvent::PeerDisconnected { peer }) => {
                        self.peer_lost(&mut queue, &peer)?;
                    }
                    Some(stale) => trace!(?stale, "ignoring event from another phase"),
                    None => return Err(SyncError::Protocol("event channel closed".to_string())),
                },
            }
        }

        Ok(collected)
    }

    /// Hand pending tasks to idle peers until one side runs out.
    fn dispatch(&self, queue: &mut TaskQueue) -> SyncResult<()> {
        while queue.pending_len() > 0 {
            let Some(conn) = self.peers.acquire_idle() else {
                break;
            };
            let task = queue.pop_pending().expect("pending checked above");

            let sent = match task.kind {
                TaskKind::Headers => conn.request_headers(task.from, task.count),
                TaskKind::Bodies => conn.request_blocks(task.from, task.count),
            };
            match sent {
                Ok(()) => {
                    trace!(peer = %conn.id(), kind = %task.kind, from = task.from, count = task.count, "dispatched task");
                    queue.dispatched(conn.id().clone(), task);
                }
                Err(e) => {
                    conn.release();
                    self.retry(queue, task, &e.to_string())?;
                }
            }
        }
        Ok(())
    }

    /// Requeue a failed task or abort once its retry budget is spent.
    fn retry(&self, queue: &mut TaskQueue, mut task: DownloadTask, cause: &str) -> SyncResult<()> {
        task.retries += 1;
        if task.retries > self.config.max_retries {
            return Err(SyncError::FetchFailed {
                kind: task.kind,
                from: task.from,
                attempts: task.retries,
                cause: cause.to_string(),
            });
        }
        warn!(kind = %task.kind, from = task.from, retries = task.retries, cause, "retrying task");
        queue.requeue(task);
        Ok(())
    }

    /// Reassign every task whose request has timed out.
    fn expire(&self, queue: &mut TaskQueue) -> SyncResult<()> {
        for peer in queue.timed_out(self.config.request_timeout) {
            if let Some(conn) = self.peers.get(&peer) {
                conn.release();
            }
            if let Some(task) = queue.take_in_flight(&peer) {
                self.retry(queue, task, "request timed out")?;
            }
        }
        Ok(())
    }

    /// Reassign the task held by a peer that dropped out.
    fn peer_lost(&self, queue: &mut TaskQueue, peer: &PeerId) -> SyncResult<()> {
        if let Some(task) = queue.take_in_flight(peer) {
            self.retry(queue, task, "peer disconnected")?;
        }
        Ok(())
    }

    fn accept_headers(
        &self,
        queue: &mut TaskQueue,
        collected: &mut BTreeMap<u64, BlockHeader>,
        peer: PeerId,
        headers: Vec<BlockHeader>,
    ) -> SyncResult<()> {
        let Some(task) = queue.in_flight(&peer) else {
            trace!(peer = %peer, "headers from peer with no assigned task");
            return Ok(());
        };
        // A response is only valid for the range the peer currently serves.
        // One starting elsewhere answers an earlier, already-expired request
        // and is dropped; the live task keeps its own timeout.
        if headers.first().map(|h| h.height) != Some(task.from) {
            trace!(peer = %peer, from = task.from, "headers do not match the assigned range");
            return Ok(());
        }
        let task = queue.take_in_flight(&peer).expect("in-flight checked above");
        if let Some(conn) = self.peers.get(&peer) {
            conn.release();
        }

        if headers.len() != task.count {
            return Err(SyncError::Protocol(format!(
                "peer {peer} sent {} headers, expected {}",
                headers.len(),
                task.count
            )));
        }
        for (offset, header) in headers.iter().enumerate() {
            let expected_height = task.from + offset as u64;
            if header.height != expected_height {
                return Err(SyncError::Protocol(format!(
                    "peer {peer} sent header at height {} in slot {expected_height}",
                    header.height
                )));
            }
        }

        for header in headers {
            collected.insert(header.height, header);
        }
        Ok(())
    }

    fn accept_blocks(
        &self,
        queue: &mut TaskQueue,
        collected: &mut BTreeMap<u64, Block>,
        peer: PeerId,
        blocks: Vec<Block>,
        expected: &BTreeMap<u64, Hash>,
    ) -> SyncResult<()> {
        let Some(task) = queue.in_flight(&peer) else {
            trace!(peer = %peer, "blocks from peer with no assigned task");
            return Ok(());
        };
        if blocks.first().map(|b| b.height()) != Some(task.from) {
            trace!(peer = %peer, from = task.from, "blocks do not match the assigned range");
            return Ok(());
        }
        let task = queue.take_in_flight(&peer).expect("in-flight checked above");
        if let Some(conn) = self.peers.get(&peer) {
            conn.release();
        }

        if blocks.len() != task.count {
            return Err(SyncError::Protocol(format!(
                "peer {peer} sent {} blocks, expected {}",
                blocks.len(),
                task.count
            )));
        }
        for (offset, block) in blocks.iter().enumerate() {
            let expected_height = task.from + offset as u64;
            if block.height() != expected_height {
                return Err(SyncError::Protocol(format!(
                    "peer {peer} sent block at height {} in slot {expected_height}",
                    block.height()
                )));
            }
            match expected.get(&expected_height) {
                Some(hash) if *hash == block.header_hash => {}
                Some(hash) => {
                    return Err(SyncError::Protocol(format!(
                        "peer {peer} sent body {} at height {expected_height}, expected {hash}",
                        block.header_hash
                    )));
                }
                None => {
                    return Err(SyncError::Protocol(format!(
                        "peer {peer} sent body at height {expected_height} outside the requested range"
                    )));
                }
            }
        }

        for block in blocks {
            collected.insert(block.height(), block);
        }
        Ok(())
    }
}
