//! Common ancestor discovery.

use crate::cancel::Cancellation;
use crate::downloader::{SyncConfig, SyncEvent};
use crate::error::{SyncError, SyncResult};
use crate::peer::{RequestOrigin, PeerConnection};
use crate::task::TaskKind;
use cinder_chain::Blockchain;
use cinder_types::BlockHeader;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, trace};

/// Binary search state over `[0, min(local, remote)]`.
///
/// The lower bound always points at a height known to match (height zero is
/// taken as matching without a probe); the search narrows until the bounds
/// meet on the highest matching height.
#[derive(Debug)]
struct AncestorSearch {
    lo: u64,
    hi: u64,
}

impl AncestorSearch {
    fn new(local_height: u64, remote_height: u64) -> Self {
        Self {
            lo: 0,
            hi: local_height.min(remote_height),
        }
    }

    /// Next height to compare, or `None` once the bounds have met.
    fn next_probe(&self) -> Option<u64> {
        (self.lo < self.hi).then(|| self.lo + (self.hi - self.lo).div_ceil(2))
    }

    /// Record whether the chains agree at `height`.
    fn record(&mut self, height: u64, matches: bool) {
        debug_assert!(height > self.lo && height <= self.hi);
        if matches {
            self.lo = height;
        } else {
            self.hi = height - 1;
        }
    }

    /// The highest matching height once the search has converged.
    fn result(&self) -> u64 {
        self.lo
    }
}

/// Finds the highest block height shared with a remote peer.
pub(crate) struct AncestorFinder<'a> {
    config: &'a SyncConfig,
    cancel: &'a Cancellation,
}

impl<'a> AncestorFinder<'a> {
    pub(crate) fn new(config: &'a SyncConfig, cancel: &'a Cancellation) -> Self {
        Self { config, cancel }
    }

    /// Fetch the peer's head header by its advertised hash.
    pub async fn remote_head(
        &self,
        conn: &PeerConnection,
        rx: &mut mpsc::Receiver<SyncEvent>,
    ) -> SyncResult<BlockHeader> {
        let hash = conn.head_hash();
        self.probe(conn, rx, RequestOrigin::Hash(hash))
            .await?
            .ok_or_else(|| {
                SyncError::PeerFault(format!("peer {} does not know its own head {hash}", conn.id()))
            })
    }

    /// Binary-search the highest height where the local chain and the peer
    /// agree on the header hash.
    ///
    /// A fresh local chain at height zero short-circuits to zero without
    /// sending any request.
    pub async fn find(
        &self,
        conn: &PeerConnection,
        rx: &mut mpsc::Receiver<SyncEvent>,
        chain: &Blockchain,
        remote_height: u64,
    ) -> SyncResult<u64> {
        let local_height = chain.head_height();
        if local_height == 0 {
            return Ok(0);
        }

        let mut search = AncestorSearch::new(local_height, remote_height);
        while let Some(height) = search.next_probe() {
            let header = self
                .probe(conn, rx, RequestOrigin::Height(height))
                .await?
                .ok_or_else(|| {
                    SyncError::PeerFault(format!(
                        "peer {} is missing header at height {height} it advertised",
                        conn.id()
                    ))
                })?;

            let local_hash = chain.hash_at(height)?.ok_or_else(|| {
                SyncError::Protocol(format!("local chain has no hash at height {height}"))
            })?;
            let matches = header.hash() == local_hash;
            trace!(height, matches, "ancestor probe");
            search.record(height, matches);
        }

        let ancestor = search.result();
        debug!(peer = %conn.id(), ancestor, local_height, remote_height, "found common ancestor");
        Ok(ancestor)
    }

    /// Send one single-header request and wait for the matching response.
    ///
    /// Times out per attempt and resends up to the retry budget. Responses
    /// from other peers, or from this peer but answering a different
    /// request, are skipped as stale.
    async fn probe(
        &self,
        conn: &PeerConnection,
        rx: &mut mpsc::Receiver<SyncEvent>,
        origin: RequestOrigin,
    ) -> SyncResult<Option<BlockHeader>> {
        if !conn.try_reserve() {
            return Err(SyncError::NoPeers);
        }
        let result = self.probe_reserved(conn, rx, origin).await;
        conn.release();
        result
    }

    async fn probe_reserved(
        &self,
        conn: &PeerConnection,
        rx: &mut mpsc::Receiver<SyncEvent>,
        origin: RequestOrigin,
    ) -> SyncResult<Option<BlockHeader>> {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let attempt = async {
                self.send_probe(conn, origin)?;
                self.wait_for_headers(conn, rx, origin).await
            };
            match attempt.await {
                Ok(reply) => return Ok(reply),
                Err(SyncError::Transport { peer, reason }) if attempts <= self.config.max_retries => {
                    debug!(peer = %peer, attempts, reason = %reason, "probe attempt failed, retrying");
                }
                Err(SyncError::Transport { reason, .. }) => {
                    let from = match origin {
                        RequestOrigin::Height(height) => height,
                        RequestOrigin::Hash(_) => 0,
                    };
                    return Err(SyncError::FetchFailed {
                        kind: TaskKind::Headers,
                        from,
                        attempts,
                        cause: reason,
                    });
                }
                Err(other) => return Err(other),
            }
        }
    }

    fn send_probe(&self, conn: &PeerConnection, origin: RequestOrigin) -> SyncResult<()> {
        let result = match origin {
            RequestOrigin::Hash(hash) => conn.request_header_by_hash(hash),
            RequestOrigin::Height(height) => conn.request_header_at(height),
        };
        result.map_err(|e| SyncError::Transport {
            peer: conn.id().clone(),
            reason: e.to_string(),
        })
    }

    /// Wait for this peer's answer to the outstanding probe.
    ///
    /// An empty response means the peer does not have the header. A
    /// non-empty response must carry exactly the requested header; anything
    /// else answers an earlier request and is skipped.
    async fn wait_for_headers(
        &self,
        conn: &PeerConnection,
        rx: &mut mpsc::Receiver<SyncEvent>,
        origin: RequestOrigin,
    ) -> SyncResult<Option<BlockHeader>> {
        let deadline = Instant::now() + self.config.request_timeout;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(SyncError::Cancelled),
                _ = sleep_until(deadline) => {
                    return Err(SyncError::Transport {
                        peer: conn.id().clone(),
                        reason: "request timed out".to_string(),
                    });
                }
                event = rx.recv() => match event {
                    Some(SyncEvent::HeadersReceived { peer, mut headers }) if peer == *conn.id() => {
                        if headers.is_empty() {
                            return Ok(None);
                        }
                        let answers_probe = headers.len() == 1
                            && match origin {
                                RequestOrigin::Height(height) => headers[0].height == height,
                                RequestOrigin::Hash(hash) => headers[0].hash() == hash,
                            };
                        if answers_probe {
                            return Ok(headers.pop());
                        }
                        trace!(peer = %peer, count = headers.len(), "headers do not answer the outstanding probe");
                    }
                    Some(SyncEvent::PeerDisconnected { peer }) if peer == *conn.id() => {
                        return Err(SyncError::PeerFault(format!(
                            "peer {peer} disconnected while answering a probe"
                        )));
                    }
                    Some(stale) => {
                        trace!(?stale, "ignoring event from another peer or phase");
                    }
                    None => return Err(SyncError::Protocol("event channel closed".to_string())),
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinder_types::Hash;

    /// Run the search against two hash chains sharing a prefix.
    fn search(local: &[Hash], remote: &[Hash]) -> (u64, u32) {
        let local_height = (local.len() - 1) as u64;
        let remote_height = (remote.len() - 1) as u64;
        let mut state = AncestorSearch::new(local_height, remote_height);
        let mut probes = 0;
        while let Some(height) = state.next_probe() {
            probes += 1;
            state.record(height, local[height as usize] == remote[height as usize]);
        }
        (state.result(), probes)
    }

    fn chain(tag: &str, len: usize) -> Vec<Hash> {
        (0..len)
            .map(|i| Hash::of(format!("{tag}:{i}").as_bytes()))
            .collect()
    }

    fn forked(base: &[Hash], shared: usize, tag: &str, len: usize) -> Vec<Hash> {
        let mut out = base[..shared + 1].to_vec();
        for i in shared + 1..len {
            out.push(Hash::of(format!("{tag}:{i}").as_bytes()));
        }
        out
    }

    #[test]
    fn test_identical_chains_converge_on_shorter_head() {
        let a = chain("main", 11);
        let (ancestor, _) = search(&a, &a);
        assert_eq!(ancestor, 10);

        let shorter = &a[..6];
        let (ancestor, _) = search(shorter, &a);
        assert_eq!(ancestor, 5);
    }

    #[test]
    fn test_fork_after_shared_prefix() {
        let main = chain("main", 20);
        let fork = forked(&main, 5, "fork", 30);
        let (ancestor, _) = search(&main, &fork);
        assert_eq!(ancestor, 5);
    }

    #[test]
    fn test_only_genesis_shared() {
        let main = chain("main", 10);
        let fork = forked(&main, 0, "fork", 10);
        let (ancestor, _) = search(&main, &fork);
        assert_eq!(ancestor, 0);
    }

    #[test]
    fn test_probe_count_is_logarithmic() {
        let main = chain("main", 1025);
        let fork = forked(&main, 600, "fork", 1025);
        let (ancestor, probes) = search(&main, &fork);
        assert_eq!(ancestor, 600);
        // ceil(log2(1024)) probes at most.
        assert!(probes <= 10, "took {probes} probes");
    }

    #[test]
    fn test_height_zero_needs_no_probe() {
        let state = AncestorSearch::new(0, 100);
        assert_eq!(state.next_probe(), None);
        assert_eq!(state.result(), 0);
    }
}
