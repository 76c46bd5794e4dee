//! # cinder-sync
//!
//! Chain synchronization for the Cinder blockchain node.
//!
//! This crate provides:
//! - Binary-search discovery of the common ancestor with a remote peer
//! - Batched header and block body fetching with timeouts and retries
//! - Strictly ordered block import into the local chain
//! - A single-session downloader driven by peer announcements

mod ancestor;
mod cancel;
mod downloader;
mod error;
mod import;
mod peer;
mod scheduler;
mod task;

pub use downloader::{Downloader, SyncConfig, SyncEvent, SyncPhase, SyncStatus};
pub use error::{SyncError, SyncResult, TransportError};
pub use import::Importer;
pub use peer::{RequestOrigin, PeerConnection, PeerId, PeerSelection, PeerSet, SyncPeer};
pub use task::{DownloadTask, TaskKind, TaskQueue};

use std::time::Duration;

/// Number of headers to request at once.
pub const HEADERS_BATCH_SIZE: usize = 64;

/// How long to wait for a peer to answer one request.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// How many times a failed request is reassigned before the session aborts.
pub const MAX_RETRIES: u32 = 3;
