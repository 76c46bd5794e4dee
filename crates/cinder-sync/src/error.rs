//! Sync error types.

use crate::peer::PeerId;
use crate::task::TaskKind;
use thiserror::Error;

/// Failure to hand a request to the transport.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct TransportError(pub String);

/// Sync errors.
#[derive(Error, Debug)]
pub enum SyncError {
    /// A request could not be sent to a peer.
    #[error("Transport error talking to {peer}: {reason}")]
    Transport {
        /// The peer the request was addressed to.
        peer: PeerId,
        /// Transport failure description.
        reason: String,
    },

    /// A batch could not be fetched within the retry budget.
    #[error("Failed to fetch {kind} from height {from} after {attempts} attempts: {cause}")]
    FetchFailed {
        /// Whether headers or bodies were being fetched.
        kind: TaskKind,
        /// First height of the failed batch.
        from: u64,
        /// Attempts made, including the first.
        attempts: u32,
        /// The last underlying failure.
        cause: String,
    },

    /// A peer sent a response that contradicts itself or earlier answers.
    #[error("Peer fault: {0}")]
    PeerFault(String),

    /// A response violated the protocol contract.
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// The local chain rejected a downloaded block.
    #[error("Block at height {height} rejected: {reason}")]
    BlockRejected {
        /// Height of the rejected block.
        height: u64,
        /// Why the chain refused it.
        reason: String,
    },

    /// The local store failed.
    #[error("Store error: {0}")]
    Store(cinder_chain::ChainError),

    /// No peer is available to serve requests.
    #[error("No peers available for sync")]
    NoPeers,

    /// A session is already running.
    #[error("Sync already in progress")]
    AlreadySyncing,

    /// Rejected configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// The session was cancelled.
    #[error("Sync cancelled")]
    Cancelled,

    /// The named peer is not registered.
    #[error("Unknown peer {0}")]
    UnknownPeer(PeerId),
}

impl From<cinder_chain::ChainError> for SyncError {
    fn from(err: cinder_chain::ChainError) -> Self {
        SyncError::Store(err)
    }
}

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;
