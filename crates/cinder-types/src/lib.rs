//! # cinder-types
//!
//! Chain primitives for the Cinder blockchain node.
//!
//! This crate provides:
//! - Content-addressed hashes and account addresses
//! - Transactions with recoverable ECDSA signatures
//! - Block headers and blocks
//! - Merkle root computation over transaction lists

mod block;
pub mod codec;
mod hash;
mod merkle;
mod transaction;

pub use block::{Block, BlockError, BlockHeader};
pub use hash::{Address, Hash, Signature};
pub use merkle::{empty_tx_root, merkle_root};
pub use transaction::{AccountState, Transaction, TransactionData, TxError, MAX_PAYLOAD_SIZE};
