//! # cinder-chain
//!
//! Canonical chain store and block import for the Cinder blockchain node.
//!
//! The [`Blockchain`] owns the canonical header chain: genesis
//! initialization, height and hash lookups, and strictly ordered block
//! import. Each imported block executes its transactions against account
//! state and commits header, body, height index, account changes and the new
//! chain head in one atomic batch.

mod chain;
mod error;
mod genesis;

pub use chain::{Blockchain, HeadInfo};
pub use error::{ChainError, ChainResult};
pub use genesis::Genesis;
