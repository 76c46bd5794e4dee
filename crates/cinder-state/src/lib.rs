//! # cinder-state
//!
//! Account state management for the Cinder blockchain node.
//!
//! State is a flat account model: each address maps to a balance and a
//! nonce, stored in the `Accounts` column family. Block execution runs
//! through a [`StateTransition`] overlay that buffers changes in memory and
//! stages them into an atomic write batch.

mod account;
mod error;
mod transition;

pub use account::{Account, StateDb};
pub use error::{StateError, StateResult};
pub use transition::StateTransition;
