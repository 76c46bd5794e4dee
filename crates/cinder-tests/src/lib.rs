//! # cinder-tests
//!
//! Integration tests for the Cinder blockchain node.
//!
//! This crate provides:
//! - A test harness for chain stores over temporary databases
//! - Generators for keys, transactions, block chains and scripted peers
//! - End-to-end tests for block import and chain synchronization

pub mod generators;
pub mod harness;



#[cfg(test)]
mod validation_tests;

pub use generators::*;
pub use harness::*;
