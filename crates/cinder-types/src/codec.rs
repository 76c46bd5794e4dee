//! Canonical byte encoding for chain data.
//!
//! All content hashes and stored records use the same bincode encoding so
//! that a value hashes and round-trips identically everywhere.

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Decoding failure.
#[derive(Debug, Error)]
#[error("codec error: {0}")]
pub struct CodecError(String);

/// Encode a value to its canonical byte form.
pub fn encode<T: Serialize>(value: &T) -> Vec<u8> {
    bincode::serialize(value).expect("encoding an in-memory value cannot fail")
}

/// Decode a value from its canonical byte form.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    bincode::deserialize(bytes).map_err(|err| CodecError(err.to_string()))
}
