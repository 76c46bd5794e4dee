//! Hashes, addresses and signatures.

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use secp256k1::ecdsa::{RecoverableSignature, RecoveryId};
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use serde::{Deserialize, Serialize};
use std::fmt;

type Blake2b256 = Blake2b<U32>;

/// 32-byte Blake2b-256 content hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Hash(pub [u8; 32]);

impl Hash {
    /// The all-zero hash.
    pub const ZERO: Hash = Hash([0u8; 32]);

    /// Hash arbitrary bytes.
    pub fn of(data: &[u8]) -> Self {
        let mut hasher = Blake2b256::new();
        hasher.update(data);
        Hash(hasher.finalize().into())
    }

    /// Build a hash from a 32-byte slice.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 32 {
            return None;
        }
        let mut out = [0u8; 32];
        out.copy_from_slice(bytes);
        Some(Hash(out))
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Whether this is the all-zero hash.
    pub fn is_zero(&self) -> bool {
        *self == Hash::ZERO
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// 20-byte account address, derived from a secp256k1 public key.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct Address(pub [u8; 20]);

impl Address {
    /// The all-zero address.
    pub const ZERO: Address = Address([0u8; 20]);

    /// Derive an address from a public key: the trailing 20 bytes of the
    /// Blake2b-256 hash of the uncompressed key material.
    pub fn from_public_key(key: &PublicKey) -> Self {
        let digest = Hash::of(&key.serialize_uncompressed()[1..]);
        let mut out = [0u8; 20];
        out.copy_from_slice(&digest.as_bytes()[12..]);
        Address(out)
    }

    /// Build an address from a 20-byte slice.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 20 {
            return None;
        }
        let mut out = [0u8; 20];
        out.copy_from_slice(bytes);
        Some(Address(out))
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Recoverable ECDSA signature: 64-byte compact form plus one recovery byte.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature(pub Vec<u8>);

impl Signature {
    /// Sign a 32-byte digest with the given secret key.
    pub fn create(secret: &SecretKey, digest: &Hash) -> Self {
        let secp = Secp256k1::new();
        let message =
            Message::from_slice(digest.as_bytes()).expect("digest is always 32 bytes");
        let signature = secp.sign_ecdsa_recoverable(&message, secret);
        let (recovery, compact) = signature.serialize_compact();
        let mut bytes = compact.to_vec();
        bytes.push(recovery.to_i32() as u8);
        Signature(bytes)
    }

    /// Verify the signature against a digest by recovering the public key and
    /// comparing its derived address to `signer`.
    pub fn verify(&self, signer: &Address, digest: &Hash) -> bool {
        if self.0.len() != 65 {
            return false;
        }
        let recovery = match RecoveryId::from_i32(self.0[64] as i32) {
            Ok(id) => id,
            Err(_) => return false,
        };
        let signature = match RecoverableSignature::from_compact(&self.0[..64], recovery) {
            Ok(sig) => sig,
            Err(_) => return false,
        };
        let message = match Message::from_slice(digest.as_bytes()) {
            Ok(msg) => msg,
            Err(_) => return false,
        };
        let secp = Secp256k1::new();
        match secp.recover_ecdsa(&message, &signature) {
            Ok(key) => Address::from_public_key(&key) == *signer,
            Err(_) => false,
        }
    }
}
