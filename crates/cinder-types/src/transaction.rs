//! Transactions and their validation rules.

use crate::codec;
use crate::hash::{Address, Hash, Signature};
use secp256k1::SecretKey;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Maximum transaction payload size in bytes.
pub const MAX_PAYLOAD_SIZE: usize = 32 * 1024;

/// Transaction rejection reasons.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TxError {
    /// Sender balance does not cover amount plus fee.
    #[error("balance not enough")]
    BalanceNotEnough,

    /// Transaction nonce is below the sender's account nonce.
    #[error("nonce too low")]
    NonceTooLow,

    /// Payload exceeds the maximum size.
    #[error("oversized payload")]
    PayloadOversized,

    /// Stored hash does not match the transaction data.
    #[error("hash mismatch")]
    HashMismatch,

    /// The transaction carries no signature.
    #[error("signature missing")]
    SignatureMissing,

    /// The signature does not recover to the sender address.
    #[error("signature is invalid")]
    SignatureInvalid,
}

/// Account lookup used by transaction validation.
///
/// Implemented by the state database; test doubles can implement it directly.
pub trait AccountState {
    /// Current balance of the address.
    fn balance(&self, address: &Address) -> u64;

    /// Current nonce of the address.
    fn nonce(&self, address: &Address) -> u64;
}

/// The signed-over portion of a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionData {
    /// Sender address.
    pub from: Address,
    /// Receiver address; `None` for contract creation.
    pub to: Option<Address>,
    /// Amount transferred.
    pub amount: u64,
    /// Sender account nonce.
    pub nonce: u64,
    /// Transaction fee, paid to the block creator.
    pub fee: u64,
    /// Creation time in unix nanoseconds.
    pub timestamp: u64,
    /// Extra payload (contract code or message).
    pub payload: Vec<u8>,
}

impl TransactionData {
    /// Content hash of the transaction data.
    pub fn hash(&self) -> Hash {
        Hash::of(&codec::encode(self))
    }
}

/// A transaction in the blockchain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Hash of the transaction data.
    pub hash: Hash,
    /// The transaction data.
    pub data: TransactionData,
    /// Sender signature over the data hash.
    pub signature: Option<Signature>,
}

impl Transaction {
    /// Create an asset transfer transaction.
    pub fn transfer(
        from: Address,
        to: Address,
        amount: u64,
        fee: u64,
        nonce: u64,
    ) -> Result<Self, TxError> {
        Self::new(from, Some(to), amount, fee, nonce, Vec::new())
    }

    /// Create a contract creation transaction; the payload carries the code.
    pub fn contract_creation(
        from: Address,
        amount: u64,
        fee: u64,
        nonce: u64,
        code: Vec<u8>,
    ) -> Result<Self, TxError> {
        Self::new(from, None, amount, fee, nonce, code)
    }

    /// Create a transfer carrying a message payload.
    pub fn with_message(
        from: Address,
        to: Address,
        amount: u64,
        fee: u64,
        nonce: u64,
        message: Vec<u8>,
    ) -> Result<Self, TxError> {
        Self::new(from, Some(to), amount, fee, nonce, message)
    }

    fn new(
        from: Address,
        to: Option<Address>,
        amount: u64,
        fee: u64,
        nonce: u64,
        payload: Vec<u8>,
    ) -> Result<Self, TxError> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(TxError::PayloadOversized);
        }

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;

        let data = TransactionData {
            from,
            to,
            amount,
            nonce,
            fee,
            timestamp,
            payload,
        };

        Ok(Self {
            hash: data.hash(),
            data,
            signature: None,
        })
    }

    /// Sign the transaction, refreshing the data hash first.
    pub fn sign(&mut self, secret: &SecretKey) {
        self.hash = self.data.hash();
        self.signature = Some(Signature::create(secret, &self.hash));
    }

    /// Content hash of the transaction data; the merkle tree leaf value.
    pub fn content_hash(&self) -> Hash {
        self.data.hash()
    }

    /// Validate the transaction against the current account state.
    pub fn validate(&self, state: &dyn AccountState) -> Result<(), TxError> {
        let cost = self
            .data
            .amount
            .checked_add(self.data.fee)
            .ok_or(TxError::BalanceNotEnough)?;
        if cost > state.balance(&self.data.from) {
            return Err(TxError::BalanceNotEnough);
        }

        if self.data.nonce < state.nonce(&self.data.from) {
            return Err(TxError::NonceTooLow);
        }

        if self.data.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(TxError::PayloadOversized);
        }

        let signature = self.signature.as_ref().ok_or(TxError::SignatureMissing)?;

        let digest = self.data.hash();
        if digest != self.hash {
            return Err(TxError::HashMismatch);
        }

        if !signature.verify(&self.data.from, &digest) {
            return Err(TxError::SignatureInvalid);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secp256k1::Secp256k1;
    use std::collections::HashMap;

    struct MapState(HashMap<Address, (u64, u64)>);

    impl AccountState for MapState {
        fn balance(&self, address: &Address) -> u64 {
            self.0.get(address).map(|(b, _)| *b).unwrap_or(0)
        }

        fn nonce(&self, address: &Address) -> u64 {
            self.0.get(address).map(|(_, n)| *n).unwrap_or(0)
        }
    }

    fn keypair() -> (SecretKey, Address) {
        let secp = Secp256k1::new();
        let (secret, public) = secp.generate_keypair(&mut rand::thread_rng());
        (secret, Address::from_public_key(&public))
    }

    fn signed_transfer(amount: u64, fee: u64, nonce: u64) -> (Transaction, Address) {
        let (secret, from) = keypair();
        let (_, to) = keypair();
        let mut tx = Transaction::transfer(from, to, amount, fee, nonce).unwrap();
        tx.sign(&secret);
        (tx, from)
    }

    #[test]
    fn test_valid_transfer_passes() {
        let (tx, from) = signed_transfer(10, 1, 0);
        let state = MapState(HashMap::from([(from, (100, 0))]));
        assert_eq!(tx.validate(&state), Ok(()));
    }

    #[test]
    fn test_balance_not_enough() {
        let (tx, from) = signed_transfer(10, 1, 0);
        let state = MapState(HashMap::from([(from, (10, 0))]));
        assert_eq!(tx.validate(&state), Err(TxError::BalanceNotEnough));
    }

    #[test]
    fn test_nonce_too_low() {
        let (tx, from) = signed_transfer(1, 0, 3);
        let state = MapState(HashMap::from([(from, (100, 4))]));
        assert_eq!(tx.validate(&state), Err(TxError::NonceTooLow));
    }

    #[test]
    fn test_signature_missing() {
        let (secret, from) = keypair();
        let _ = secret;
        let (_, to) = keypair();
        let tx = Transaction::transfer(from, to, 1, 0, 0).unwrap();
        let state = MapState(HashMap::from([(from, (100, 0))]));
        assert_eq!(tx.validate(&state), Err(TxError::SignatureMissing));
    }

    #[test]
    fn test_tampered_data_detected() {
        let (mut tx, from) = signed_transfer(10, 1, 0);
        tx.data.amount = 1_000;
        let state = MapState(HashMap::from([(from, (10_000, 0))]));
        assert_eq!(tx.validate(&state), Err(TxError::HashMismatch));
    }

    #[test]
    fn test_wrong_signer_detected() {
        let (mut tx, _) = signed_transfer(10, 1, 0);
        let (other_secret, _) = keypair();
        // Re-sign with a different key; hash still matches the data.
        tx.signature = Some(Signature::create(&other_secret, &tx.hash));
        let state = MapState(HashMap::from([(tx.data.from, (100, 0))]));
        assert_eq!(tx.validate(&state), Err(TxError::SignatureInvalid));
    }

    #[test]
    fn test_oversized_payload_rejected_at_construction() {
        let (_, from) = keypair();
        let code = vec![0u8; MAX_PAYLOAD_SIZE + 1];
        let result = Transaction::contract_creation(from, 0, 0, 0, code);
        assert_eq!(result.unwrap_err(), TxError::PayloadOversized);
    }

    #[test]
    fn test_contract_creation_has_no_receiver() {
        let (_, from) = keypair();
        let tx = Transaction::contract_creation(from, 5, 1, 0, vec![1, 2, 3]).unwrap();
        assert!(tx.data.to.is_none());
        assert_eq!(tx.data.payload, vec![1, 2, 3]);
    }
}
