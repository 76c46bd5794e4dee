//! Account records and the read-only state view.

use crate::{StateError, StateResult};
use cinder_storage::{ColumnFamily, Storage};
use cinder_types::{codec, Address};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A single account record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Spendable balance.
    pub balance: u64,
    /// Next expected transaction nonce.
    pub nonce: u64,
}

impl Account {
    /// Whether the account carries no balance and no history.
    pub fn is_empty(&self) -> bool {
        self.balance == 0 && self.nonce == 0
    }
}

/// Read-only view over committed account state.
#[derive(Clone)]
pub struct StateDb {
    storage: Arc<dyn Storage>,
}

impl StateDb {
    /// Create a state view over the given storage.
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// The underlying storage handle.
    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Load an account record exactly as stored, `None` if absent.
    pub fn stored_account(&self, address: &Address) -> StateResult<Option<Account>> {
        match self.storage.get(ColumnFamily::Accounts, address.as_bytes())? {
            Some(bytes) => codec::decode(&bytes)
                .map(Some)
                .map_err(|e| StateError::Codec(e.to_string())),
            None => Ok(None),
        }
    }

    /// Load an account record; missing accounts read as the default record.
    pub fn account(&self, address: &Address) -> StateResult<Account> {
        Ok(self.stored_account(address)?.unwrap_or_default())
    }

    /// Committed balance of an address.
    pub fn balance(&self, address: &Address) -> StateResult<u64> {
        Ok(self.account(address)?.balance)
    }

    /// Committed nonce of an address.
    pub fn nonce(&self, address: &Address) -> StateResult<u64> {
        Ok(self.account(address)?.nonce)
    }
}
