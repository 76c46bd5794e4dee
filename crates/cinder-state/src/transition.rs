//! In-memory overlay used to execute a block against committed state.

use crate::{Account, StateDb, StateError, StateResult};
use cinder_storage::{ColumnFamily, WriteBatch};
use cinder_types::{codec, AccountState, Address, Hash, Transaction};
use std::collections::{BTreeMap, HashMap};
use tracing::trace;

/// Buffered account changes for one block.
///
/// All accounts a block can touch are loaded up front with
/// [`StateTransition::load_for_block`]; transactions are then applied in
/// order and the final overlay is staged into a write batch. Nothing is
/// persisted until that batch commits.
pub struct StateTransition<'a> {
    db: &'a StateDb,
    accounts: HashMap<Address, Account>,
    original: HashMap<Address, Option<Account>>,
}

impl<'a> StateTransition<'a> {
    /// Create an empty overlay over committed state.
    pub fn new(db: &'a StateDb) -> Self {
        Self {
            db,
            accounts: HashMap::new(),
            original: HashMap::new(),
        }
    }

    /// Load one account into the overlay, remembering its stored record.
    pub fn load(&mut self, address: Address) -> StateResult<()> {
        if !self.accounts.contains_key(&address) {
            let stored = self.db.stored_account(&address)?;
            self.original.insert(address, stored);
            self.accounts.insert(address, stored.unwrap_or_default());
        }
        Ok(())
    }

    /// Load every account a block touches: the creator plus each
    /// transaction's sender and receiver.
    pub fn load_for_block(&mut self, creator: Address, txs: &[Transaction]) -> StateResult<()> {
        self.load(creator)?;
        for tx in txs {
            self.load(tx.data.from)?;
            if let Some(to) = tx.data.to {
                self.load(to)?;
            }
        }
        Ok(())
    }

    /// Apply one transaction: debit amount plus fee from the sender, bump the
    /// sender nonce and credit the receiver.
    ///
    /// The fee is not credited here; the caller credits the block creator
    /// once per transaction.
    pub fn apply(&mut self, tx: &Transaction) -> StateResult<()> {
        let cost = tx
            .data
            .amount
            .checked_add(tx.data.fee)
            .ok_or(StateError::InsufficientFunds {
                address: tx.data.from,
            })?;

        self.load(tx.data.from)?;
        let sender = self.accounts.entry(tx.data.from).or_default();
        sender.balance =
            sender
                .balance
                .checked_sub(cost)
                .ok_or(StateError::InsufficientFunds {
                    address: tx.data.from,
                })?;
        sender.nonce = tx.data.nonce + 1;

        if let Some(to) = tx.data.to {
            self.credit(to, tx.data.amount)?;
        }

        trace!(from = %tx.data.from, amount = tx.data.amount, fee = tx.data.fee, "applied transaction");
        Ok(())
    }

    /// Credit an account, failing on balance overflow.
    pub fn credit(&mut self, address: Address, amount: u64) -> StateResult<()> {
        self.load(address)?;
        let account = self.accounts.entry(address).or_default();
        account.balance = account
            .balance
            .checked_add(amount)
            .ok_or(StateError::BalanceOverflow { address })?;
        Ok(())
    }

    /// Overlay view of an account; missing entries read as the default record.
    pub fn account(&self, address: &Address) -> Account {
        self.accounts.get(address).copied().unwrap_or_default()
    }

    /// Compute the state root over committed state merged with this overlay.
    ///
    /// Accounts are hashed in address order; empty accounts are skipped so
    /// the root does not depend on which addresses were ever touched.
    pub fn root(&self) -> StateResult<Hash> {
        let mut merged: BTreeMap<Address, Account> = BTreeMap::new();

        for (key, value) in self.db.storage().iter(ColumnFamily::Accounts)? {
            let address = Address::from_slice(&key).ok_or_else(|| {
                StateError::Codec(format!("bad account key length {}", key.len()))
            })?;
            let account =
                codec::decode(&value).map_err(|e| StateError::Codec(e.to_string()))?;
            merged.insert(address, account);
        }
        for (address, account) in &self.accounts {
            merged.insert(*address, *account);
        }

        let mut preimage = Vec::with_capacity(merged.len() * 36);
        for (address, account) in &merged {
            if account.is_empty() {
                continue;
            }
            preimage.extend_from_slice(address.as_bytes());
            preimage.extend_from_slice(&account.balance.to_be_bytes());
            preimage.extend_from_slice(&account.nonce.to_be_bytes());
        }
        Ok(Hash::of(&preimage))
    }

    /// Stored records of every loaded account, as they were before this
    /// overlay touched them. Sorted by address.
    ///
    /// Committing this snapshot alongside a block lets the chain later undo
    /// the block's account changes without replaying it.
    pub fn undo_record(&self) -> Vec<(Address, Option<Account>)> {
        let ordered: BTreeMap<Address, Option<Account>> = self
            .original
            .iter()
            .map(|(address, stored)| (*address, *stored))
            .collect();
        ordered.into_iter().collect()
    }

    /// Put prior account records back into the overlay. A `None` record marks
    /// an account that did not exist and reads as the default record.
    pub fn restore(&mut self, entries: &[(Address, Option<Account>)]) {
        for (address, stored) in entries {
            self.accounts.insert(*address, stored.unwrap_or_default());
        }
    }

    /// Stage every overlay entry into the batch. Accounts left empty are
    /// deleted so absent and empty records stay indistinguishable.
    pub fn stage(&self, batch: &mut WriteBatch) {
        for (address, account) in &self.accounts {
            if account.is_empty() {
                batch.delete(ColumnFamily::Accounts, address.as_bytes());
            } else {
                batch.put(
                    ColumnFamily::Accounts,
                    address.as_bytes(),
                    codec::encode(account),
                );
            }
        }
    }
}

impl AccountState for StateTransition<'_> {
    fn balance(&self, address: &Address) -> u64 {
        self.account(address).balance
    }

    fn nonce(&self, address: &Address) -> u64 {
        self.account(address).nonce
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinder_storage::{Database, Storage};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn addr(byte: u8) -> Address {
        Address([byte; 20])
    }

    fn state_db() -> (TempDir, StateDb) {
        let tmp = TempDir::new().unwrap();
        let storage: Arc<dyn Storage> = Arc::new(Database::open(tmp.path()).unwrap());
        (tmp, StateDb::new(storage))
    }

    fn fund(db: &StateDb, address: Address, balance: u64) {
        db.storage()
            .put(
                ColumnFamily::Accounts,
                address.as_bytes(),
                &codec::encode(&Account { balance, nonce: 0 }),
            )
            .unwrap();
    }

    #[test]
    fn test_apply_moves_amount_and_holds_fee() {
        let (_tmp, db) = state_db();
        fund(&db, addr(1), 100);

        let tx = Transaction::transfer(addr(1), addr(2), 30, 5, 0).unwrap();
        let mut transition = StateTransition::new(&db);
        transition.load_for_block(addr(9), &[tx.clone()]).unwrap();
        transition.apply(&tx).unwrap();

        assert_eq!(transition.balance(&addr(1)), 65);
        assert_eq!(transition.nonce(&addr(1)), 1);
        assert_eq!(transition.balance(&addr(2)), 30);
        // Fee is credited separately by the block executor.
        assert_eq!(transition.balance(&addr(9)), 0);
    }

    #[test]
    fn test_apply_rejects_overdraft() {
        let (_tmp, db) = state_db();
        fund(&db, addr(1), 10);

        let tx = Transaction::transfer(addr(1), addr(2), 10, 1, 0).unwrap();
        let mut transition = StateTransition::new(&db);
        transition.load_for_block(addr(9), &[tx.clone()]).unwrap();

        let err = transition.apply(&tx).unwrap_err();
        assert!(matches!(
            err,
            StateError::InsufficientFunds { address } if address == addr(1)
        ));
    }

    #[test]
    fn test_stage_and_commit_roundtrip() {
        let (_tmp, db) = state_db();
        fund(&db, addr(1), 100);

        let tx = Transaction::transfer(addr(1), addr(2), 40, 0, 0).unwrap();
        let mut transition = StateTransition::new(&db);
        transition.load_for_block(addr(9), &[tx.clone()]).unwrap();
        transition.apply(&tx).unwrap();

        let mut batch = WriteBatch::new();
        transition.stage(&mut batch);
        db.storage().write_batch(batch).unwrap();

        assert_eq!(db.balance(&addr(1)).unwrap(), 60);
        assert_eq!(db.balance(&addr(2)).unwrap(), 40);
        assert_eq!(db.nonce(&addr(1)).unwrap(), 1);
    }

    #[test]
    fn test_root_ignores_untouched_empty_accounts() {
        let (_tmp, db) = state_db();
        fund(&db, addr(1), 100);

        let mut bare = StateTransition::new(&db);
        bare.load(addr(1)).unwrap();
        let base_root = bare.root().unwrap();

        // Loading an account that stays empty must not change the root.
        let mut with_empty = StateTransition::new(&db);
        with_empty.load(addr(1)).unwrap();
        with_empty.load(addr(7)).unwrap();
        assert_eq!(with_empty.root().unwrap(), base_root);

        // Changing a balance must change the root.
        with_empty.credit(addr(1), 1).unwrap();
        assert_ne!(with_empty.root().unwrap(), base_root);
    }

    #[test]
    fn test_root_merges_overlay_over_committed_state() {
        let (_tmp, db) = state_db();
        fund(&db, addr(1), 100);

        let mut transition = StateTransition::new(&db);
        transition.load(addr(1)).unwrap();
        transition.credit(addr(2), 50).unwrap();
        let overlay_root = transition.root().unwrap();

        // Commit the overlay; a fresh empty transition must see the same root.
        let mut batch = WriteBatch::new();
        transition.stage(&mut batch);
        db.storage().write_batch(batch).unwrap();

        let fresh = StateTransition::new(&db);
        assert_eq!(fresh.root().unwrap(), overlay_root);
    }

    #[test]
    fn test_undo_record_holds_pre_transition_values() {
        let (_tmp, db) = state_db();
        fund(&db, addr(1), 100);

        let tx = Transaction::transfer(addr(1), addr(2), 30, 5, 0).unwrap();
        let mut transition = StateTransition::new(&db);
        transition.load_for_block(addr(9), &[tx.clone()]).unwrap();
        transition.apply(&tx).unwrap();
        transition.credit(addr(9), 5).unwrap();

        let undo = transition.undo_record();
        assert_eq!(undo.len(), 3);
        // Funded sender keeps its stored record, untouched addresses read as absent.
        assert_eq!(
            undo.iter().find(|(a, _)| *a == addr(1)).unwrap().1,
            Some(Account { balance: 100, nonce: 0 })
        );
        assert_eq!(undo.iter().find(|(a, _)| *a == addr(2)).unwrap().1, None);
        assert_eq!(undo.iter().find(|(a, _)| *a == addr(9)).unwrap().1, None);
    }

    #[test]
    fn test_restore_reverts_committed_changes() {
        let (_tmp, db) = state_db();
        fund(&db, addr(1), 100);

        let baseline = StateTransition::new(&db).root().unwrap();

        let tx = Transaction::transfer(addr(1), addr(2), 40, 2, 0).unwrap();
        let mut transition = StateTransition::new(&db);
        transition.load_for_block(addr(9), &[tx.clone()]).unwrap();
        transition.apply(&tx).unwrap();
        transition.credit(addr(9), 2).unwrap();
        let undo = transition.undo_record();

        let mut batch = WriteBatch::new();
        transition.stage(&mut batch);
        db.storage().write_batch(batch).unwrap();
        assert_eq!(db.balance(&addr(2)).unwrap(), 40);

        let mut revert = StateTransition::new(&db);
        revert.restore(&undo);
        assert_eq!(revert.root().unwrap(), baseline);

        let mut batch = WriteBatch::new();
        revert.stage(&mut batch);
        db.storage().write_batch(batch).unwrap();

        assert_eq!(db.balance(&addr(1)).unwrap(), 100);
        assert_eq!(db.nonce(&addr(1)).unwrap(), 0);
        assert_eq!(db.balance(&addr(2)).unwrap(), 0);
        assert_eq!(db.balance(&addr(9)).unwrap(), 0);
        // Receiver and creator rows are gone, not zeroed.
        assert_eq!(db.stored_account(&addr(2)).unwrap(), None);
    }
}
