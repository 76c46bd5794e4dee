//! Merkle root computation over transaction lists.

use crate::hash::Hash;
use crate::transaction::Transaction;
use std::sync::OnceLock;

/// Designated root for the empty transaction list.
///
/// An empty block carries this constant rather than a tree computed over
/// zero leaves.
pub fn empty_tx_root() -> Hash {
    static ROOT: OnceLock<Hash> = OnceLock::new();
    *ROOT.get_or_init(|| Hash::of(b"empty transaction root hash"))
}

/// Compute the merkle root of an ordered transaction list.
///
/// Leaves are transaction content hashes; an odd node at any level is
/// combined with itself.
pub fn merkle_root(transactions: &[Transaction]) -> Hash {
    if transactions.is_empty() {
        return empty_tx_root();
    }

    let mut level: Vec<Hash> = transactions.iter().map(|tx| tx.content_hash()).collect();
    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        for pair in level.chunks(2) {
            let right = pair.get(1).unwrap_or(&pair[0]);
            let mut combined = [0u8; 64];
            combined[..32].copy_from_slice(pair[0].as_bytes());
            combined[32..].copy_from_slice(right.as_bytes());
            next.push(Hash::of(&combined));
        }
        level = next;
    }
    level[0]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::Address;

    fn tx(nonce: u64) -> Transaction {
        Transaction::transfer(Address::ZERO, Address::ZERO, 1, 0, nonce).unwrap()
    }

    #[test]
    fn test_empty_list_uses_designated_root() {
        assert_eq!(merkle_root(&[]), empty_tx_root());
        assert_eq!(empty_tx_root(), empty_tx_root());
    }

    #[test]
    fn test_single_leaf_root() {
        let t = tx(0);
        let root = merkle_root(std::slice::from_ref(&t));
        // One leaf still combines with itself once.
        assert_ne!(root, t.content_hash());
        assert_eq!(root, merkle_root(std::slice::from_ref(&t)));
    }

    #[test]
    fn test_root_is_order_sensitive() {
        let a = tx(0);
        let b = tx(1);
        let forward = merkle_root(&[a.clone(), b.clone()]);
        let reversed = merkle_root(&[b, a]);
        assert_ne!(forward, reversed);
    }

    #[test]
    fn test_odd_leaf_count() {
        let txs = vec![tx(0), tx(1), tx(2)];
        let root = merkle_root(&txs);
        assert_ne!(root, merkle_root(&txs[..2]));
    }
}
