//! Structural validation tests across assembled blocks.

use crate::generators::{ChainBuilder, TestAccount};
use crate::harness::TestChain;
use cinder_chain::{ChainError, Genesis};
use cinder_types::{BlockError, Transaction, TxError};

#[test]
fn test_builder_blocks_are_internally_consistent() {
    let alice = TestAccount::generate();
    let bob = TestAccount::generate();
    let genesis = Genesis::default();

    let mut builder = ChainBuilder::new(&genesis);
    builder.add_block(vec![alice.signed_transfer(bob.address, 5, 1, 0)], 0);
    builder.add_empty();

    for block in builder.blocks() {
        assert_eq!(block.validate_body(), Ok(()));
    }
}

#[test]
fn test_tampered_transaction_breaks_tx_root() {
    let alice = TestAccount::generate();
    let bob = TestAccount::generate();
    let genesis = Genesis::default();

    let mut builder = ChainBuilder::new(&genesis);
    builder.add_block(vec![alice.signed_transfer(bob.address, 5, 1, 0)], 0);

    let mut block = builder.body()[0].clone();
    block.transactions[0].data.amount = 5_000;
    block.transactions[0].hash = block.transactions[0].data.hash();
    assert_eq!(block.validate_body(), Err(BlockError::TxRootMismatch));
}

#[test]
fn test_unsigned_transaction_rejected_at_import() {
    let alice = TestAccount::generate();
    let bob = TestAccount::generate();

    let genesis = Genesis {
        alloc: vec![(alice.address, 1_000)],
        ..Genesis::default()
    };
    let local = TestChain::new(&genesis);

    let unsigned = Transaction::transfer(alice.address, bob.address, 10, 0, 0).unwrap();
    let mut builder = ChainBuilder::new(&genesis);
    builder.add_block(vec![unsigned], 0);

    let err = local.chain().write_block(&builder.body()[0]).unwrap_err();
    assert!(matches!(
        err,
        ChainError::InvalidTransaction {
            source: TxError::SignatureMissing,
            ..
        }
    ));
}

#[test]
fn test_foreign_signature_rejected_at_import() {
    let alice = TestAccount::generate();
    let mallory = TestAccount::generate();
    let bob = TestAccount::generate();

    let genesis = Genesis {
        alloc: vec![(alice.address, 1_000)],
        ..Genesis::default()
    };
    let local = TestChain::new(&genesis);

    // Mallory signs a transfer that claims to come from Alice.
    let mut forged = mallory.signed_transfer(bob.address, 10, 0, 0);
    forged.data.from = alice.address;
    forged.hash = forged.data.hash();

    let mut builder = ChainBuilder::new(&genesis);
    builder.add_block(vec![forged], 0);

    let err = local.chain().write_block(&builder.body()[0]).unwrap_err();
    assert!(matches!(
        err,
        ChainError::InvalidTransaction {
            source: TxError::SignatureInvalid,
            ..
        }
    ));
}
