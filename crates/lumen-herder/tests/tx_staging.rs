//! Transaction intake, the three-generation staging buffer and proposal
//! building.

mod common;

use common::*;
use lumen_herder::{LedgerValue, TransactionSet, TxStatus};
use tokio::time::Instant;

fn funded(validator: bool) -> Harness {
    let h = Harness::new(validator, 10);
    h.ledger.set_account(5, 0, 10_000);
    h.ledger.set_account(6, 0, 10_000);
    h
}

#[test]
fn test_admission_statuses() {
    let mut h = funded(false);
    assert_eq!(h.herder.recv_transaction(transaction(5, 1, 100)), TxStatus::Pending);
    assert_eq!(h.herder.recv_transaction(transaction(5, 1, 100)), TxStatus::Duplicate);
    assert_eq!(h.herder.recv_transaction(transaction(9, 1, 100)), TxStatus::UnknownAccount);
    assert_eq!(h.herder.recv_transaction(transaction(5, 5, 100)), TxStatus::BadSequence);
    assert_eq!(h.herder.recv_transaction(transaction(6, 1, 50)), TxStatus::InsufficientFee);
    assert_eq!(h.herder.recv_transaction(transaction(6, 1, 20_000)), TxStatus::InsufficientBalance);

    let mut empty = transaction(6, 1, 100);
    if let stellar_xdr::curr::TransactionEnvelope::Tx(env) = &mut empty {
        env.tx.operations = Default::default();
    }
    assert_eq!(h.herder.recv_transaction(empty), TxStatus::Malformed);

    let metrics = h.herder.metrics();
    assert_eq!(metrics.tx_received.get(), 1);
    assert_eq!(metrics.tx_rejected.get(), 6);
    assert_eq!(h.overlay.tx_count(), 1);
}

#[test]
fn test_sequence_chains_and_balance_include_staged() {
    let mut h = funded(false);
    assert_eq!(h.herder.recv_transaction(transaction(5, 1, 4_000)), TxStatus::Pending);
    assert_eq!(h.herder.recv_transaction(transaction(5, 2, 4_000)), TxStatus::Pending);
    assert_eq!(h.herder.get_max_seq_in_pending_txs(&account(5)), Some(2));
    assert_eq!(h.herder.get_max_seq_in_pending_txs(&account(6)), None);

    // 8_000 already committed out of 10_000
    assert_eq!(
        h.herder.recv_transaction(transaction(5, 3, 4_000)),
        TxStatus::InsufficientBalance
    );
    assert_eq!(h.herder.recv_transaction(transaction(5, 3, 2_000)), TxStatus::Pending);
}

#[test]
fn test_exhausted_sequence_rejected() {
    let mut h = funded(false);
    h.ledger.set_account(7, i64::MAX, 10_000);
    assert_eq!(
        h.herder.recv_transaction(transaction(7, i64::MAX, 100)),
        TxStatus::BadSequence
    );

    h.ledger.set_account(8, i64::MAX - 1, 10_000);
    assert_eq!(h.herder.recv_transaction(transaction(8, i64::MAX, 100)), TxStatus::Pending);
    assert_eq!(
        h.herder.recv_transaction(transaction(8, i64::MAX, 200)),
        TxStatus::BadSequence
    );
}

#[test]
fn test_recv_transactions_from_set() {
    let mut h = funded(false);
    let set = TransactionSet::new(
        h.ledger.lcl().hash,
        vec![frame(5, 1, 100), frame(6, 1, 100), frame(9, 1, 100)],
    );
    let mut statuses = h.herder.recv_transactions(&set);
    statuses.sort_by_key(|s| *s != TxStatus::Pending);
    assert_eq!(
        statuses,
        vec![TxStatus::Pending, TxStatus::Pending, TxStatus::UnknownAccount]
    );
}

#[test]
fn test_unapplied_transactions_age_out() {
    let mut h = funded(false);
    h.herder.recv_transaction(transaction(5, 1, 100));
    assert_eq!(h.herder.driver().received().sizes(), [1, 0, 0]);
    assert_eq!(h.overlay.tx_count(), 1);

    h.close_next(2);
    assert_eq!(h.herder.driver().received().sizes(), [0, 1, 0]);
    // one rebroadcast when it reaches the second generation
    assert_eq!(h.overlay.tx_count(), 2);

    h.close_next(2);
    assert_eq!(h.herder.driver().received().sizes(), [0, 0, 1]);
    assert_eq!(h.overlay.tx_count(), 2);

    h.close_next(2);
    assert!(h.herder.driver().received().is_empty());
    assert_eq!(h.herder.recv_transaction(transaction(5, 1, 100)), TxStatus::Pending);
}

#[test]
fn test_applied_transactions_leave_staging() {
    let mut h = funded(false);
    h.herder.recv_transaction(transaction(5, 1, 100));
    h.herder.recv_transaction(transaction(6, 1, 100));

    let lcl = h.ledger.lcl();
    let tx_set = TransactionSet::new(lcl.hash, vec![frame(5, 1, 100)]);
    let value = LedgerValue::new(tx_set.hash(), lcl.close_time() + 1, 100);
    h.externalize(2, 11, &value, tx_set);

    assert_eq!(h.ledger.closed_seqs(), vec![11]);
    assert_eq!(h.herder.driver().received().sizes(), [0, 1, 0]);
    assert_eq!(h.herder.get_max_seq_in_pending_txs(&account(5)), None);
    assert_eq!(h.herder.recv_transaction(transaction(5, 2, 100)), TxStatus::Pending);
}

#[test]
fn test_proposal_uses_staged_transactions() {
    let mut h = funded(true);
    h.herder.recv_transaction(transaction(5, 1, 100));
    h.herder.recv_transaction(transaction(6, 1, 100));
    h.herder.bootstrap();
    h.herder.fire_timers(Instant::now());

    let (slot, value, _) = h.herder.engine().nominations[0].clone();
    assert_eq!(slot, 11);
    let proposal = LedgerValue::from_value(&value).unwrap();
    assert_eq!(proposal.base_fee, 100);
    assert!(proposal.close_time > h.ledger.lcl().close_time());
    let tx_set = h.herder.get_tx_set(&proposal.tx_set_hash).unwrap();
    assert_eq!(tx_set.len(), 2);
    assert_eq!(tx_set.previous_ledger_hash(), h.ledger.lcl().hash);
}

#[test]
fn test_proposal_drops_stale_transactions() {
    let mut h = funded(true);
    h.herder.recv_transaction(transaction(5, 1, 100));
    h.herder.recv_transaction(transaction(6, 1, 100));
    // account 6 moved on outside of this node's view
    h.ledger.set_account(6, 3, 10_000);
    h.herder.bootstrap();
    h.herder.fire_timers(Instant::now());

    let (_, value, _) = h.herder.engine().nominations[0].clone();
    let proposal = LedgerValue::from_value(&value).unwrap();
    assert_eq!(h.herder.get_tx_set(&proposal.tx_set_hash).unwrap().len(), 1);
    assert_eq!(h.herder.driver().received().len(), 1);
    assert_eq!(h.herder.get_max_seq_in_pending_txs(&account(6)), None);
}

#[test]
fn test_proposal_respects_size_limit() {
    let mut config = herder_config(true);
    config.max_tx_set_size = 2;
    let engine = MockEngine::emitting(node(1), &config.quorum_set);
    let mut h = Harness::with_engine(config, engine, 10);
    for seed in [5, 6, 7] {
        h.ledger.set_account(seed, 0, 10_000);
    }
    h.herder.recv_transaction(transaction(5, 1, 100));
    h.herder.recv_transaction(transaction(6, 1, 300));
    h.herder.recv_transaction(transaction(7, 1, 200));
    h.herder.bootstrap();
    h.herder.fire_timers(Instant::now());

    let (_, value, _) = h.herder.engine().nominations[0].clone();
    let proposal = LedgerValue::from_value(&value).unwrap();
    let tx_set = h.herder.get_tx_set(&proposal.tx_set_hash).unwrap();
    let mut fees: Vec<u64> = tx_set.transactions().iter().map(|tx| tx.fee()).collect();
    fees.sort();
    assert_eq!(fees, vec![200, 300]);
    // the evicted transaction stays staged
    assert_eq!(h.herder.driver().received().len(), 3);
}
