//! The async runner: commands, timers and the published snapshot.

mod common;

use std::time::Duration;

use common::*;
use lumen_herder::{HerderError, HerderRunner, HerderState, TxStatus};

fn spawn(h: Harness) -> (tokio::task::JoinHandle<lumen_herder::Herder<MockEngine>>, lumen_herder::HerderHandle) {
    let (runner, handle) = HerderRunner::new(h.herder, 64);
    (tokio::spawn(runner.run()), handle)
}

#[tokio::test(start_paused = true)]
async fn test_commands_are_applied_in_order() {
    let h = Harness::new(false, 10);
    h.ledger.set_account(5, 0, 10_000);
    let ledger = h.ledger.clone();
    let (value, tx_set) = h.next_value(1);
    let externalize = externalize_envelope(2, 11, &value, h.local_qset_hash());
    let (task, handle) = spawn(h);

    assert_eq!(
        handle.submit_transaction(transaction(5, 1, 100)).await.unwrap(),
        TxStatus::Pending
    );
    handle.recv_envelope(externalize).await.unwrap();
    handle.recv_tx_set(tx_set.hash(), tx_set).await.unwrap();

    let info = handle.dump_info().await.unwrap();
    assert_eq!(info.state, HerderState::Tracking);
    assert_eq!(ledger.closed_seqs(), vec![11]);

    let snapshot = handle.snapshot();
    assert_eq!(snapshot.tracking_slot, Some(11));
    assert_eq!(snapshot.staged, [0, 1, 0]);
    assert_eq!(snapshot.metrics.tx_received, 1);

    handle.shutdown().await.unwrap();
    let herder = task.await.unwrap();
    assert_eq!(herder.engine().received_slots(), vec![11]);
}

#[tokio::test(start_paused = true)]
async fn test_timers_drive_nomination_and_sync_loss() {
    let h = Harness::new(true, 10);
    let overlay = h.overlay.clone();
    let (task, handle) = spawn(h);

    handle.bootstrap().await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(handle.snapshot().state, HerderState::Tracking);
    assert_eq!(overlay.scp_count(), 1);

    // nobody else participates, so the envelope is re-sent and then the
    // heartbeat runs out
    tokio::time::sleep(Duration::from_secs(35)).await;
    assert!(overlay.scp_count() > 1);
    let snapshot = handle.snapshot();
    assert_eq!(snapshot.state, HerderState::Syncing);
    assert_eq!(snapshot.metrics.lost_sync, 1);

    handle.shutdown().await.unwrap();
    let herder = task.await.unwrap();
    assert_eq!(herder.engine().nominations.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_handle_reports_closed_loop() {
    let h = Harness::new(false, 10);
    let (task, handle) = spawn(h);
    let spare = handle.clone();
    handle.shutdown().await.unwrap();
    task.await.unwrap();

    assert!(matches!(spare.bootstrap().await, Err(HerderError::ChannelClosed)));
    assert!(matches!(
        spare.submit_transaction(transaction(5, 1, 100)).await,
        Err(HerderError::ChannelClosed)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_loop_ends_when_handles_drop() {
    let h = Harness::new(false, 10);
    let (task, handle) = spawn(h);
    drop(handle);
    let herder = task.await.unwrap();
    assert_eq!(herder.state(), HerderState::Syncing);
}
