//! Async shell around a [`Herder`].
//!
//! The herder itself is synchronous. [`HerderRunner`] owns it on one task and
//! serializes everything that touches it: commands arriving on a channel and
//! timer deadlines. Other tasks talk to it through a cloneable
//! [`HerderHandle`], which also exposes a snapshot refreshed after every
//! event for cheap monitoring reads.
//!
//! ```ignore
//! let (runner, handle) = HerderRunner::new(herder, 1024);
//! tokio::spawn(runner.run());
//! handle.recv_envelope(envelope).await?;
//! let status = handle.submit_transaction(tx).await?;
//! ```

use std::sync::Arc;

use lumen_common::Hash256;
use lumen_scp::{ScpEngine, SlotIndex};
use parking_lot::RwLock;
use serde::Serialize;
use stellar_xdr::curr::{ScpEnvelope, ScpQuorumSet, TransactionEnvelope};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info};

use crate::callbacks::{ItemType, PeerId};
use crate::error::HerderError;
use crate::herder::Herder;
use crate::json_api::HerderJsonInfo;
use crate::metrics::MetricsSnapshot;
use crate::received_transactions::GENERATIONS;
use crate::scp_driver::TxStatus;
use crate::state::HerderState;
use crate::tx_set::TransactionSet;
use crate::Result;

/// Messages accepted by the runner.
#[derive(Debug)]
pub enum HerderCommand {
    Envelope(Box<ScpEnvelope>),
    QuorumSet {
        hash: Hash256,
        quorum_set: Box<ScpQuorumSet>,
    },
    TxSet {
        hash: Hash256,
        tx_set: Box<TransactionSet>,
    },
    DontHave {
        item_type: ItemType,
        hash: Hash256,
        peer: PeerId,
    },
    Peers(Vec<PeerId>),
    Transaction {
        tx: Box<TransactionEnvelope>,
        reply: oneshot::Sender<TxStatus>,
    },
    DumpInfo {
        reply: oneshot::Sender<HerderJsonInfo>,
    },
    Bootstrap,
    Shutdown,
}

/// State published after every event.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HerderSnapshot {
    pub state: HerderState,
    pub tracking_slot: Option<SlotIndex>,
    pub ready_envelopes: usize,
    pub fetching_envelopes: usize,
    pub timers: usize,
    pub staged: [usize; GENERATIONS],
    pub metrics: MetricsSnapshot,
}

impl HerderSnapshot {
    fn capture<E: ScpEngine>(herder: &Herder<E>) -> Self {
        let driver = herder.driver();
        Self {
            state: herder.state(),
            tracking_slot: herder.tracking().last_index(),
            ready_envelopes: driver.pending().ready_count(),
            fetching_envelopes: driver.pending().fetching_count(),
            timers: driver.timers().len(),
            staged: driver.received().sizes(),
            metrics: herder.metrics().snapshot(),
        }
    }
}

/// Cloneable handle to a running herder.
#[derive(Clone)]
pub struct HerderHandle {
    sender: mpsc::Sender<HerderCommand>,
    snapshot: Arc<RwLock<HerderSnapshot>>,
}

impl HerderHandle {
    async fn send(&self, command: HerderCommand) -> Result<()> {
        self.sender
            .send(command)
            .await
            .map_err(|_| HerderError::ChannelClosed)
    }

    pub async fn recv_envelope(&self, envelope: ScpEnvelope) -> Result<()> {
        self.send(HerderCommand::Envelope(Box::new(envelope))).await
    }

    pub async fn recv_quorum_set(&self, hash: Hash256, quorum_set: ScpQuorumSet) -> Result<()> {
        self.send(HerderCommand::QuorumSet {
            hash,
            quorum_set: Box::new(quorum_set),
        })
        .await
    }

    pub async fn recv_tx_set(&self, hash: Hash256, tx_set: TransactionSet) -> Result<()> {
        self.send(HerderCommand::TxSet {
            hash,
            tx_set: Box::new(tx_set),
        })
        .await
    }

    pub async fn peer_doesnt_have(&self, item_type: ItemType, hash: Hash256, peer: PeerId) -> Result<()> {
        self.send(HerderCommand::DontHave {
            item_type,
            hash,
            peer,
        })
        .await
    }

    pub async fn set_available_peers(&self, peers: Vec<PeerId>) -> Result<()> {
        self.send(HerderCommand::Peers(peers)).await
    }

    /// Submit a transaction and wait for its admission status.
    pub async fn submit_transaction(&self, tx: TransactionEnvelope) -> Result<TxStatus> {
        let (reply, rx) = oneshot::channel();
        self.send(HerderCommand::Transaction {
            tx: Box::new(tx),
            reply,
        })
        .await?;
        rx.await.map_err(|_| HerderError::ChannelClosed)
    }

    pub async fn dump_info(&self) -> Result<HerderJsonInfo> {
        let (reply, rx) = oneshot::channel();
        self.send(HerderCommand::DumpInfo { reply }).await?;
        rx.await.map_err(|_| HerderError::ChannelClosed)
    }

    pub async fn bootstrap(&self) -> Result<()> {
        self.send(HerderCommand::Bootstrap).await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.send(HerderCommand::Shutdown).await
    }

    /// Latest published snapshot. Never waits on the herder task.
    pub fn snapshot(&self) -> HerderSnapshot {
        self.snapshot.read().clone()
    }
}

/// Owns the herder and drives it from commands and timers.
pub struct HerderRunner<E: ScpEngine> {
    herder: Herder<E>,
    receiver: mpsc::Receiver<HerderCommand>,
    snapshot: Arc<RwLock<HerderSnapshot>>,
}

impl<E: ScpEngine> HerderRunner<E> {
    pub fn new(herder: Herder<E>, capacity: usize) -> (Self, HerderHandle) {
        let (sender, receiver) = mpsc::channel(capacity);
        let snapshot = Arc::new(RwLock::new(HerderSnapshot::capture(&herder)));
        let handle = HerderHandle {
            sender,
            snapshot: Arc::clone(&snapshot),
        };
        (
            Self {
                herder,
                receiver,
                snapshot,
            },
            handle,
        )
    }

    /// Run until shut down or every handle is dropped. Returns the herder.
    pub async fn run(mut self) -> Herder<E> {
        info!("herder event loop started");
        loop {
            let deadline = self.herder.next_timer_deadline();
            tokio::select! {
                command = self.receiver.recv() => {
                    match command {
                        Some(HerderCommand::Shutdown) | None => {
                            info!("herder event loop shutting down");
                            break;
                        }
                        Some(command) => self.handle(command),
                    }
                }
                _ = sleep_until_or_forever(deadline) => {
                    let fired = self.herder.fire_timers(Instant::now());
                    debug!(fired, "timers fired");
                }
            }
            self.publish_snapshot();
        }
        self.publish_snapshot();
        self.herder
    }

    fn handle(&mut self, command: HerderCommand) {
        match command {
            HerderCommand::Envelope(envelope) => {
                self.herder.recv_scp_envelope(*envelope);
            }
            HerderCommand::QuorumSet { hash, quorum_set } => {
                self.herder.recv_scp_quorum_set(hash, *quorum_set);
            }
            HerderCommand::TxSet { hash, tx_set } => {
                self.herder.recv_tx_set(hash, *tx_set);
            }
            HerderCommand::DontHave {
                item_type,
                hash,
                peer,
            } => self.herder.peer_doesnt_have(item_type, hash, &peer),
            HerderCommand::Peers(peers) => self.herder.set_available_peers(peers),
            HerderCommand::Transaction { tx, reply } => {
                let status = self.herder.recv_transaction(*tx);
                let _ = reply.send(status);
            }
            HerderCommand::DumpInfo { reply } => {
                let _ = reply.send(self.herder.dump_info());
            }
            HerderCommand::Bootstrap => self.herder.bootstrap(),
            HerderCommand::Shutdown => {}
        }
    }

    fn publish_snapshot(&self) {
        *self.snapshot.write() = HerderSnapshot::capture(&self.herder);
    }
}

async fn sleep_until_or_forever(deadline: Option<Instant>) {
    match deadline {
        Some(when) => sleep_until(when).await,
        None => std::future::pending::<()>().await,
    }
}
