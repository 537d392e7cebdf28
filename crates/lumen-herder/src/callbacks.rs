//! Collaborator interfaces: the ledger below the herder and the overlay
//! beside it.
//!
//! Both are owned by the herder as boxed trait objects and called
//! synchronously from its single thread of execution. Implementations must
//! not block; anything slow belongs behind a channel on the collaborator's
//! side.

use std::fmt;

use lumen_common::Hash256;
use serde::{Deserialize, Serialize};
use stellar_xdr::curr::{AccountId, ScpEnvelope, TransactionEnvelope};

use crate::tx_set::TransactionSet;
use crate::value::LedgerValue;

/// Identifier of a connected peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of dependency an envelope can wait on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ItemType {
    TxSet,
    QuorumSet,
}

/// The ledger the node last closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LastClosedLedger {
    pub seq: u32,
    pub hash: Hash256,
    /// Value the ledger was closed with.
    pub value: LedgerValue,
}

impl LastClosedLedger {
    pub fn close_time(&self) -> u64 {
        self.value.close_time
    }
}

/// Account fields the herder checks transactions against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccountState {
    pub seq_num: i64,
    pub balance: i64,
}

/// Everything the ledger needs to apply an externalized value.
#[derive(Debug, Clone)]
pub struct LedgerCloseData {
    pub ledger_seq: u32,
    pub tx_set: TransactionSet,
    pub value: LedgerValue,
}

/// The ledger-application layer.
pub trait LedgerCallback: Send {
    fn last_closed_ledger(&self) -> LastClosedLedger;

    fn load_account(&self, account: &AccountId) -> Option<AccountState>;

    /// Apply `data`. When this returns, [`last_closed_ledger`] reports the
    /// new ledger.
    ///
    /// [`last_closed_ledger`]: LedgerCallback::last_closed_ledger
    fn close_ledger(&mut self, data: LedgerCloseData);

    /// Whether the ledger is caught up with the network.
    fn is_synced(&self) -> bool;
}

/// The networking layer.
pub trait OverlayCallback: Send {
    /// Ask `peer` for the item `hash`. The answer comes back through the
    /// herder's receive methods or as a "don't have".
    fn ask_peer(&mut self, peer: &PeerId, item_type: ItemType, hash: &Hash256);

    fn broadcast_scp_message(&mut self, envelope: &ScpEnvelope);

    fn broadcast_transaction(&mut self, tx: &TransactionEnvelope);
}
