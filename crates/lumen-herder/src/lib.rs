//! Consensus driver for the lumen node.
//!
//! The herder sits between the agreement engine, the overlay network and the
//! ledger. It:
//!
//! - Vets inbound envelopes and parks them until their transaction set and
//!   quorum set are known
//! - Feeds ready envelopes to the engine in slot order
//! - Answers the engine's callbacks: value validation, candidate combination,
//!   timers, signing and broadcasting
//! - Tracks the last externalized slot and notices when it falls out of sync
//! - Stages submitted transactions and proposes a set for the next ledger
//! - Hands externalized values to the ledger for closing
//!
//! ## Architecture
//!
//! ```text
//! +-------------------------+
//! |        Herder<E>        |
//! |-------------------------|
//! | engine: E               |  <-- ScpEngine (agreement protocol)
//! | driver: ScpDriver       |  <-- implements SCPDriver
//! |   - tracking            |  <-- ConsensusTracking
//! |   - pending             |  <-- PendingEnvelopes (+ ItemFetcher)
//! |   - timers              |  <-- TimerRegistry
//! |   - received            |  <-- ReceivedTransactions
//! |   - ledger / overlay    |  <-- LedgerCallback / OverlayCallback
//! +-------------------------+
//!           ^
//!           | commands, timer deadlines
//! +-------------------------+
//! |      HerderRunner       |  <-- tokio task, HerderHandle for callers
//! +-------------------------+
//! ```
//!
//! ## State Machine
//!
//! 1. **Syncing**: not following consensus; envelopes for any slot are
//!    processed until one externalizes
//! 2. **Tracking**: following consensus; a heartbeat that is not renewed
//!    within the stuck timeout drops the node back to Syncing
//!
//! ## Example
//!
//! ```ignore
//! use lumen_herder::{Herder, HerderConfig, HerderRunner};
//!
//! let config = HerderConfig::from_config(&node_config)?;
//! let herder = Herder::new(config, engine, Box::new(ledger), Box::new(overlay));
//! let (runner, handle) = HerderRunner::new(herder, 1024);
//! tokio::spawn(runner.run());
//! handle.bootstrap().await?;
//! ```

mod callbacks;
mod error;
mod event_loop;
mod herder;
mod item_fetcher;
mod json_api;
mod metrics;
mod pending_envelopes;
mod received_transactions;
mod scp_driver;
mod state;
mod timer_registry;
mod tx_set;
mod value;

pub use callbacks::{
    AccountState, ItemType, LastClosedLedger, LedgerCallback, LedgerCloseData, OverlayCallback,
    PeerId,
};
pub use error::HerderError;
pub use event_loop::{HerderCommand, HerderHandle, HerderRunner, HerderSnapshot};
pub use herder::{Herder, HerderConfig};
pub use item_fetcher::{FetchAction, FetchRequest, ItemFetcher, Tracker, MAX_REBUILD_FETCH_LIST};
pub use json_api::{HerderJsonInfo, PendingEnvelopesJsonInfo, TimersJsonInfo, TrackingJsonInfo};
pub use metrics::{Counter, HerderMetrics, MetricsSnapshot};
pub use pending_envelopes::{
    quorum_set_hash, statement_values, tx_set_hashes, PendingConfig, PendingEnvelopes, RecvResult,
    SlotSummary,
};
pub use received_transactions::{ReceivedTransactions, GENERATIONS};
pub use scp_driver::{ScpDriver, TxStatus};
pub use state::{ConsensusTracking, HerderState};
pub use timer_registry::{FiredTimer, TimerKey, TimerKind, TimerRegistry};
pub use tx_set::{TransactionFrame, TransactionSet};
pub use value::LedgerValue;

/// Result type for herder operations.
pub type Result<T> = std::result::Result<T, HerderError>;
