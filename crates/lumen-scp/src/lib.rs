//! Agreement-engine contract for the lumen consensus driver.
//!
//! The federated voting algorithm (nomination, prepare/confirm/externalize)
//! is pluggable. This crate defines only what the driver and such an engine
//! need to agree on:
//!
//! - [`ScpEngine`]: what the driver calls (feed an envelope, nominate, purge)
//! - [`SCPDriver`]: what the engine calls back (validate, combine, emit,
//!   externalize, timers)
//! - quorum-set hashing and sanity checks used when quorum sets arrive from
//!   the network
//!
//! ```ignore
//! let state = engine.receive_envelope(&mut driver, envelope);
//! engine.nominate(&mut driver, slot, value, &prev_value);
//! ```

mod driver;
mod error;
mod quorum;

pub use driver::{
    engine_timer, SCPDriver, ScpEngine, TimerCallback, TimerId, ValidationLevel,
    BALLOT_PROTOCOL_TIMER, MAX_SCP_TIMEOUT_SECONDS, NOMINATION_TIMER,
};
pub use error::ScpError;
pub use quorum::{
    hash_quorum_set, is_quorum_set_sane, quorum_set_contains, simple_quorum_set,
    MAXIMUM_QUORUM_NESTING_LEVEL, MAXIMUM_QUORUM_NODES,
};

/// Result type for SCP operations.
pub type Result<T> = std::result::Result<T, ScpError>;

/// A slot index (the ledger sequence number being agreed on).
pub type SlotIndex = u64;

/// Outcome of feeding an envelope to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeState {
    /// Envelope is invalid (bad signature, malformed, etc.)
    Invalid,
    /// Envelope is valid but not new (duplicate or older state)
    Valid,
    /// Envelope is valid and caused state change
    ValidNew,
}

impl EnvelopeState {
    pub fn is_valid(&self) -> bool {
        matches!(self, EnvelopeState::Valid | EnvelopeState::ValidNew)
    }

    pub fn is_new(&self) -> bool {
        matches!(self, EnvelopeState::ValidNew)
    }
}

// Re-export XDR types commonly used with SCP
pub use stellar_xdr::curr::{
    NodeId, ScpBallot, ScpEnvelope, ScpNomination, ScpQuorumSet, ScpStatement,
    ScpStatementConfirm, ScpStatementExternalize, ScpStatementPledges, ScpStatementPrepare, Value,
};

pub use lumen_common::Hash256;
