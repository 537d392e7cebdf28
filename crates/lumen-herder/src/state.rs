//! Consensus tracking state.
//!
//! The herder either follows the network (it knows the last slot the network
//! externalized and the value it agreed on) or it does not. There is no third
//! state: a node that has lost sync simply waits for the next externalization
//! it can observe.
//!
//! ```text
//! NotTracking --externalize / bootstrap--> Tracking
//! Tracking    --externalize-------------> Tracking
//! Tracking    --heartbeat expiry--------> NotTracking
//! ```

use std::fmt;

use lumen_scp::SlotIndex;
use serde::{Deserialize, Serialize};

use crate::value::LedgerValue;

/// Coarse herder state reported to operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum HerderState {
    /// Not following consensus; waiting to observe an externalization.
    #[default]
    Syncing,
    /// Following consensus in real time.
    Tracking,
}

impl HerderState {
    pub fn is_tracking(&self) -> bool {
        matches!(self, HerderState::Tracking)
    }
}

impl fmt::Display for HerderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HerderState::Syncing => write!(f, "Syncing"),
            HerderState::Tracking => write!(f, "Tracking"),
        }
    }
}

/// What the herder believes the network last agreed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConsensusTracking {
    #[default]
    NotTracking,
    Tracking {
        /// Last externalized slot.
        slot: SlotIndex,
        /// Value externalized for `slot`.
        value: LedgerValue,
    },
}

impl ConsensusTracking {
    /// Start tracking `slot`.
    ///
    /// # Panics
    ///
    /// Slots map to 32-bit ledger sequence numbers; a slot beyond `u32::MAX`
    /// means the state is corrupt.
    pub fn tracking(slot: SlotIndex, value: LedgerValue) -> Self {
        assert!(
            slot <= u32::MAX as u64,
            "consensus index {} does not fit a ledger sequence",
            slot
        );
        ConsensusTracking::Tracking { slot, value }
    }

    pub fn is_tracking(&self) -> bool {
        matches!(self, ConsensusTracking::Tracking { .. })
    }

    /// Last externalized slot, when tracking.
    pub fn last_index(&self) -> Option<SlotIndex> {
        match self {
            ConsensusTracking::Tracking { slot, .. } => Some(*slot),
            ConsensusTracking::NotTracking => None,
        }
    }

    /// Slot currently being agreed on, when tracking.
    pub fn next_index(&self) -> Option<SlotIndex> {
        self.last_index().map(|slot| slot + 1)
    }

    /// Value externalized for [`last_index`](Self::last_index).
    pub fn value(&self) -> Option<&LedgerValue> {
        match self {
            ConsensusTracking::Tracking { value, .. } => Some(value),
            ConsensusTracking::NotTracking => None,
        }
    }

    pub fn state(&self) -> HerderState {
        if self.is_tracking() {
            HerderState::Tracking
        } else {
            HerderState::Syncing
        }
    }
}
