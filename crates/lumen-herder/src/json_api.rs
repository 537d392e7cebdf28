//! JSON introspection of herder state for admin endpoints.
//!
//! [`HerderJsonInfo`] is a point-in-time copy; building it never changes
//! herder state.

use std::collections::BTreeMap;

use lumen_crypto::PublicKey;
use lumen_scp::SlotIndex;
use serde::Serialize;

use crate::metrics::MetricsSnapshot;
use crate::pending_envelopes::SlotSummary;
use crate::received_transactions::GENERATIONS;
use crate::scp_driver::ScpDriver;
use crate::state::HerderState;
use crate::timer_registry::TimerKind;

/// Complete herder info response.
#[derive(Debug, Clone, Serialize)]
pub struct HerderJsonInfo {
    /// This node's public key, or empty for a watcher.
    pub you: String,
    pub state: HerderState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tracking: Option<TrackingJsonInfo>,
    pub queue: PendingEnvelopesJsonInfo,
    pub timers: TimersJsonInfo,
    /// Staged transactions per generation, newest first.
    pub staging: [usize; GENERATIONS],
    pub metrics: MetricsSnapshot,
}

/// Last externalized slot and value.
#[derive(Debug, Clone, Serialize)]
pub struct TrackingJsonInfo {
    pub slot: SlotIndex,
    pub value: String,
    pub close_time: u64,
    pub base_fee: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct PendingEnvelopesJsonInfo {
    pub slots: Vec<SlotSummary>,
    pub fetching: usize,
    pub ready: usize,
    pub tx_set_fetches: usize,
    pub qset_fetches: usize,
    pub cached_tx_sets: usize,
    pub cached_quorum_sets: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct TimersJsonInfo {
    pub total: usize,
    pub by_kind: BTreeMap<TimerKind, usize>,
}

const ALL_TIMER_KINDS: [TimerKind; 6] = [
    TimerKind::Scp,
    TimerKind::BallotValidation,
    TimerKind::Trigger,
    TimerKind::TrackingHeartbeat,
    TimerKind::Rebroadcast,
    TimerKind::FetchRetry,
];

impl HerderJsonInfo {
    pub(crate) fn collect(driver: &ScpDriver) -> Self {
        let you = driver
            .node_id()
            .and_then(|node| PublicKey::try_from(node).ok())
            .map(|key| key.to_strkey())
            .unwrap_or_default();

        let tracking = match (driver.tracking().last_index(), driver.tracking().value()) {
            (Some(slot), Some(value)) => Some(TrackingJsonInfo {
                slot,
                value: value.to_string(),
                close_time: value.close_time,
                base_fee: value.base_fee,
            }),
            _ => None,
        };

        let pending = driver.pending();
        let queue = PendingEnvelopesJsonInfo {
            slots: pending.slot_summaries(),
            fetching: pending.fetching_count(),
            ready: pending.ready_count(),
            tx_set_fetches: pending.tx_set_fetch_count(),
            qset_fetches: pending.qset_fetch_count(),
            cached_tx_sets: pending.cached_tx_sets(),
            cached_quorum_sets: pending.cached_quorum_sets(),
        };

        let timers = driver.timers();
        let by_kind = ALL_TIMER_KINDS
            .iter()
            .map(|kind| (*kind, timers.count(*kind)))
            .filter(|(_, count)| *count > 0)
            .collect();

        Self {
            you,
            state: driver.state(),
            tracking,
            queue,
            timers: TimersJsonInfo {
                total: timers.len(),
                by_kind,
            },
            staging: driver.received().sizes(),
            metrics: driver.metrics().snapshot(),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
