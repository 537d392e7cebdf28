//! The two halves of the agreement-engine contract.
//!
//! The voting algorithm itself lives behind [`ScpEngine`]. It is fed
//! envelopes and nomination inputs, and talks back to the application through
//! [`SCPDriver`]. Every engine entry point receives the driver as
//! `&mut dyn SCPDriver`, so the engine never owns or aliases the driver and
//! callbacks run synchronously on the caller's thread.
//!
//! Timers requested by the engine are owned by the driver. When one fires,
//! the driver hands its [`TimerCallback`] both halves back, which lets the
//! engine resume with the same borrow discipline.

use std::collections::BTreeSet;
use std::time::Duration;

use lumen_common::Hash256;
use stellar_xdr::curr::{NodeId, ScpBallot, ScpEnvelope, ScpQuorumSet, Value};

use crate::{EnvelopeState, SlotIndex};

/// Identifier of an engine timer within a slot.
pub type TimerId = u32;

/// Timer driving nomination rounds.
pub const NOMINATION_TIMER: TimerId = 0;

/// Timer driving ballot counter bumps.
pub const BALLOT_PROTOCOL_TIMER: TimerId = 1;

/// Upper bound for computed round timeouts, in seconds.
pub const MAX_SCP_TIMEOUT_SECONDS: u64 = 30 * 60;

/// Callback run when an engine timer fires.
pub type TimerCallback = Box<dyn FnOnce(&mut dyn ScpEngine, &mut dyn SCPDriver) + Send>;

/// Build a callback that routes back to [`ScpEngine::timer_expired`].
pub fn engine_timer(slot_index: SlotIndex, timer_id: TimerId) -> TimerCallback {
    Box::new(move |engine: &mut dyn ScpEngine, driver: &mut dyn SCPDriver| {
        engine.timer_expired(driver, slot_index, timer_id)
    })
}

/// Verdict on a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationLevel {
    /// Reject the value.
    Invalid,
    /// Cannot decide yet (for example, the transaction set is still being
    /// fetched). The engine defers instead of rejecting.
    MaybeValid,
    /// The value is valid.
    FullyValidated,
}

/// Callbacks the engine makes into the application.
pub trait SCPDriver {
    /// Judge a value proposed by `node_id` for `slot_index`.
    fn validate_value(
        &mut self,
        slot_index: SlotIndex,
        node_id: &NodeId,
        value: &Value,
    ) -> ValidationLevel;

    /// Judge a ballot before the engine lets it count.
    fn validate_ballot(
        &mut self,
        _slot_index: SlotIndex,
        _node_id: &NodeId,
        _ballot: &ScpBallot,
    ) -> bool {
        true
    }

    /// Human-readable rendering of a value, for logs only.
    fn get_value_string(&self, value: &Value) -> String {
        let bytes = value.as_slice();
        hex::encode(&bytes[..8.min(bytes.len())])
    }

    /// Reduce the confirmed nomination candidates to one value.
    ///
    /// Must be deterministic and independent of iteration order. Returns
    /// `None` only when nothing can be combined.
    fn combine_candidates(
        &mut self,
        slot_index: SlotIndex,
        candidates: &BTreeSet<Value>,
    ) -> Option<Value>;

    fn nominating_value(&mut self, _slot_index: SlotIndex, _value: &Value) {}

    fn updated_candidate_value(&mut self, _slot_index: SlotIndex, _value: &Value) {}

    fn started_ballot_protocol(&mut self, _slot_index: SlotIndex, _ballot: &ScpBallot) {}

    fn accepted_ballot_prepared(&mut self, _slot_index: SlotIndex, _ballot: &ScpBallot) {}

    fn confirmed_ballot_prepared(&mut self, _slot_index: SlotIndex, _ballot: &ScpBallot) {}

    fn accepted_commit(&mut self, _slot_index: SlotIndex, _ballot: &ScpBallot) {}

    /// A quorum has been heard from on `ballot`.
    fn ballot_did_hear_from_quorum(&mut self, _slot_index: SlotIndex, _ballot: &ScpBallot) {}

    /// `value` is final for `slot_index`.
    fn value_externalized(&mut self, slot_index: SlotIndex, value: &Value);

    /// Schedule, reschedule or (with `None`) cancel the timer
    /// `(slot_index, timer_id)`. A reschedule supersedes the earlier one.
    fn setup_timer(
        &mut self,
        slot_index: SlotIndex,
        timer_id: TimerId,
        timeout: Duration,
        callback: Option<TimerCallback>,
    );

    /// Sign and broadcast a statement produced by the local node.
    fn emit_envelope(&mut self, envelope: ScpEnvelope);

    /// Look up a quorum set by hash.
    fn get_quorum_set(&self, hash: &Hash256) -> Option<ScpQuorumSet>;

    /// Timeout for round `round` (1-based): one second doubling per round.
    fn compute_timeout(&self, round: u32) -> Duration {
        let secs = if round >= 63 {
            MAX_SCP_TIMEOUT_SECONDS
        } else {
            (1u64 << round.saturating_sub(1)).min(MAX_SCP_TIMEOUT_SECONDS)
        };
        Duration::from_secs(secs)
    }
}

/// Entry points of the agreement engine.
pub trait ScpEngine: Send {
    /// Feed one envelope into the engine.
    fn receive_envelope(
        &mut self,
        driver: &mut dyn SCPDriver,
        envelope: ScpEnvelope,
    ) -> EnvelopeState;

    /// Start or continue nominating `value` for `slot_index`.
    fn nominate(
        &mut self,
        driver: &mut dyn SCPDriver,
        slot_index: SlotIndex,
        value: Value,
        prev_value: &Value,
    ) -> bool;

    /// A timer requested through [`SCPDriver::setup_timer`] via
    /// [`engine_timer`] has fired.
    fn timer_expired(
        &mut self,
        _driver: &mut dyn SCPDriver,
        _slot_index: SlotIndex,
        _timer_id: TimerId,
    ) {
    }

    /// Forget every slot below `max_slot_index`.
    fn purge_slots(&mut self, max_slot_index: SlotIndex);

    /// Number of slots the engine holds state for.
    fn known_slot_count(&self) -> usize {
        0
    }

    /// Statements held across all slots.
    fn cumulative_statement_count(&self) -> usize {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullDriver;

    impl SCPDriver for NullDriver {
        fn validate_value(&mut self, _: SlotIndex, _: &NodeId, _: &Value) -> ValidationLevel {
            ValidationLevel::FullyValidated
        }
        fn combine_candidates(&mut self, _: SlotIndex, c: &BTreeSet<Value>) -> Option<Value> {
            c.iter().next().cloned()
        }
        fn value_externalized(&mut self, _: SlotIndex, _: &Value) {}
        fn setup_timer(&mut self, _: SlotIndex, _: TimerId, _: Duration, _: Option<TimerCallback>) {}
        fn emit_envelope(&mut self, _: ScpEnvelope) {}
        fn get_quorum_set(&self, _: &Hash256) -> Option<ScpQuorumSet> {
            None
        }
    }

    #[derive(Default)]
    struct CountingEngine {
        expired: Vec<(SlotIndex, TimerId)>,
    }

    impl ScpEngine for CountingEngine {
        fn receive_envelope(&mut self, _: &mut dyn SCPDriver, _: ScpEnvelope) -> EnvelopeState {
            EnvelopeState::Valid
        }
        fn nominate(&mut self, _: &mut dyn SCPDriver, _: SlotIndex, _: Value, _: &Value) -> bool {
            false
        }
        fn timer_expired(&mut self, _: &mut dyn SCPDriver, slot: SlotIndex, id: TimerId) {
            self.expired.push((slot, id));
        }
        fn purge_slots(&mut self, _: SlotIndex) {}
    }

    #[test]
    fn test_timeout_doubles_and_caps() {
        let driver = NullDriver;
        assert_eq!(driver.compute_timeout(1), Duration::from_secs(1));
        assert_eq!(driver.compute_timeout(2), Duration::from_secs(2));
        assert_eq!(driver.compute_timeout(5), Duration::from_secs(16));
        assert_eq!(
            driver.compute_timeout(40),
            Duration::from_secs(MAX_SCP_TIMEOUT_SECONDS)
        );
        assert_eq!(
            driver.compute_timeout(u32::MAX),
            Duration::from_secs(MAX_SCP_TIMEOUT_SECONDS)
        );
    }

    #[test]
    fn test_engine_timer_routes_to_engine() {
        let mut engine = CountingEngine::default();
        let mut driver = NullDriver;
        let callback = engine_timer(9, BALLOT_PROTOCOL_TIMER);
        callback(&mut engine, &mut driver);
        assert_eq!(engine.expired, vec![(9, BALLOT_PROTOCOL_TIMER)]);
    }

    #[test]
    fn test_default_value_string_is_short_hex() {
        let driver = NullDriver;
        let value = Value(vec![0xab; 20].try_into().unwrap());
        assert_eq!(driver.get_value_string(&value), "abababababababab");
    }
}
