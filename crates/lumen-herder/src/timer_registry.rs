//! Keyed registry of the herder's timers.
//!
//! Every scheduled callback the herder or the agreement engine needs lives
//! here under a [`TimerKey`]. There is at most one live timer per key:
//! scheduling an existing key replaces it, so a superseded timer can never
//! fire. Timers belonging to a slot are cancelled in bulk once the slot is
//! decided.
//!
//! The registry does not sleep. The owner asks for [`next_deadline`] and
//! later hands the current time to [`pop_expired`], one timer at a time, so
//! that firing one timer can still cancel the others.
//!
//! [`next_deadline`]: TimerRegistry::next_deadline
//! [`pop_expired`]: TimerRegistry::pop_expired

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use lumen_common::Hash256;
use lumen_scp::{ScpBallot, SlotIndex, TimerCallback, TimerId};
use serde::Serialize;
use stellar_xdr::curr::NodeId;
use tokio::time::Instant;
use tracing::trace;

use crate::callbacks::ItemType;

/// What a timer is for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TimerKey {
    /// Engine timer requested through `setup_timer`.
    Scp { slot: SlotIndex, timer_id: TimerId },
    /// Provisional acceptance of a ballot from outside the local quorum set.
    BallotValidation {
        slot: SlotIndex,
        ballot: ScpBallot,
        node: NodeId,
    },
    /// Start nominating for the next ledger.
    Trigger,
    /// Declare loss of sync if nothing renews it first.
    TrackingHeartbeat,
    /// Re-send our latest envelope.
    Rebroadcast,
    /// Ask the next peer for a missing item.
    FetchRetry { item_type: ItemType, hash: Hash256 },
}

impl TimerKey {
    /// Slot the timer belongs to, if it is slot-scoped.
    pub fn slot(&self) -> Option<SlotIndex> {
        match self {
            TimerKey::Scp { slot, .. } | TimerKey::BallotValidation { slot, .. } => Some(*slot),
            _ => None,
        }
    }

    /// Short kind label used in introspection.
    pub fn kind(&self) -> TimerKind {
        match self {
            TimerKey::Scp { .. } => TimerKind::Scp,
            TimerKey::BallotValidation { .. } => TimerKind::BallotValidation,
            TimerKey::Trigger => TimerKind::Trigger,
            TimerKey::TrackingHeartbeat => TimerKind::TrackingHeartbeat,
            TimerKey::Rebroadcast => TimerKind::Rebroadcast,
            TimerKey::FetchRetry { .. } => TimerKind::FetchRetry,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum TimerKind {
    Scp,
    BallotValidation,
    Trigger,
    TrackingHeartbeat,
    Rebroadcast,
    FetchRetry,
}

/// A timer taken out of the registry because its deadline passed.
pub struct FiredTimer {
    pub key: TimerKey,
    /// Engine callback, present only for [`TimerKey::Scp`].
    pub callback: Option<TimerCallback>,
}

impl fmt::Debug for FiredTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiredTimer")
            .field("key", &self.key)
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}

struct Entry {
    deadline: Instant,
    generation: u64,
    callback: Option<TimerCallback>,
}

#[derive(Default)]
pub struct TimerRegistry {
    entries: HashMap<TimerKey, Entry>,
    generation: u64,
}

impl TimerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm `key` to fire `delay` after `now`, replacing any live timer with
    /// the same key. Returns the generation of the new timer.
    pub fn schedule(
        &mut self,
        key: TimerKey,
        now: Instant,
        delay: Duration,
        callback: Option<TimerCallback>,
    ) -> u64 {
        self.generation = self.generation.wrapping_add(1);
        trace!(?key, ?delay, generation = self.generation, "schedule timer");
        self.entries.insert(
            key,
            Entry {
                deadline: now + delay,
                generation: self.generation,
                callback,
            },
        );
        self.generation
    }

    /// Cancel `key`. Returns whether a timer was live.
    pub fn cancel(&mut self, key: &TimerKey) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Cancel every slot-scoped timer for slots up to and including `slot`.
    pub fn cancel_slots_up_to(&mut self, slot: SlotIndex) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|key, _| key.slot().map_or(true, |s| s > slot));
        let cancelled = before - self.entries.len();
        if cancelled > 0 {
            trace!(slot, cancelled, "cancelled slot timers");
        }
        cancelled
    }

    pub fn contains(&self, key: &TimerKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn deadline(&self, key: &TimerKey) -> Option<Instant> {
        self.entries.get(key).map(|e| e.deadline)
    }

    pub fn generation(&self, key: &TimerKey) -> Option<u64> {
        self.entries.get(key).map(|e| e.generation)
    }

    /// Earliest deadline among live timers.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.values().map(|e| e.deadline).min()
    }

    /// Remove and return the earliest timer whose deadline is at or before
    /// `now`. Timers with equal deadlines come out in scheduling order.
    pub fn pop_expired(&mut self, now: Instant) -> Option<FiredTimer> {
        let key = self
            .entries
            .iter()
            .filter(|(_, e)| e.deadline <= now)
            .min_by_key(|(_, e)| (e.deadline, e.generation))
            .map(|(k, _)| k.clone())?;
        let entry = self.entries.remove(&key)?;
        Some(FiredTimer {
            key,
            callback: entry.callback,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Live timers of one kind.
    pub fn count(&self, kind: TimerKind) -> usize {
        self.entries.keys().filter(|k| k.kind() == kind).count()
    }
}
