//! Herder metrics.
//!
//! Counters are relaxed atomics so monitoring can read them from any thread
//! while the herder runs. They never feed back into control flow.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Atomic counter.
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    /// Overwrite the value. Used for gauges.
    pub fn set(&self, n: u64) {
        self.value.store(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Every metric the herder maintains.
#[derive(Debug, Default)]
pub struct HerderMetrics {
    // values
    pub value_valid: Counter,
    pub value_invalid: Counter,
    pub nominating_value: Counter,
    pub value_externalize: Counter,
    pub updated_candidate: Counter,
    pub start_ballot_protocol: Counter,
    pub accepted_ballot_prepared: Counter,
    pub confirmed_ballot_prepared: Counter,
    pub accepted_commit: Counter,

    // ballots
    pub ballot_valid: Counter,
    pub ballot_invalid: Counter,
    pub ballot_sign: Counter,
    pub ballot_valid_sig: Counter,
    pub ballot_invalid_sig: Counter,
    pub ballot_expire: Counter,
    pub quorum_heard: Counter,

    // sync
    pub qset_retrieve: Counter,
    pub lost_sync: Counter,
    pub discontinuity: Counter,

    // envelopes
    pub envelope_emit: Counter,
    pub envelope_receive: Counter,
    pub envelope_sign: Counter,
    pub envelope_valid_sig: Counter,
    pub envelope_invalid_sig: Counter,
    pub envelope_duplicate: Counter,
    pub envelope_evicted: Counter,
    pub cache_evicted: Counter,

    // transactions
    pub tx_received: Counter,
    pub tx_rejected: Counter,

    // gauges
    pub qset_fetches: Counter,
    pub ballot_validation_timers: Counter,
    pub known_slots: Counter,
    pub cumulative_statements: Counter,
    pub cached_quorum_sets: Counter,
}

impl HerderMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            value_valid: self.value_valid.get(),
            value_invalid: self.value_invalid.get(),
            nominating_value: self.nominating_value.get(),
            value_externalize: self.value_externalize.get(),
            updated_candidate: self.updated_candidate.get(),
            start_ballot_protocol: self.start_ballot_protocol.get(),
            accepted_ballot_prepared: self.accepted_ballot_prepared.get(),
            confirmed_ballot_prepared: self.confirmed_ballot_prepared.get(),
            accepted_commit: self.accepted_commit.get(),
            ballot_valid: self.ballot_valid.get(),
            ballot_invalid: self.ballot_invalid.get(),
            ballot_sign: self.ballot_sign.get(),
            ballot_valid_sig: self.ballot_valid_sig.get(),
            ballot_invalid_sig: self.ballot_invalid_sig.get(),
            ballot_expire: self.ballot_expire.get(),
            quorum_heard: self.quorum_heard.get(),
            qset_retrieve: self.qset_retrieve.get(),
            lost_sync: self.lost_sync.get(),
            discontinuity: self.discontinuity.get(),
            envelope_emit: self.envelope_emit.get(),
            envelope_receive: self.envelope_receive.get(),
            envelope_sign: self.envelope_sign.get(),
            envelope_valid_sig: self.envelope_valid_sig.get(),
            envelope_invalid_sig: self.envelope_invalid_sig.get(),
            envelope_duplicate: self.envelope_duplicate.get(),
            envelope_evicted: self.envelope_evicted.get(),
            cache_evicted: self.cache_evicted.get(),
            tx_received: self.tx_received.get(),
            tx_rejected: self.tx_rejected.get(),
            qset_fetches: self.qset_fetches.get(),
            ballot_validation_timers: self.ballot_validation_timers.get(),
            known_slots: self.known_slots.get(),
            cumulative_statements: self.cumulative_statements.get(),
            cached_quorum_sets: self.cached_quorum_sets.get(),
        }
    }
}

/// Point-in-time copy of [`HerderMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub value_valid: u64,
    pub value_invalid: u64,
    pub nominating_value: u64,
    pub value_externalize: u64,
    pub updated_candidate: u64,
    pub start_ballot_protocol: u64,
    pub accepted_ballot_prepared: u64,
    pub confirmed_ballot_prepared: u64,
    pub accepted_commit: u64,
    pub ballot_valid: u64,
    pub ballot_invalid: u64,
    pub ballot_sign: u64,
    pub ballot_valid_sig: u64,
    pub ballot_invalid_sig: u64,
    pub ballot_expire: u64,
    pub quorum_heard: u64,
    pub qset_retrieve: u64,
    pub lost_sync: u64,
    pub discontinuity: u64,
    pub envelope_emit: u64,
    pub envelope_receive: u64,
    pub envelope_sign: u64,
    pub envelope_valid_sig: u64,
    pub envelope_invalid_sig: u64,
    pub envelope_duplicate: u64,
    pub envelope_evicted: u64,
    pub cache_evicted: u64,
    pub tx_received: u64,
    pub tx_rejected: u64,
    pub qset_fetches: u64,
    pub ballot_validation_timers: u64,
    pub known_slots: u64,
    pub cumulative_statements: u64,
    pub cached_quorum_sets: u64,
}
