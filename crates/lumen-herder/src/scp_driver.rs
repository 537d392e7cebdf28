//! The herder's side of the agreement-engine contract.
//!
//! [`ScpDriver`] owns every piece of herder state (consensus tracking,
//! pending envelopes, timers, the transaction staging buffer and the
//! collaborator handles) and implements [`SCPDriver`], so the engine can call
//! back into it while it is handed out as `&mut dyn SCPDriver`.
//!
//! Work that needs the engine itself (feeding envelopes, nominating, purging
//! slots, running engine timers) is done one level up by
//! [`Herder`](crate::Herder), which owns both halves.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use lumen_common::time::current_timestamp;
use lumen_common::Hash256;
use lumen_crypto::{sign_statement, verify_envelope};
use lumen_scp::{
    quorum_set_contains, SCPDriver, ScpBallot, SlotIndex, TimerCallback, TimerId,
    ValidationLevel,
};
use serde::Serialize;
use stellar_xdr::curr::{
    AccountId, NodeId, ScpEnvelope, ScpQuorumSet, ScpStatementPledges, TransactionEnvelope, Value,
};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::callbacks::{ItemType, LedgerCallback, LedgerCloseData, OverlayCallback, PeerId};
use crate::herder::HerderConfig;
use crate::item_fetcher::{FetchAction, FetchRequest};
use crate::metrics::HerderMetrics;
use crate::pending_envelopes::{PendingConfig, PendingEnvelopes, RecvResult};
use crate::received_transactions::ReceivedTransactions;
use crate::state::{ConsensusTracking, HerderState};
use crate::timer_registry::{TimerKey, TimerRegistry};
use crate::tx_set::{TransactionFrame, TransactionSet};
use crate::value::LedgerValue;

/// Outcome of submitting a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TxStatus {
    /// Accepted and staged for the next proposal.
    Pending,
    Duplicate,
    Malformed,
    InsufficientFee,
    InsufficientBalance,
    BadSequence,
    UnknownAccount,
}

pub struct ScpDriver {
    config: HerderConfig,
    node_id: Option<NodeId>,
    tracking: ConsensusTracking,
    pending: PendingEnvelopes,
    timers: TimerRegistry,
    received: ReceivedTransactions,
    ledger: Box<dyn LedgerCallback>,
    overlay: Box<dyn OverlayCallback>,
    metrics: Arc<HerderMetrics>,
    /// Value we are nominating for the slot in progress.
    current_value: Option<Value>,
    last_trigger: Instant,
    last_triggered_seq: Option<u64>,
    /// Ledger the armed trigger timer will nominate for.
    trigger_seq: Option<u64>,
    latest_envelopes: BTreeMap<SlotIndex, ScpEnvelope>,
    /// Externalized slot whose transaction set is still being fetched.
    deferred_close: Option<(SlotIndex, LedgerValue)>,
    /// Later externalizations waiting for the deferred close to finish.
    held_externalizations: BTreeMap<SlotIndex, Value>,
    purge_below: Option<SlotIndex>,
}

impl ScpDriver {
    pub fn new(
        config: HerderConfig,
        ledger: Box<dyn LedgerCallback>,
        overlay: Box<dyn OverlayCallback>,
        metrics: Arc<HerderMetrics>,
    ) -> Self {
        let pending = PendingEnvelopes::new(
            PendingConfig {
                max_pending_envelopes: config.max_pending_envelopes,
                tx_set_cache_size: config.tx_set_cache_size,
                qset_cache_size: config.qset_cache_size,
                fetch_reply_timeout: config.fetch_reply_timeout,
            },
            config.quorum_set.clone(),
            Arc::clone(&metrics),
        );
        Self {
            node_id: config.node_id(),
            config,
            tracking: ConsensusTracking::NotTracking,
            pending,
            timers: TimerRegistry::new(),
            received: ReceivedTransactions::new(),
            ledger,
            overlay,
            metrics,
            current_value: None,
            last_trigger: Instant::now(),
            last_triggered_seq: None,
            trigger_seq: None,
            latest_envelopes: BTreeMap::new(),
            deferred_close: None,
            held_externalizations: BTreeMap::new(),
            purge_below: None,
        }
    }

    pub fn config(&self) -> &HerderConfig {
        &self.config
    }

    pub fn node_id(&self) -> Option<&NodeId> {
        self.node_id.as_ref()
    }

    pub fn tracking(&self) -> &ConsensusTracking {
        &self.tracking
    }

    pub fn state(&self) -> HerderState {
        self.tracking.state()
    }

    pub fn metrics(&self) -> &Arc<HerderMetrics> {
        &self.metrics
    }

    pub fn pending(&self) -> &PendingEnvelopes {
        &self.pending
    }

    pub fn timers(&self) -> &TimerRegistry {
        &self.timers
    }

    pub(crate) fn timers_mut(&mut self) -> &mut TimerRegistry {
        &mut self.timers
    }

    pub fn received(&self) -> &ReceivedTransactions {
        &self.received
    }

    pub fn ledger(&self) -> &dyn LedgerCallback {
        self.ledger.as_ref()
    }

    pub fn current_value(&self) -> Option<&Value> {
        self.current_value.as_ref()
    }

    /// Ledger the armed trigger will nominate for.
    pub fn scheduled_trigger(&self) -> Option<u64> {
        self.trigger_seq
    }

    pub fn deferred_close(&self) -> Option<SlotIndex> {
        self.deferred_close.map(|(slot, _)| slot)
    }

    /// Externalized slots waiting behind the deferred close, ascending.
    pub fn held_externalizations(&self) -> Vec<SlotIndex> {
        self.held_externalizations.keys().copied().collect()
    }

    /// Last envelope we emitted for `slot`.
    pub fn latest_envelope(&self, slot: SlotIndex) -> Option<&ScpEnvelope> {
        self.latest_envelopes.get(&slot)
    }

    pub fn is_validator(&self) -> bool {
        self.config.is_validator && self.config.secret_key.is_some()
    }

    /// Highest ledger the node knows of: the last closed ledger, or the last
    /// externalized slot if that is ahead.
    pub fn current_ledger_seq(&self) -> SlotIndex {
        let lcl = self.ledger.last_closed_ledger().seq as SlotIndex;
        self.tracking.last_index().map_or(lcl, |last| last.max(lcl))
    }

    /// Whether full value checks can run for `slot`: the ledger is synced
    /// and `slot` is the one right after the last closed ledger.
    pub fn is_slot_compatible_with_current_state(&self, slot: SlotIndex) -> bool {
        self.ledger.is_synced() && slot == self.ledger.last_closed_ledger().seq as SlotIndex + 1
    }

    pub fn set_available_peers(&mut self, peers: Vec<PeerId>) {
        self.pending.set_available_peers(peers);
    }

    // ---------------------------------------------------------------------
    // Envelope intake
    // ---------------------------------------------------------------------

    /// Check an inbound envelope and hand it to the pending store.
    pub fn recv_scp_envelope(&mut self, envelope: ScpEnvelope) -> RecvResult {
        let slot = envelope.statement.slot_index;
        if self.pending.is_duplicate(&envelope) {
            self.metrics.envelope_duplicate.inc();
            trace!(slot, "duplicate envelope");
            return RecvResult::AlreadyProcessed;
        }

        let min_slot = self
            .current_ledger_seq()
            .saturating_sub(self.config.max_slots_to_remember as SlotIndex);
        if slot < min_slot {
            debug!(slot, min_slot, "envelope for a slot too far behind");
            return RecvResult::Discarded;
        }
        if let Some(next) = self.tracking.next_index() {
            let max_slot = next + self.config.ledger_validity_bracket as SlotIndex;
            if slot > max_slot {
                debug!(slot, max_slot, "envelope for a slot too far ahead");
                return RecvResult::Discarded;
            }
        }

        let ballot = is_ballot_statement(&envelope);
        if let Err(err) = verify_envelope(&self.config.network_id, &envelope) {
            self.metrics.envelope_invalid_sig.inc();
            if ballot {
                self.metrics.ballot_invalid_sig.inc();
            }
            debug!(slot, %err, "envelope signature check failed");
            return RecvResult::Discarded;
        }
        self.metrics.envelope_valid_sig.inc();
        if ballot {
            self.metrics.ballot_valid_sig.inc();
        }
        self.metrics.envelope_receive.inc();

        let (result, requests) = self.pending.recv_envelope(envelope);
        self.execute_fetches(requests);
        result
    }

    /// Next envelope the engine should see, lowest slot first.
    ///
    /// While tracking, slots too far behind are dropped and nothing beyond
    /// the slot in progress is released. Nothing beyond a slot whose close is
    /// deferred is released either.
    pub(crate) fn next_ready_envelope(&mut self) -> Option<ScpEnvelope> {
        let deferred = self.deferred_close.map(|(slot, _)| slot);
        match self.tracking.next_index() {
            Some(next) => {
                let oldest = next.saturating_sub(self.config.max_slots_to_remember as SlotIndex);
                let stopped = self.pending.erase_below(oldest);
                self.cancel_fetch_timers(stopped);
                self.pending.pop(deferred.map_or(next, |slot| slot.min(next)))
            }
            None => self.pending.pop(deferred.unwrap_or(SlotIndex::MAX)),
        }
    }

    pub fn recv_scp_quorum_set(&mut self, hash: Hash256, quorum_set: ScpQuorumSet) -> bool {
        let accepted = self.pending.recv_quorum_set(hash, quorum_set);
        if !self.pending.is_fetching(ItemType::QuorumSet, &hash) {
            self.timers.cancel(&TimerKey::FetchRetry {
                item_type: ItemType::QuorumSet,
                hash,
            });
        }
        let refetches = self.pending.take_fetch_requests();
        self.execute_fetches(refetches);
        accepted
    }

    /// Accept a fetched transaction set and finish a deferred ledger close
    /// waiting on it.
    pub fn recv_tx_set(&mut self, hash: Hash256, tx_set: TransactionSet) -> bool {
        if !self.pending.recv_tx_set(hash, tx_set) {
            return false;
        }
        self.timers.cancel(&TimerKey::FetchRetry {
            item_type: ItemType::TxSet,
            hash,
        });
        let refetches = self.pending.take_fetch_requests();
        self.execute_fetches(refetches);
        if let Some((slot, value)) = self.deferred_close {
            if value.tx_set_hash == hash {
                if let Some(tx_set) = self.pending.get_tx_set(&hash).cloned() {
                    info!(slot, "completing deferred ledger close");
                    self.complete_close(slot, value, tx_set);
                    self.release_held_externalizations();
                }
            }
        }
        true
    }

    /// Replay held externalizations in slot order until one has to wait for
    /// its transaction set again.
    fn release_held_externalizations(&mut self) {
        while self.deferred_close.is_none() {
            let Some((slot, value)) = self.held_externalizations.pop_first() else {
                break;
            };
            debug!(slot, "processing held externalization");
            self.value_externalized(slot, &value);
        }
    }

    pub fn peer_doesnt_have(&mut self, item_type: ItemType, hash: Hash256, peer: &PeerId) {
        if let Some(request) = self.pending.peer_doesnt_have(item_type, &hash, peer) {
            self.execute_fetch(request);
        }
    }

    pub(crate) fn fetch_retry(&mut self, item_type: ItemType, hash: Hash256) {
        if let Some(request) = self.pending.fetch_retry(item_type, &hash) {
            self.execute_fetch(request);
        }
    }

    fn execute_fetches(&mut self, requests: Vec<FetchRequest>) {
        for request in requests {
            self.execute_fetch(request);
        }
    }

    fn execute_fetch(&mut self, request: FetchRequest) {
        let key = TimerKey::FetchRetry {
            item_type: request.item_type,
            hash: request.hash,
        };
        let delay = match request.action {
            FetchAction::Ask { peer, timeout } => {
                trace!(%peer, item = ?request.item_type, hash = %request.hash.short(), "asking peer");
                self.overlay
                    .ask_peer(&peer, request.item_type, &request.hash);
                timeout
            }
            FetchAction::Wait { delay } => delay,
        };
        self.timers.schedule(key, Instant::now(), delay, None);
    }

    fn cancel_fetch_timers(&mut self, stopped: Vec<(ItemType, Hash256)>) {
        for (item_type, hash) in stopped {
            self.timers.cancel(&TimerKey::FetchRetry { item_type, hash });
        }
    }

    // ---------------------------------------------------------------------
    // Transactions
    // ---------------------------------------------------------------------

    /// Validate and stage a transaction.
    pub fn recv_transaction(&mut self, tx: TransactionEnvelope) -> TxStatus {
        let status = self.admit_transaction(tx);
        if status == TxStatus::Pending {
            self.metrics.tx_received.inc();
        } else {
            self.metrics.tx_rejected.inc();
            trace!(?status, "transaction rejected");
        }
        status
    }

    fn admit_transaction(&mut self, tx: TransactionEnvelope) -> TxStatus {
        let frame = match TransactionFrame::new(tx) {
            Ok(frame) => frame,
            Err(err) => {
                debug!(%err, "malformed transaction");
                return TxStatus::Malformed;
            }
        };
        if self.received.contains(&frame.hash()) {
            return TxStatus::Duplicate;
        }
        let Some(account) = self.ledger.load_account(frame.source()) else {
            return TxStatus::UnknownAccount;
        };

        let staged_seq = self.received.max_seq_for(frame.source());
        let expected = staged_seq
            .map_or(account.seq_num, |seq| seq.max(account.seq_num))
            .checked_add(1);
        if expected != Some(frame.seq_num()) {
            return TxStatus::BadSequence;
        }

        let base_fee = self.ledger.last_closed_ledger().value.base_fee;
        if frame.fee() < frame.min_fee(base_fee) {
            return TxStatus::InsufficientFee;
        }

        let total_fees = self
            .received
            .fees_for(frame.source())
            .saturating_add(frame.fee());
        if total_fees > account.balance.max(0) as u64 {
            return TxStatus::InsufficientBalance;
        }

        self.overlay.broadcast_transaction(frame.envelope());
        self.received.push(frame);
        TxStatus::Pending
    }

    /// Stage every transaction of a received set.
    pub fn recv_transactions(&mut self, tx_set: &TransactionSet) -> Vec<TxStatus> {
        tx_set
            .transactions()
            .iter()
            .map(|tx| self.recv_transaction(tx.envelope().clone()))
            .collect()
    }

    /// Highest sequence number staged for `account`.
    pub fn get_max_seq_in_pending_txs(&self, account: &AccountId) -> Option<i64> {
        self.received.max_seq_for(account)
    }

    // ---------------------------------------------------------------------
    // Tracking and ledger close
    // ---------------------------------------------------------------------

    /// Start tracking at the last closed ledger without waiting for the
    /// network, and arm an immediate trigger.
    pub fn bootstrap(&mut self) {
        let lcl = self.ledger.last_closed_ledger();
        info!(ledger = lcl.seq, "bootstrapping consensus at last closed ledger");
        self.tracking = ConsensusTracking::tracking(lcl.seq as SlotIndex, lcl.value);
        self.tracking_heartbeat();
        let now = Instant::now();
        self.last_trigger = now
            .checked_sub(self.config.ledger_close_time)
            .unwrap_or(now);
        self.ledger_closed();
    }

    fn tracking_heartbeat(&mut self) {
        self.timers.schedule(
            TimerKey::TrackingHeartbeat,
            Instant::now(),
            self.config.consensus_stuck_timeout,
            None,
        );
    }

    /// The heartbeat ran out: stop tracking until the next externalization.
    pub(crate) fn herder_out_of_sync(&mut self) {
        warn!(
            last = ?self.tracking.last_index(),
            "lost track of consensus"
        );
        self.metrics.lost_sync.inc();
        self.tracking = ConsensusTracking::NotTracking;
        self.current_value = None;
        self.cancel_trigger();
    }

    fn cancel_trigger(&mut self) {
        self.timers.cancel(&TimerKey::Trigger);
        self.trigger_seq = None;
    }

    fn complete_close(&mut self, slot: SlotIndex, value: LedgerValue, tx_set: TransactionSet) {
        self.deferred_close = None;
        let applied: HashSet<Hash256> = tx_set.transactions().iter().map(|tx| tx.hash()).collect();
        info!(
            slot,
            txs = tx_set.len(),
            value = %value,
            "closing ledger"
        );
        self.ledger.close_ledger(LedgerCloseData {
            ledger_seq: slot as u32,
            tx_set,
            value,
        });

        self.received.remove(&applied);
        let max_slots = self.config.max_slots_to_remember as SlotIndex;
        if slot > max_slots {
            self.purge_below = Some(slot - max_slots);
        }
        let dropped = self.received.rotate();
        if !dropped.is_empty() {
            debug!(slot, dropped = dropped.len(), "transactions aged out of staging");
        }
        for tx in self.received.generation(1) {
            self.overlay.broadcast_transaction(tx.envelope());
        }
        self.ledger_closed();
    }

    /// Bookkeeping after the ledger moved: forget old slots and arm the
    /// trigger for the next ledger so that ledgers close roughly one
    /// expected timespan apart.
    fn ledger_closed(&mut self) {
        let lcl = self.ledger.last_closed_ledger();
        let oldest = (lcl.seq as SlotIndex).saturating_sub(self.config.max_slots_to_remember as SlotIndex);
        let stopped = self.pending.erase_below(oldest);
        self.cancel_fetch_timers(stopped);

        if !self.is_validator() {
            return;
        }
        if !self.ledger.is_synced() {
            debug!(ledger = lcl.seq, "ledger not synced, not arming trigger");
            return;
        }
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.last_trigger);
        let delay = self.config.ledger_close_time.saturating_sub(elapsed);
        let seq = lcl.seq as u64 + 1;
        debug!(ledger = seq, ?delay, "arming trigger");
        self.trigger_seq = Some(seq);
        self.timers.schedule(TimerKey::Trigger, now, delay, None);
    }

    pub(crate) fn take_trigger(&mut self) -> Option<u64> {
        self.trigger_seq.take()
    }

    pub(crate) fn take_purge_request(&mut self) -> Option<SlotIndex> {
        self.purge_below.take()
    }

    /// Build our proposal for `ledger_seq`: `(slot, value, previous value)`.
    ///
    /// Returns `None` when not tracking, not synced, not a validator, or when
    /// `ledger_seq` has already been triggered.
    pub(crate) fn prepare_nomination(&mut self, ledger_seq: u64) -> Option<(SlotIndex, Value, Value)> {
        if !self.is_validator() {
            return None;
        }
        if !self.tracking.is_tracking() || !self.ledger.is_synced() {
            debug!(ledger = ledger_seq, "not triggering: out of sync");
            return None;
        }
        if self.last_triggered_seq.is_some_and(|last| ledger_seq <= last) {
            debug!(ledger = ledger_seq, "not triggering: already triggered");
            return None;
        }
        if self.tracking.next_index() != Some(ledger_seq) {
            debug!(
                ledger = ledger_seq,
                next = ?self.tracking.next_index(),
                "not triggering: not the slot in progress"
            );
            return None;
        }

        let lcl = self.ledger.last_closed_ledger();
        let mut proposed = TransactionSet::new(lcl.hash, self.received.candidates());
        let trimmed = proposed.trim_invalid(self.ledger.as_ref());
        if !trimmed.is_empty() {
            let hashes: HashSet<Hash256> = trimmed.iter().map(|tx| tx.hash()).collect();
            self.received.remove(&hashes);
        }
        proposed.surge_filter(self.config.max_tx_set_size);

        let close_time = current_timestamp().max(lcl.close_time() + 1);
        let proposal = LedgerValue::new(proposed.hash(), close_time, self.config.desired_base_fee);
        let (value, prev) = match (proposal.to_value(), lcl.value.to_value()) {
            (Ok(value), Ok(prev)) => (value, prev),
            (Err(err), _) | (_, Err(err)) => {
                error!(ledger = ledger_seq, %err, "cannot encode proposal");
                return None;
            }
        };
        info!(
            ledger = ledger_seq,
            txs = proposed.len(),
            value = %proposal,
            "triggering next ledger"
        );
        self.pending.add_tx_set(proposed);
        self.current_value = Some(value.clone());
        self.last_trigger = Instant::now();
        self.last_triggered_seq = Some(ledger_seq);
        Some((ledger_seq, value, prev))
    }

    // ---------------------------------------------------------------------
    // Timers owned by the herder
    // ---------------------------------------------------------------------

    /// Re-send the newest envelope we emitted for a slot not beyond the one
    /// in progress.
    pub(crate) fn rebroadcast(&mut self) {
        let limit = self
            .tracking
            .next_index()
            .unwrap_or(self.ledger.last_closed_ledger().seq as SlotIndex + 1);
        if let Some((slot, envelope)) = self.latest_envelopes.range(..=limit).next_back() {
            trace!(slot = *slot, "rebroadcasting latest envelope");
            self.overlay.broadcast_scp_message(envelope);
            self.metrics.envelope_emit.inc();
        }
        if !self.latest_envelopes.is_empty() {
            self.start_rebroadcast_timer();
        }
    }

    fn start_rebroadcast_timer(&mut self) {
        self.timers.schedule(
            TimerKey::Rebroadcast,
            Instant::now(),
            self.config.rebroadcast_interval,
            None,
        );
    }

    pub(crate) fn expire_ballot(&mut self, slot: SlotIndex, ballot: &ScpBallot, node: &NodeId) {
        self.metrics.ballot_expire.inc();
        debug!(
            slot,
            counter = ballot.counter,
            node = ?node,
            "provisional ballot expired"
        );
    }

    // ---------------------------------------------------------------------
    // Validation helpers
    // ---------------------------------------------------------------------

    fn base_fee_acceptable(&self, base_fee: u32) -> bool {
        let desired = self.config.desired_base_fee;
        base_fee >= desired / 2 && base_fee <= desired.saturating_mul(2)
    }

    fn check_value(&self, slot: SlotIndex, value: &Value) -> ValidationLevel {
        let proposal = match LedgerValue::from_value(value) {
            Ok(v) => v,
            Err(err) => {
                debug!(slot, %err, "value does not decode");
                return ValidationLevel::Invalid;
            }
        };

        let now = current_timestamp();
        if proposal.close_time > now + self.config.max_time_slip.as_secs() {
            debug!(slot, close_time = proposal.close_time, now, "close time too far in the future");
            return ValidationLevel::Invalid;
        }

        // close time to beat: the last externalized value while tracking,
        // else the last closed ledger when the slot follows it directly
        let last_close_time = match (self.tracking.next_index(), self.tracking.value()) {
            (Some(next), Some(last)) => {
                if slot < next {
                    // already decided; only the transaction set can still be missing
                    return if self.pending.get_tx_set(&proposal.tx_set_hash).is_some() {
                        ValidationLevel::FullyValidated
                    } else {
                        ValidationLevel::MaybeValid
                    };
                }
                if slot > next {
                    debug!(slot, next, "value for a future slot");
                    return ValidationLevel::Invalid;
                }
                last.close_time
            }
            _ if self.is_slot_compatible_with_current_state(slot) => {
                self.ledger.last_closed_ledger().close_time()
            }
            _ => return ValidationLevel::MaybeValid,
        };
        if proposal.close_time <= last_close_time {
            debug!(
                slot,
                close_time = proposal.close_time,
                last = last_close_time,
                "close time not after last close"
            );
            return ValidationLevel::Invalid;
        }
        if !self.base_fee_acceptable(proposal.base_fee) {
            debug!(slot, base_fee = proposal.base_fee, "unacceptable base fee");
            return ValidationLevel::Invalid;
        }
        if !self.is_slot_compatible_with_current_state(slot) {
            return ValidationLevel::MaybeValid;
        }

        let Some(tx_set) = self.pending.get_tx_set(&proposal.tx_set_hash) else {
            trace!(slot, tx_set = %proposal.tx_set_hash.short(), "tx set not known yet");
            return ValidationLevel::MaybeValid;
        };
        let lcl = self.ledger.last_closed_ledger();
        if tx_set.hash() == proposal.tx_set_hash && tx_set.check_valid(self.ledger.as_ref(), &lcl.hash) {
            ValidationLevel::FullyValidated
        } else {
            ValidationLevel::Invalid
        }
    }

    /// Largest ballot counter reachable within `budget_secs` of ballot
    /// timeouts.
    fn max_ballot_counter(&self, budget_secs: u64) -> u32 {
        let mut counter: u32 = 1;
        let mut spent: u64 = 0;
        loop {
            let timeout = self.compute_timeout(counter).as_secs().max(1);
            if spent + timeout > budget_secs || counter == u32::MAX {
                return counter;
            }
            spent += timeout;
            counter += 1;
        }
    }

    fn check_ballot(&mut self, slot: SlotIndex, node_id: &NodeId, ballot: &ScpBallot) -> bool {
        if self.node_id.as_ref() == Some(node_id) {
            return true;
        }
        if self.tracking.next_index() == Some(slot) {
            let elapsed = Instant::now()
                .saturating_duration_since(self.last_trigger)
                .as_secs();
            let max_counter = self.max_ballot_counter(elapsed + self.config.max_time_slip.as_secs());
            if ballot.counter > max_counter {
                debug!(slot, counter = ballot.counter, max_counter, "ballot counter too high");
                return false;
            }
        }
        if !quorum_set_contains(self.pending.local_quorum_set(), node_id) {
            let key = TimerKey::BallotValidation {
                slot,
                ballot: ballot.clone(),
                node: node_id.clone(),
            };
            if !self.timers.contains(&key) {
                trace!(slot, counter = ballot.counter, "provisionally accepting ballot");
                self.timers
                    .schedule(key, Instant::now(), self.config.max_time_slip, None);
            }
        }
        true
    }
}

fn is_ballot_statement(envelope: &ScpEnvelope) -> bool {
    !matches!(envelope.statement.pledges, ScpStatementPledges::Nominate(_))
}

impl SCPDriver for ScpDriver {
    fn validate_value(
        &mut self,
        slot_index: SlotIndex,
        _node_id: &NodeId,
        value: &Value,
    ) -> ValidationLevel {
        let level = self.check_value(slot_index, value);
        match level {
            ValidationLevel::FullyValidated => self.metrics.value_valid.inc(),
            ValidationLevel::Invalid => self.metrics.value_invalid.inc(),
            ValidationLevel::MaybeValid => {}
        }
        level
    }

    fn validate_ballot(&mut self, slot_index: SlotIndex, node_id: &NodeId, ballot: &ScpBallot) -> bool {
        let valid = self.check_ballot(slot_index, node_id, ballot);
        if valid {
            self.metrics.ballot_valid.inc();
        } else {
            self.metrics.ballot_invalid.inc();
        }
        valid
    }

    fn get_value_string(&self, value: &Value) -> String {
        match LedgerValue::from_value(value) {
            Ok(v) => v.to_string(),
            Err(_) => {
                let bytes = value.as_slice();
                format!("[undecodable {}]", hex::encode(&bytes[..8.min(bytes.len())]))
            }
        }
    }

    /// Union of the known candidate transaction sets built on the last
    /// closed ledger, the latest proposed close time, and the most common
    /// base fee (lowest on ties).
    fn combine_candidates(
        &mut self,
        slot_index: SlotIndex,
        candidates: &BTreeSet<Value>,
    ) -> Option<Value> {
        let decoded: Vec<LedgerValue> = candidates
            .iter()
            .filter_map(|v| LedgerValue::from_value(v).ok())
            .collect();
        if decoded.is_empty() {
            warn!(slot = slot_index, "no decodable candidates to combine");
            return None;
        }

        let lcl = self.ledger.last_closed_ledger();
        let close_time = decoded
            .iter()
            .map(|v| v.close_time)
            .max()
            .unwrap_or(0)
            .max(lcl.close_time() + 1);

        let mut fee_counts: BTreeMap<u32, usize> = BTreeMap::new();
        for v in &decoded {
            *fee_counts.entry(v.base_fee).or_default() += 1;
        }
        let base_fee = fee_counts
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0)))
            .map(|(fee, _)| *fee)
            .unwrap_or(self.config.desired_base_fee);

        let mut union: HashMap<Hash256, TransactionFrame> = HashMap::new();
        for v in &decoded {
            match self.pending.get_tx_set(&v.tx_set_hash) {
                Some(set) if set.previous_ledger_hash() == lcl.hash => {
                    for tx in set.transactions() {
                        union.entry(tx.hash()).or_insert_with(|| tx.clone());
                    }
                }
                Some(_) => trace!(slot = slot_index, "skipping stale candidate tx set"),
                None => trace!(slot = slot_index, "skipping unknown candidate tx set"),
            }
        }
        let mut combined = TransactionSet::new(lcl.hash, union.into_values().collect());
        combined.trim_invalid(self.ledger.as_ref());
        combined.surge_filter(self.config.max_tx_set_size);

        let result = LedgerValue::new(combined.hash(), close_time, base_fee);
        debug!(
            slot = slot_index,
            candidates = decoded.len(),
            txs = combined.len(),
            value = %result,
            "combined candidates"
        );
        self.pending.add_tx_set(combined);
        match result.to_value() {
            Ok(value) => Some(value),
            Err(err) => {
                error!(slot = slot_index, %err, "cannot encode combined value");
                None
            }
        }
    }

    fn nominating_value(&mut self, slot_index: SlotIndex, value: &Value) {
        self.metrics.nominating_value.inc();
        trace!(slot = slot_index, value = %self.get_value_string(value), "nominating");
    }

    fn updated_candidate_value(&mut self, slot_index: SlotIndex, value: &Value) {
        self.metrics.updated_candidate.inc();
        trace!(slot = slot_index, value = %self.get_value_string(value), "candidate updated");
    }

    fn started_ballot_protocol(&mut self, _slot_index: SlotIndex, _ballot: &ScpBallot) {
        self.metrics.start_ballot_protocol.inc();
    }

    fn accepted_ballot_prepared(&mut self, _slot_index: SlotIndex, _ballot: &ScpBallot) {
        self.metrics.accepted_ballot_prepared.inc();
    }

    fn confirmed_ballot_prepared(&mut self, _slot_index: SlotIndex, _ballot: &ScpBallot) {
        self.metrics.confirmed_ballot_prepared.inc();
    }

    fn accepted_commit(&mut self, _slot_index: SlotIndex, _ballot: &ScpBallot) {
        self.metrics.accepted_commit.inc();
    }

    fn ballot_did_hear_from_quorum(&mut self, slot_index: SlotIndex, ballot: &ScpBallot) {
        self.metrics.quorum_heard.inc();
        trace!(slot = slot_index, counter = ballot.counter, "heard from quorum");
        if self.tracking.is_tracking() {
            self.tracking_heartbeat();
        }
    }

    fn value_externalized(&mut self, slot_index: SlotIndex, value: &Value) {
        let externalized = match LedgerValue::from_value(value) {
            Ok(v) => v,
            Err(err) => {
                error!(slot = slot_index, %err, "externalized value does not decode");
                panic!(
                    "externalized value for slot {} does not decode: {}",
                    slot_index, err
                );
            }
        };

        let current = self.current_ledger_seq();
        if slot_index <= current {
            debug!(slot = slot_index, current, "ignoring externalization of old slot");
            return;
        }
        if let Some((deferred, _)) = self.deferred_close {
            info!(
                slot = slot_index,
                deferred,
                "holding externalization until the deferred close completes"
            );
            self.held_externalizations.insert(slot_index, value.clone());
            return;
        }
        self.metrics.value_externalize.inc();

        match self.tracking.last_index() {
            Some(last) if slot_index != last + 1 => {
                warn!(slot = slot_index, last, "externalized slot is not contiguous");
                self.metrics.discontinuity.inc();
            }
            Some(_) => {}
            None => info!(slot = slot_index, "tracking consensus"),
        }

        self.current_value = None;
        self.tracking = ConsensusTracking::tracking(slot_index, externalized);
        self.tracking_heartbeat();
        self.cancel_trigger();
        self.timers.cancel_slots_up_to(slot_index);
        self.latest_envelopes.retain(|slot, _| *slot >= slot_index);

        match self.pending.get_tx_set(&externalized.tx_set_hash).cloned() {
            Some(tx_set) => self.complete_close(slot_index, externalized, tx_set),
            None => {
                warn!(
                    slot = slot_index,
                    tx_set = %externalized.tx_set_hash.short(),
                    "externalized tx set not known, deferring ledger close"
                );
                self.deferred_close = Some((slot_index, externalized));
                if let Some(request) = self
                    .pending
                    .fetch_tx_set(externalized.tx_set_hash, slot_index)
                {
                    self.execute_fetch(request);
                }
            }
        }
    }

    fn setup_timer(
        &mut self,
        slot_index: SlotIndex,
        timer_id: TimerId,
        timeout: Duration,
        callback: Option<TimerCallback>,
    ) {
        let key = TimerKey::Scp {
            slot: slot_index,
            timer_id,
        };
        match callback {
            None => {
                self.timers.cancel(&key);
            }
            Some(_) if self.tracking.last_index().is_some_and(|last| slot_index <= last) => {
                trace!(slot = slot_index, timer_id, "ignoring timer for decided slot");
            }
            Some(callback) => {
                self.timers
                    .schedule(key, Instant::now(), timeout, Some(callback));
            }
        }
    }

    fn emit_envelope(&mut self, mut envelope: ScpEnvelope) {
        if !self.is_validator() {
            return;
        }
        let signature = match &self.config.secret_key {
            Some(secret) => sign_statement(secret, &self.config.network_id, &envelope.statement),
            None => return,
        };
        match signature {
            Ok(signature) => envelope.signature = signature,
            Err(err) => {
                warn!(%err, "failed to sign envelope");
                return;
            }
        }
        self.metrics.envelope_sign.inc();
        if is_ballot_statement(&envelope) {
            self.metrics.ballot_sign.inc();
        }

        let slot = envelope.statement.slot_index;
        trace!(slot, "emitting envelope");
        self.overlay.broadcast_scp_message(&envelope);
        self.metrics.envelope_emit.inc();
        self.latest_envelopes.insert(slot, envelope);
        self.start_rebroadcast_timer();
    }

    fn get_quorum_set(&self, hash: &Hash256) -> Option<ScpQuorumSet> {
        self.pending.get_quorum_set(hash).cloned()
    }
}
