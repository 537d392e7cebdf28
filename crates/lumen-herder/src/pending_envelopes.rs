//! Envelopes waiting on their dependencies.
//!
//! An SCP statement names a quorum set by hash and carries values that name a
//! transaction set by hash. The engine can only make sense of a statement
//! once both are known locally, so inbound envelopes are parked here until
//! every dependency has been fetched, then released in receipt order.
//!
//! ```text
//! recv_envelope ─┬─ all deps known ───────────────▶ ready ──pop──▶ engine
//!                └─ missing deps ─▶ fetching ──deps arrive──▶ ready
//! ```
//!
//! The store also owns the caches of fetched transaction sets and quorum
//! sets, and the [`ItemFetcher`]s that retrieve them. Everything here is
//! bounded: parked envelopes and both caches evict their oldest entry when
//! full, and once more envelopes are remembered than the store may hold the
//! lowest slot is forgotten whole.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use lumen_common::Hash256;
use lumen_scp::{hash_quorum_set, is_quorum_set_sane, SlotIndex};
use serde::Serialize;
use stellar_xdr::curr::{ScpEnvelope, ScpQuorumSet, ScpStatementPledges, Value};
use tracing::{debug, trace, warn};

use crate::callbacks::{ItemType, PeerId};
use crate::item_fetcher::{FetchRequest, ItemFetcher};
use crate::metrics::HerderMetrics;
use crate::tx_set::TransactionSet;
use crate::value::LedgerValue;

/// Outcome of handing an envelope to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RecvResult {
    /// All dependencies known; queued for the engine.
    Ready,
    /// Parked until dependencies arrive.
    Fetching,
    /// Seen before; ignored.
    AlreadyProcessed,
    /// Unusable (undecodable value, insane quorum set, out of range).
    Discarded,
}

/// Capacity settings for [`PendingEnvelopes`].
#[derive(Debug, Clone)]
pub struct PendingConfig {
    pub max_pending_envelopes: usize,
    pub tx_set_cache_size: usize,
    pub qset_cache_size: usize,
    pub fetch_reply_timeout: Duration,
}

/// Per-slot counts for introspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotSummary {
    pub slot: SlotIndex,
    pub ready: usize,
    pub fetching: usize,
    pub processed: usize,
    pub discarded: usize,
}

struct ParkedEnvelope {
    envelope: ScpEnvelope,
    arrival: u64,
    quorum_set: Hash256,
    tx_sets: Vec<Hash256>,
}

#[derive(Default)]
struct SlotEnvelopes {
    processed: HashSet<Hash256>,
    discarded: HashSet<Hash256>,
    fetching: HashMap<Hash256, ParkedEnvelope>,
    ready: VecDeque<ScpEnvelope>,
}

/// Insertion-ordered map that evicts its oldest entry when full.
struct BoundedCache<V> {
    entries: HashMap<Hash256, V>,
    order: VecDeque<Hash256>,
    capacity: usize,
}

impl<V> BoundedCache<V> {
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Insert and return the evicted key, if any.
    fn insert(&mut self, key: Hash256, value: V) -> Option<Hash256> {
        if self.entries.insert(key, value).is_some() {
            return None;
        }
        self.order.push_back(key);
        if self.entries.len() <= self.capacity {
            return None;
        }
        let oldest = self.order.pop_front()?;
        self.entries.remove(&oldest);
        Some(oldest)
    }

    fn get(&self, key: &Hash256) -> Option<&V> {
        self.entries.get(key)
    }

    fn contains(&self, key: &Hash256) -> bool {
        self.entries.contains_key(key)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

pub struct PendingEnvelopes {
    slots: BTreeMap<SlotIndex, SlotEnvelopes>,
    tx_sets: BoundedCache<TransactionSet>,
    quorum_sets: BoundedCache<ScpQuorumSet>,
    local_quorum_set_hash: Hash256,
    local_quorum_set: ScpQuorumSet,
    tx_set_fetcher: ItemFetcher,
    qset_fetcher: ItemFetcher,
    peers: Vec<PeerId>,
    max_pending: usize,
    parked: usize,
    next_arrival: u64,
    /// Fetches restarted for dependencies that fell out of a cache.
    refetches: Vec<FetchRequest>,
    metrics: Arc<HerderMetrics>,
}

impl PendingEnvelopes {
    pub fn new(
        config: PendingConfig,
        local_quorum_set: ScpQuorumSet,
        metrics: Arc<HerderMetrics>,
    ) -> Self {
        Self {
            slots: BTreeMap::new(),
            tx_sets: BoundedCache::new(config.tx_set_cache_size),
            quorum_sets: BoundedCache::new(config.qset_cache_size),
            local_quorum_set_hash: hash_quorum_set(&local_quorum_set),
            local_quorum_set,
            tx_set_fetcher: ItemFetcher::new(ItemType::TxSet, config.fetch_reply_timeout),
            qset_fetcher: ItemFetcher::new(ItemType::QuorumSet, config.fetch_reply_timeout),
            peers: Vec::new(),
            max_pending: config.max_pending_envelopes.max(1),
            parked: 0,
            next_arrival: 0,
            refetches: Vec::new(),
            metrics,
        }
    }

    pub fn set_available_peers(&mut self, peers: Vec<PeerId>) {
        self.peers = peers;
    }

    pub fn available_peers(&self) -> &[PeerId] {
        &self.peers
    }

    /// Whether `envelope` has been seen before.
    pub fn is_duplicate(&self, envelope: &ScpEnvelope) -> bool {
        let Some(state) = self.slots.get(&envelope.statement.slot_index) else {
            return false;
        };
        let hash = envelope_hash(envelope);
        state.processed.contains(&hash)
            || state.discarded.contains(&hash)
            || state.fetching.contains_key(&hash)
    }

    /// Accept an envelope, parking it if something it references is unknown.
    pub fn recv_envelope(&mut self, envelope: ScpEnvelope) -> (RecvResult, Vec<FetchRequest>) {
        if self.is_duplicate(&envelope) {
            return (RecvResult::AlreadyProcessed, Vec::new());
        }
        let slot = envelope.statement.slot_index;
        let hash = envelope_hash(&envelope);

        let Some(tx_sets) = tx_set_hashes(&envelope) else {
            debug!(slot, "discarding envelope with undecodable value");
            self.slots.entry(slot).or_default().discarded.insert(hash);
            self.enforce_slot_capacity();
            return (RecvResult::Discarded, Vec::new());
        };
        let quorum_set = quorum_set_hash(&envelope);

        let missing_qset = !self.has_quorum_set(&quorum_set);
        let missing_tx_sets: Vec<Hash256> = tx_sets
            .iter()
            .filter(|h| !self.tx_sets.contains(h))
            .copied()
            .collect();

        if !missing_qset && missing_tx_sets.is_empty() {
            let state = self.slots.entry(slot).or_default();
            state.processed.insert(hash);
            state.ready.push_back(envelope);
            trace!(slot, "envelope ready");
            self.enforce_slot_capacity();
            return (RecvResult::Ready, Vec::new());
        }

        let mut requests = Vec::new();
        if missing_qset {
            requests.extend(self.qset_fetcher.fetch(quorum_set, slot, &self.peers));
        }
        for tx_set in missing_tx_sets {
            requests.extend(self.tx_set_fetcher.fetch(tx_set, slot, &self.peers));
        }

        let arrival = self.next_arrival;
        self.next_arrival += 1;
        self.slots.entry(slot).or_default().fetching.insert(
            hash,
            ParkedEnvelope {
                envelope,
                arrival,
                quorum_set,
                tx_sets,
            },
        );
        self.parked += 1;
        trace!(slot, parked = self.parked, "envelope waiting on dependencies");
        self.enforce_capacity();
        self.enforce_slot_capacity();
        (RecvResult::Fetching, requests)
    }

    fn enforce_capacity(&mut self) {
        while self.parked > self.max_pending {
            let oldest = self
                .slots
                .iter()
                .flat_map(|(slot, state)| {
                    state
                        .fetching
                        .iter()
                        .map(move |(hash, parked)| (parked.arrival, *slot, *hash))
                })
                .min();
            let Some((_, slot, hash)) = oldest else {
                break;
            };
            if let Some(state) = self.slots.get_mut(&slot) {
                state.fetching.remove(&hash);
            }
            self.parked -= 1;
            self.metrics.envelope_evicted.inc();
            warn!(slot, envelope = %hash.short(), "evicted oldest parked envelope");
        }
    }

    /// Envelopes remembered across all slots: processed, discarded and
    /// parked.
    fn remembered(&self) -> usize {
        self.slots
            .values()
            .map(|s| s.processed.len() + s.discarded.len() + s.fetching.len())
            .sum()
    }

    /// Forget the lowest slot while more envelopes are remembered than
    /// `max_pending`. The highest slot is always kept.
    fn enforce_slot_capacity(&mut self) {
        while self.slots.len() > 1 && self.remembered() > self.max_pending {
            let Some((slot, state)) = self.slots.pop_first() else {
                break;
            };
            let forgotten = state.processed.len() + state.discarded.len() + state.fetching.len();
            self.parked -= state.fetching.len();
            self.metrics.envelope_evicted.add(forgotten as u64);
            warn!(
                slot,
                forgotten,
                ready = state.ready.len(),
                "store full, forgot lowest slot"
            );
        }
    }

    /// Take the fetches restarted since the last call.
    pub fn take_fetch_requests(&mut self) -> Vec<FetchRequest> {
        std::mem::take(&mut self.refetches)
    }

    /// Cache a transaction set unconditionally (our own proposals, combined
    /// candidates).
    pub fn add_tx_set(&mut self, tx_set: TransactionSet) {
        let hash = tx_set.hash();
        if let Some(evicted) = self.tx_sets.insert(hash, tx_set) {
            self.metrics.cache_evicted.inc();
            warn!(tx_set = %evicted.short(), "evicted oldest cached tx set");
        }
    }

    /// A peer sent a transaction set. Only sets we asked for and whose
    /// contents match `hash` are accepted.
    pub fn recv_tx_set(&mut self, hash: Hash256, tx_set: TransactionSet) -> bool {
        if !self.tx_set_fetcher.is_fetching(&hash) {
            trace!(tx_set = %hash.short(), "ignoring unsolicited tx set");
            return false;
        }
        if tx_set.hash() != hash {
            warn!(expected = %hash.short(), got = %tx_set.hash().short(), "tx set hash mismatch");
            return false;
        }
        self.tx_set_fetcher.stop(&hash);
        self.add_tx_set(tx_set);
        self.release_ready();
        true
    }

    /// A peer sent a quorum set. Sets that fail the sanity check are
    /// rejected and every envelope depending on them is discarded.
    pub fn recv_quorum_set(&mut self, hash: Hash256, quorum_set: ScpQuorumSet) -> bool {
        if !self.qset_fetcher.is_fetching(&hash) {
            trace!(qset = %hash.short(), "ignoring unsolicited quorum set");
            return false;
        }
        if hash_quorum_set(&quorum_set) != hash {
            warn!(qset = %hash.short(), "quorum set hash mismatch");
            return false;
        }
        self.qset_fetcher.stop(&hash);
        if let Err(reason) = is_quorum_set_sane(&quorum_set) {
            warn!(qset = %hash.short(), %reason, "rejecting insane quorum set");
            self.discard_waiting_on_qset(&hash);
            return false;
        }
        if let Some(evicted) = self.quorum_sets.insert(hash, quorum_set) {
            self.metrics.cache_evicted.inc();
            warn!(qset = %evicted.short(), "evicted oldest cached quorum set");
        }
        self.metrics.qset_retrieve.inc();
        self.release_ready();
        true
    }

    fn discard_waiting_on_qset(&mut self, qset: &Hash256) {
        for state in self.slots.values_mut() {
            let doomed: Vec<Hash256> = state
                .fetching
                .iter()
                .filter(|(_, p)| p.quorum_set == *qset)
                .map(|(h, _)| *h)
                .collect();
            for hash in doomed {
                state.fetching.remove(&hash);
                state.discarded.insert(hash);
                self.parked -= 1;
            }
        }
    }

    /// Move every parked envelope whose dependencies are now all known to
    /// the ready queue of its slot, in arrival order.
    fn release_ready(&mut self) {
        let tx_sets = &self.tx_sets;
        let quorum_sets = &self.quorum_sets;
        let local = self.local_quorum_set_hash;
        let mut released = 0;
        for (slot, state) in self.slots.iter_mut() {
            let mut now_ready: Vec<(u64, Hash256)> = state
                .fetching
                .iter()
                .filter(|(_, p)| {
                    (p.quorum_set == local || quorum_sets.contains(&p.quorum_set))
                        && p.tx_sets.iter().all(|h| tx_sets.contains(h))
                })
                .map(|(h, p)| (p.arrival, *h))
                .collect();
            now_ready.sort();
            for (_, hash) in now_ready {
                if let Some(parked) = state.fetching.remove(&hash) {
                    state.processed.insert(hash);
                    state.ready.push_back(parked.envelope);
                    released += 1;
                    trace!(slot = *slot, "envelope ready after dependencies arrived");
                }
            }
        }
        self.parked -= released;
        self.refetch_missing();
    }

    /// Restart fetches for dependencies of parked envelopes that are neither
    /// cached nor being fetched, which happens when a cache evicts an item
    /// before the rest of an envelope's dependencies arrive.
    fn refetch_missing(&mut self) {
        let mut missing: Vec<(ItemType, Hash256, SlotIndex)> = Vec::new();
        for (slot, state) in &self.slots {
            for parked in state.fetching.values() {
                if !self.has_quorum_set(&parked.quorum_set)
                    && !self.qset_fetcher.is_fetching(&parked.quorum_set)
                {
                    missing.push((ItemType::QuorumSet, parked.quorum_set, *slot));
                }
                for hash in &parked.tx_sets {
                    if !self.tx_sets.contains(hash) && !self.tx_set_fetcher.is_fetching(hash) {
                        missing.push((ItemType::TxSet, *hash, *slot));
                    }
                }
            }
        }
        for (item_type, hash, slot) in missing {
            let request = match item_type {
                ItemType::TxSet => self.tx_set_fetcher.fetch(hash, slot, &self.peers),
                ItemType::QuorumSet => self.qset_fetcher.fetch(hash, slot, &self.peers),
            };
            if let Some(request) = request {
                debug!(item = ?item_type, hash = %hash.short(), slot, "refetching evicted dependency");
                self.refetches.push(request);
            }
        }
    }

    /// Start fetching a transaction set nobody's envelope is waiting on.
    pub fn fetch_tx_set(&mut self, hash: Hash256, slot: SlotIndex) -> Option<FetchRequest> {
        if self.tx_sets.contains(&hash) {
            return None;
        }
        self.tx_set_fetcher.fetch(hash, slot, &self.peers)
    }

    /// `peer` does not have the item; try someone else.
    pub fn peer_doesnt_have(
        &mut self,
        item_type: ItemType,
        hash: &Hash256,
        peer: &PeerId,
    ) -> Option<FetchRequest> {
        let peers = &self.peers;
        match item_type {
            ItemType::TxSet => self.tx_set_fetcher.doesnt_have(hash, peer, peers),
            ItemType::QuorumSet => self.qset_fetcher.doesnt_have(hash, peer, peers),
        }
    }

    /// The retry timer of a fetch fired.
    pub fn fetch_retry(&mut self, item_type: ItemType, hash: &Hash256) -> Option<FetchRequest> {
        let peers = &self.peers;
        match item_type {
            ItemType::TxSet => self.tx_set_fetcher.retry(hash, peers),
            ItemType::QuorumSet => self.qset_fetcher.retry(hash, peers),
        }
    }

    /// Pop the next ready envelope from the lowest slot at or below
    /// `max_slot`.
    pub fn pop(&mut self, max_slot: SlotIndex) -> Option<ScpEnvelope> {
        self.slots
            .range_mut(..=max_slot)
            .find_map(|(_, state)| state.ready.pop_front())
    }

    /// Slots with envelopes ready for the engine, ascending.
    pub fn ready_slots(&self) -> Vec<SlotIndex> {
        self.slots
            .iter()
            .filter(|(_, s)| !s.ready.is_empty())
            .map(|(slot, _)| *slot)
            .collect()
    }

    /// Forget everything about slots below `slot` and stop fetches only they
    /// needed. Returns the stopped fetches.
    pub fn erase_below(&mut self, slot: SlotIndex) -> Vec<(ItemType, Hash256)> {
        let kept = self.slots.split_off(&slot);
        let erased = std::mem::replace(&mut self.slots, kept);
        let dropped: usize = erased.values().map(|s| s.fetching.len()).sum();
        self.parked -= dropped;
        if !erased.is_empty() {
            debug!(below = slot, slots = erased.len(), "erased old slots");
        }
        let mut stopped: Vec<(ItemType, Hash256)> = self
            .tx_set_fetcher
            .stop_below(slot)
            .into_iter()
            .map(|h| (ItemType::TxSet, h))
            .collect();
        stopped.extend(
            self.qset_fetcher
                .stop_below(slot)
                .into_iter()
                .map(|h| (ItemType::QuorumSet, h)),
        );
        stopped
    }

    pub fn get_tx_set(&self, hash: &Hash256) -> Option<&TransactionSet> {
        self.tx_sets.get(hash)
    }

    pub fn get_quorum_set(&self, hash: &Hash256) -> Option<&ScpQuorumSet> {
        if *hash == self.local_quorum_set_hash {
            return Some(&self.local_quorum_set);
        }
        self.quorum_sets.get(hash)
    }

    pub fn has_quorum_set(&self, hash: &Hash256) -> bool {
        self.get_quorum_set(hash).is_some()
    }

    pub fn is_fetching(&self, item_type: ItemType, hash: &Hash256) -> bool {
        match item_type {
            ItemType::TxSet => self.tx_set_fetcher.is_fetching(hash),
            ItemType::QuorumSet => self.qset_fetcher.is_fetching(hash),
        }
    }

    pub fn local_quorum_set(&self) -> &ScpQuorumSet {
        &self.local_quorum_set
    }

    pub fn local_quorum_set_hash(&self) -> Hash256 {
        self.local_quorum_set_hash
    }

    /// Envelopes parked waiting on dependencies.
    pub fn fetching_count(&self) -> usize {
        self.parked
    }

    /// Envelopes ready for the engine.
    pub fn ready_count(&self) -> usize {
        self.slots.values().map(|s| s.ready.len()).sum()
    }

    pub fn tx_set_fetch_count(&self) -> usize {
        self.tx_set_fetcher.len()
    }

    pub fn qset_fetch_count(&self) -> usize {
        self.qset_fetcher.len()
    }

    pub fn cached_tx_sets(&self) -> usize {
        self.tx_sets.len()
    }

    pub fn cached_quorum_sets(&self) -> usize {
        self.quorum_sets.len()
    }

    pub fn slot_summaries(&self) -> Vec<SlotSummary> {
        self.slots
            .iter()
            .map(|(slot, s)| SlotSummary {
                slot: *slot,
                ready: s.ready.len(),
                fetching: s.fetching.len(),
                processed: s.processed.len(),
                discarded: s.discarded.len(),
            })
            .collect()
    }
}

fn envelope_hash(envelope: &ScpEnvelope) -> Hash256 {
    Hash256::hash_xdr(envelope).unwrap_or(Hash256::ZERO)
}

/// Quorum set a statement is made under.
pub fn quorum_set_hash(envelope: &ScpEnvelope) -> Hash256 {
    let hash = match &envelope.statement.pledges {
        ScpStatementPledges::Nominate(nom) => &nom.quorum_set_hash,
        ScpStatementPledges::Prepare(prep) => &prep.quorum_set_hash,
        ScpStatementPledges::Confirm(conf) => &conf.quorum_set_hash,
        ScpStatementPledges::Externalize(ext) => &ext.commit_quorum_set_hash,
    };
    Hash256::from(hash)
}

/// Every value a statement carries.
pub fn statement_values(envelope: &ScpEnvelope) -> Vec<&Value> {
    match &envelope.statement.pledges {
        ScpStatementPledges::Nominate(nom) => {
            nom.votes.iter().chain(nom.accepted.iter()).collect()
        }
        ScpStatementPledges::Prepare(prep) => {
            let mut values = vec![&prep.ballot.value];
            values.extend(prep.prepared.as_ref().map(|b| &b.value));
            values.extend(prep.prepared_prime.as_ref().map(|b| &b.value));
            values
        }
        ScpStatementPledges::Confirm(conf) => vec![&conf.ballot.value],
        ScpStatementPledges::Externalize(ext) => vec![&ext.commit.value],
    }
}

/// Transaction sets referenced by a statement's values, deduplicated.
/// `None` if any value does not decode.
pub fn tx_set_hashes(envelope: &ScpEnvelope) -> Option<Vec<Hash256>> {
    let mut hashes = Vec::new();
    for value in statement_values(envelope) {
        let hash = LedgerValue::from_value(value).ok()?.tx_set_hash;
        if !hashes.contains(&hash) {
            hashes.push(hash);
        }
    }
    Some(hashes)
}
