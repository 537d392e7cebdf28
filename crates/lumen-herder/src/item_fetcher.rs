//! Fetching of transaction sets and quorum sets from peers.
//!
//! Each missing item gets a [`Tracker`] that asks one peer at a time. A
//! "don't have" answer or a reply timeout moves on to the next peer that has
//! not been asked yet. Once every peer has been tried the list is rebuilt
//! after a back-off that grows with the number of rebuilds.
//!
//! The fetcher performs no I/O and owns no clock. It returns
//! [`FetchAction`]s; the caller sends the request and arms the retry timer.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use lumen_common::Hash256;
use lumen_scp::SlotIndex;
use tracing::trace;

use crate::callbacks::{ItemType, PeerId};

/// Cap on the back-off multiplier.
pub const MAX_REBUILD_FETCH_LIST: u32 = 10;

/// What the caller should do next for one item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchAction {
    /// Send a request to `peer` and retry after `timeout`.
    Ask { peer: PeerId, timeout: Duration },
    /// Nobody left to ask; retry after `delay`.
    Wait { delay: Duration },
}

/// A [`FetchAction`] for a specific item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub item_type: ItemType,
    pub hash: Hash256,
    pub action: FetchAction,
}

/// Fetch state of a single item.
#[derive(Debug)]
pub struct Tracker {
    peers_asked: HashSet<PeerId>,
    last_asked_peer: Option<PeerId>,
    num_list_rebuild: u32,
    last_seen_slot: SlotIndex,
}

impl Tracker {
    fn new(slot: SlotIndex) -> Self {
        Self {
            peers_asked: HashSet::new(),
            last_asked_peer: None,
            num_list_rebuild: 0,
            last_seen_slot: slot,
        }
    }

    pub fn last_asked_peer(&self) -> Option<&PeerId> {
        self.last_asked_peer.as_ref()
    }

    pub fn last_seen_slot(&self) -> SlotIndex {
        self.last_seen_slot
    }

    fn try_next_peer(&mut self, peers: &[PeerId], reply_timeout: Duration) -> FetchAction {
        self.last_asked_peer = None;
        if let Some(peer) = peers.iter().find(|p| !self.peers_asked.contains(*p)) {
            self.peers_asked.insert(peer.clone());
            self.last_asked_peer = Some(peer.clone());
            return FetchAction::Ask {
                peer: peer.clone(),
                timeout: reply_timeout,
            };
        }
        self.num_list_rebuild += 1;
        self.peers_asked.clear();
        FetchAction::Wait {
            delay: reply_timeout * self.num_list_rebuild.min(MAX_REBUILD_FETCH_LIST),
        }
    }
}

/// All in-flight fetches of one item type.
#[derive(Debug)]
pub struct ItemFetcher {
    item_type: ItemType,
    reply_timeout: Duration,
    trackers: HashMap<Hash256, Tracker>,
}

impl ItemFetcher {
    pub fn new(item_type: ItemType, reply_timeout: Duration) -> Self {
        Self {
            item_type,
            reply_timeout,
            trackers: HashMap::new(),
        }
    }

    pub fn item_type(&self) -> ItemType {
        self.item_type
    }

    /// Start fetching `hash` on behalf of `slot`. Returns `None` when the item
    /// is already being fetched.
    pub fn fetch(&mut self, hash: Hash256, slot: SlotIndex, peers: &[PeerId]) -> Option<FetchRequest> {
        if let Some(tracker) = self.trackers.get_mut(&hash) {
            tracker.last_seen_slot = tracker.last_seen_slot.max(slot);
            return None;
        }
        trace!(item = ?self.item_type, hash = %hash.short(), slot, "start fetch");
        let mut tracker = Tracker::new(slot);
        let action = tracker.try_next_peer(peers, self.reply_timeout);
        self.trackers.insert(hash, tracker);
        Some(self.request(hash, action))
    }

    /// The retry timer for `hash` fired.
    pub fn retry(&mut self, hash: &Hash256, peers: &[PeerId]) -> Option<FetchRequest> {
        let tracker = self.trackers.get_mut(hash)?;
        let action = tracker.try_next_peer(peers, self.reply_timeout);
        Some(self.request(*hash, action))
    }

    /// `peer` answered that it does not have `hash`. Only an answer from the
    /// peer we are currently waiting on moves the fetch along.
    pub fn doesnt_have(
        &mut self,
        hash: &Hash256,
        peer: &PeerId,
        peers: &[PeerId],
    ) -> Option<FetchRequest> {
        let tracker = self.trackers.get_mut(hash)?;
        if tracker.last_asked_peer.as_ref() != Some(peer) {
            return None;
        }
        trace!(item = ?self.item_type, hash = %hash.short(), %peer, "peer does not have item");
        let action = tracker.try_next_peer(peers, self.reply_timeout);
        Some(self.request(*hash, action))
    }

    /// Stop fetching `hash`. Returns whether it was being fetched.
    pub fn stop(&mut self, hash: &Hash256) -> bool {
        self.trackers.remove(hash).is_some()
    }

    /// Stop every fetch whose newest interested slot is below `slot`.
    pub fn stop_below(&mut self, slot: SlotIndex) -> Vec<Hash256> {
        let stale: Vec<Hash256> = self
            .trackers
            .iter()
            .filter(|(_, t)| t.last_seen_slot < slot)
            .map(|(h, _)| *h)
            .collect();
        for hash in &stale {
            self.trackers.remove(hash);
        }
        stale
    }

    pub fn is_fetching(&self, hash: &Hash256) -> bool {
        self.trackers.contains_key(hash)
    }

    pub fn tracker(&self, hash: &Hash256) -> Option<&Tracker> {
        self.trackers.get(hash)
    }

    pub fn len(&self) -> usize {
        self.trackers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trackers.is_empty()
    }

    fn request(&self, hash: Hash256, action: FetchAction) -> FetchRequest {
        FetchRequest {
            item_type: self.item_type,
            hash,
            action,
        }
    }
}
