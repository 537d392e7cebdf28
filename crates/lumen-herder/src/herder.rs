//! The herder: glue between the agreement engine, the overlay and the ledger.
//!
//! [`Herder`] owns the engine and the [`ScpDriver`] side by side. Every entry
//! point runs to completion on the caller's thread; the engine is only ever
//! called from here, never from inside a driver callback. Follow-up work a
//! callback requests (purging old slots, releasing envelopes that became
//! ready) is applied after the engine call returns.

use std::sync::Arc;
use std::time::Duration;

use lumen_common::config::{HerderSettings, QuorumSetConfig};
use lumen_common::{Config, Hash256, NetworkId};
use lumen_crypto::{PublicKey, SecretKey};
use lumen_scp::{
    is_quorum_set_sane, simple_quorum_set, ScpEngine, SlotIndex,
};
use stellar_xdr::curr::{AccountId, NodeId, ScpEnvelope, ScpQuorumSet, TransactionEnvelope};
use tokio::time::Instant;
use tracing::{debug, info, trace};

use crate::callbacks::{ItemType, LedgerCallback, OverlayCallback, PeerId};
use crate::error::HerderError;
use crate::json_api::HerderJsonInfo;
use crate::metrics::HerderMetrics;
use crate::pending_envelopes::RecvResult;
use crate::scp_driver::{ScpDriver, TxStatus};
use crate::state::{ConsensusTracking, HerderState};
use crate::timer_registry::{FiredTimer, TimerKey, TimerKind};
use crate::tx_set::TransactionSet;
use crate::Result;

/// Herder configuration resolved from the node configuration.
#[derive(Debug, Clone)]
pub struct HerderConfig {
    pub network_id: NetworkId,
    /// Emit statements. Requires `secret_key`.
    pub is_validator: bool,
    pub secret_key: Option<SecretKey>,
    pub quorum_set: ScpQuorumSet,
    pub ledger_close_time: Duration,
    pub consensus_stuck_timeout: Duration,
    pub rebroadcast_interval: Duration,
    pub max_time_slip: Duration,
    pub desired_base_fee: u32,
    pub max_tx_set_size: usize,
    pub max_pending_envelopes: usize,
    pub max_slots_to_remember: u32,
    pub ledger_validity_bracket: u32,
    pub fetch_reply_timeout: Duration,
    pub tx_set_cache_size: usize,
    pub qset_cache_size: usize,
}

impl HerderConfig {
    /// Configuration with default timings. The node validates iff it has a
    /// key.
    pub fn new(
        network_id: NetworkId,
        secret_key: Option<SecretKey>,
        quorum_set: ScpQuorumSet,
    ) -> Self {
        let defaults = HerderSettings::default();
        Self {
            network_id,
            is_validator: secret_key.is_some(),
            secret_key,
            quorum_set,
            ledger_close_time: Duration::ZERO,
            consensus_stuck_timeout: Duration::ZERO,
            rebroadcast_interval: Duration::ZERO,
            max_time_slip: Duration::ZERO,
            desired_base_fee: 0,
            max_tx_set_size: 0,
            max_pending_envelopes: 0,
            max_slots_to_remember: 0,
            ledger_validity_bracket: 0,
            fetch_reply_timeout: Duration::ZERO,
            tx_set_cache_size: 0,
            qset_cache_size: 0,
        }
        .with_settings(&defaults)
    }

    /// Resolve keys and the quorum set from `config`.
    ///
    /// A validator with an empty quorum set trusts only itself.
    pub fn from_config(config: &Config) -> Result<Self> {
        let network_id = NetworkId::from_passphrase(&config.network.passphrase);
        let secret_key = config
            .node
            .seed
            .as_deref()
            .map(SecretKey::from_strkey)
            .transpose()?;

        let mut quorum_set = quorum_set_from_config(&config.node.quorum_set)?;
        if quorum_set.validators.is_empty() && quorum_set.inner_sets.is_empty() {
            if let (true, Some(secret)) = (config.node.is_validator, &secret_key) {
                debug!("no quorum set configured, trusting only ourselves");
                quorum_set = simple_quorum_set(1, vec![secret.public_key().to_node_id()]);
            }
        }
        is_quorum_set_sane(&quorum_set)
            .map_err(|reason| HerderError::Config(format!("local quorum set: {}", reason)))?;

        let mut herder_config = Self::new(network_id, secret_key, quorum_set);
        herder_config.is_validator = config.node.is_validator;
        Ok(herder_config.with_settings(&config.herder))
    }

    /// Apply the timing and capacity knobs from `settings`.
    pub fn with_settings(mut self, settings: &HerderSettings) -> Self {
        self.ledger_close_time = Duration::from_secs(settings.ledger_close_time_secs);
        self.consensus_stuck_timeout = Duration::from_secs(settings.consensus_stuck_timeout_secs);
        self.rebroadcast_interval = Duration::from_millis(settings.rebroadcast_interval_ms);
        self.max_time_slip = Duration::from_secs(settings.max_time_slip_secs);
        self.desired_base_fee = settings.desired_base_fee;
        self.max_tx_set_size = settings.max_tx_set_size;
        self.max_pending_envelopes = settings.max_pending_envelopes;
        self.max_slots_to_remember = settings.max_slots_to_remember;
        self.ledger_validity_bracket = settings.ledger_validity_bracket;
        self.fetch_reply_timeout = Duration::from_millis(settings.fetch_reply_timeout_ms);
        self.tx_set_cache_size = settings.tx_set_cache_size;
        self.qset_cache_size = settings.qset_cache_size;
        self
    }

    /// Our node id, when we have a key.
    pub fn node_id(&self) -> Option<NodeId> {
        self.secret_key
            .as_ref()
            .map(|secret| secret.public_key().to_node_id())
    }
}

fn quorum_set_from_config(config: &QuorumSetConfig) -> Result<ScpQuorumSet> {
    let validators = config
        .validators
        .iter()
        .map(|strkey| PublicKey::from_strkey(strkey).map(|key| key.to_node_id()))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    let inner_sets = config
        .inner_sets
        .iter()
        .map(quorum_set_from_config)
        .collect::<Result<Vec<_>>>()?;
    Ok(ScpQuorumSet {
        threshold: config.threshold,
        validators: validators.try_into()?,
        inner_sets: inner_sets.try_into()?,
    })
}

/// Consensus driver for one node.
pub struct Herder<E: ScpEngine> {
    engine: E,
    driver: ScpDriver,
}

impl<E: ScpEngine> Herder<E> {
    pub fn new(
        config: HerderConfig,
        engine: E,
        ledger: Box<dyn LedgerCallback>,
        overlay: Box<dyn OverlayCallback>,
    ) -> Self {
        Self::with_metrics(config, engine, ledger, overlay, Arc::new(HerderMetrics::new()))
    }

    /// Like [`Herder::new`], reporting into a shared metrics registry.
    pub fn with_metrics(
        config: HerderConfig,
        engine: E,
        ledger: Box<dyn LedgerCallback>,
        overlay: Box<dyn OverlayCallback>,
        metrics: Arc<HerderMetrics>,
    ) -> Self {
        info!(
            validator = config.is_validator,
            quorum_threshold = config.quorum_set.threshold,
            "creating herder"
        );
        Self {
            engine,
            driver: ScpDriver::new(config, ledger, overlay, metrics),
        }
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    pub fn driver(&self) -> &ScpDriver {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut ScpDriver {
        &mut self.driver
    }

    pub fn state(&self) -> HerderState {
        self.driver.state()
    }

    pub fn tracking(&self) -> &ConsensusTracking {
        self.driver.tracking()
    }

    pub fn metrics(&self) -> &Arc<HerderMetrics> {
        self.driver.metrics()
    }

    /// Start tracking at the last closed ledger. Used when this node starts
    /// a network or restarts with an up-to-date ledger.
    pub fn bootstrap(&mut self) {
        self.driver.bootstrap();
        self.process_scp_queue();
        self.update_scp_counters();
    }

    /// Entry point for envelopes from the overlay.
    pub fn recv_scp_envelope(&mut self, envelope: ScpEnvelope) -> RecvResult {
        let result = self.driver.recv_scp_envelope(envelope);
        if result == RecvResult::Ready {
            self.process_scp_queue();
        }
        self.update_scp_counters();
        result
    }

    pub fn recv_scp_quorum_set(&mut self, hash: Hash256, quorum_set: ScpQuorumSet) -> bool {
        let accepted = self.driver.recv_scp_quorum_set(hash, quorum_set);
        if accepted {
            self.process_scp_queue();
        }
        self.update_scp_counters();
        accepted
    }

    pub fn recv_tx_set(&mut self, hash: Hash256, tx_set: TransactionSet) -> bool {
        let accepted = self.driver.recv_tx_set(hash, tx_set);
        if accepted {
            self.after_engine_call();
            self.process_scp_queue();
        }
        accepted
    }

    pub fn peer_doesnt_have(&mut self, item_type: ItemType, hash: Hash256, peer: &PeerId) {
        self.driver.peer_doesnt_have(item_type, hash, peer);
    }

    pub fn set_available_peers(&mut self, peers: Vec<PeerId>) {
        self.driver.set_available_peers(peers);
    }

    pub fn recv_transaction(&mut self, tx: TransactionEnvelope) -> TxStatus {
        self.driver.recv_transaction(tx)
    }

    pub fn recv_transactions(&mut self, tx_set: &TransactionSet) -> Vec<TxStatus> {
        self.driver.recv_transactions(tx_set)
    }

    pub fn get_max_seq_in_pending_txs(&self, account: &AccountId) -> Option<i64> {
        self.driver.get_max_seq_in_pending_txs(account)
    }

    /// Cached or locally built transaction set, for answering peers.
    pub fn get_tx_set(&self, hash: &Hash256) -> Option<TransactionSet> {
        self.driver.pending().get_tx_set(hash).cloned()
    }

    /// Cached or local quorum set, for answering peers.
    pub fn get_quorum_set(&self, hash: &Hash256) -> Option<ScpQuorumSet> {
        self.driver.pending().get_quorum_set(hash).cloned()
    }

    pub fn is_slot_compatible_with_current_state(&self, slot: SlotIndex) -> bool {
        self.driver.is_slot_compatible_with_current_state(slot)
    }

    /// Propose a value for `ledger_seq` and start nominating it.
    pub fn trigger_next_ledger(&mut self, ledger_seq: u64) {
        let Some((slot, value, prev)) = self.driver.prepare_nomination(ledger_seq) else {
            return;
        };
        if !self.engine.nominate(&mut self.driver, slot, value, &prev) {
            debug!(slot, "nomination left engine state unchanged");
        }
        self.after_engine_call();
    }

    /// Feed every envelope that is ready into the engine, lowest slot first.
    pub fn process_scp_queue(&mut self) -> usize {
        let mut processed = 0;
        while let Some(envelope) = self.driver.next_ready_envelope() {
            let slot = envelope.statement.slot_index;
            let state = self.engine.receive_envelope(&mut self.driver, envelope);
            trace!(slot, ?state, "envelope processed");
            self.after_engine_call();
            processed += 1;
        }
        processed
    }

    pub fn next_timer_deadline(&self) -> Option<Instant> {
        self.driver.timers().next_deadline()
    }

    /// Fire every timer due at `now`, earliest first. A timer cancelled by
    /// one fired earlier in the same call does not run.
    pub fn fire_timers(&mut self, now: Instant) -> usize {
        let mut fired = 0;
        while let Some(timer) = self.driver.timers_mut().pop_expired(now) {
            fired += 1;
            self.dispatch_timer(timer);
        }
        if fired > 0 {
            self.update_scp_counters();
        }
        fired
    }

    fn dispatch_timer(&mut self, timer: FiredTimer) {
        trace!(key = ?timer.key, "timer fired");
        match timer.key {
            TimerKey::Scp { .. } => {
                if let Some(callback) = timer.callback {
                    callback(&mut self.engine, &mut self.driver);
                    self.after_engine_call();
                }
            }
            TimerKey::BallotValidation { slot, ballot, node } => {
                self.driver.expire_ballot(slot, &ballot, &node);
            }
            TimerKey::Trigger => {
                if let Some(ledger_seq) = self.driver.take_trigger() {
                    self.trigger_next_ledger(ledger_seq);
                }
            }
            TimerKey::TrackingHeartbeat => {
                self.driver.herder_out_of_sync();
                self.process_scp_queue();
            }
            TimerKey::Rebroadcast => self.driver.rebroadcast(),
            TimerKey::FetchRetry { item_type, hash } => self.driver.fetch_retry(item_type, hash),
        }
    }

    fn after_engine_call(&mut self) {
        if let Some(below) = self.driver.take_purge_request() {
            debug!(below, "purging old slots");
            self.engine.purge_slots(below);
        }
        self.update_scp_counters();
    }

    /// Refresh the gauges that mirror engine and store sizes.
    pub fn update_scp_counters(&self) {
        let metrics = self.driver.metrics();
        let pending = self.driver.pending();
        metrics.qset_fetches.set(pending.qset_fetch_count() as u64);
        metrics
            .ballot_validation_timers
            .set(self.driver.timers().count(TimerKind::BallotValidation) as u64);
        metrics.known_slots.set(self.engine.known_slot_count() as u64);
        metrics
            .cumulative_statements
            .set(self.engine.cumulative_statement_count() as u64);
        metrics
            .cached_quorum_sets
            .set(pending.cached_quorum_sets() as u64);
    }

    pub fn dump_info(&self) -> HerderJsonInfo {
        HerderJsonInfo::collect(&self.driver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumen_common::config::NodeConfig;

    fn seed(n: u8) -> SecretKey {
        SecretKey::from_seed(&[n; 32])
    }

    #[test]
    fn test_new_uses_default_settings() {
        let key = seed(1);
        let qset = simple_quorum_set(1, vec![key.public_key().to_node_id()]);
        let config = HerderConfig::new(NetworkId::from_passphrase("unit"), Some(key), qset);
        assert!(config.is_validator);
        assert_eq!(config.ledger_close_time, Duration::from_secs(5));
        assert_eq!(config.consensus_stuck_timeout, Duration::from_secs(35));
        assert_eq!(config.rebroadcast_interval, Duration::from_secs(2));
        assert_eq!(config.max_slots_to_remember, 12);
        assert_eq!(config.node_id(), Some(seed(1).public_key().to_node_id()));
    }

    #[test]
    fn test_from_config_parses_nested_quorum_set() {
        let mut config = Config::default();
        config.node = NodeConfig {
            seed: Some(seed(1).to_strkey()),
            is_validator: true,
            quorum_set: QuorumSetConfig {
                threshold: 2,
                validators: vec![seed(1).public_key().to_strkey()],
                inner_sets: vec![QuorumSetConfig {
                    threshold: 1,
                    validators: vec![
                        seed(2).public_key().to_strkey(),
                        seed(3).public_key().to_strkey(),
                    ],
                    inner_sets: vec![],
                }],
            },
        };
        config.herder.ledger_close_time_secs = 1;

        let herder_config = HerderConfig::from_config(&config).unwrap();
        assert!(herder_config.is_validator);
        assert_eq!(herder_config.quorum_set.threshold, 2);
        assert_eq!(herder_config.quorum_set.inner_sets.len(), 1);
        assert_eq!(herder_config.quorum_set.inner_sets[0].validators.len(), 2);
        assert_eq!(herder_config.ledger_close_time, Duration::from_secs(1));
    }

    #[test]
    fn test_validator_without_quorum_set_trusts_itself() {
        let mut config = Config::default();
        config.node.seed = Some(seed(4).to_strkey());
        config.node.is_validator = true;

        let herder_config = HerderConfig::from_config(&config).unwrap();
        assert_eq!(herder_config.quorum_set.threshold, 1);
        assert_eq!(
            herder_config.quorum_set.validators.to_vec(),
            vec![seed(4).public_key().to_node_id()]
        );
    }

    #[test]
    fn test_insane_quorum_set_rejected() {
        let mut config = Config::default();
        config.node.quorum_set = QuorumSetConfig {
            threshold: 3,
            validators: vec![seed(1).public_key().to_strkey()],
            inner_sets: vec![],
        };
        assert!(matches!(
            HerderConfig::from_config(&config),
            Err(HerderError::Config(_))
        ));
    }

    #[test]
    fn test_bad_strkey_rejected() {
        let mut config = Config::default();
        config.node.quorum_set = QuorumSetConfig {
            threshold: 1,
            validators: vec!["not-a-key".to_string()],
            inner_sets: vec![],
        };
        assert!(matches!(
            HerderConfig::from_config(&config),
            Err(HerderError::Crypto(_))
        ));
    }
}
