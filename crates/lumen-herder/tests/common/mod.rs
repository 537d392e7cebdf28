//! Shared fixtures: a scripted engine and recording ledger/overlay doubles.

#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use lumen_common::config::HerderSettings;
use lumen_common::time::current_timestamp;
use lumen_common::{Hash256, NetworkId};
use lumen_crypto::{sign_statement, SecretKey};
use lumen_herder::{
    AccountState, Herder, HerderConfig, ItemType, LastClosedLedger, LedgerCallback,
    LedgerCloseData, LedgerValue, OverlayCallback, PeerId, TransactionFrame, TransactionSet,
};
use lumen_scp::{
    hash_quorum_set, simple_quorum_set, EnvelopeState, SCPDriver, ScpEngine, SlotIndex, TimerId,
};
use parking_lot::Mutex;
use stellar_xdr::curr::{
    AccountId, CreateAccountOp, Hash, Memo, MuxedAccount, NodeId, Operation, OperationBody,
    Preconditions, PublicKey, ScpBallot, ScpEnvelope, ScpNomination, ScpQuorumSet, ScpStatement,
    ScpStatementExternalize, ScpStatementPledges, ScpStatementPrepare, SequenceNumber,
    Transaction, TransactionEnvelope, TransactionExt, TransactionV1Envelope, Uint256, Value,
};

pub const PASSPHRASE: &str = "Lumen Test Network";

pub fn network() -> NetworkId {
    NetworkId::from_passphrase(PASSPHRASE)
}

pub fn key(seed: u8) -> SecretKey {
    SecretKey::from_seed(&[seed; 32])
}

pub fn node(seed: u8) -> NodeId {
    key(seed).public_key().to_node_id()
}

/// Quorum set of the nodes with the given key seeds.
pub fn quorum_set(threshold: u32, seeds: &[u8]) -> ScpQuorumSet {
    simple_quorum_set(threshold, seeds.iter().map(|s| node(*s)).collect())
}

pub fn ledger_hash(seq: u32) -> Hash256 {
    Hash256::hash(&seq.to_be_bytes())
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Engine double. Externalize statements externalize immediately; nothing
/// else changes engine state.
#[derive(Default)]
pub struct MockEngine {
    pub received: Vec<ScpEnvelope>,
    pub nominations: Vec<(SlotIndex, Value, Value)>,
    pub purged: Vec<SlotIndex>,
    pub timers_expired: Vec<(SlotIndex, TimerId)>,
    /// When set, `nominate` emits a nomination statement as this node.
    pub local: Option<(NodeId, Hash256)>,
}

impl MockEngine {
    pub fn emitting(node_id: NodeId, quorum_set: &ScpQuorumSet) -> Self {
        Self {
            local: Some((node_id, hash_quorum_set(quorum_set))),
            ..Self::default()
        }
    }

    pub fn received_slots(&self) -> Vec<SlotIndex> {
        self.received
            .iter()
            .map(|e| e.statement.slot_index)
            .collect()
    }
}

impl ScpEngine for MockEngine {
    fn receive_envelope(&mut self, driver: &mut dyn SCPDriver, envelope: ScpEnvelope) -> EnvelopeState {
        let slot = envelope.statement.slot_index;
        if let ScpStatementPledges::Externalize(ext) = &envelope.statement.pledges {
            driver.value_externalized(slot, &ext.commit.value);
        }
        self.received.push(envelope);
        EnvelopeState::ValidNew
    }

    fn nominate(
        &mut self,
        driver: &mut dyn SCPDriver,
        slot_index: SlotIndex,
        value: Value,
        prev_value: &Value,
    ) -> bool {
        if let Some((node_id, qset_hash)) = &self.local {
            let statement = nominate_statement(node_id.clone(), slot_index, *qset_hash, vec![value.clone()]);
            driver.emit_envelope(ScpEnvelope {
                statement,
                signature: Default::default(),
            });
        }
        self.nominations.push((slot_index, value, prev_value.clone()));
        true
    }

    fn timer_expired(&mut self, _driver: &mut dyn SCPDriver, slot_index: SlotIndex, timer_id: TimerId) {
        self.timers_expired.push((slot_index, timer_id));
    }

    fn purge_slots(&mut self, max_slot_index: SlotIndex) {
        self.purged.push(max_slot_index);
    }

    fn known_slot_count(&self) -> usize {
        self.received_slots().into_iter().collect::<BTreeSet<_>>().len()
    }

    fn cumulative_statement_count(&self) -> usize {
        self.received.len()
    }
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

pub struct LedgerState {
    pub lcl: LastClosedLedger,
    pub accounts: HashMap<AccountId, AccountState>,
    pub closes: Vec<LedgerCloseData>,
    pub synced: bool,
}

/// Ledger double; clones share state so tests can inspect it after handing
/// one to the herder.
#[derive(Clone)]
pub struct MockLedger(pub Arc<Mutex<LedgerState>>);

impl MockLedger {
    /// Ledger at `seq` that closed 100 seconds ago.
    pub fn new(seq: u32) -> Self {
        let value = LedgerValue::new(Hash256::ZERO, current_timestamp() - 100, 100);
        Self(Arc::new(Mutex::new(LedgerState {
            lcl: LastClosedLedger {
                seq,
                hash: ledger_hash(seq),
                value,
            },
            accounts: HashMap::new(),
            closes: Vec::new(),
            synced: true,
        })))
    }

    pub fn set_account(&self, seed: u8, seq_num: i64, balance: i64) {
        self.0
            .lock()
            .accounts
            .insert(account(seed), AccountState { seq_num, balance });
    }

    pub fn set_synced(&self, synced: bool) {
        self.0.lock().synced = synced;
    }

    pub fn lcl(&self) -> LastClosedLedger {
        self.0.lock().lcl
    }

    pub fn closed_seqs(&self) -> Vec<u32> {
        self.0.lock().closes.iter().map(|c| c.ledger_seq).collect()
    }

    pub fn close_count(&self) -> usize {
        self.0.lock().closes.len()
    }
}

impl LedgerCallback for MockLedger {
    fn last_closed_ledger(&self) -> LastClosedLedger {
        self.0.lock().lcl
    }

    fn load_account(&self, account: &AccountId) -> Option<AccountState> {
        self.0.lock().accounts.get(account).copied()
    }

    fn close_ledger(&mut self, data: LedgerCloseData) {
        let mut state = self.0.lock();
        state.lcl = LastClosedLedger {
            seq: data.ledger_seq,
            hash: ledger_hash(data.ledger_seq),
            value: data.value,
        };
        for tx in data.tx_set.transactions() {
            if let Some(acct) = state.accounts.get_mut(tx.source()) {
                acct.seq_num = tx.seq_num();
                acct.balance -= tx.fee() as i64;
            }
        }
        state.closes.push(data);
    }

    fn is_synced(&self) -> bool {
        self.0.lock().synced
    }
}

// ---------------------------------------------------------------------------
// Overlay
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct OverlayLog {
    pub asks: Vec<(PeerId, ItemType, Hash256)>,
    pub scp: Vec<ScpEnvelope>,
    pub txs: Vec<TransactionEnvelope>,
}

#[derive(Clone, Default)]
pub struct MockOverlay(pub Arc<Mutex<OverlayLog>>);

impl MockOverlay {
    pub fn asks(&self) -> Vec<(PeerId, ItemType, Hash256)> {
        self.0.lock().asks.clone()
    }

    pub fn scp_count(&self) -> usize {
        self.0.lock().scp.len()
    }

    pub fn last_scp(&self) -> Option<ScpEnvelope> {
        self.0.lock().scp.last().cloned()
    }

    pub fn tx_count(&self) -> usize {
        self.0.lock().txs.len()
    }

    pub fn clear(&self) {
        let mut log = self.0.lock();
        log.asks.clear();
        log.scp.clear();
        log.txs.clear();
    }
}

impl OverlayCallback for MockOverlay {
    fn ask_peer(&mut self, peer: &PeerId, item_type: ItemType, hash: &Hash256) {
        self.0.lock().asks.push((peer.clone(), item_type, *hash));
    }

    fn broadcast_scp_message(&mut self, envelope: &ScpEnvelope) {
        self.0.lock().scp.push(envelope.clone());
    }

    fn broadcast_transaction(&mut self, tx: &TransactionEnvelope) {
        self.0.lock().txs.push(tx.clone());
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

/// Local node is seed 1; the quorum is seeds 1..=3 with threshold 2.
pub struct Harness {
    pub herder: Herder<MockEngine>,
    pub ledger: MockLedger,
    pub overlay: MockOverlay,
}

pub fn settings() -> HerderSettings {
    HerderSettings {
        ledger_close_time_secs: 5,
        consensus_stuck_timeout_secs: 35,
        rebroadcast_interval_ms: 2000,
        max_pending_envelopes: 100,
        max_slots_to_remember: 4,
        ledger_validity_bracket: 10,
        ..HerderSettings::default()
    }
}

pub fn herder_config(validator: bool) -> HerderConfig {
    let secret = validator.then(|| key(1));
    HerderConfig::new(network(), secret, quorum_set(2, &[1, 2, 3])).with_settings(&settings())
}

impl Harness {
    pub fn new(validator: bool, lcl_seq: u32) -> Self {
        let config = herder_config(validator);
        let engine = if validator {
            MockEngine::emitting(node(1), &config.quorum_set)
        } else {
            MockEngine::default()
        };
        Self::with_engine(config, engine, lcl_seq)
    }

    pub fn with_engine(config: HerderConfig, engine: MockEngine, lcl_seq: u32) -> Self {
        let ledger = MockLedger::new(lcl_seq);
        let overlay = MockOverlay::default();
        let mut herder = Herder::new(
            config,
            engine,
            Box::new(ledger.clone()),
            Box::new(overlay.clone()),
        );
        herder.set_available_peers(vec![PeerId::new("peer-a"), PeerId::new("peer-b")]);
        Self {
            herder,
            ledger,
            overlay,
        }
    }

    pub fn local_qset_hash(&self) -> Hash256 {
        hash_quorum_set(&quorum_set(2, &[1, 2, 3]))
    }

    /// Value for the ledger after the current last closed ledger, with an
    /// empty transaction set.
    pub fn next_value(&self, close_offset: u64) -> (LedgerValue, TransactionSet) {
        let lcl = self.ledger.lcl();
        let tx_set = TransactionSet::empty(lcl.hash);
        let value = LedgerValue::new(tx_set.hash(), lcl.close_time() + close_offset, 100);
        (value, tx_set)
    }

    /// Deliver an externalize from `seed` for `slot` together with its
    /// transaction set.
    pub fn externalize(&mut self, seed: u8, slot: SlotIndex, value: &LedgerValue, tx_set: TransactionSet) {
        let envelope = externalize_envelope(seed, slot, value, self.local_qset_hash());
        self.herder.recv_scp_envelope(envelope);
        self.herder.recv_tx_set(tx_set.hash(), tx_set);
    }

    /// Externalize the ledger after the last closed one.
    pub fn close_next(&mut self, seed: u8) {
        let slot = self.ledger.lcl().seq as SlotIndex + 1;
        let (value, tx_set) = self.next_value(1);
        self.externalize(seed, slot, &value, tx_set);
    }
}

// ---------------------------------------------------------------------------
// Envelopes and transactions
// ---------------------------------------------------------------------------

pub fn nominate_statement(node_id: NodeId, slot: SlotIndex, qset_hash: Hash256, votes: Vec<Value>) -> ScpStatement {
    ScpStatement {
        node_id,
        slot_index: slot,
        pledges: ScpStatementPledges::Nominate(ScpNomination {
            quorum_set_hash: Hash(qset_hash.0),
            votes: votes.try_into().unwrap(),
            accepted: Default::default(),
        }),
    }
}

pub fn sign(seed: u8, statement: ScpStatement) -> ScpEnvelope {
    let signature = sign_statement(&key(seed), &network(), &statement).unwrap();
    ScpEnvelope {
        statement,
        signature,
    }
}

pub fn nominate_envelope(seed: u8, slot: SlotIndex, value: &LedgerValue, qset_hash: Hash256) -> ScpEnvelope {
    sign(
        seed,
        nominate_statement(node(seed), slot, qset_hash, vec![value.to_value().unwrap()]),
    )
}

pub fn prepare_envelope(
    seed: u8,
    slot: SlotIndex,
    counter: u32,
    value: &LedgerValue,
    qset_hash: Hash256,
) -> ScpEnvelope {
    sign(
        seed,
        ScpStatement {
            node_id: node(seed),
            slot_index: slot,
            pledges: ScpStatementPledges::Prepare(ScpStatementPrepare {
                quorum_set_hash: Hash(qset_hash.0),
                ballot: ScpBallot {
                    counter,
                    value: value.to_value().unwrap(),
                },
                prepared: None,
                prepared_prime: None,
                n_c: 0,
                n_h: 0,
            }),
        },
    )
}

pub fn externalize_envelope(seed: u8, slot: SlotIndex, value: &LedgerValue, qset_hash: Hash256) -> ScpEnvelope {
    sign(
        seed,
        ScpStatement {
            node_id: node(seed),
            slot_index: slot,
            pledges: ScpStatementPledges::Externalize(ScpStatementExternalize {
                commit: ScpBallot {
                    counter: 1,
                    value: value.to_value().unwrap(),
                },
                n_h: 1,
                commit_quorum_set_hash: Hash(qset_hash.0),
            }),
        },
    )
}

pub fn account(seed: u8) -> AccountId {
    AccountId(PublicKey::PublicKeyTypeEd25519(Uint256([seed; 32])))
}

/// Single-operation payment-like transaction from account `seed`.
pub fn transaction(seed: u8, seq: i64, fee: u32) -> TransactionEnvelope {
    TransactionEnvelope::Tx(TransactionV1Envelope {
        tx: Transaction {
            source_account: MuxedAccount::Ed25519(Uint256([seed; 32])),
            fee,
            seq_num: SequenceNumber(seq),
            cond: Preconditions::None,
            memo: Memo::None,
            operations: vec![Operation {
                source_account: None,
                body: OperationBody::CreateAccount(CreateAccountOp {
                    destination: account(250),
                    starting_balance: 1_000_000,
                }),
            }]
            .try_into()
            .unwrap(),
            ext: TransactionExt::V0,
        },
        signatures: Default::default(),
    })
}

pub fn frame(seed: u8, seq: i64, fee: u32) -> TransactionFrame {
    TransactionFrame::new(transaction(seed, seq, fee)).unwrap()
}
