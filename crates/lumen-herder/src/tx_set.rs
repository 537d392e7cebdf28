//! Transactions and transaction sets.
//!
//! A [`TransactionFrame`] wraps an XDR envelope with the fields the herder
//! keys on: source account, sequence number, fee and operation count. A
//! [`TransactionSet`] is the canonical, hash-identified list of frames
//! proposed for one ledger.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use lumen_common::Hash256;
use stellar_xdr::curr::{
    AccountId, FeeBumpTransactionInnerTx, Limits, MuxedAccount, PublicKey as XdrPublicKey,
    TransactionEnvelope, WriteXdr,
};
use tracing::{debug, trace};

use crate::callbacks::LedgerCallback;
use crate::error::HerderError;
use crate::Result;

/// A transaction envelope with its identity and fee fields extracted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionFrame {
    envelope: TransactionEnvelope,
    hash: Hash256,
    source: AccountId,
    seq_num: i64,
    fee: u64,
    operation_count: usize,
}

impl TransactionFrame {
    /// Wrap an envelope.
    ///
    /// # Errors
    ///
    /// Returns [`HerderError::MalformedTransaction`] for an envelope without
    /// operations or with a negative fee.
    pub fn new(envelope: TransactionEnvelope) -> Result<Self> {
        let (source, seq_num, fee, operation_count) = match &envelope {
            TransactionEnvelope::TxV0(env) => (
                AccountId(XdrPublicKey::PublicKeyTypeEd25519(
                    env.tx.source_account_ed25519.clone(),
                )),
                env.tx.seq_num.0,
                env.tx.fee as i64,
                env.tx.operations.len(),
            ),
            TransactionEnvelope::Tx(env) => (
                muxed_to_account_id(&env.tx.source_account),
                env.tx.seq_num.0,
                env.tx.fee as i64,
                env.tx.operations.len(),
            ),
            TransactionEnvelope::TxFeeBump(env) => match &env.tx.inner_tx {
                FeeBumpTransactionInnerTx::Tx(inner) => (
                    muxed_to_account_id(&inner.tx.source_account),
                    inner.tx.seq_num.0,
                    env.tx.fee,
                    inner.tx.operations.len(),
                ),
            },
        };
        if operation_count == 0 {
            return Err(HerderError::MalformedTransaction(
                "transaction has no operations".to_string(),
            ));
        }
        let fee = u64::try_from(fee)
            .map_err(|_| HerderError::MalformedTransaction(format!("negative fee {}", fee)))?;
        let hash = Hash256::hash_xdr(&envelope)?;
        Ok(Self {
            envelope,
            hash,
            source,
            seq_num,
            fee,
            operation_count,
        })
    }

    pub fn envelope(&self) -> &TransactionEnvelope {
        &self.envelope
    }

    pub fn hash(&self) -> Hash256 {
        self.hash
    }

    pub fn source(&self) -> &AccountId {
        &self.source
    }

    pub fn seq_num(&self) -> i64 {
        self.seq_num
    }

    pub fn fee(&self) -> u64 {
        self.fee
    }

    pub fn operation_count(&self) -> usize {
        self.operation_count
    }

    /// Minimum fee for this transaction at `base_fee` per operation.
    pub fn min_fee(&self, base_fee: u32) -> u64 {
        base_fee as u64 * self.operation_count as u64
    }

    /// Compare fee per operation without rounding.
    pub fn cmp_fee_rate(&self, other: &Self) -> Ordering {
        let lhs = self.fee as u128 * other.operation_count as u128;
        let rhs = other.fee as u128 * self.operation_count as u128;
        lhs.cmp(&rhs)
    }
}

fn muxed_to_account_id(muxed: &MuxedAccount) -> AccountId {
    match muxed {
        MuxedAccount::Ed25519(key) => AccountId(XdrPublicKey::PublicKeyTypeEd25519(key.clone())),
        MuxedAccount::MuxedEd25519(m) => {
            AccountId(XdrPublicKey::PublicKeyTypeEd25519(m.ed25519.clone()))
        }
    }
}

/// The transactions proposed for one ledger, built on a given previous
/// ledger.
///
/// Transactions are kept sorted by hash and deduplicated, so two sets with
/// the same contents and previous ledger always have the same hash:
/// `sha256(previous_ledger_hash || xdr(tx_0) || xdr(tx_1) || ...)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionSet {
    previous_ledger_hash: Hash256,
    transactions: Vec<TransactionFrame>,
    hash: Hash256,
}

impl TransactionSet {
    pub fn new(previous_ledger_hash: Hash256, mut transactions: Vec<TransactionFrame>) -> Self {
        transactions.sort_by(|a, b| a.hash.cmp(&b.hash));
        transactions.dedup_by(|a, b| a.hash == b.hash);
        let hash = Self::contents_hash(&previous_ledger_hash, &transactions);
        Self {
            previous_ledger_hash,
            transactions,
            hash,
        }
    }

    /// An empty set on top of `previous_ledger_hash`.
    pub fn empty(previous_ledger_hash: Hash256) -> Self {
        Self::new(previous_ledger_hash, Vec::new())
    }

    /// Decode the legacy XDR transaction set.
    pub fn from_xdr(xdr: &stellar_xdr::curr::TransactionSet) -> Result<Self> {
        let transactions = xdr
            .txs
            .iter()
            .cloned()
            .map(TransactionFrame::new)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(
            Hash256::from(&xdr.previous_ledger_hash),
            transactions,
        ))
    }

    pub fn to_xdr(&self) -> Result<stellar_xdr::curr::TransactionSet> {
        let txs: Vec<TransactionEnvelope> = self
            .transactions
            .iter()
            .map(|tx| tx.envelope.clone())
            .collect();
        Ok(stellar_xdr::curr::TransactionSet {
            previous_ledger_hash: self.previous_ledger_hash.into(),
            txs: txs.try_into()?,
        })
    }

    fn contents_hash(previous_ledger_hash: &Hash256, transactions: &[TransactionFrame]) -> Hash256 {
        let mut data = previous_ledger_hash.0.to_vec();
        for tx in transactions {
            if let Ok(bytes) = tx.envelope.to_xdr(Limits::none()) {
                data.extend_from_slice(&bytes);
            }
        }
        Hash256::hash(&data)
    }

    pub fn hash(&self) -> Hash256 {
        self.hash
    }

    pub fn previous_ledger_hash(&self) -> Hash256 {
        self.previous_ledger_hash
    }

    pub fn transactions(&self) -> &[TransactionFrame] {
        &self.transactions
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    fn by_account(&self) -> BTreeMap<&AccountId, Vec<&TransactionFrame>> {
        let mut accounts: BTreeMap<&AccountId, Vec<&TransactionFrame>> = BTreeMap::new();
        for tx in &self.transactions {
            accounts.entry(&tx.source).or_default().push(tx);
        }
        for chain in accounts.values_mut() {
            chain.sort_by(|a, b| a.seq_num.cmp(&b.seq_num).then(a.hash.cmp(&b.hash)));
        }
        accounts
    }

    /// Full validity check against the ledger the set builds on.
    ///
    /// Every account must exist, its transactions must continue its sequence
    /// number without gaps or double spends, and their fees together must be
    /// covered by its balance.
    pub fn check_valid(&self, ledger: &dyn LedgerCallback, lcl_hash: &Hash256) -> bool {
        if self.previous_ledger_hash != *lcl_hash {
            debug!(
                expected = %lcl_hash.short(),
                got = %self.previous_ledger_hash.short(),
                "tx set built on a different ledger"
            );
            return false;
        }
        if Self::contents_hash(&self.previous_ledger_hash, &self.transactions) != self.hash {
            debug!(hash = %self.hash.short(), "tx set hash mismatch");
            return false;
        }
        for (account, chain) in self.by_account() {
            let Some(state) = ledger.load_account(account) else {
                debug!(hash = %self.hash.short(), "tx set references unknown account");
                return false;
            };
            let mut expected = state.seq_num.checked_add(1);
            let mut fees: u64 = 0;
            for tx in chain {
                if expected != Some(tx.seq_num) {
                    debug!(
                        hash = %self.hash.short(),
                        ?expected,
                        got = tx.seq_num,
                        "tx set has bad sequence"
                    );
                    return false;
                }
                expected = tx.seq_num.checked_add(1);
                fees = fees.saturating_add(tx.fee);
            }
            if fees > state.balance.max(0) as u64 {
                debug!(hash = %self.hash.short(), fees, "tx set fees exceed balance");
                return false;
            }
        }
        true
    }

    /// Remove every transaction that would make [`check_valid`] fail and
    /// return the removed ones.
    ///
    /// Per account, the longest valid prefix of the sequence chain is kept.
    /// Among several transactions with the same sequence number, the one with
    /// the lowest hash wins.
    ///
    /// [`check_valid`]: Self::check_valid
    pub fn trim_invalid(&mut self, ledger: &dyn LedgerCallback) -> Vec<TransactionFrame> {
        let mut keep: Vec<Hash256> = Vec::new();
        for (account, chain) in self.by_account() {
            let Some(state) = ledger.load_account(account) else {
                continue;
            };
            let balance = state.balance.max(0) as u64;
            let mut expected = state.seq_num.checked_add(1);
            let mut fees: u64 = 0;
            for tx in chain {
                if expected != Some(tx.seq_num) || fees.saturating_add(tx.fee) > balance {
                    continue;
                }
                expected = tx.seq_num.checked_add(1);
                fees += tx.fee;
                keep.push(tx.hash);
            }
        }
        keep.sort();
        let (kept, removed): (Vec<_>, Vec<_>) = std::mem::take(&mut self.transactions)
            .into_iter()
            .partition(|tx| keep.binary_search(&tx.hash).is_ok());
        if !removed.is_empty() {
            trace!(removed = removed.len(), "trimmed invalid transactions");
        }
        self.transactions = kept;
        self.hash = Self::contents_hash(&self.previous_ledger_hash, &self.transactions);
        removed
    }

    /// Cap the set at `max_size` transactions and return the evicted ones.
    ///
    /// Eviction repeatedly removes the lowest fee-rate transaction among the
    /// last link of every account chain (highest hash on ties), so surviving
    /// chains stay contiguous and the outcome depends only on the contents.
    pub fn surge_filter(&mut self, max_size: usize) -> Vec<TransactionFrame> {
        if self.transactions.len() <= max_size {
            return Vec::new();
        }
        let mut chains: HashMap<AccountId, Vec<TransactionFrame>> = HashMap::new();
        for tx in std::mem::take(&mut self.transactions) {
            chains.entry(tx.source.clone()).or_default().push(tx);
        }
        for chain in chains.values_mut() {
            chain.sort_by(|a, b| a.seq_num.cmp(&b.seq_num).then(a.hash.cmp(&b.hash)));
        }
        let mut remaining: usize = chains.values().map(Vec::len).sum();
        let mut evicted = Vec::new();
        while remaining > max_size {
            let victim = chains
                .iter()
                .filter_map(|(account, chain)| chain.last().map(|tx| (account, tx)))
                .min_by(|(_, a), (_, b)| a.cmp_fee_rate(b).then(b.hash.cmp(&a.hash)))
                .map(|(account, _)| account.clone());
            let Some(account) = victim else {
                break;
            };
            if let Some(chain) = chains.get_mut(&account) {
                if let Some(tx) = chain.pop() {
                    evicted.push(tx);
                    remaining -= 1;
                }
            }
        }
        debug!(
            evicted = evicted.len(),
            max_size, "surge pricing trimmed tx set"
        );
        let mut transactions: Vec<TransactionFrame> = chains.into_values().flatten().collect();
        transactions.sort_by(|a, b| a.hash.cmp(&b.hash));
        self.transactions = transactions;
        self.hash = Self::contents_hash(&self.previous_ledger_hash, &self.transactions);
        evicted
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use stellar_xdr::curr::{
        AccountId, CreateAccountOp, Memo, MuxedAccount, Operation, OperationBody, Preconditions,
        PublicKey, SequenceNumber, Transaction, TransactionEnvelope, TransactionExt,
        TransactionV1Envelope, Uint256,
    };

    pub fn account(seed: u8) -> AccountId {
        AccountId(PublicKey::PublicKeyTypeEd25519(Uint256([seed; 32])))
    }

    pub fn envelope(source: u8, seq: i64, fee: u32, ops: usize) -> TransactionEnvelope {
        let operations: Vec<Operation> = (0..ops)
            .map(|i| Operation {
                source_account: None,
                body: OperationBody::CreateAccount(CreateAccountOp {
                    destination: account(200 + i as u8),
                    starting_balance: 1_000_000,
                }),
            })
            .collect();
        TransactionEnvelope::Tx(TransactionV1Envelope {
            tx: Transaction {
                source_account: MuxedAccount::Ed25519(Uint256([source; 32])),
                fee,
                seq_num: SequenceNumber(seq),
                cond: Preconditions::None,
                memo: Memo::None,
                operations: operations.try_into().unwrap(),
                ext: TransactionExt::V0,
            },
            signatures: Default::default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{account, envelope};
    use super::*;
    use crate::callbacks::{AccountState, LastClosedLedger, LedgerCloseData};
    use std::collections::HashMap;

    struct Accounts(HashMap<AccountId, AccountState>);

    impl LedgerCallback for Accounts {
        fn last_closed_ledger(&self) -> LastClosedLedger {
            unreachable!()
        }
        fn load_account(&self, account: &AccountId) -> Option<AccountState> {
            self.0.get(account).copied()
        }
        fn close_ledger(&mut self, _: LedgerCloseData) {}
        fn is_synced(&self) -> bool {
            true
        }
    }

    fn accounts(entries: &[(u8, i64, i64)]) -> Accounts {
        Accounts(
            entries
                .iter()
                .map(|(seed, seq_num, balance)| {
                    (
                        account(*seed),
                        AccountState {
                            seq_num: *seq_num,
                            balance: *balance,
                        },
                    )
                })
                .collect(),
        )
    }

    fn frame(source: u8, seq: i64, fee: u32, ops: usize) -> TransactionFrame {
        TransactionFrame::new(envelope(source, seq, fee, ops)).unwrap()
    }

    #[test]
    fn test_frame_extracts_fields() {
        let tx = frame(1, 7, 300, 3);
        assert_eq!(tx.source(), &account(1));
        assert_eq!(tx.seq_num(), 7);
        assert_eq!(tx.fee(), 300);
        assert_eq!(tx.operation_count(), 3);
        assert_eq!(tx.min_fee(100), 300);
    }

    #[test]
    fn test_frame_without_operations_is_malformed() {
        assert!(matches!(
            TransactionFrame::new(envelope(1, 1, 100, 0)),
            Err(HerderError::MalformedTransaction(_))
        ));
    }

    #[test]
    fn test_set_hash_independent_of_input_order() {
        let prev = Hash256::hash(b"lcl");
        let a = TransactionSet::new(prev, vec![frame(1, 1, 100, 1), frame(2, 1, 100, 1)]);
        let b = TransactionSet::new(prev, vec![frame(2, 1, 100, 1), frame(1, 1, 100, 1)]);
        assert_eq!(a.hash(), b.hash());
        assert_ne!(a.hash(), TransactionSet::empty(prev).hash());
        assert_ne!(
            TransactionSet::empty(prev).hash(),
            TransactionSet::empty(Hash256::ZERO).hash()
        );
    }

    #[test]
    fn test_set_deduplicates() {
        let set = TransactionSet::new(Hash256::ZERO, vec![frame(1, 1, 100, 1), frame(1, 1, 100, 1)]);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_xdr_conversion_keeps_hash() {
        let set = TransactionSet::new(Hash256::hash(b"p"), vec![frame(3, 4, 100, 1)]);
        let decoded = TransactionSet::from_xdr(&set.to_xdr().unwrap()).unwrap();
        assert_eq!(decoded.hash(), set.hash());
    }

    #[test]
    fn test_check_valid() {
        let lcl = Hash256::hash(b"lcl");
        let ledger = accounts(&[(1, 10, 1_000), (2, 0, 50)]);

        let good = TransactionSet::new(lcl, vec![frame(1, 11, 100, 1), frame(1, 12, 100, 1)]);
        assert!(good.check_valid(&ledger, &lcl));
        assert!(!good.check_valid(&ledger, &Hash256::ZERO));

        let gap = TransactionSet::new(lcl, vec![frame(1, 11, 100, 1), frame(1, 13, 100, 1)]);
        assert!(!gap.check_valid(&ledger, &lcl));

        let double_spend =
            TransactionSet::new(lcl, vec![frame(1, 11, 100, 1), frame(1, 11, 200, 1)]);
        assert!(!double_spend.check_valid(&ledger, &lcl));

        let broke = TransactionSet::new(lcl, vec![frame(2, 1, 100, 1)]);
        assert!(!broke.check_valid(&ledger, &lcl));

        let unknown = TransactionSet::new(lcl, vec![frame(9, 1, 100, 1)]);
        assert!(!unknown.check_valid(&ledger, &lcl));
    }

    #[test]
    fn test_trim_invalid_keeps_valid_prefix() {
        let lcl = Hash256::hash(b"lcl");
        let ledger = accounts(&[(1, 10, 250)]);
        let mut set = TransactionSet::new(
            lcl,
            vec![
                frame(1, 11, 100, 1),
                frame(1, 12, 100, 1),
                frame(1, 13, 100, 1),
                frame(9, 1, 100, 1),
            ],
        );
        let removed = set.trim_invalid(&ledger);
        assert_eq!(set.len(), 2);
        assert_eq!(removed.len(), 2);
        assert!(set.check_valid(&ledger, &lcl));
    }

    #[test]
    fn test_sequence_at_upper_bound() {
        let lcl = Hash256::hash(b"lcl");
        let ledger = accounts(&[(1, i64::MAX - 1, 1_000), (2, i64::MAX, 1_000)]);

        let last = TransactionSet::new(lcl, vec![frame(1, i64::MAX, 100, 1)]);
        assert!(last.check_valid(&ledger, &lcl));

        let exhausted = TransactionSet::new(lcl, vec![frame(2, i64::MAX, 100, 1)]);
        assert!(!exhausted.check_valid(&ledger, &lcl));

        let mut set = TransactionSet::new(
            lcl,
            vec![frame(1, i64::MAX, 100, 1), frame(2, i64::MAX, 100, 1)],
        );
        let removed = set.trim_invalid(&ledger);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].source(), &account(2));
        assert!(set.check_valid(&ledger, &lcl));
    }

    #[test]
    fn test_surge_filter_evicts_lowest_fee_rate_tail() {
        let lcl = Hash256::hash(b"lcl");
        let mut set = TransactionSet::new(
            lcl,
            vec![
                frame(1, 1, 500, 1),
                frame(1, 2, 500, 1),
                frame(2, 1, 100, 1),
                frame(3, 1, 900, 2),
            ],
        );
        let evicted = set.surge_filter(3);
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].source(), &account(2));

        let evicted = set.surge_filter(1);
        assert_eq!(evicted.len(), 2);
        let survivors: Vec<_> = set.transactions().iter().map(|tx| tx.seq_num()).collect();
        assert_eq!(survivors, vec![1]);
        assert_eq!(set.transactions()[0].source(), &account(1));
    }

    #[test]
    fn test_surge_filter_noop_under_limit() {
        let mut set = TransactionSet::new(Hash256::ZERO, vec![frame(1, 1, 100, 1)]);
        let before = set.hash();
        assert!(set.surge_filter(10).is_empty());
        assert_eq!(set.hash(), before);
    }
}
