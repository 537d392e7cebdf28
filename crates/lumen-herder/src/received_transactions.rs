//! Staging buffer for received transactions.
//!
//! Transactions wait here between receipt and inclusion in a closed ledger.
//! The buffer has three generations:
//!
//! | generation | holds                                   |
//! |------------|-----------------------------------------|
//! | 0          | received since the last close           |
//! | 1          | survived one close, rebroadcast once    |
//! | 2          | aging out; drained by the same rotate   |
//!
//! [`ReceivedTransactions::rotate`] shifts every generation up by one and
//! then drains generation 2, so a transaction not included within two closes
//! is gone. Between rotations generation 2 is always empty.

use std::collections::HashSet;

use lumen_common::Hash256;
use stellar_xdr::curr::AccountId;

use crate::tx_set::TransactionFrame;

/// Number of generations, counting the transient aging-out slot. Only the
/// first two hold transactions between ledger closes.
pub const GENERATIONS: usize = 3;

#[derive(Debug, Default)]
pub struct ReceivedTransactions {
    generations: [Vec<TransactionFrame>; GENERATIONS],
}

impl ReceivedTransactions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage a freshly received transaction in generation 0.
    pub fn push(&mut self, tx: TransactionFrame) {
        self.generations[0].push(tx);
    }

    pub fn contains(&self, hash: &Hash256) -> bool {
        self.iter().any(|tx| tx.hash() == *hash)
    }

    pub fn generation(&self, index: usize) -> &[TransactionFrame] {
        &self.generations[index]
    }

    pub fn iter(&self) -> impl Iterator<Item = &TransactionFrame> {
        self.generations.iter().flatten()
    }

    pub fn len(&self) -> usize {
        self.generations.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Generation sizes, oldest last.
    pub fn sizes(&self) -> [usize; GENERATIONS] {
        [
            self.generations[0].len(),
            self.generations[1].len(),
            self.generations[2].len(),
        ]
    }

    /// Highest staged sequence number for `account`.
    pub fn max_seq_for(&self, account: &AccountId) -> Option<i64> {
        self.iter()
            .filter(|tx| tx.source() == account)
            .map(TransactionFrame::seq_num)
            .max()
    }

    /// Sum of the fees of everything staged for `account`.
    pub fn fees_for(&self, account: &AccountId) -> u64 {
        self.iter()
            .filter(|tx| tx.source() == account)
            .map(TransactionFrame::fee)
            .fold(0u64, u64::saturating_add)
    }

    /// Candidates for the next proposal: generations 0 and 1.
    pub fn candidates(&self) -> Vec<TransactionFrame> {
        self.generations[0]
            .iter()
            .chain(self.generations[1].iter())
            .cloned()
            .collect()
    }

    /// Remove the given transactions from every generation. Returns how many
    /// were removed.
    pub fn remove(&mut self, hashes: &HashSet<Hash256>) -> usize {
        let before = self.len();
        for generation in self.generations.iter_mut() {
            generation.retain(|tx| !hashes.contains(&tx.hash()));
        }
        before - self.len()
    }

    /// Advance one ledger. Returns the transactions that aged out.
    pub fn rotate(&mut self) -> Vec<TransactionFrame> {
        let mut dropped = std::mem::take(&mut self.generations[GENERATIONS - 1]);
        for i in (1..GENERATIONS).rev() {
            self.generations[i] = std::mem::take(&mut self.generations[i - 1]);
        }
        dropped.append(&mut self.generations[GENERATIONS - 1]);
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tx_set::test_support::{account, envelope};

    fn frame(source: u8, seq: i64, fee: u32) -> TransactionFrame {
        TransactionFrame::new(envelope(source, seq, fee, 1)).unwrap()
    }

    #[test]
    fn test_push_lands_in_generation_zero() {
        let mut received = ReceivedTransactions::new();
        let tx = frame(1, 1, 100);
        received.push(tx.clone());
        assert_eq!(received.sizes(), [1, 0, 0]);
        assert!(received.contains(&tx.hash()));
    }

    #[test]
    fn test_transaction_gone_after_two_rotations() {
        let mut received = ReceivedTransactions::new();
        let tx = frame(1, 1, 100);
        received.push(tx.clone());

        assert!(received.rotate().is_empty());
        assert_eq!(received.sizes(), [0, 1, 0]);
        assert_eq!(received.generation(1), &[tx.clone()]);
        assert_eq!(received.candidates(), vec![tx.clone()]);

        let dropped = received.rotate();
        assert_eq!(dropped, vec![tx.clone()]);
        assert_eq!(received.sizes(), [0, 0, 0]);
        assert!(!received.contains(&tx.hash()));
        assert!(received.is_empty());
    }

    #[test]
    fn test_account_aggregates() {
        let mut received = ReceivedTransactions::new();
        received.push(frame(1, 5, 100));
        received.rotate();
        received.push(frame(1, 6, 250));
        received.push(frame(2, 9, 100));

        assert_eq!(received.max_seq_for(&account(1)), Some(6));
        assert_eq!(received.fees_for(&account(1)), 350);
        assert_eq!(received.max_seq_for(&account(3)), None);
        assert_eq!(received.fees_for(&account(3)), 0);
    }

    #[test]
    fn test_remove_across_generations() {
        let mut received = ReceivedTransactions::new();
        let old = frame(1, 1, 100);
        let new = frame(2, 1, 100);
        received.push(old.clone());
        received.rotate();
        received.push(new.clone());

        let hashes: HashSet<_> = [old.hash(), new.hash()].into_iter().collect();
        assert_eq!(received.remove(&hashes), 2);
        assert!(received.is_empty());
    }
}
