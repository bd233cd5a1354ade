// src/ledger.rs
use std::collections::{HashMap, HashSet};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::models::{FetchCursor, WalletTransaction};

/// Persistence handoff format
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub transactions: Vec<WalletTransaction>,
    pub cursor: FetchCursor,
}

#[derive(Debug, Default)]
struct Inner {
    transactions: HashMap<String, WalletTransaction>,
    cursor: FetchCursor,
}

/// Resolved transactions keyed by signature, plus the pagination cursor.
/// The signature set only grows, except through `restore`.
#[derive(Debug, Default)]
pub struct Ledger {
    inner: RwLock<Inner>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert or replace by signature. Returns true if the signature was new.
    pub fn upsert(&self, tx: WalletTransaction) -> bool {
        self.write()
            .transactions
            .insert(tx.signature.clone(), tx)
            .is_none()
    }

    pub fn has(&self, signature: &str) -> bool {
        self.read().transactions.contains_key(signature)
    }

    pub fn get(&self, signature: &str) -> Option<WalletTransaction> {
        self.read().transactions.get(signature).cloned()
    }

    pub fn all(&self) -> Vec<WalletTransaction> {
        self.read().transactions.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn cursor(&self) -> FetchCursor {
        self.read().cursor.clone()
    }

    pub fn set_cursor(&self, cursor: FetchCursor) {
        self.write().cursor = cursor;
    }

    /// Consistent copy of transactions and cursor, sorted newest first
    pub fn snapshot(&self) -> LedgerSnapshot {
        let inner = self.read();
        let mut transactions: Vec<WalletTransaction> =
            inner.transactions.values().cloned().collect();
        transactions.sort_by(|a, b| {
            b.slot
                .cmp(&a.slot)
                .then_with(|| a.signature.cmp(&b.signature))
        });

        LedgerSnapshot {
            transactions,
            cursor: inner.cursor.clone(),
        }
    }

    /// Replace the whole ledger with a persisted snapshot.
    /// The snapshot is validated first; on error the ledger is left untouched.
    pub fn restore(&self, snapshot: LedgerSnapshot) -> Result<(), StoreError> {
        {
            let mut seen = HashSet::with_capacity(snapshot.transactions.len());
            for tx in &snapshot.transactions {
                if tx.signature.is_empty() {
                    return Err(StoreError::Corrupt("transaction without signature".into()));
                }
                if !seen.insert(tx.signature.as_str()) {
                    return Err(StoreError::Corrupt(format!(
                        "signature {} stored twice",
                        tx.signature
                    )));
                }
            }
        }

        let transactions = snapshot
            .transactions
            .into_iter()
            .map(|tx| (tx.signature.clone(), tx))
            .collect();

        let mut inner = self.write();
        inner.transactions = transactions;
        inner.cursor = snapshot.cursor;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::{Flow, TxStatus};
    use chrono::{TimeZone, Utc};
    use rust_decimal::Decimal;

    pub(crate) fn sample_tx(signature: &str, slot: u64, flow: Flow) -> WalletTransaction {
        let block_time = 1_700_000_000 + slot as i64;
        WalletTransaction {
            signature: signature.to_string(),
            block_time: Some(block_time),
            slot,
            timestamp: Utc.timestamp_opt(block_time, 0).single(),
            flow,
            token: "SOL".to_string(),
            token_mint: None,
            wallet: "Wallet".to_string(),
            fee: Decimal::new(5, 6),
            status: TxStatus::Confirmed,
        }
    }

    fn sent(amount: i64, to: &str) -> Flow {
        Flow::Sent {
            amount: Decimal::from(amount),
            to: Some(to.to_string()),
        }
    }

    #[test]
    fn upsert_twice_is_identical_to_once() {
        let once = Ledger::new();
        once.upsert(sample_tx("sig1", 10, sent(1, "Bob")));

        let twice = Ledger::new();
        assert!(twice.upsert(sample_tx("sig1", 10, sent(1, "Bob"))));
        assert!(!twice.upsert(sample_tx("sig1", 10, sent(1, "Bob"))));

        assert_eq!(once.snapshot(), twice.snapshot());
        assert_eq!(twice.len(), 1);
    }

    #[test]
    fn upsert_replaces_in_place() {
        let ledger = Ledger::new();
        ledger.upsert(sample_tx("sig1", 10, Flow::Unknown));
        ledger.upsert(sample_tx("sig1", 10, sent(2, "Carol")));

        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger.get("sig1").unwrap().counterparty(), Some("Carol"));
    }

    #[test]
    fn keys_match_signatures() {
        let ledger = Ledger::new();
        for (i, sig) in ["a", "b", "c"].iter().enumerate() {
            ledger.upsert(sample_tx(sig, i as u64, Flow::Unknown));
        }
        for tx in ledger.all() {
            assert_eq!(ledger.get(&tx.signature).unwrap(), tx);
        }
    }

    #[test]
    fn snapshot_restore_round_trip() {
        let ledger = Ledger::new();
        ledger.upsert(sample_tx("sig1", 1, sent(1, "Bob")));
        ledger.upsert(sample_tx("sig2", 2, Flow::Unknown));
        ledger.set_cursor(FetchCursor {
            before_signature: Some("sig1".into()),
            ..FetchCursor::default()
        });

        let snapshot = ledger.snapshot();
        assert_eq!(snapshot.transactions[0].signature, "sig2");

        let restored = Ledger::new();
        restored.restore(snapshot.clone()).unwrap();
        assert_eq!(restored.snapshot(), snapshot);
        assert_eq!(restored.cursor().before_signature.as_deref(), Some("sig1"));
    }

    #[test]
    fn restore_rejects_duplicate_signatures_without_mutating() {
        let ledger = Ledger::new();
        ledger.upsert(sample_tx("keep", 1, Flow::Unknown));

        let bad = LedgerSnapshot {
            transactions: vec![
                sample_tx("dup", 1, Flow::Unknown),
                sample_tx("dup", 2, Flow::Unknown),
            ],
            cursor: FetchCursor::default(),
        };

        let err = ledger.restore(bad).unwrap_err();
        assert!(err.is_integrity());
        assert!(ledger.has("keep"));
        assert!(!ledger.has("dup"));
    }
}
