// src/aggregator.rs
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeMap;

use crate::ledger::Ledger;
use crate::models::{TxKind, WalletTransaction};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct KindStats {
    pub count: u64,
    pub total: Decimal,
}

/// Inflows and outflows per token
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TokenStats {
    pub count: u64,
    pub sent: Decimal,
    pub received: Decimal,
    pub net: Decimal, // received - sent
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CounterpartyStats {
    pub sent_count: u64,
    pub sent_total: Decimal,
    pub received_count: u64,
    pub received_total: Decimal,
}

impl CounterpartyStats {
    pub fn volume(&self) -> Decimal {
        self.sent_total + self.received_total
    }
}

/// Derived view over the ledger. Never stored as a source of truth.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Stats {
    pub total_transactions: u64,
    pub by_kind: BTreeMap<TxKind, KindStats>,
    pub by_token: BTreeMap<String, TokenStats>,
    pub counterparties: BTreeMap<String, CounterpartyStats>,
    /// Network fees of every ledger transaction, whoever paid them. A native
    /// send paid by the wallet already carries its fee inside `amount`.
    pub total_fees: Decimal,
    pub first_seen: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
}

impl Stats {
    /// Counterparties by combined volume, largest first, ties by address
    pub fn top_counterparties(&self, n: usize) -> Vec<(&str, &CounterpartyStats)> {
        let mut ranked: Vec<(&str, &CounterpartyStats)> = self
            .counterparties
            .iter()
            .map(|(addr, s)| (addr.as_str(), s))
            .collect();
        ranked.sort_by(|a, b| b.1.volume().cmp(&a.1.volume()).then_with(|| a.0.cmp(b.0)));
        ranked.truncate(n);
        ranked
    }

    fn add(&mut self, tx: &WalletTransaction) {
        let amount = tx.amount();

        self.total_transactions += 1;
        self.total_fees += tx.fee;

        let kind = self.by_kind.entry(tx.kind()).or_default();
        kind.count += 1;
        kind.total += amount;

        let token = self.by_token.entry(tx.token.clone()).or_default();
        token.count += 1;
        match tx.kind() {
            TxKind::Sent => token.sent += amount,
            TxKind::Received => token.received += amount,
            TxKind::Unknown => {}
        }
        token.net = token.received - token.sent;

        if let Some(other) = tx.counterparty() {
            let cp = self.counterparties.entry(other.to_string()).or_default();
            match tx.kind() {
                TxKind::Sent => {
                    cp.sent_count += 1;
                    cp.sent_total += amount;
                }
                TxKind::Received => {
                    cp.received_count += 1;
                    cp.received_total += amount;
                }
                TxKind::Unknown => {}
            }
        }

        if let Some(ts) = tx.timestamp {
            self.first_seen = Some(self.first_seen.map_or(ts, |t| t.min(ts)));
            self.last_seen = Some(self.last_seen.map_or(ts, |t| t.max(ts)));
        }
    }
}

/// Single pass over the transactions; order does not affect the result
pub fn compute<'a, I>(transactions: I) -> Stats
where
    I: IntoIterator<Item = &'a WalletTransaction>,
{
    let mut stats = Stats::default();
    for tx in transactions {
        stats.add(tx);
    }
    stats
}

pub fn compute_ledger(ledger: &Ledger) -> Stats {
    compute(&ledger.all())
}
