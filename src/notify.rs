use async_trait::async_trait;
use tracing::{info, warn};

use crate::ingest::RunResult;
use crate::models::WalletTransaction;

/// Receives pipeline events. Failures here are never fatal to a run.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Called once per page with the transactions that page added
    async fn new_transactions(&self, txs: &[WalletTransaction]);

    async fn run_finished(&self, result: &RunResult);
}

/// Reports through the tracing subscriber
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn new_transactions(&self, txs: &[WalletTransaction]) {
        for tx in txs {
            info!(
                "🔔 {} {} {} ({}) counterparty {}",
                tx.kind(),
                tx.amount(),
                tx.token,
                tx.signature,
                tx.counterparty().unwrap_or("-")
            );
        }
    }

    async fn run_finished(&self, result: &RunResult) {
        match result {
            RunResult::Error { message, .. } => warn!("Ingestion run failed: {}", message),
            other => info!("Ingestion run finished: {}", other.label()),
        }
    }
}

/// Discards everything
#[derive(Debug, Default)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn new_transactions(&self, _txs: &[WalletTransaction]) {}

    async fn run_finished(&self, _result: &RunResult) {}
}
