use chrono::{TimeZone, Utc};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::LimiterError;
use crate::ledger::Ledger;
use crate::limiter::RateLimiter;
use crate::models::{TxStatus, WalletTransaction};
use crate::parser::{classify, scale_amount};
use crate::retry::RetryPolicy;
use crate::rpc::RpcProvider;

/// Outcome of resolving one signature into the ledger
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Added(WalletTransaction),
    /// Already in the ledger, no provider call was made
    Known,
    /// Failed on-chain, missing upstream, or a terminal error. Logged.
    Skipped,
}

/// Turns a signature into a classified [`WalletTransaction`]
pub struct TransactionResolver {
    provider: Arc<dyn RpcProvider>,
    limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
    ledger: Arc<Ledger>,
    wallet: String,
    unit_scale: u64,
    commitment: TxStatus,
}

impl TransactionResolver {
    pub fn new(
        provider: Arc<dyn RpcProvider>,
        limiter: Arc<RateLimiter>,
        retry: RetryPolicy,
        ledger: Arc<Ledger>,
        wallet: String,
        unit_scale: u64,
        commitment: TxStatus,
    ) -> Self {
        Self {
            provider,
            limiter,
            retry,
            ledger,
            wallet,
            unit_scale,
            commitment,
        }
    }

    /// `Ok(None)` for anything that should be skipped.
    /// Only cooldown signals come back as errors.
    pub async fn resolve(&self, signature: &str) -> Result<Option<WalletTransaction>, LimiterError> {
        let fetched = self
            .retry
            .run("getTransaction", || {
                self.limiter
                    .submit(|| self.provider.get_transaction(signature, self.commitment))
            })
            .await;

        let tx = match fetched {
            Ok(Some(tx)) => tx,
            Ok(None) => {
                warn!(
                    "Transaction {} not available at {} commitment, skipping",
                    signature,
                    self.commitment.as_str()
                );
                return Ok(None);
            }
            Err(e) if e.is_cooldown_signal() => return Err(e),
            Err(e) => {
                warn!("Skipping transaction {}: {}", signature, e);
                return Ok(None);
            }
        };

        let Some(meta) = &tx.meta else {
            warn!("Transaction {} has no status meta, skipping", signature);
            return Ok(None);
        };
        if meta.err.as_ref().is_some_and(|e| !e.is_null()) {
            debug!("Transaction {} failed on-chain, skipping", signature);
            return Ok(None);
        }
        let fee = scale_amount(meta.fee, self.unit_scale);

        let classification = classify(&self.wallet, &tx, self.unit_scale);
        Ok(Some(WalletTransaction {
            signature: signature.to_string(),
            block_time: tx.block_time,
            slot: tx.slot,
            timestamp: tx
                .block_time
                .and_then(|t| Utc.timestamp_opt(t, 0).single()),
            flow: classification.flow,
            token: classification.token,
            token_mint: classification.token_mint,
            wallet: self.wallet.clone(),
            fee,
            status: self.commitment,
        }))
    }

    /// Resolve unless already known, upserting the result
    pub async fn resolve_into_ledger(&self, signature: &str) -> Result<Resolution, LimiterError> {
        if self.ledger.has(signature) {
            return Ok(Resolution::Known);
        }

        match self.resolve(signature).await? {
            Some(tx) => {
                self.ledger.upsert(tx.clone());
                Ok(Resolution::Added(tx))
            }
            None => Ok(Resolution::Skipped),
        }
    }
}
