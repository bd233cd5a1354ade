// src/testing.rs
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::json;

use crate::error::RpcError;
use crate::models::TxStatus;
use crate::rpc::{RpcProvider, RpcTransaction, SignatureInfo};

pub(crate) const LAMPORTS: u64 = 1_000_000_000;

/// Native transfer of `lamports` from `from` to `to`
pub(crate) fn transfer(slot: u64, block_time: i64, from: &str, to: &str, lamports: u64) -> RpcTransaction {
    serde_json::from_value(json!({
        "slot": slot,
        "blockTime": block_time,
        "meta": {
            "err": null,
            "fee": 5000,
            "preBalances": [lamports + 10_000, 0, 1],
            "postBalances": [5_000, lamports, 1],
            "preTokenBalances": [],
            "postTokenBalances": []
        },
        "transaction": {
            "signatures": ["ignored"],
            "message": { "accountKeys": [from, to, "11111111111111111111111111111111"] }
        }
    }))
    .expect("valid transaction fixture")
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scripted provider. History is newest first: `sig1` is the most recent signature.
pub(crate) struct MockProvider {
    history: Vec<SignatureInfo>,
    transactions: HashMap<String, RpcTransaction>,
    page_failures: Mutex<VecDeque<RpcError>>,
    tx_failures: Mutex<HashMap<String, VecDeque<RpcError>>>,
    signature_requests: Mutex<Vec<Option<String>>>,
    transaction_requests: Mutex<Vec<String>>,
}

impl MockProvider {
    /// `n` signatures, each a 1 SOL payment from `Sender` to `Wallet`
    pub(crate) fn with_history(n: usize) -> Self {
        let mut history = Vec::with_capacity(n);
        let mut transactions = HashMap::new();
        for i in 0..n {
            let signature = format!("sig{}", i + 1);
            let slot = 100 + (n - i) as u64;
            let block_time = 1_700_000_000 + slot as i64 * 10;
            transactions.insert(
                signature.clone(),
                transfer(slot, block_time, "Sender", "Wallet", LAMPORTS),
            );
            history.push(SignatureInfo {
                signature,
                slot,
                block_time: Some(block_time),
                err: None,
                confirmation_status: Some("finalized".to_string()),
            });
        }

        Self {
            history,
            transactions,
            page_failures: Mutex::new(VecDeque::new()),
            tx_failures: Mutex::new(HashMap::new()),
            signature_requests: Mutex::new(Vec::new()),
            transaction_requests: Mutex::new(Vec::new()),
        }
    }

    /// Flag a listing entry as failed on-chain
    pub(crate) fn failed_on_chain(mut self, signature: &str) -> Self {
        if let Some(info) = self.history.iter_mut().find(|s| s.signature == signature) {
            info.err = Some(json!({ "InstructionError": [0, "Custom"] }));
        }
        self
    }

    /// Provider returns `null` for this signature
    pub(crate) fn without_transaction(mut self, signature: &str) -> Self {
        self.transactions.remove(signature);
        self
    }

    pub(crate) fn history(&self) -> &[SignatureInfo] {
        &self.history
    }

    /// Errors returned by the next signature listings, in order
    pub(crate) fn fail_pages(&self, errors: Vec<RpcError>) {
        lock(&self.page_failures).extend(errors);
    }

    /// Errors returned by the next lookups of `signature`, in order
    pub(crate) fn fail_transaction(&self, signature: &str, errors: Vec<RpcError>) {
        lock(&self.tx_failures)
            .entry(signature.to_string())
            .or_default()
            .extend(errors);
    }

    /// `before` argument of every listing request
    pub(crate) fn signature_requests(&self) -> Vec<Option<String>> {
        lock(&self.signature_requests).clone()
    }

    pub(crate) fn transaction_requests(&self) -> Vec<String> {
        lock(&self.transaction_requests).clone()
    }

    pub(crate) fn lookups_of(&self, signature: &str) -> usize {
        lock(&self.transaction_requests)
            .iter()
            .filter(|s| s.as_str() == signature)
            .count()
    }
}

#[async_trait]
impl RpcProvider for MockProvider {
    async fn get_signatures_for_address(
        &self,
        _address: &str,
        limit: usize,
        before: Option<&str>,
    ) -> Result<Vec<SignatureInfo>, RpcError> {
        lock(&self.signature_requests).push(before.map(str::to_string));
        if let Some(err) = lock(&self.page_failures).pop_front() {
            return Err(err);
        }

        let start = match before {
            None => 0,
            Some(anchor) => match self.history.iter().position(|s| s.signature == anchor) {
                Some(pos) => pos + 1,
                None => return Ok(Vec::new()),
            },
        };
        Ok(self.history.iter().skip(start).take(limit).cloned().collect())
    }

    async fn get_transaction(
        &self,
        signature: &str,
        _commitment: TxStatus,
    ) -> Result<Option<RpcTransaction>, RpcError> {
        lock(&self.transaction_requests).push(signature.to_string());
        if let Some(err) = lock(&self.tx_failures)
            .get_mut(signature)
            .and_then(VecDeque::pop_front)
        {
            return Err(err);
        }
        Ok(self.transactions.get(signature).cloned())
    }
}
