// src/rpc.rs
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

use crate::error::RpcError;
use crate::models::TxStatus;

/// One entry of `getSignaturesForAddress`, newest first
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureInfo {
    pub signature: String,
    #[serde(default)]
    pub slot: u64,
    #[serde(default)]
    pub block_time: Option<i64>,
    #[serde(default)]
    pub err: Option<Value>, // non-null when the transaction failed on-chain
    #[serde(default)]
    pub confirmation_status: Option<String>,
}

impl SignatureInfo {
    pub fn failed(&self) -> bool {
        self.err.as_ref().is_some_and(|e| !e.is_null())
    }
}

/// Account keys arrive as plain strings (`json`) or objects (`jsonParsed`)
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum AccountKey {
    Plain(String),
    Parsed { pubkey: String },
}

impl AccountKey {
    pub fn pubkey(&self) -> &str {
        match self {
            AccountKey::Plain(k) => k,
            AccountKey::Parsed { pubkey } => pubkey,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UiTokenAmount {
    pub amount: String, // raw integer units
    pub decimals: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenBalance {
    pub account_index: usize,
    pub mint: String,
    #[serde(default)]
    pub owner: Option<String>,
    pub ui_token_amount: UiTokenAmount,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoadedAddresses {
    #[serde(default)]
    pub writable: Vec<String>,
    #[serde(default)]
    pub readonly: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionMeta {
    #[serde(default)]
    pub err: Option<Value>,
    #[serde(default)]
    pub fee: u64,
    pub pre_balances: Vec<u64>,
    pub post_balances: Vec<u64>,
    #[serde(default)]
    pub pre_token_balances: Option<Vec<TokenBalance>>,
    #[serde(default)]
    pub post_token_balances: Option<Vec<TokenBalance>>,
    #[serde(default)]
    pub loaded_addresses: Option<LoadedAddresses>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub account_keys: Vec<AccountKey>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransactionBody {
    pub message: Message,
}

/// `getTransaction` result
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcTransaction {
    pub slot: u64,
    #[serde(default)]
    pub block_time: Option<i64>,
    pub meta: Option<TransactionMeta>,
    pub transaction: TransactionBody,
}

impl RpcTransaction {
    /// Static keys followed by lookup-table writable then readonly keys,
    /// matching the indices of the balance arrays
    pub fn account_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .transaction
            .message
            .account_keys
            .iter()
            .map(|k| k.pubkey().to_string())
            .collect();
        if let Some(loaded) = self.meta.as_ref().and_then(|m| m.loaded_addresses.as_ref()) {
            keys.extend(loaded.writable.iter().cloned());
            keys.extend(loaded.readonly.iter().cloned());
        }
        keys
    }
}

/// The two provider operations the pipeline consumes
#[async_trait]
pub trait RpcProvider: Send + Sync {
    async fn get_signatures_for_address(
        &self,
        address: &str,
        limit: usize,
        before: Option<&str>,
    ) -> Result<Vec<SignatureInfo>, RpcError>;

    /// `Ok(None)` when the provider has no record of the signature
    async fn get_transaction(
        &self,
        signature: &str,
        commitment: TxStatus,
    ) -> Result<Option<RpcTransaction>, RpcError>;
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

/// JSON-RPC 2.0 client over HTTP
pub struct HttpRpcClient {
    client: Client,
    rpc_url: String,
    api_key: Option<String>,
}

impl HttpRpcClient {
    pub fn new(rpc_url: &str, api_key: Option<String>) -> Result<Self, RpcError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| RpcError::Terminal(format!("building http client: {}", e)))?;

        Ok(Self {
            client,
            rpc_url: rpc_url.to_string(),
            api_key,
        })
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<Option<T>, RpcError> {
        let payload = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params
        });

        debug!("📡 Sending {} → {}", method, self.rpc_url);

        let mut request = self.client.post(&self.rpc_url).json(&payload);
        if let Some(key) = &self.api_key {
            request = request.query(&[("api-key", key)]);
        }

        let resp = request.send().await.map_err(classify_transport)?;
        if let Some(err) = classify_status(method, resp.status()) {
            return Err(err);
        }

        let text = resp.text().await.map_err(classify_transport)?;
        decode_response(method, &text)
    }
}

/// `None` for 200, otherwise the error the status maps onto
fn classify_status(method: &str, status: StatusCode) -> Option<RpcError> {
    if status == StatusCode::OK {
        None
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        Some(RpcError::RateLimited)
    } else if status == StatusCode::REQUEST_TIMEOUT || status.is_server_error() {
        Some(RpcError::Transient(format!("{} returned HTTP {}", method, status)))
    } else {
        Some(RpcError::Terminal(format!("{} returned HTTP {}", method, status)))
    }
}

fn classify_transport(e: reqwest::Error) -> RpcError {
    if e.is_timeout() || e.is_connect() || e.is_request() || e.is_body() {
        RpcError::Transient(e.to_string())
    } else {
        RpcError::Terminal(e.to_string())
    }
}

/// Decode a JSON-RPC envelope, mapping provider error codes onto the taxonomy
fn decode_response<T: DeserializeOwned>(method: &str, text: &str) -> Result<Option<T>, RpcError> {
    let parsed: RpcResponse<T> = serde_json::from_str(text)
        .map_err(|e| RpcError::Terminal(format!("{}: malformed response: {}", method, e)))?;

    if let Some(err) = parsed.error {
        return Err(match err.code {
            429 | -32429 => RpcError::RateLimited,
            // node is behind or the request timed out server side
            -32004 | -32005 | -32603 => RpcError::Transient(err.message),
            _ => RpcError::Terminal(format!("{} error {}: {}", method, err.code, err.message)),
        });
    }

    Ok(parsed.result)
}

#[async_trait]
impl RpcProvider for HttpRpcClient {
    async fn get_signatures_for_address(
        &self,
        address: &str,
        limit: usize,
        before: Option<&str>,
    ) -> Result<Vec<SignatureInfo>, RpcError> {
        let mut opts = json!({ "limit": limit });
        if let Some(before) = before {
            opts["before"] = json!(before);
        }

        let result: Option<Vec<SignatureInfo>> = self
            .call("getSignaturesForAddress", json!([address, opts]))
            .await?;
        Ok(result.unwrap_or_default())
    }

    async fn get_transaction(
        &self,
        signature: &str,
        commitment: TxStatus,
    ) -> Result<Option<RpcTransaction>, RpcError> {
        self.call(
            "getTransaction",
            json!([signature, {
                "encoding": "json",
                "commitment": commitment.as_str(),
                "maxSupportedTransactionVersion": 0
            }]),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_transaction_with_loaded_addresses() {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": {
                "slot": 250_000_000u64,
                "blockTime": 1_700_000_000i64,
                "meta": {
                    "err": null,
                    "fee": 5000,
                    "preBalances": [10, 20, 30, 40],
                    "postBalances": [10, 20, 30, 40],
                    "preTokenBalances": [],
                    "postTokenBalances": [],
                    "loadedAddresses": { "writable": ["W1"], "readonly": ["R1"] }
                },
                "transaction": {
                    "signatures": ["sig"],
                    "message": { "accountKeys": ["A", { "pubkey": "B", "signer": false }] }
                }
            }
        })
        .to_string();

        let tx: RpcTransaction = decode_response("getTransaction", &body).unwrap().unwrap();
        assert_eq!(tx.slot, 250_000_000);
        assert_eq!(tx.block_time, Some(1_700_000_000));
        assert_eq!(tx.account_keys(), vec!["A", "B", "W1", "R1"]);
        assert_eq!(tx.meta.unwrap().fee, 5000);
    }

    #[test]
    fn null_result_is_none() {
        let body = r#"{"jsonrpc":"2.0","id":1,"result":null}"#;
        let tx: Option<RpcTransaction> = decode_response("getTransaction", body).unwrap();
        assert!(tx.is_none());
    }

    #[test]
    fn maps_http_status_codes() {
        assert_eq!(classify_status("m", StatusCode::OK), None);
        assert_eq!(
            classify_status("m", StatusCode::TOO_MANY_REQUESTS),
            Some(RpcError::RateLimited)
        );
        assert!(matches!(
            classify_status("m", StatusCode::REQUEST_TIMEOUT),
            Some(RpcError::Transient(_))
        ));
        assert!(matches!(
            classify_status("m", StatusCode::SERVICE_UNAVAILABLE),
            Some(RpcError::Transient(_))
        ));
        assert!(matches!(
            classify_status("getTransaction", StatusCode::NOT_FOUND),
            Some(RpcError::Terminal(msg)) if msg.contains("404")
        ));
    }

    #[tokio::test]
    async fn rate_limited_http_response_maps_to_rate_limited() {
        use axum::{http::StatusCode as AxumStatus, routing::post, Router};

        let app = Router::new().route("/", post(|| async { AxumStatus::TOO_MANY_REQUESTS }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });

        let client = HttpRpcClient::new(&format!("http://{}/", addr), None).unwrap();
        let err = client
            .get_signatures_for_address("Wallet", 10, None)
            .await
            .unwrap_err();
        assert_eq!(err, RpcError::RateLimited);
    }

    #[test]
    fn maps_provider_error_codes() {
        let limited = r#"{"jsonrpc":"2.0","id":1,"error":{"code":429,"message":"Too many requests"}}"#;
        let behind = r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32005,"message":"Node is behind"}}"#;
        let invalid = r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32602,"message":"Invalid param"}}"#;

        assert_eq!(
            decode_response::<Value>("m", limited).unwrap_err(),
            RpcError::RateLimited
        );
        assert!(matches!(
            decode_response::<Value>("m", behind).unwrap_err(),
            RpcError::Transient(_)
        ));
        assert!(matches!(
            decode_response::<Value>("m", invalid).unwrap_err(),
            RpcError::Terminal(_)
        ));
        assert!(matches!(
            decode_response::<Value>("m", "<html>").unwrap_err(),
            RpcError::Terminal(_)
        ));
    }

    #[test]
    fn signature_info_flags_failed_entries() {
        let entries: Vec<SignatureInfo> = serde_json::from_value(json!([
            { "signature": "ok", "slot": 2, "blockTime": 20, "err": null, "confirmationStatus": "finalized" },
            { "signature": "bad", "slot": 1, "blockTime": null, "err": { "InstructionError": [0, "Custom"] } }
        ]))
        .unwrap();

        assert!(!entries[0].failed());
        assert!(entries[1].failed());
        assert_eq!(entries[1].block_time, None);
    }
}
