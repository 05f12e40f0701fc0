//! JSON-RPC client over HTTP.
//!
//! One `RpcClient` holds an ordered list of endpoints. Each request goes
//! to the first endpoint; transport failures fall through to the next one,
//! while JSON-RPC error responses (reverts, nonce conflicts, ...) are
//! returned as-is since another node would answer the same.
//!
//! `split()` yields one single-endpoint client per URL for the feeds that
//! must watch every connection independently.

use alloy::primitives::{Address, Bytes, B256, U256, U64};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::{CallRequest, ChainClient, NonceTag, RawLog};
use crate::types::{ReceiptView, SniperError, Tick, TxView, Wei};

// ---------------------------------------------------------------------------
// Wire types (JSON-RPC → Rust). Only the fields we read.
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcBlock {
    #[serde(default)]
    base_fee_per_gas: Option<U256>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcTransaction {
    hash: B256,
    from: Address,
    #[serde(default)]
    to: Option<Address>,
    #[serde(default)]
    input: Bytes,
    nonce: U64,
    #[serde(default)]
    max_fee_per_gas: Option<U256>,
    #[serde(default)]
    max_priority_fee_per_gas: Option<U256>,
    #[serde(default)]
    gas_price: Option<U256>,
}

impl From<RpcTransaction> for TxView {
    fn from(tx: RpcTransaction) -> Self {
        // Legacy transactions only carry a gas price; it is both caps.
        let legacy = tx.gas_price.map(|p| p.saturating_to::<u128>());
        TxView {
            hash: tx.hash,
            from: tx.from,
            to: tx.to,
            input: tx.input,
            nonce: tx.nonce.to::<u64>(),
            max_fee_per_gas: tx.max_fee_per_gas.map(|v| v.saturating_to::<u128>()).or(legacy),
            max_priority_fee_per_gas: tx
                .max_priority_fee_per_gas
                .map(|v| v.saturating_to::<u128>())
                .or(legacy),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcReceipt {
    #[serde(default)]
    block_number: Option<U64>,
    gas_used: U256,
    #[serde(default)]
    effective_gas_price: Option<U256>,
    #[serde(default)]
    status: Option<U64>,
}

impl From<RpcReceipt> for ReceiptView {
    fn from(r: RpcReceipt) -> Self {
        ReceiptView {
            block_number: r.block_number.map(|n| n.to::<u64>()),
            gas_used: r.gas_used.saturating_to::<u128>(),
            effective_gas_price: r
                .effective_gas_price
                .map(|p| p.saturating_to::<u128>())
                .unwrap_or_default(),
            success: r.status.map(|s| s == U64::from(1)).unwrap_or(true),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcLog {
    address: Address,
    topics: Vec<B256>,
    data: Bytes,
    #[serde(default)]
    block_number: Option<U64>,
    #[serde(default)]
    transaction_hash: Option<B256>,
}

impl From<RpcLog> for RawLog {
    fn from(l: RpcLog) -> Self {
        RawLog {
            address: l.address,
            topics: l.topics,
            data: l.data,
            block_number: l.block_number.map(|n| n.to::<u64>()),
            tx_hash: l.transaction_hash,
        }
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// HTTP JSON-RPC client with ordered fallback.
#[derive(Clone)]
pub struct RpcClient {
    http: Client,
    endpoints: Arc<Vec<String>>,
    label: String,
    next_id: Arc<AtomicU64>,
}

impl RpcClient {
    /// Build a client over `endpoints`, tried in order.
    ///
    /// `ws://` / `wss://` URLs are rewritten to `http://` / `https://`.
    pub fn new(endpoints: &[String], timeout: Duration) -> Result<Self> {
        if endpoints.is_empty() {
            return Err(SniperError::Config("no RPC endpoints".into()).into());
        }
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self::with_http(http, endpoints.iter().map(|e| normalize_url(e)).collect()))
    }

    fn with_http(http: Client, endpoints: Vec<String>) -> Self {
        let label = endpoints.join(",");
        Self {
            http,
            endpoints: Arc::new(endpoints),
            label,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// One client per endpoint, sharing the HTTP connection pool.
    pub fn split(&self) -> Vec<RpcClient> {
        self.endpoints
            .iter()
            .map(|url| Self::with_http(self.http.clone(), vec![url.clone()]))
            .collect()
    }

    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    /// Issue `method` with `params`, falling back across endpoints on
    /// transport failure.
    pub async fn request<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        let payload = json!({
            "jsonrpc": "2.0",
            "id": self.next_id.fetch_add(1, Ordering::Relaxed),
            "method": method,
            "params": params,
        });

        for url in self.endpoints.iter() {
            let response = match self.http.post(url).json(&payload).send().await {
                Ok(r) => r,
                Err(e) => {
                    warn!(endpoint = %url, method, error = %e, "RPC transport failure, trying next endpoint");
                    continue;
                }
            };
            let body: RpcResponse = match response.json().await {
                Ok(b) => b,
                Err(e) => {
                    warn!(endpoint = %url, method, error = %e, "Malformed RPC response, trying next endpoint");
                    continue;
                }
            };

            if let Some(err) = body.error {
                return Err(SniperError::Rpc {
                    method: method.to_string(),
                    message: format!("{} (code {})", err.message, err.code),
                }
                .into());
            }

            let result = body.result.unwrap_or(Value::Null);
            debug!(endpoint = %url, method, "RPC ok");
            return serde_json::from_value(result)
                .map_err(|e| SniperError::Decode(format!("{method}: {e}")).into());
        }

        Err(SniperError::AllEndpointsFailed {
            method: method.to_string(),
        }
        .into())
    }
}

/// Block heights go over the wire as hex quantities.
pub fn block_tag(tick: Tick) -> String {
    format!("0x{tick:x}")
}

fn normalize_url(url: &str) -> String {
    let url = url.trim();
    if let Some(rest) = url.strip_prefix("wss://") {
        return format!("https://{rest}");
    }
    if let Some(rest) = url.strip_prefix("ws://") {
        return format!("http://{rest}");
    }
    url.to_string()
}

fn call_object(request: &CallRequest) -> Value {
    let mut obj = json!({
        "to": request.to,
        "data": request.input,
    });
    if let Some(from) = request.from {
        obj["from"] = json!(from);
    }
    if let Some(value) = request.value {
        obj["value"] = json!(value);
    }
    obj
}

#[async_trait]
impl ChainClient for RpcClient {
    async fn chain_id(&self) -> Result<u64> {
        let id: U64 = self.request("eth_chainId", json!([])).await?;
        Ok(id.to::<u64>())
    }

    async fn block_number(&self) -> Result<Tick> {
        let n: U64 = self.request("eth_blockNumber", json!([])).await?;
        Ok(n.to::<u64>())
    }

    async fn base_fee(&self, tick: Tick) -> Result<Option<Wei>> {
        let block: Option<RpcBlock> = self
            .request("eth_getBlockByNumber", json!([block_tag(tick), false]))
            .await?;
        let block = block.ok_or_else(|| SniperError::Rpc {
            method: "eth_getBlockByNumber".into(),
            message: format!("block {tick} not found"),
        })?;
        Ok(block.base_fee_per_gas.map(|f| f.saturating_to::<u128>()))
    }

    async fn gas_price(&self) -> Result<Wei> {
        let price: U256 = self.request("eth_gasPrice", json!([])).await?;
        Ok(price.saturating_to::<u128>())
    }

    async fn call(&self, request: &CallRequest, tick: Option<Tick>) -> Result<Bytes> {
        let tag = tick.map(block_tag).unwrap_or_else(|| "latest".to_string());
        self.request("eth_call", json!([call_object(request), tag])).await
    }

    async fn estimate_gas(&self, request: &CallRequest) -> Result<u64> {
        let gas: U64 = self.request("eth_estimateGas", json!([call_object(request)])).await?;
        Ok(gas.to::<u64>())
    }

    async fn balance(&self, address: Address) -> Result<Wei> {
        let balance: U256 = self.request("eth_getBalance", json!([address, "latest"])).await?;
        Ok(balance.saturating_to::<u128>())
    }

    async fn nonce(&self, address: Address, tag: NonceTag) -> Result<u64> {
        let n: U64 = self
            .request("eth_getTransactionCount", json!([address, tag.as_str()]))
            .await?;
        Ok(n.to::<u64>())
    }

    async fn send_raw_transaction(&self, raw: &Bytes) -> Result<B256> {
        self.request("eth_sendRawTransaction", json!([raw])).await
    }

    async fn transaction(&self, hash: B256) -> Result<Option<TxView>> {
        let tx: Option<RpcTransaction> = self
            .request("eth_getTransactionByHash", json!([hash]))
            .await?;
        Ok(tx.map(TxView::from))
    }

    async fn receipt(&self, hash: B256) -> Result<Option<ReceiptView>> {
        let r: Option<RpcReceipt> = self
            .request("eth_getTransactionReceipt", json!([hash]))
            .await?;
        Ok(r.map(ReceiptView::from))
    }

    async fn logs(
        &self,
        address: Address,
        topic0: B256,
        from: Tick,
        to: Tick,
    ) -> Result<Vec<RawLog>> {
        let filter = json!({
            "address": address,
            "topics": [topic0],
            "fromBlock": block_tag(from),
            "toBlock": block_tag(to),
        });
        let logs: Vec<RpcLog> = self.request("eth_getLogs", json!([filter])).await?;
        Ok(logs.into_iter().map(RawLog::from).collect())
    }

    async fn new_pending_filter(&self) -> Result<String> {
        self.request("eth_newPendingTransactionFilter", json!([])).await
    }

    async fn pending_changes(&self, filter_id: &str) -> Result<Vec<B256>> {
        self.request("eth_getFilterChanges", json!([filter_id])).await
    }

    fn name(&self) -> &str {
        &self.label
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
