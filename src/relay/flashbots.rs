//! Flashbots-compatible relay.
//!
//! Speaks `eth_callBundle` / `eth_sendBundle` over HTTP. Every request is
//! authenticated with `X-Flashbots-Signature: <address>:<signature>`, where
//! the signature is an EIP-191 signature of the hex keccak of the body made
//! by a session key. The session key only identifies us to the relay; it
//! never holds funds.

use alloy::primitives::{hex, keccak256, Address};
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::Signer;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::{Bundle, BundleRelay, SimulationReport};
use crate::chain::rpc::block_tag;
use crate::chain::{ChainClient, NonceTag};
use crate::types::{BundleResolution, ReceiptView, SniperError};

const AUTH_HEADER: &str = "X-Flashbots-Signature";

/// Upper bound on waiting for the target block to be mined.
const RESOLUTION_TIMEOUT: Duration = Duration::from_secs(120);

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RelayResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RelayErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RelayErrorBody {
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CallBundleResult {
    #[serde(default)]
    results: Vec<CallBundleTx>,
    #[serde(default)]
    first_revert: Option<Value>,
    #[serde(default)]
    total_gas_used: Option<u64>,
    #[serde(default)]
    coinbase_diff: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CallBundleTx {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    revert: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendBundleResult {
    bundle_hash: String,
}

/// Turn an `eth_callBundle` result into a report, or the reason the
/// bundle must not be sent.
fn check_simulation(result: CallBundleResult) -> Result<SimulationReport, SniperError> {
    for (i, tx) in result.results.iter().enumerate() {
        if let Some(err) = tx.error.as_ref().or(tx.revert.as_ref()) {
            return Err(SniperError::Simulation(format!("tx {i}: {err}")));
        }
    }
    if let Some(first) = result.first_revert.filter(|v| !v.is_null()) {
        return Err(SniperError::Simulation(format!("first revert: {first}")));
    }
    Ok(SimulationReport {
        gas_used: result.total_gas_used.unwrap_or_default(),
        coinbase_diff: result
            .coinbase_diff
            .and_then(|d| d.parse().ok())
            .unwrap_or_default(),
    })
}

/// Classify a bundle once its target block is behind us.
pub fn classify_resolution(
    receipt: Option<ReceiptView>,
    account_nonce: u64,
    bundle_nonce: u64,
) -> BundleResolution {
    if receipt.is_some() {
        BundleResolution::Included
    } else if account_nonce > bundle_nonce {
        BundleResolution::NonceTooHigh
    } else {
        BundleResolution::ExpiredWithoutInclusion
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct FlashbotsRelay {
    http: Client,
    url: String,
    session: PrivateKeySigner,
    chain: Arc<dyn ChainClient>,
    poll_interval: Duration,
}

impl FlashbotsRelay {
    /// Build a relay client with a fresh random session key.
    pub fn new(
        url: impl Into<String>,
        chain: Arc<dyn ChainClient>,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build relay HTTP client")?;
        let session = PrivateKeySigner::random();
        info!(session = %session.address(), "Relay session key generated");
        Ok(Self {
            http,
            url: url.into(),
            session,
            chain,
            poll_interval,
        })
    }

    pub fn session_address(&self) -> Address {
        self.session.address()
    }

    async fn auth_header(&self, body: &str) -> Result<String, SniperError> {
        let digest = hex::encode_prefixed(keccak256(body.as_bytes()));
        let signature = self
            .session
            .sign_message(digest.as_bytes())
            .await
            .map_err(|e| SniperError::Signing(format!("session key: {e}")))?;
        Ok(format!(
            "{}:{}",
            self.session.address(),
            hex::encode_prefixed(signature.as_bytes())
        ))
    }

    async fn post(&self, method: &str, params: Value) -> Result<Value> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        })
        .to_string();
        let header = self.auth_header(&body).await?;

        let response = self
            .http
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(AUTH_HEADER, header)
            .body(body)
            .send()
            .await
            .map_err(|e| SniperError::Relay(format!("{method}: {e}")))?;

        let status = response.status();
        let parsed: RelayResponse = response
            .json()
            .await
            .map_err(|e| SniperError::Relay(format!("{method}: HTTP {status}: {e}")))?;

        if let Some(err) = parsed.error {
            return Err(SniperError::Relay(format!("{method}: {}", err.message)).into());
        }
        parsed
            .result
            .ok_or_else(|| SniperError::Relay(format!("{method}: missing result")).into())
    }

    fn encoded_txs(bundle: &Bundle) -> Vec<String> {
        bundle.txs.iter().map(hex::encode_prefixed).collect()
    }
}

#[async_trait]
impl BundleRelay for FlashbotsRelay {
    async fn simulate(&self, bundle: &Bundle) -> Result<SimulationReport> {
        let params = json!([{
            "txs": Self::encoded_txs(bundle),
            "blockNumber": block_tag(bundle.target_tick),
            "stateBlockNumber": "latest",
        }]);
        let result = self
            .post("eth_callBundle", params)
            .await
            .map_err(|e| SniperError::Simulation(e.to_string()))?;
        let result: CallBundleResult = serde_json::from_value(result)
            .map_err(|e| SniperError::Simulation(format!("malformed callBundle result: {e}")))?;
        Ok(check_simulation(result)?)
    }

    async fn submit(&self, bundle: &Bundle) -> Result<String> {
        let params = json!([{
            "txs": Self::encoded_txs(bundle),
            "blockNumber": block_tag(bundle.target_tick),
            "replacementUuid": bundle.id.to_string(),
        }]);
        let result = self.post("eth_sendBundle", params).await?;
        let sent: SendBundleResult = serde_json::from_value(result)
            .map_err(|e| SniperError::Relay(format!("malformed sendBundle result: {e}")))?;
        Ok(sent.bundle_hash)
    }

    async fn resolution(&self, bundle: &Bundle) -> Result<BundleResolution> {
        let wait_for_target = async {
            let mut interval = tokio::time::interval(self.poll_interval);
            loop {
                interval.tick().await;
                match self.chain.block_number().await {
                    Ok(height) if height >= bundle.target_tick => return,
                    Ok(_) => {}
                    Err(e) => debug!(error = %e, "Block poll failed while awaiting bundle"),
                }
            }
        };
        tokio::time::timeout(RESOLUTION_TIMEOUT, wait_for_target)
            .await
            .map_err(|_| {
                SniperError::Relay(format!(
                    "block {} not seen within {}s",
                    bundle.target_tick,
                    RESOLUTION_TIMEOUT.as_secs()
                ))
            })?;

        let (receipt, nonce) = tokio::try_join!(
            self.chain.receipt(bundle.tx_hash),
            self.chain.nonce(bundle.signer, NonceTag::Latest),
        )?;
        Ok(classify_resolution(receipt, nonce, bundle.nonce))
    }

    fn name(&self) -> &str {
        &self.url
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
