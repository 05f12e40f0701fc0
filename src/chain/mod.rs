//! Chain access.
//!
//! Defines the `ChainClient` trait the engine talks to and provides:
//! - `rpc`: JSON-RPC over HTTP with ordered fallback across endpoints
//! - `contract`: the mint contracts' ABI surface
//! - `wallet`: funding-key transaction signing
//! - `feeds`: tick, confirmed-event and pending-action feeds

pub mod contract;
pub mod feeds;
pub mod rpc;
pub mod wallet;

use alloy::primitives::{Address, Bytes, B256, U256};
use anyhow::Result;
use async_trait::async_trait;

use crate::types::{ReceiptView, Tick, TxView, Wei};

/// A read-only contract call or gas-estimate request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRequest {
    pub from: Option<Address>,
    pub to: Address,
    pub input: Bytes,
    pub value: Option<U256>,
}

impl CallRequest {
    pub fn new(to: Address, input: impl Into<Bytes>) -> Self {
        Self {
            from: None,
            to,
            input: input.into(),
            value: None,
        }
    }

    pub fn from(mut self, from: Address) -> Self {
        self.from = Some(from);
        self
    }
}

/// Which state a nonce lookup reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceTag {
    Latest,
    Pending,
}

impl NonceTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            NonceTag::Latest => "latest",
            NonceTag::Pending => "pending",
        }
    }
}

/// A log entry as returned by `eth_getLogs`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLog {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    pub block_number: Option<Tick>,
    pub tx_hash: Option<B256>,
}

/// Abstraction over an Ethereum JSON-RPC node (or a fallback set of them).
///
/// Every method is a single bounded round trip. Implementors decide how
/// redundancy across connections is handled.
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn chain_id(&self) -> Result<u64>;

    /// Latest block height.
    async fn block_number(&self) -> Result<Tick>;

    /// Base fee of the given block; `None` on pre-London chains.
    async fn base_fee(&self, tick: Tick) -> Result<Option<Wei>>;

    /// Legacy gas price.
    async fn gas_price(&self) -> Result<Wei>;

    /// `eth_call` against the state at `tick` (latest when `None`).
    async fn call(&self, request: &CallRequest, tick: Option<Tick>) -> Result<Bytes>;

    async fn estimate_gas(&self, request: &CallRequest) -> Result<u64>;

    async fn balance(&self, address: Address) -> Result<Wei>;

    async fn nonce(&self, address: Address, tag: NonceTag) -> Result<u64>;

    /// Broadcast a signed transaction. Returns once the node accepts it.
    async fn send_raw_transaction(&self, raw: &Bytes) -> Result<B256>;

    async fn transaction(&self, hash: B256) -> Result<Option<TxView>>;

    async fn receipt(&self, hash: B256) -> Result<Option<ReceiptView>>;

    /// Logs emitted by `address` with first topic `topic0` in `from..=to`.
    async fn logs(&self, address: Address, topic0: B256, from: Tick, to: Tick)
        -> Result<Vec<RawLog>>;

    /// Install a pending-transaction filter; returns its id.
    async fn new_pending_filter(&self) -> Result<String>;

    /// Hashes seen by the filter since the previous poll.
    async fn pending_changes(&self, filter_id: &str) -> Result<Vec<B256>>;

    /// Identifier for logging (endpoint URL or mock name).
    fn name(&self) -> &str;
}
