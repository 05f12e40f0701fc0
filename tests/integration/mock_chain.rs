//! Mock chain and relay for integration testing.
//!
//! Deterministic, in-memory `ChainClient` and `BundleRelay`
//! implementations. Block height, ember, fees, logs and the mempool are
//! fully controllable from test code; every state-changing call is
//! recorded.

use alloy::primitives::{keccak256, Address, Bytes, B256, U256};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ember_sniper::chain::contract::{encode_minted, is_current_ember_call};
use ember_sniper::chain::{CallRequest, ChainClient, NonceTag, RawLog};
use ember_sniper::relay::{Bundle, BundleRelay, SimulationReport};
use ember_sniper::types::*;

#[derive(Debug, Default)]
struct ChainState {
    height: Tick,
    embers: HashMap<Tick, u64>,
    base_fees: HashMap<Tick, Option<Wei>>,
    gas_price: Wei,
    gas_estimate: u64,
    balance: Wei,
    nonce: u64,
    logs: Vec<RawLog>,
    transactions: HashMap<B256, TxView>,
    receipts: HashMap<B256, ReceiptView>,
    sent: Vec<Bytes>,
    ember_reads: Vec<Tick>,
    fail_calls: bool,
    call_delay: Duration,
}

/// A mock chain for deterministic testing.
#[derive(Clone)]
pub struct MockChain {
    name: String,
    contract: Address,
    state: Arc<Mutex<ChainState>>,
    /// Mempool hashes this connection has yet to report.
    pending: Arc<Mutex<Vec<B256>>>,
    /// If set, all operations will return this error.
    force_error: Arc<Mutex<Option<String>>>,
}

impl MockChain {
    /// A chain at `height` with the given ember and base fee there.
    pub fn new(contract: Address, height: Tick, ember: u64, base_fee: Option<Wei>) -> Self {
        let chain = Self {
            name: "mock".to_string(),
            contract,
            state: Arc::new(Mutex::new(ChainState {
                gas_price: 20 * GWEI,
                gas_estimate: 90_000,
                balance: ETHER,
                ..Default::default()
            })),
            pending: Arc::new(Mutex::new(Vec::new())),
            force_error: Arc::new(Mutex::new(None)),
        };
        chain.set_block(height, ember, base_fee);
        chain
    }

    /// Move to `height` and record the ember and base fee there.
    pub fn set_block(&self, height: Tick, ember: u64, base_fee: Option<Wei>) {
        let mut s = self.state.lock().unwrap();
        s.height = height;
        s.embers.insert(height, ember);
        s.base_fees.insert(height, base_fee);
    }

    /// Next block with the given ember and base fee.
    pub fn advance(&self, ember: u64, base_fee: Option<Wei>) -> Tick {
        let next = self.height() + 1;
        self.set_block(next, ember, base_fee);
        next
    }

    pub fn height(&self) -> Tick {
        self.state.lock().unwrap().height
    }

    /// Force all subsequent operations to return an error.
    pub fn set_error(&self, msg: &str) {
        *self.force_error.lock().unwrap() = Some(msg.to_string());
    }

    /// Make `eth_call` fail while leaving everything else up.
    pub fn fail_calls(&self, fail: bool) {
        self.state.lock().unwrap().fail_calls = fail;
    }

    /// Slow every `eth_call` down by `delay`.
    pub fn set_call_delay(&self, delay: Duration) {
        self.state.lock().unwrap().call_delay = delay;
    }

    pub fn set_nonce(&self, nonce: u64) {
        self.state.lock().unwrap().nonce = nonce;
    }

    /// Emit a `Minted` event in the current block.
    pub fn mint_event(&self, minter: Address, ember: u64, tx_hash: B256) -> ActionEvent {
        let mut s = self.state.lock().unwrap();
        let event = ActionEvent {
            minter,
            token_id: U256::from(s.logs.len() + 1),
            tick: s.height,
            condition: ember,
            tx_hash,
        };
        let log = encode_minted(self.contract, &event, s.height);
        s.logs.push(log);
        event
    }

    pub fn add_transaction(&self, tx: TxView) {
        self.state.lock().unwrap().transactions.insert(tx.hash, tx);
    }

    pub fn add_receipt(&self, hash: B256, receipt: ReceiptView) {
        self.state.lock().unwrap().receipts.insert(hash, receipt);
    }

    /// Another connection to the same chain, with its own mempool view.
    pub fn connection(&self, name: &str) -> Self {
        Self {
            name: name.to_string(),
            pending: Arc::new(Mutex::new(Vec::new())),
            ..self.clone()
        }
    }

    pub fn push_pending(&self, hash: B256) {
        self.pending.lock().unwrap().push(hash);
    }

    /// Raw transactions broadcast so far.
    pub fn sent(&self) -> Vec<Bytes> {
        self.state.lock().unwrap().sent.clone()
    }

    /// Blocks at which the ember was read.
    pub fn ember_reads(&self) -> Vec<Tick> {
        self.state.lock().unwrap().ember_reads.clone()
    }

    fn check_error(&self) -> Result<()> {
        match self.force_error.lock().unwrap().as_ref() {
            Some(msg) => Err(anyhow!("{msg}")),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ChainClient for MockChain {
    async fn chain_id(&self) -> Result<u64> {
        self.check_error()?;
        Ok(1)
    }

    async fn block_number(&self) -> Result<Tick> {
        self.check_error()?;
        Ok(self.height())
    }

    async fn base_fee(&self, tick: Tick) -> Result<Option<Wei>> {
        self.check_error()?;
        let s = self.state.lock().unwrap();
        Ok(s.base_fees.get(&tick).copied().flatten())
    }

    async fn gas_price(&self) -> Result<Wei> {
        self.check_error()?;
        Ok(self.state.lock().unwrap().gas_price)
    }

    async fn call(&self, request: &CallRequest, tick: Option<Tick>) -> Result<Bytes> {
        self.check_error()?;
        let delay = self.state.lock().unwrap().call_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut s = self.state.lock().unwrap();
        if s.fail_calls {
            return Err(anyhow!("execution timeout"));
        }
        if request.to != self.contract || !is_current_ember_call(&request.input) {
            return Err(anyhow!("unexpected call to {}", request.to));
        }
        let at = tick.unwrap_or(s.height);
        s.ember_reads.push(at);
        let ember = s.embers.get(&at).copied().unwrap_or_default();
        Ok(Bytes::from(U256::from(ember).to_be_bytes::<32>().to_vec()))
    }

    async fn estimate_gas(&self, _request: &CallRequest) -> Result<u64> {
        self.check_error()?;
        Ok(self.state.lock().unwrap().gas_estimate)
    }

    async fn balance(&self, _address: Address) -> Result<Wei> {
        self.check_error()?;
        Ok(self.state.lock().unwrap().balance)
    }

    async fn nonce(&self, _address: Address, _tag: NonceTag) -> Result<u64> {
        self.check_error()?;
        Ok(self.state.lock().unwrap().nonce)
    }

    async fn send_raw_transaction(&self, raw: &Bytes) -> Result<B256> {
        self.check_error()?;
        let mut s = self.state.lock().unwrap();
        s.sent.push(raw.clone());
        s.nonce += 1;
        Ok(keccak256(raw))
    }

    async fn transaction(&self, hash: B256) -> Result<Option<TxView>> {
        self.check_error()?;
        Ok(self.state.lock().unwrap().transactions.get(&hash).cloned())
    }

    async fn receipt(&self, hash: B256) -> Result<Option<ReceiptView>> {
        self.check_error()?;
        Ok(self.state.lock().unwrap().receipts.get(&hash).copied())
    }

    async fn logs(&self, address: Address, topic0: B256, from: Tick, to: Tick) -> Result<Vec<RawLog>> {
        self.check_error()?;
        let s = self.state.lock().unwrap();
        Ok(s.logs
            .iter()
            .filter(|l| l.address == address && l.topics.first() == Some(&topic0))
            .filter(|l| l.block_number.is_some_and(|b| b >= from && b <= to))
            .cloned()
            .collect())
    }

    async fn new_pending_filter(&self) -> Result<String> {
        self.check_error()?;
        Ok("0x1".to_string())
    }

    async fn pending_changes(&self, _filter_id: &str) -> Result<Vec<B256>> {
        self.check_error()?;
        Ok(std::mem::take(&mut *self.pending.lock().unwrap()))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

// ---------------------------------------------------------------------------
// Relay
// ---------------------------------------------------------------------------

/// A mock bundle relay recording every simulation and submission.
#[derive(Clone, Default)]
pub struct MockRelay {
    simulated: Arc<Mutex<Vec<Bundle>>>,
    submitted: Arc<Mutex<Vec<Bundle>>>,
    resolved: Arc<Mutex<Vec<BundleResolution>>>,
    /// If set, every simulation fails with this message.
    simulation_error: Arc<Mutex<Option<String>>>,
}

impl MockRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_simulation(&self, msg: &str) {
        *self.simulation_error.lock().unwrap() = Some(msg.to_string());
    }

    pub fn clear_simulation_error(&self) {
        *self.simulation_error.lock().unwrap() = None;
    }

    pub fn simulated(&self) -> Vec<Bundle> {
        self.simulated.lock().unwrap().clone()
    }

    pub fn submitted(&self) -> Vec<Bundle> {
        self.submitted.lock().unwrap().clone()
    }

    pub fn resolved(&self) -> Vec<BundleResolution> {
        self.resolved.lock().unwrap().clone()
    }
}

#[async_trait]
impl BundleRelay for MockRelay {
    async fn simulate(&self, bundle: &Bundle) -> Result<SimulationReport> {
        self.simulated.lock().unwrap().push(bundle.clone());
        if let Some(msg) = self.simulation_error.lock().unwrap().as_ref() {
            return Err(SniperError::Simulation(msg.clone()).into());
        }
        Ok(SimulationReport {
            gas_used: 90_000,
            coinbase_diff: 0,
        })
    }

    async fn submit(&self, bundle: &Bundle) -> Result<String> {
        self.submitted.lock().unwrap().push(bundle.clone());
        Ok(format!("{:?}", bundle.tx_hash))
    }

    async fn resolution(&self, _bundle: &Bundle) -> Result<BundleResolution> {
        tokio::time::sleep(Duration::from_millis(5)).await;
        self.resolved.lock().unwrap().push(BundleResolution::ExpiredWithoutInclusion);
        Ok(BundleResolution::ExpiredWithoutInclusion)
    }

    fn name(&self) -> &str {
        "mock-relay"
    }
}
