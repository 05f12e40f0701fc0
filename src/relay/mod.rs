//! Private bundle relays.
//!
//! Defines the `BundleRelay` trait and the `Bundle` it carries, and
//! provides a Flashbots-compatible JSON-RPC implementation.

pub mod flashbots;

use alloy::primitives::{Address, Bytes, B256};
use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

use crate::chain::wallet::SignedAction;
use crate::types::{BundleResolution, Tick};

/// One signed action packaged for exactly one block.
///
/// A bundle is built fresh per dispatch attempt and never retargeted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bundle {
    /// Relay-side replacement id; unique per attempt.
    pub id: Uuid,
    pub txs: Vec<Bytes>,
    pub tx_hash: B256,
    pub signer: Address,
    pub nonce: u64,
    pub target_tick: Tick,
}

impl Bundle {
    pub fn new(action: SignedAction, signer: Address, target_tick: Tick) -> Self {
        Self {
            id: Uuid::new_v4(),
            txs: vec![action.raw],
            tx_hash: action.hash,
            signer,
            nonce: action.nonce,
            target_tick,
        }
    }
}

/// What a successful simulation reports.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimulationReport {
    pub gas_used: u64,
    pub coinbase_diff: u128,
}

/// Abstraction over a private submission channel.
///
/// `simulate` must fail for any bundle that would not land cleanly;
/// callers treat that failure as final for the attempt.
#[async_trait]
pub trait BundleRelay: Send + Sync {
    async fn simulate(&self, bundle: &Bundle) -> Result<SimulationReport>;

    /// Submit for `bundle.target_tick`; returns the relay's bundle hash.
    async fn submit(&self, bundle: &Bundle) -> Result<String>;

    /// Wait until the target block has passed and classify the outcome.
    async fn resolution(&self, bundle: &Bundle) -> Result<BundleResolution>;

    fn name(&self) -> &str;
}
