//! Public dispatcher: sign `mint()` and broadcast it.

use alloy::primitives::{Address, U256};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use super::dispatch::Dispatcher;
use crate::chain::contract::mint_calldata;
use crate::chain::wallet::{ActionRequest, Wallet};
use crate::chain::{ChainClient, NonceTag};
use crate::types::{DispatchOutcome, EffectiveFee, Tick};

pub struct PublicDispatcher {
    chain: Arc<dyn ChainClient>,
    wallet: Arc<Wallet>,
    contract: Address,
    /// Fixed for the whole run; twice the startup estimate.
    gas_limit: u64,
}

impl PublicDispatcher {
    pub fn new(chain: Arc<dyn ChainClient>, wallet: Arc<Wallet>, contract: Address, gas_limit: u64) -> Self {
        Self {
            chain,
            wallet,
            contract,
            gas_limit,
        }
    }
}

#[async_trait]
impl Dispatcher for PublicDispatcher {
    async fn submit(&self, fee: EffectiveFee, tick: Tick) -> Result<DispatchOutcome> {
        let nonce = self
            .chain
            .nonce(self.wallet.address(), NonceTag::Pending)
            .await
            .context("Failed to read account nonce")?;

        let signed = self
            .wallet
            .sign(&ActionRequest {
                to: self.contract,
                input: mint_calldata(),
                value: U256::ZERO,
                nonce,
                gas_limit: self.gas_limit,
                fee,
            })
            .await?;
        debug!(tick, nonce, tx_hash = %signed.hash, "Mint signed");

        let tx_hash = self
            .chain
            .send_raw_transaction(&signed.raw)
            .await
            .context("Network rejected the mint")?;
        Ok(DispatchOutcome::Broadcast { tx_hash })
    }

    fn name(&self) -> &'static str {
        "public"
    }
}
