//! Private bundle dispatcher.
//!
//! Each attempt builds a fresh single-transaction bundle around the
//! safe-mint wrapper's `mintTo(desiredEmber, us)`, targets the next block
//! only, simulates it, and submits it. A failed simulation ends the
//! attempt before anything reaches the relay's submission endpoint. The
//! resolution is awaited on a detached task and only logged.

use alloy::primitives::{Address, U256};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::dispatch::Dispatcher;
use crate::chain::contract::mint_to_calldata;
use crate::chain::wallet::{ActionRequest, Wallet};
use crate::chain::{CallRequest, ChainClient, NonceTag};
use crate::relay::{Bundle, BundleRelay};
use crate::types::{
    format_ether, BundleResolution, DispatchOutcome, EffectiveFee, Tick, Wei,
};

/// Spread a tip over the gas limit and add it to both fee fields.
pub fn with_tip(fee: EffectiveFee, tip: Option<Wei>, gas_limit: u64) -> EffectiveFee {
    let per_gas = match tip {
        Some(tip) if gas_limit > 0 => tip / Wei::from(gas_limit),
        _ => 0,
    };
    EffectiveFee {
        max_fee_per_gas: fee.max_fee_per_gas.saturating_add(per_gas),
        max_priority_fee_per_gas: fee.max_priority_fee_per_gas.saturating_add(per_gas),
    }
}

pub struct BundleDispatcher {
    chain: Arc<dyn ChainClient>,
    wallet: Arc<Wallet>,
    relay: Arc<dyn BundleRelay>,
    safe_mint: Address,
    desired_ember: u64,
    tip: Option<Wei>,
}

impl BundleDispatcher {
    pub fn new(
        chain: Arc<dyn ChainClient>,
        wallet: Arc<Wallet>,
        relay: Arc<dyn BundleRelay>,
        safe_mint: Address,
        desired_ember: u64,
        tip: Option<Wei>,
    ) -> Self {
        Self {
            chain,
            wallet,
            relay,
            safe_mint,
            desired_ember,
            tip,
        }
    }

    fn spawn_resolution(&self, bundle: Bundle) {
        let relay = Arc::clone(&self.relay);
        tokio::spawn(async move {
            match relay.resolution(&bundle).await {
                Ok(BundleResolution::Included) => info!(
                    bundle = %bundle.id,
                    block = bundle.target_tick,
                    tx_hash = %bundle.tx_hash,
                    "Bundle included"
                ),
                Ok(resolution) => warn!(
                    bundle = %bundle.id,
                    block = bundle.target_tick,
                    %resolution,
                    "Bundle not included"
                ),
                Err(e) => warn!(bundle = %bundle.id, error = %e, "Bundle resolution unknown"),
            }
        });
    }
}

#[async_trait]
impl Dispatcher for BundleDispatcher {
    async fn submit(&self, fee: EffectiveFee, tick: Tick) -> Result<DispatchOutcome> {
        let from = self.wallet.address();
        let input = mint_to_calldata(self.desired_ember, from);

        // 1. Estimate the act-on-behalf call.
        let request = CallRequest::new(self.safe_mint, input.clone()).from(from);
        let (estimate, nonce) = tokio::try_join!(
            self.chain.estimate_gas(&request),
            self.chain.nonce(from, NonceTag::Latest),
        )
        .context("Failed to prepare bundle")?;
        let gas_limit = estimate.saturating_mul(2);
        let fee = with_tip(fee, self.tip, gas_limit);

        // 2. Sign and package for the next block only.
        let signed = self
            .wallet
            .sign(&ActionRequest {
                to: self.safe_mint,
                input,
                value: U256::ZERO,
                nonce,
                gas_limit,
                fee,
            })
            .await?;
        let bundle = Bundle::new(signed, from, tick + 1);
        debug!(
            bundle = %bundle.id,
            block = bundle.target_tick,
            gas_limit,
            tip_eth = %format_ether(self.tip.unwrap_or(0)),
            "Bundle built"
        );

        // 3. Simulate; any failure ends the attempt here.
        let report = self.relay.simulate(&bundle).await.with_context(|| {
            format!("Simulation for block {} aborted the attempt", bundle.target_tick)
        })?;
        info!(
            bundle = %bundle.id,
            block = bundle.target_tick,
            gas_used = report.gas_used,
            coinbase_diff_eth = %format_ether(report.coinbase_diff),
            "Bundle simulated"
        );

        // 4. Submit.
        let bundle_id = self
            .relay
            .submit(&bundle)
            .await
            .with_context(|| format!("{} rejected the bundle", self.relay.name()))?;
        let outcome = DispatchOutcome::BundleSubmitted {
            bundle_id,
            tx_hash: bundle.tx_hash,
            target_tick: bundle.target_tick,
        };

        // 5. Await the resolution off the dispatch path.
        self.spawn_resolution(bundle);
        Ok(outcome)
    }

    fn name(&self) -> &'static str {
        "private"
    }
}
