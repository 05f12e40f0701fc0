//! State sampler: one condition read and one fee read per tick.

use anyhow::Result;
use std::sync::Arc;

use crate::chain::contract::EmberContract;
use crate::chain::ChainClient;
use crate::types::{ConditionSnapshot, FeeSnapshot, Tick, Wei};

/// Priority headroom folded into the ceiling candidate (1.5 gwei).
pub const CEILING_PRIORITY_HEADROOM: Wei = 1_500_000_000;

/// Derive the fee snapshot from a block's base fee, falling back to the
/// legacy gas price on chains without one.
pub fn fee_snapshot(tick: Tick, base_fee: Option<Wei>, gas_price: Wei) -> FeeSnapshot {
    match base_fee {
        Some(base) => FeeSnapshot {
            tick,
            ceiling_candidate: Some(base.saturating_mul(2).saturating_add(CEILING_PRIORITY_HEADROOM)),
            fallback_floor: base,
        },
        None => FeeSnapshot {
            tick,
            ceiling_candidate: None,
            fallback_floor: gas_price,
        },
    }
}

#[derive(Clone)]
pub struct StateSampler {
    chain: Arc<dyn ChainClient>,
    contract: EmberContract,
}

impl StateSampler {
    pub fn new(chain: Arc<dyn ChainClient>, contract: EmberContract) -> Self {
        Self { chain, contract }
    }

    /// Read the current ember at `tick`.
    pub async fn condition(&self, tick: Tick) -> Result<ConditionSnapshot> {
        let value = self.contract.current_ember(tick).await?;
        Ok(ConditionSnapshot { tick, value })
    }

    /// Read the fee market at `tick`.
    pub async fn fee(&self, tick: Tick) -> Result<FeeSnapshot> {
        match self.chain.base_fee(tick).await? {
            Some(base) => Ok(fee_snapshot(tick, Some(base), 0)),
            None => {
                let gas_price = self.chain.gas_price().await?;
                Ok(fee_snapshot(tick, None, gas_price))
            }
        }
    }

    /// Both reads, issued together. Either failing fails the tick.
    pub async fn sample(&self, tick: Tick) -> Result<(ConditionSnapshot, FeeSnapshot)> {
        tokio::try_join!(self.condition(tick), self.fee(tick))
    }
}
