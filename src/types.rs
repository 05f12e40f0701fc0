//! Shared types for the ember sniper.
//!
//! These types form the data model used across the chain, relay and
//! engine modules. Snapshots and opportunities are immutable once built;
//! the only mutable shared state in the crate lives in the dispatch
//! controller.

use alloy::primitives::{Address, B256};
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::fmt;

/// One sampling point: a block height.
pub type Tick = u64;

/// An amount of wei. Fees per gas and totals both fit comfortably.
pub type Wei = u128;

pub const GWEI: Wei = 1_000_000_000;
pub const ETHER: Wei = 1_000_000_000_000_000_000;

// ---------------------------------------------------------------------------
// Unit helpers
// ---------------------------------------------------------------------------

/// Convert a gwei amount (possibly fractional) to wei. Sub-wei precision is
/// truncated and negative input is rejected.
pub fn gwei_to_wei(gwei: Decimal) -> Result<Wei, SniperError> {
    decimal_to_wei(gwei, 9)
}

/// Convert an ether amount (possibly fractional) to wei.
pub fn ether_to_wei(ether: Decimal) -> Result<Wei, SniperError> {
    decimal_to_wei(ether, 18)
}

fn decimal_to_wei(amount: Decimal, decimals: u32) -> Result<Wei, SniperError> {
    if amount.is_sign_negative() {
        return Err(SniperError::Config(format!("negative amount: {amount}")));
    }
    let scaled = amount
        .checked_mul(Decimal::from(10u64.pow(decimals)))
        .ok_or_else(|| SniperError::Config(format!("amount out of range: {amount}")))?;
    scaled
        .trunc()
        .to_u128()
        .ok_or_else(|| SniperError::Config(format!("amount out of range: {amount}")))
}

/// Render a wei amount as gwei with `places` decimals, e.g. `"41.50"`.
pub fn to_fixed_gwei(wei: Wei, places: u32) -> String {
    format_units(wei, 9, places)
}

/// Render a wei amount as ether with six decimals.
pub fn format_ether(wei: Wei) -> String {
    format_units(wei, 18, 6)
}

fn format_units(wei: Wei, decimals: u32, places: u32) -> String {
    let scaled = i128::try_from(wei)
        .ok()
        .and_then(|v| Decimal::try_from_i128_with_scale(v, decimals).ok());
    match scaled {
        Some(value) => format!("{:.*}", places as usize, value),
        // Beyond Decimal's 96-bit mantissa; whole units are plenty for a log line.
        None => format!("{}", wei / 10u128.pow(decimals)),
    }
}

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

/// The observed condition (current ember) at a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConditionSnapshot {
    pub tick: Tick,
    pub value: u64,
}

/// The cost-market reading at a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeSnapshot {
    pub tick: Tick,
    /// Preferred max-fee-per-gas. Absent on chains without a base fee.
    pub ceiling_candidate: Option<Wei>,
    /// Last base fee (or legacy gas price) used when no ceiling is known.
    pub fallback_floor: Wei,
}

/// The joined per-tick record handed to the evaluator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Opportunity {
    pub tick: Tick,
    pub condition: ConditionSnapshot,
    pub fee: FeeSnapshot,
}

// ---------------------------------------------------------------------------
// Admission policy
// ---------------------------------------------------------------------------

/// Which side of the target the ember approaches from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EdgePolicy {
    /// Admit exactly one block before the target: `condition == target + 1`.
    RisingEdge,
    /// Admit anywhere at or below the block before the target:
    /// `condition <= target + 1`.
    FallingEdge,
}

impl EdgePolicy {
    /// Whether a sampled condition is the moment to act.
    pub fn admits(&self, condition: u64, target: u64) -> bool {
        let trigger = target.saturating_add(1);
        match self {
            EdgePolicy::RisingEdge => condition == trigger,
            EdgePolicy::FallingEdge => condition <= trigger,
        }
    }

    /// Whether one of our own confirmed actions reached the goal.
    pub fn is_terminal(&self, condition: u64, target: u64) -> bool {
        match self {
            EdgePolicy::RisingEdge => condition == target,
            EdgePolicy::FallingEdge => condition <= target,
        }
    }
}

impl fmt::Display for EdgePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EdgePolicy::RisingEdge => write!(f, "rising-edge"),
            EdgePolicy::FallingEdge => write!(f, "falling-edge"),
        }
    }
}

impl std::str::FromStr for EdgePolicy {
    type Err = SniperError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "rising-edge" | "rising" => Ok(EdgePolicy::RisingEdge),
            "falling-edge" | "falling" => Ok(EdgePolicy::FallingEdge),
            _ => Err(SniperError::Config(format!("unknown edge policy: {s}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// Fees attached to one dispatch attempt, per gas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EffectiveFee {
    pub max_fee_per_gas: Wei,
    pub max_priority_fee_per_gas: Wei,
}

/// What a dispatcher hands back once its submission call settles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Broadcast accepted by the network layer (not yet mined).
    Broadcast { tx_hash: B256 },
    /// Bundle accepted by the relay for `target_tick`.
    BundleSubmitted { bundle_id: String, tx_hash: B256, target_tick: Tick },
}

impl fmt::Display for DispatchOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchOutcome::Broadcast { tx_hash } => write!(f, "broadcast {tx_hash}"),
            DispatchOutcome::BundleSubmitted { bundle_id, tx_hash, target_tick } => {
                write!(f, "bundle {bundle_id} ({tx_hash}) for block {target_tick}")
            }
        }
    }
}

/// Terminal outcome of a submitted bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleResolution {
    Included,
    NonceTooHigh,
    ExpiredWithoutInclusion,
}

impl fmt::Display for BundleResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BundleResolution::Included => write!(f, "included"),
            BundleResolution::NonceTooHigh => write!(f, "account nonce too high"),
            BundleResolution::ExpiredWithoutInclusion => write!(f, "block passed without inclusion"),
        }
    }
}

// ---------------------------------------------------------------------------
// Chain observations
// ---------------------------------------------------------------------------

/// A confirmed `Minted` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionEvent {
    pub minter: Address,
    pub token_id: alloy::primitives::U256,
    /// Block the contract recorded the mint at.
    pub tick: Tick,
    /// Ember of the minted token.
    pub condition: u64,
    pub tx_hash: B256,
}

/// The slice of a transaction the monitor cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxView {
    pub hash: B256,
    pub from: Address,
    pub to: Option<Address>,
    pub input: alloy::primitives::Bytes,
    pub nonce: u64,
    pub max_fee_per_gas: Option<Wei>,
    pub max_priority_fee_per_gas: Option<Wei>,
}

/// The slice of a receipt the monitor and relay care about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiptView {
    pub block_number: Option<Tick>,
    pub gas_used: u128,
    pub effective_gas_price: Wei,
    pub success: bool,
}

impl ReceiptView {
    /// Total cost paid for the transaction.
    pub fn cost(&self) -> Wei {
        self.gas_used.saturating_mul(self.effective_gas_price)
    }
}

// ---------------------------------------------------------------------------
// Adversarial reports
// ---------------------------------------------------------------------------

/// Where a competing action was seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportSource {
    Confirmed,
    Pending,
}

impl fmt::Display for ReportSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReportSource::Confirmed => write!(f, "confirmed"),
            ReportSource::Pending => write!(f, "pending"),
        }
    }
}

/// Fees a competitor offered or paid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FeePaid {
    pub max_fee_per_gas: Wei,
    pub max_priority_fee_per_gas: Wei,
    /// `gasUsed * effectiveGasPrice`; only known once confirmed.
    pub total_cost: Option<Wei>,
}

/// Advisory record of a competing mint. Never drives control flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdversarialReport {
    pub actor: Address,
    pub tick: Option<Tick>,
    pub observed_condition: Option<u64>,
    /// Absent when the transaction could not be looked up.
    pub fee_paid: Option<FeePaid>,
    pub tx_hash: B256,
    pub source: ReportSource,
    pub observed_at: DateTime<Utc>,
}

impl fmt::Display for AdversarialReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.source, self.actor)?;
        if let Some(fee) = &self.fee_paid {
            write!(
                f,
                " max fee {} gwei, priority {} gwei",
                to_fixed_gwei(fee.max_fee_per_gas, 2),
                to_fixed_gwei(fee.max_priority_fee_per_gas, 2),
            )?;
        }
        if let Some(tick) = self.tick {
            write!(f, " at block {tick}")?;
        }
        if let Some(ember) = self.observed_condition {
            write!(f, " ember {ember}")?;
        }
        if let Some(cost) = self.fee_paid.and_then(|fee| fee.total_cost) {
            write!(f, " cost {} ether", format_ether(cost))?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Classified failures. Everything else travels as `anyhow::Error`.
#[derive(Debug, thiserror::Error)]
pub enum SniperError {
    #[error("RPC error ({method}): {message}")]
    Rpc { method: String, message: String },

    #[error("All endpoints failed for {method}")]
    AllEndpointsFailed { method: String },

    #[error("Bundle simulation failed: {0}")]
    Simulation(String),

    #[error("Relay error: {0}")]
    Relay(String),

    #[error("Signing error: {0}")]
    Signing(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Decode error: {0}")]
    Decode(String),
}

impl SniperError {
    /// Errors with no recovery path: the process should exit.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SniperError::AllEndpointsFailed { .. } | SniperError::Signing(_)
        )
    }

    /// Failures of a single dispatch attempt that end the run. Connectivity
    /// is judged by the tick source over several rounds, not by one request.
    pub fn is_fatal_for_dispatch(&self) -> bool {
        matches!(self, SniperError::Signing(_))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
