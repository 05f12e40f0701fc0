//! Configuration loading from TOML with environment variable resolution.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs.
//! The funding key is referenced by env-var name in the config and
//! resolved at runtime via `std::env::var`.

use alloy::primitives::Address;
use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use secrecy::SecretString;
use serde::{Deserialize, Deserializer};
use std::fs;

use crate::types::{ether_to_wei, gwei_to_wei, EdgePolicy, SniperError, Wei};

/// Highest monk rank the contract hands out.
const MAX_MONK_RANK: u64 = 15;

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub agent: AgentConfig,
    pub network: NetworkConfig,
    pub target: TargetConfig,
    #[serde(default)]
    pub fees: FeesConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub wallet: WalletConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AgentConfig {
    pub name: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct NetworkConfig {
    /// RPC endpoints. A single comma-separated string is also accepted.
    #[serde(deserialize_with = "endpoint_list")]
    pub endpoints: Vec<String>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Consecutive rounds with every endpoint down before giving up.
    #[serde(default = "default_max_failed_polls")]
    pub max_failed_polls: u32,
    /// Fetched from the node when absent.
    #[serde(default)]
    pub chain_id: Option<u64>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TargetConfig {
    pub contract: Address,
    pub safe_mint_contract: Address,
    /// Exact ember to mint at. Takes precedence over `monk_rank`.
    #[serde(default)]
    pub desired_ember: Option<u64>,
    /// Monk rank 1..=15 (1 is the highest); ember = rank * 5.
    #[serde(default)]
    pub monk_rank: Option<u64>,
    #[serde(default = "default_policy")]
    pub policy: EdgePolicy,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FeesConfig {
    /// Do not mint while the max fee per gas is above this.
    #[serde(default = "default_max_base_fee_gwei")]
    pub max_base_fee_gwei: Decimal,
    #[serde(default)]
    pub priority_fee_gwei: Decimal,
    /// Floor for the max fee when building a transaction.
    #[serde(default)]
    pub min_max_fee_gwei: Decimal,
}

impl Default for FeesConfig {
    fn default() -> Self {
        Self {
            max_base_fee_gwei: default_max_base_fee_gwei(),
            priority_fee_gwei: Decimal::ZERO,
            min_max_fee_gwei: Decimal::ZERO,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    #[default]
    Public,
    Private,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct DispatchConfig {
    #[serde(default)]
    pub strategy: Strategy,
    #[serde(default)]
    pub relay_url: Option<String>,
    /// Extra payment to the block builder on the private path, in ether.
    #[serde(default)]
    pub tip_eth: Option<Decimal>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct MonitorConfig {
    #[serde(default)]
    pub watch_pending: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WalletConfig {
    #[serde(default = "default_private_key_env")]
    pub private_key_env: String,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            private_key_env: default_private_key_env(),
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_request_timeout_ms() -> u64 {
    5_000
}

fn default_max_failed_polls() -> u32 {
    30
}

fn default_policy() -> EdgePolicy {
    EdgePolicy::RisingEdge
}

fn default_max_base_fee_gwei() -> Decimal {
    dec!(30)
}

fn default_private_key_env() -> String {
    "PRIVATE_KEY".to_string()
}

fn endpoint_list<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        One(String),
        Many(Vec<String>),
    }

    let raw = match Raw::deserialize(deserializer)? {
        Raw::One(s) => s.split(',').map(str::to_string).collect(),
        Raw::Many(v) => v,
    };
    Ok(raw
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect())
}

/// Fee settings converted to wei, ready for the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeSettings {
    pub cost_ceiling: Wei,
    pub priority_fee: Wei,
    pub min_max_fee: Wei,
    pub tip: Option<Wei>,
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        Self::from_toml(&contents).with_context(|| format!("Failed to parse config file: {path}"))
    }

    /// Parse and validate configuration from a TOML string.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), SniperError> {
        if self.network.endpoints.is_empty() {
            return Err(SniperError::Config("network.endpoints is empty".into()));
        }
        if self.network.poll_interval_ms == 0 {
            return Err(SniperError::Config("network.poll_interval_ms must be > 0".into()));
        }
        self.desired_ember()?;
        if self.dispatch.strategy == Strategy::Private && self.dispatch.relay_url.is_none() {
            return Err(SniperError::Config(
                "dispatch.relay_url is required for the private strategy".into(),
            ));
        }
        self.fee_settings()?;
        Ok(())
    }

    /// The ember we want to mint at.
    pub fn desired_ember(&self) -> Result<u64, SniperError> {
        if let Some(ember) = self.target.desired_ember {
            return Ok(ember);
        }
        match self.target.monk_rank {
            Some(rank) if (1..=MAX_MONK_RANK).contains(&rank) => Ok(rank_to_ember(rank)),
            Some(rank) => Err(SniperError::Config(format!(
                "target.monk_rank must be 1-{MAX_MONK_RANK}, got {rank}"
            ))),
            None => Err(SniperError::Config(
                "one of target.desired_ember or target.monk_rank is required".into(),
            )),
        }
    }

    pub fn fee_settings(&self) -> Result<FeeSettings, SniperError> {
        Ok(FeeSettings {
            cost_ceiling: gwei_to_wei(self.fees.max_base_fee_gwei)?,
            priority_fee: gwei_to_wei(self.fees.priority_fee_gwei)?,
            min_max_fee: gwei_to_wei(self.fees.min_max_fee_gwei)?,
            tip: self.dispatch.tip_eth.map(ether_to_wei).transpose()?,
        })
    }

    /// Resolve an environment variable name to its value.
    pub fn resolve_env(env_name: &str) -> Result<String> {
        std::env::var(env_name)
            .with_context(|| format!("Environment variable not set: {env_name}"))
    }

    /// Read the funding key named by `wallet.private_key_env`.
    pub fn private_key(&self) -> Result<SecretString> {
        Self::resolve_env(&self.wallet.private_key_env).map(SecretString::new)
    }
}

/// Monk rank to ember.
pub fn rank_to_ember(rank: u64) -> u64 {
    rank * 5
}
