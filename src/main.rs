//! EMBER SNIPER: mints one Prometheans token at the desired ember
//!
//! Entry point. Loads configuration, initialises structured logging,
//! runs the startup preflight, and drives the block pipeline until our
//! own mint lands at the target ember or Ctrl+C is pressed.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use ember_sniper::chain::contract::EmberContract;
use ember_sniper::chain::rpc::RpcClient;
use ember_sniper::chain::wallet::Wallet;
use ember_sniper::chain::ChainClient;
use ember_sniper::config::{self, Strategy};
use ember_sniper::engine::bundle::BundleDispatcher;
use ember_sniper::engine::dispatch::Dispatcher;
use ember_sniper::engine::evaluator::OpportunityEvaluator;
use ember_sniper::engine::pipeline::{preflight, Pipeline, PipelineSettings};
use ember_sniper::engine::public::PublicDispatcher;
use ember_sniper::relay::flashbots::FlashbotsRelay;
use ember_sniper::types::{format_ether, to_fixed_gwei};

const BANNER: &str = r#"
  _____ __  __ ____  _____ ____
 | ____|  \/  | __ )| ____|  _ \
 |  _| | |\/| |  _ \|  _| | |_) |
 | |___| |  | | |_) | |___|  _ <
 |_____|_|  |_|____/|_____|_| \_\

  Prometheans ember sniper
  v0.1.0 — one mint, one ember
"#;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    // Load configuration from TOML
    let config_path = std::env::var("SNIPER_CONFIG").unwrap_or_else(|_| "config.toml".into());
    let cfg = config::AppConfig::load(&config_path)?;

    // Initialise structured logging
    init_logging();

    // Print startup banner
    println!("{BANNER}");
    let desired_ember = cfg.desired_ember()?;
    let fees = cfg.fee_settings()?;
    info!(
        agent_name = %cfg.agent.name,
        desired_ember,
        policy = %cfg.target.policy,
        strategy = ?cfg.dispatch.strategy,
        max_fee_gwei = %to_fixed_gwei(fees.cost_ceiling, 2),
        priority_fee_gwei = %to_fixed_gwei(fees.priority_fee, 2),
        "Attempting to mint one"
    );

    // -- Initialise components -------------------------------------------

    let timeout = Duration::from_millis(cfg.network.request_timeout_ms);
    let rpc = RpcClient::new(&cfg.network.endpoints, timeout)?;
    let endpoints: Vec<Arc<dyn ChainClient>> = rpc
        .split()
        .into_iter()
        .map(|c| Arc::new(c) as Arc<dyn ChainClient>)
        .collect();
    let chain: Arc<dyn ChainClient> = Arc::new(rpc);

    let chain_id = match cfg.network.chain_id {
        Some(id) => id,
        None => chain.chain_id().await.context("Failed to read chain id")?,
    };
    let wallet = Arc::new(Wallet::from_secret(&cfg.private_key()?, chain_id)?);
    info!(chain_id, address = %wallet.address(), "Signer ready");

    let contract = EmberContract::new(Arc::clone(&chain), cfg.target.contract);

    // Make one estimate of the mint; it barely moves between blocks.
    let pre = preflight(&chain, &contract, wallet.address(), fees.priority_fee).await?;
    if pre.balance < pre.estimated_cost {
        warn!(
            balance_eth = %format_ether(pre.balance),
            cost_eth = %format_ether(pre.estimated_cost),
            "Balance below the estimated mint cost"
        );
    }

    // Transmission strategy, fixed for the whole run
    let dispatcher: Arc<dyn Dispatcher> = match cfg.dispatch.strategy {
        Strategy::Public => Arc::new(PublicDispatcher::new(
            Arc::clone(&chain),
            Arc::clone(&wallet),
            cfg.target.contract,
            pre.gas_limit,
        )),
        Strategy::Private => {
            let relay_url = cfg
                .dispatch
                .relay_url
                .clone()
                .context("dispatch.relay_url is required for the private strategy")?;
            let relay = FlashbotsRelay::new(
                relay_url,
                Arc::clone(&chain),
                timeout,
                Duration::from_millis(cfg.network.poll_interval_ms),
            )?;
            info!(relay = %cfg.dispatch.relay_url.as_deref().unwrap_or_default(), "Using private bundles");
            Arc::new(BundleDispatcher::new(
                Arc::clone(&chain),
                Arc::clone(&wallet),
                Arc::new(relay),
                cfg.target.safe_mint_contract,
                desired_ember,
                fees.tip,
            ))
        }
    };

    let evaluator = OpportunityEvaluator::new(desired_ember, cfg.target.policy, fees.cost_ceiling);
    let pipeline = Pipeline::new(
        Arc::clone(&chain),
        contract,
        wallet.address(),
        evaluator,
        dispatcher,
        fees,
        PipelineSettings {
            poll_interval: Duration::from_millis(cfg.network.poll_interval_ms),
            max_failed_polls: cfg.network.max_failed_polls,
            watch_pending: cfg.monitor.watch_pending,
        },
    )
    .with_endpoints(endpoints);

    // -- Main loop -------------------------------------------------------

    let shutdown = pipeline.shutdown();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received.");
            shutdown.signal();
        }
    });

    info!("Watching blocks. Press Ctrl+C to stop.");
    if let Err(e) = pipeline.run().await {
        error!(error = %e, "Pipeline stopped on a fatal error");
        return Err(e);
    }

    info!("EMBER SNIPER shut down cleanly.");
    Ok(())
}

/// Initialise the `tracing` subscriber.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("ember_sniper=info"));

    let json_logging = std::env::var("SNIPER_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}
