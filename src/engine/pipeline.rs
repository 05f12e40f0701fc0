//! Startup preflight and the long-running pipeline.
//!
//! ```text
//! TickSource ─┬─> sampling ─> TickJoin ─> evaluator ─> DispatchController
//!             └─> EventFeed ─┬─> TerminationWatcher (closes TickSource)
//!                            └─> AdversarialMonitor (confirmed)
//! PendingFeed ─> AdversarialMonitor (pending, optional)
//! ```

use alloy::primitives::Address;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::dispatch::{DispatchController, Dispatcher, Offer};
use super::evaluator::OpportunityEvaluator;
use super::join::{Component, TickJoin};
use super::monitor::AdversarialMonitor;
use super::sampler::StateSampler;
use super::termination::{Shutdown, TerminationWatcher};
use crate::chain::contract::EmberContract;
use crate::chain::feeds::{EventFeed, PendingFeed, TickSource, TICK_CHANNEL_CAPACITY};
use crate::chain::ChainClient;
use crate::config::FeeSettings;
use crate::types::{format_ether, ActionEvent, AdversarialReport, DispatchOutcome, Tick, Wei, GWEI};

/// Max fee assumed for the cost estimate when the chain has no base fee.
const FALLBACK_MAX_FEE: Wei = 100 * GWEI;

const EVENT_CHANNEL_CAPACITY: usize = 256;
const PENDING_CHANNEL_CAPACITY: usize = 4096;

// ---------------------------------------------------------------------------
// Preflight
// ---------------------------------------------------------------------------

/// Numbers gathered once before the first tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Preflight {
    pub gas_estimate: u64,
    /// Gas limit for every public mint: twice the estimate.
    pub gas_limit: u64,
    pub estimated_cost: Wei,
    pub balance: Wei,
}

/// Estimate `mint()` once, price it at the current fee market, and report
/// what the account can afford.
pub async fn preflight(
    chain: &Arc<dyn ChainClient>,
    contract: &EmberContract,
    from: Address,
    priority_fee: Wei,
) -> Result<Preflight> {
    let sampler = StateSampler::new(Arc::clone(chain), contract.clone());
    let gas_estimate = chain
        .estimate_gas(&contract.mint_request(from))
        .await
        .context("Failed to estimate mint gas")?;
    info!(gas_estimate, "Mint estimate");

    let latest = chain.block_number().await?;
    let (fee, balance) = tokio::try_join!(sampler.fee(latest), chain.balance(from))?;
    let max_fee = fee.ceiling_candidate.unwrap_or(FALLBACK_MAX_FEE);
    let estimated_cost = Wei::from(gas_estimate).saturating_mul(priority_fee.saturating_add(max_fee));

    info!(cost_eth = %format_ether(estimated_cost), "Estimated gas cost");
    info!(balance_eth = %format_ether(balance), address = %from, "Ether left for minting");

    Ok(Preflight {
        gas_estimate,
        gas_limit: gas_estimate.saturating_mul(2),
        estimated_cost,
        balance,
    })
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct PipelineSettings {
    pub poll_interval: Duration,
    pub max_failed_polls: u32,
    pub watch_pending: bool,
}

pub struct Pipeline {
    chain: Arc<dyn ChainClient>,
    endpoints: Vec<Arc<dyn ChainClient>>,
    contract: EmberContract,
    own: Address,
    evaluator: OpportunityEvaluator,
    dispatcher: Arc<dyn Dispatcher>,
    fees: FeeSettings,
    settings: PipelineSettings,
    shutdown: Shutdown,
    reports: Option<mpsc::UnboundedSender<AdversarialReport>>,
}

impl Pipeline {
    pub fn new(
        chain: Arc<dyn ChainClient>,
        contract: EmberContract,
        own: Address,
        evaluator: OpportunityEvaluator,
        dispatcher: Arc<dyn Dispatcher>,
        fees: FeeSettings,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            endpoints: vec![Arc::clone(&chain)],
            chain,
            contract,
            own,
            evaluator,
            dispatcher,
            fees,
            settings,
            shutdown: Shutdown::new(),
            reports: None,
        }
    }

    /// Poll these connections for ticks and pending hashes instead of the
    /// single read client.
    pub fn with_endpoints(mut self, endpoints: Vec<Arc<dyn ChainClient>>) -> Self {
        if !endpoints.is_empty() {
            self.endpoints = endpoints;
        }
        self
    }

    /// Also hand every adversarial report to `tx`.
    pub fn with_reports(mut self, tx: mpsc::UnboundedSender<AdversarialReport>) -> Self {
        self.reports = Some(tx);
        self
    }

    /// Handle for stopping the pipeline from outside (e.g. ctrl-c).
    pub fn shutdown(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Run until our own mint lands at the target, shutdown is signalled,
    /// or a fatal error occurs.
    pub async fn run(self) -> Result<()> {
        let (tick_tx, sample_ticks) = broadcast::channel::<Tick>(TICK_CHANNEL_CAPACITY);
        let event_ticks = tick_tx.subscribe();
        let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel();

        let monitor = AdversarialMonitor::new(Arc::clone(&self.chain), self.own, self.contract.address());
        let watcher = TerminationWatcher::new(
            self.own,
            self.evaluator.target(),
            self.evaluator.policy(),
            self.shutdown.clone(),
        );

        // Confirmed events: termination first, then the monitor.
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (confirmed_tx, confirmed_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        tokio::spawn(EventFeed::new(Arc::clone(&self.chain), self.contract.address()).run(event_ticks, event_tx));
        tokio::spawn(route_events(self.own, watcher, event_rx, confirmed_tx));
        tokio::spawn(monitor.clone().run_confirmed(confirmed_rx, self.reports.clone()));

        if self.settings.watch_pending {
            let (pending_tx, pending_rx) = mpsc::channel(PENDING_CHANNEL_CAPACITY);
            let feed = PendingFeed::new(self.endpoints.clone(), self.settings.poll_interval, self.shutdown.clone());
            tokio::spawn(feed.run(pending_tx));
            tokio::spawn(monitor.run_pending(pending_rx, self.reports.clone()));
        }

        // Sampling feeds the join; the tick source is started last so no
        // subscriber misses the first height.
        let (component_tx, mut component_rx) = mpsc::unbounded_channel();
        let sampler = StateSampler::new(Arc::clone(&self.chain), self.contract.clone());
        tokio::spawn(sample_ticks_into(sampler, sample_ticks, component_tx, self.shutdown.clone()));

        let source = TickSource::new(
            self.endpoints.clone(),
            self.settings.poll_interval,
            self.settings.max_failed_polls,
            self.shutdown.clone(),
        );
        let source_task = tokio::spawn(source.run(tick_tx));

        let controller = DispatchController::new(Arc::clone(&self.dispatcher), self.fees).on_fatal(fatal_tx);
        let mut join = TickJoin::new();
        let mut last_dispatch: Option<JoinHandle<Option<DispatchOutcome>>> = None;

        info!(
            target_ember = self.evaluator.target(),
            policy = %self.evaluator.policy(),
            via = self.dispatcher.name(),
            "Pipeline running"
        );

        // Once shutdown is signalled no sample still in flight may reach the
        // controller, whatever it reads.
        let fatal = loop {
            tokio::select! {
                biased;
                Some(err) = fatal_rx.recv() => break Some(err),
                _ = self.shutdown.wait() => break None,
                component = component_rx.recv() => {
                    let Some(component) = component else { break None };
                    let Some(opp) = join.push(component) else { continue };
                    if !self.evaluator.evaluate(&opp).is_admitted() || self.shutdown.is_signalled() {
                        continue;
                    }
                    if let Offer::Forwarded(handle) = controller.offer(&opp) {
                        last_dispatch = Some(handle);
                    }
                }
            }
        };

        if let Some(err) = fatal {
            self.shutdown.signal();
            return Err(err);
        }

        // A submission cannot be safely abandoned halfway.
        if let Some(handle) = last_dispatch.filter(|h| !h.is_finished()) {
            info!("Waiting for the in-flight mint to settle");
            let _ = handle.await;
        }

        source_task.await.context("Tick source task panicked")?
    }
}

/// Emit the tick itself, then sample it on its own task so a slow read
/// never holds up later ticks. Samples still running at shutdown are
/// abandoned.
async fn sample_ticks_into(
    sampler: StateSampler,
    mut ticks: broadcast::Receiver<Tick>,
    out: mpsc::UnboundedSender<Component>,
    shutdown: Shutdown,
) {
    loop {
        let tick = match ticks.recv().await {
            Ok(t) => t,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Sampling fell behind; older blocks skipped");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        if shutdown.is_signalled() || out.send(Component::Tick(tick)).is_err() {
            break;
        }
        let sampler = sampler.clone();
        let out = out.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let sampled = tokio::select! {
                biased;
                _ = shutdown.wait() => return,
                sampled = sampler.sample(tick) => sampled,
            };
            let parts = match sampled {
                Ok((condition, fee)) => vec![Component::Condition(condition), Component::Fee(fee)],
                Err(e) => {
                    warn!(tick, error = %e, "Sampling failed, block skipped");
                    vec![Component::Failed(tick)]
                }
            };
            for part in parts {
                let _ = out.send(part);
            }
        });
    }
    debug!("Sampling stopped");
}

/// Fan confirmed events out to the termination watcher and the monitor.
async fn route_events(
    own: Address,
    watcher: TerminationWatcher,
    mut events: mpsc::Receiver<ActionEvent>,
    monitor: mpsc::Sender<ActionEvent>,
) {
    while let Some(event) = events.recv().await {
        if event.minter == own {
            info!(
                token_id = %event.token_id,
                ember = event.condition,
                block = event.tick,
                "Minted token"
            );
        }
        watcher.observe(&event);
        // Never wait on the monitor: a backlog of slow lookups must not
        // delay the termination check for later events.
        match monitor.try_send(event) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(event)) => warn!(
                minter = %event.minter,
                ember = event.condition,
                block = event.tick,
                tx_hash = %event.tx_hash,
                "Monitor backlog full, confirmed mint not inspected"
            ),
        }
    }
}
