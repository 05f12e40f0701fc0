//! Push-style feeds built on polling.
//!
//! - `TickSource`: block heights, merged across every endpoint
//! - `EventFeed`: confirmed `Minted` events, one `eth_getLogs` per tick
//! - `PendingFeed`: pending transaction hashes from every endpoint

use alloy::primitives::{Address, B256};
use anyhow::Result;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use super::contract::{decode_minted, minted_topic};
use super::ChainClient;
use crate::engine::termination::Shutdown;
use crate::types::{ActionEvent, SniperError, Tick};

/// Buffer for the tick broadcast. Slow consumers skip ahead.
pub const TICK_CHANNEL_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// Tick source
// ---------------------------------------------------------------------------

/// Polls every endpoint for the latest block and forwards strictly
/// increasing heights. Redundant connections reporting the same height
/// produce one tick.
pub struct TickSource {
    endpoints: Vec<Arc<dyn ChainClient>>,
    poll_interval: Duration,
    max_failed_polls: u32,
    shutdown: Shutdown,
}

impl TickSource {
    pub fn new(
        endpoints: Vec<Arc<dyn ChainClient>>,
        poll_interval: Duration,
        max_failed_polls: u32,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            endpoints,
            poll_interval,
            max_failed_polls,
            shutdown,
        }
    }

    /// Run until shutdown. Dropping `tx` on return closes every derived
    /// per-tick stream.
    ///
    /// Fails once `max_failed_polls` consecutive rounds saw every
    /// endpoint down.
    pub async fn run(self, tx: broadcast::Sender<Tick>) -> Result<()> {
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut last: Option<Tick> = None;
        let mut failed_rounds = 0u32;

        info!(endpoints = self.endpoints.len(), "Tick source started");

        loop {
            tokio::select! {
                _ = self.shutdown.wait() => {
                    info!("Tick source closed");
                    return Ok(());
                }
                _ = interval.tick() => {}
            }

            let heights = join_all(self.endpoints.iter().map(|e| e.block_number())).await;
            let mut best: Option<Tick> = None;
            for (endpoint, height) in self.endpoints.iter().zip(heights) {
                match height {
                    Ok(h) => best = Some(best.map_or(h, |b| b.max(h))),
                    Err(e) => debug!(endpoint = endpoint.name(), error = %e, "Block poll failed"),
                }
            }

            let Some(height) = best else {
                failed_rounds += 1;
                warn!(failed_rounds, "No endpoint answered the block poll");
                if failed_rounds >= self.max_failed_polls {
                    error!("Lost every network connection");
                    return Err(SniperError::AllEndpointsFailed {
                        method: "eth_blockNumber".into(),
                    }
                    .into());
                }
                continue;
            };
            failed_rounds = 0;

            if last.map_or(true, |l| height > l) {
                last = Some(height);
                // No receivers just means nobody is listening yet.
                let _ = tx.send(height);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Confirmed events
// ---------------------------------------------------------------------------

/// Turns ticks into decoded `Minted` events. A failed range is retried
/// on the next tick, so no block is skipped.
pub struct EventFeed {
    chain: Arc<dyn ChainClient>,
    contract: Address,
}

impl EventFeed {
    pub fn new(chain: Arc<dyn ChainClient>, contract: Address) -> Self {
        Self { chain, contract }
    }

    /// Run until the tick stream closes or every event consumer is gone.
    pub async fn run(self, mut ticks: broadcast::Receiver<Tick>, tx: mpsc::Sender<ActionEvent>) {
        let mut next_from: Option<Tick> = None;

        loop {
            let tick = match ticks.recv().await {
                Ok(t) => t,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Event feed lagged; the next range covers the gap");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };

            let from = next_from.unwrap_or(tick);
            if from > tick {
                continue;
            }

            match self.chain.logs(self.contract, minted_topic(), from, tick).await {
                Ok(logs) => {
                    next_from = Some(tick + 1);
                    for log in logs {
                        match decode_minted(&log) {
                            Ok(event) => {
                                if tx.send(event).await.is_err() {
                                    return;
                                }
                            }
                            Err(e) => warn!(error = %e, "Skipping undecodable Minted log"),
                        }
                    }
                }
                Err(e) => {
                    warn!(from, to = tick, error = %e, "Event query failed, retrying next block");
                }
            }
        }
        debug!("Event feed stopped");
    }
}

// ---------------------------------------------------------------------------
// Pending actions
// ---------------------------------------------------------------------------

/// Merges pending transaction hashes from every endpoint. The same hash
/// usually arrives once per endpoint; de-duplication is the consumer's job.
pub struct PendingFeed {
    endpoints: Vec<Arc<dyn ChainClient>>,
    poll_interval: Duration,
    shutdown: Shutdown,
}

impl PendingFeed {
    pub fn new(endpoints: Vec<Arc<dyn ChainClient>>, poll_interval: Duration, shutdown: Shutdown) -> Self {
        Self {
            endpoints,
            poll_interval,
            shutdown,
        }
    }

    pub async fn run(self, tx: mpsc::Sender<B256>) {
        info!(
            providers = self.endpoints.len(),
            "Watching pending transactions"
        );
        let watchers = self.endpoints.iter().map(|endpoint| {
            watch_endpoint(endpoint.clone(), self.poll_interval, self.shutdown.clone(), tx.clone())
        });
        join_all(watchers).await;
        debug!("Pending feed stopped");
    }
}

async fn watch_endpoint(
    endpoint: Arc<dyn ChainClient>,
    poll_interval: Duration,
    shutdown: Shutdown,
    tx: mpsc::Sender<B256>,
) {
    let mut interval = tokio::time::interval(poll_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut filter: Option<String> = None;

    loop {
        tokio::select! {
            _ = shutdown.wait() => return,
            _ = interval.tick() => {}
        }

        let id = match &filter {
            Some(id) => id.clone(),
            None => match endpoint.new_pending_filter().await {
                Ok(id) => {
                    debug!(endpoint = endpoint.name(), filter = %id, "Pending filter installed");
                    filter = Some(id.clone());
                    id
                }
                Err(e) => {
                    warn!(endpoint = endpoint.name(), error = %e, "Cannot install pending filter");
                    continue;
                }
            },
        };

        match endpoint.pending_changes(&id).await {
            Ok(hashes) => {
                for hash in hashes {
                    if tx.send(hash).await.is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                // Filters expire on the node; install a fresh one next round.
                debug!(endpoint = endpoint.name(), error = %e, "Pending filter lost");
                filter = None;
            }
        }
    }
}
