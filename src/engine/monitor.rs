//! Adversarial monitor.
//!
//! Read-only and advisory: reports other accounts' mints, both confirmed
//! (from `Minted` events) and pending (from the mempool). Nothing here
//! feeds back into dispatch.

use alloy::primitives::{Address, B256};
use anyhow::Result;
use chrono::Utc;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::chain::contract::is_mint_call;
use crate::chain::ChainClient;
use crate::types::{ActionEvent, AdversarialReport, FeePaid, ReportSource};

/// Pending hashes remembered for de-duplication. Older ones are forgotten
/// first; by then they have long since been mined or dropped.
pub const PENDING_MEMORY: usize = 50_000;

/// Keeps only the first sighting of each pending hash, remembering at most
/// `max_entries` recent hashes.
#[derive(Debug)]
pub struct PendingDeduper {
    seen: HashSet<B256>,
    fifo: VecDeque<B256>,
    max_entries: usize,
}

impl PendingDeduper {
    pub fn new() -> Self {
        Self::with_capacity(PENDING_MEMORY)
    }

    pub fn with_capacity(max_entries: usize) -> Self {
        Self {
            seen: HashSet::new(),
            fifo: VecDeque::new(),
            max_entries: max_entries.max(1),
        }
    }

    /// `true` the first time `hash` is offered.
    pub fn first_sighting(&mut self, hash: B256) -> bool {
        if !self.seen.insert(hash) {
            return false;
        }
        self.fifo.push_back(hash);
        while self.fifo.len() > self.max_entries {
            if let Some(oldest) = self.fifo.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

impl Default for PendingDeduper {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub struct AdversarialMonitor {
    chain: Arc<dyn ChainClient>,
    own: Address,
    contract: Address,
}

impl AdversarialMonitor {
    pub fn new(chain: Arc<dyn ChainClient>, own: Address, contract: Address) -> Self {
        Self { chain, own, contract }
    }

    /// Report a confirmed mint by someone else. Our own mints yield `None`.
    ///
    /// A mint whose transaction cannot be looked up (e.g. a lagging node)
    /// is still reported, without fees.
    pub async fn on_confirmed(&self, event: &ActionEvent) -> Option<AdversarialReport> {
        if event.minter == self.own {
            return None;
        }
        let fee_paid = match tokio::try_join!(
            self.chain.transaction(event.tx_hash),
            self.chain.receipt(event.tx_hash),
        ) {
            Ok((tx, receipt)) => tx.map(|tx| FeePaid {
                max_fee_per_gas: tx.max_fee_per_gas.unwrap_or(0),
                max_priority_fee_per_gas: tx.max_priority_fee_per_gas.unwrap_or(0),
                total_cost: receipt.map(|r| r.cost()),
            }),
            Err(e) => {
                debug!(tx_hash = %event.tx_hash, error = %e, "Cannot look up confirmed mint");
                None
            }
        };

        let report = AdversarialReport {
            actor: event.minter,
            tick: Some(event.tick),
            observed_condition: Some(event.condition),
            fee_paid,
            tx_hash: event.tx_hash,
            source: ReportSource::Confirmed,
            observed_at: Utc::now(),
        };
        warn!(token_id = %event.token_id, tx_hash = %event.tx_hash, "Hostile mint detected: {report}");
        Some(report)
    }

    /// Inspect a pending hash that survived de-duplication.
    pub async fn inspect_pending(&self, hash: B256) -> Result<Option<AdversarialReport>> {
        let Some(tx) = self.chain.transaction(hash).await? else {
            return Ok(None);
        };
        if tx.to != Some(self.contract) || tx.from == self.own {
            return Ok(None);
        }
        debug!(tx_hash = %hash, from = %tx.from, "Pending transaction to the mint contract");
        if !is_mint_call(&tx.input) {
            return Ok(None);
        }

        let report = AdversarialReport {
            actor: tx.from,
            tick: None,
            observed_condition: None,
            fee_paid: Some(FeePaid {
                max_fee_per_gas: tx.max_fee_per_gas.unwrap_or(0),
                max_priority_fee_per_gas: tx.max_priority_fee_per_gas.unwrap_or(0),
                total_cost: None,
            }),
            tx_hash: hash,
            source: ReportSource::Pending,
            observed_at: Utc::now(),
        };
        warn!(tx_hash = %hash, "Hostile pending mint detected: {report}");
        Ok(Some(report))
    }

    /// Consume confirmed events until the feed closes.
    pub async fn run_confirmed(
        self,
        mut events: mpsc::Receiver<ActionEvent>,
        reports: Option<mpsc::UnboundedSender<AdversarialReport>>,
    ) {
        while let Some(event) = events.recv().await {
            if let Some(report) = self.on_confirmed(&event).await {
                forward(&reports, report);
            }
        }
    }

    /// Consume pending hashes until the feed closes. Each unique hash is
    /// inspected on its own task so a slow lookup never holds the stream.
    pub async fn run_pending(
        self,
        mut hashes: mpsc::Receiver<B256>,
        reports: Option<mpsc::UnboundedSender<AdversarialReport>>,
    ) {
        let mut deduper = PendingDeduper::new();
        while let Some(hash) = hashes.recv().await {
            if !deduper.first_sighting(hash) {
                continue;
            }
            let monitor = self.clone();
            let reports = reports.clone();
            tokio::spawn(async move {
                match monitor.inspect_pending(hash).await {
                    Ok(Some(report)) => forward(&reports, report),
                    Ok(None) => {}
                    Err(e) => debug!(tx_hash = %hash, error = %e, "Cannot inspect pending transaction"),
                }
            });
        }
    }
}

fn forward(reports: &Option<mpsc::UnboundedSender<AdversarialReport>>, report: AdversarialReport) {
    if let Some(tx) = reports {
        let _ = tx.send(report);
    }
}
