//! Dispatch controller.
//!
//! Admitted opportunities pass through an exhaust gate: while one dispatch
//! is in flight every further opportunity is dropped, never queued. The
//! forwarded call runs on its own task so ticks keep flowing; the gate
//! reopens when that call settles, whatever its result.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::FeeSettings;
use crate::types::{
    to_fixed_gwei, DispatchOutcome, EffectiveFee, FeeSnapshot, Opportunity, SniperError, Tick,
};

// ---------------------------------------------------------------------------
// Dispatcher capability
// ---------------------------------------------------------------------------

/// One way of getting the mint on chain. Chosen once at startup.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Submit one attempt for the opportunity seen at `tick`.
    async fn submit(&self, fee: EffectiveFee, tick: Tick) -> Result<DispatchOutcome>;

    fn name(&self) -> &'static str;
}

// ---------------------------------------------------------------------------
// Exhaust gate
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    Idle,
    InFlight,
}

#[derive(Debug, Default)]
pub struct ExhaustGate {
    in_flight: AtomicBool,
}

impl ExhaustGate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Idle -> InFlight. `None` if a dispatch already holds the gate.
    pub fn try_acquire(self: &Arc<Self>) -> Option<GatePermit> {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| GatePermit { gate: Arc::clone(self) })
    }

    pub fn state(&self) -> DispatchState {
        if self.in_flight.load(Ordering::Acquire) {
            DispatchState::InFlight
        } else {
            DispatchState::Idle
        }
    }
}

/// Holding a permit is being InFlight. Dropping it returns the gate to Idle.
#[derive(Debug)]
pub struct GatePermit {
    gate: Arc<ExhaustGate>,
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        self.gate.in_flight.store(false, Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// Fees
// ---------------------------------------------------------------------------

/// `max(ceiling candidate, fallback floor, configured minimum) + priority`.
pub fn effective_fee(fee: &FeeSnapshot, settings: &FeeSettings) -> EffectiveFee {
    let base = fee
        .ceiling_candidate
        .unwrap_or(0)
        .max(fee.fallback_floor)
        .max(settings.min_max_fee);
    EffectiveFee {
        max_fee_per_gas: base.saturating_add(settings.priority_fee),
        max_priority_fee_per_gas: settings.priority_fee,
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

/// What happened to an offered opportunity.
#[derive(Debug)]
pub enum Offer {
    /// Forwarded to the dispatcher. The handle yields the outcome, or
    /// `None` if the attempt failed.
    Forwarded(JoinHandle<Option<DispatchOutcome>>),
    /// A dispatch was already in flight.
    Dropped,
}

pub struct DispatchController {
    gate: Arc<ExhaustGate>,
    dispatcher: Arc<dyn Dispatcher>,
    fees: FeeSettings,
    fatal: Option<mpsc::UnboundedSender<anyhow::Error>>,
}

impl DispatchController {
    pub fn new(dispatcher: Arc<dyn Dispatcher>, fees: FeeSettings) -> Self {
        Self {
            gate: ExhaustGate::new(),
            dispatcher,
            fees,
            fatal: None,
        }
    }

    /// Route fatal dispatch errors (signer unavailable) to `tx` so the
    /// pipeline can exit.
    pub fn on_fatal(mut self, tx: mpsc::UnboundedSender<anyhow::Error>) -> Self {
        self.fatal = Some(tx);
        self
    }

    pub fn state(&self) -> DispatchState {
        self.gate.state()
    }

    /// Offer an admitted opportunity. Must be called from a Tokio runtime.
    pub fn offer(&self, opp: &Opportunity) -> Offer {
        let Some(permit) = self.gate.try_acquire() else {
            info!(tick = opp.tick, ember = opp.condition.value, "Mint in flight, opportunity dropped");
            return Offer::Dropped;
        };

        let fee = effective_fee(&opp.fee, &self.fees);
        let tick = opp.tick;
        let dispatcher = Arc::clone(&self.dispatcher);
        let fatal = self.fatal.clone();

        info!(
            tick,
            via = dispatcher.name(),
            max_fee_gwei = %to_fixed_gwei(fee.max_fee_per_gas, 2),
            priority_fee_gwei = %to_fixed_gwei(fee.max_priority_fee_per_gas, 2),
            "Sending mint"
        );

        let handle = tokio::spawn(async move {
            let _permit = permit;
            match dispatcher.submit(fee, tick).await {
                Ok(outcome) => {
                    info!(tick, %outcome, "Mint submitted");
                    Some(outcome)
                }
                Err(e) => {
                    let is_fatal = e
                        .downcast_ref::<SniperError>()
                        .is_some_and(SniperError::is_fatal_for_dispatch);
                    if is_fatal {
                        error!(tick, error = %e, "Dispatch failed fatally");
                        if let Some(tx) = fatal {
                            let _ = tx.send(e);
                        }
                    } else {
                        warn!(tick, error = %e, "Dispatch failed, waiting for the next opportunity");
                    }
                    None
                }
            }
        });
        Offer::Forwarded(handle)
    }
}
