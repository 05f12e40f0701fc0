//! Termination watcher and the process-wide shutdown signal.
//!
//! The only normal exit: one of our own mints lands at the target ember.

use alloy::primitives::Address;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::types::{ActionEvent, EdgePolicy};

/// One-shot shutdown flag shared by every long-running task.
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx: Arc::new(tx), rx }
    }

    /// Raise the flag. Returns `true` only for the call that raised it.
    pub fn signal(&self) -> bool {
        self.tx.send_if_modified(|done| {
            if *done {
                false
            } else {
                *done = true;
                true
            }
        })
    }

    pub fn is_signalled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the flag is raised.
    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        // The sender lives in `self`, so the channel cannot close under us.
        let _ = rx.wait_for(|done| *done).await;
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Watches confirmed mints for our own terminal one.
pub struct TerminationWatcher {
    own: Address,
    target: u64,
    policy: EdgePolicy,
    shutdown: Shutdown,
}

impl TerminationWatcher {
    pub fn new(own: Address, target: u64, policy: EdgePolicy, shutdown: Shutdown) -> Self {
        Self {
            own,
            target,
            policy,
            shutdown,
        }
    }

    /// Feed one confirmed event. Returns `true` if this event ended the run.
    ///
    /// Signalling closes the tick source, which in turn ends every per-tick
    /// stream; later terminal events are ignored.
    pub fn observe(&self, event: &ActionEvent) -> bool {
        if event.minter != self.own {
            return false;
        }
        if !self.policy.is_terminal(event.condition, self.target) {
            debug!(
                ember = event.condition,
                target_ember = self.target,
                "Own mint confirmed off target"
            );
            return false;
        }
        if self.shutdown.signal() {
            info!(
                ember = event.condition,
                token_id = %event.token_id,
                block = event.tick,
                tx_hash = %event.tx_hash,
                "Minted at target ember, shutting down"
            );
            true
        } else {
            false
        }
    }
}
