//! Tick-keyed join of the three per-tick streams.
//!
//! Ticks, condition reads and fee reads arrive independently and, since
//! sampling runs concurrently, not necessarily in order. The join holds
//! partial records keyed by tick and releases an `Opportunity` once all
//! three parts of a tick are in. Releases are strictly increasing: when a
//! tick completes, every older partial is dropped as stale, and parts for
//! ticks at or below the last release are ignored.

use std::collections::BTreeMap;
use tracing::debug;

use crate::types::{ConditionSnapshot, FeeSnapshot, Opportunity, Tick};

/// One part of a tick's record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    Tick(Tick),
    Condition(ConditionSnapshot),
    Fee(FeeSnapshot),
    /// Sampling for this tick failed; it will never complete.
    Failed(Tick),
}

impl Component {
    pub fn tick(&self) -> Tick {
        match self {
            Component::Tick(t) | Component::Failed(t) => *t,
            Component::Condition(c) => c.tick,
            Component::Fee(f) => f.tick,
        }
    }
}

#[derive(Debug, Default)]
struct Partial {
    seen: bool,
    condition: Option<ConditionSnapshot>,
    fee: Option<FeeSnapshot>,
}

impl Partial {
    fn complete(&self, tick: Tick) -> Option<Opportunity> {
        match (self.seen, self.condition, self.fee) {
            (true, Some(condition), Some(fee)) => Some(Opportunity { tick, condition, fee }),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct TickJoin {
    partials: BTreeMap<Tick, Partial>,
    last_released: Option<Tick>,
}

impl TickJoin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one part. Returns the joined record if this part completed it.
    pub fn push(&mut self, component: Component) -> Option<Opportunity> {
        let tick = component.tick();
        if self.last_released.is_some_and(|last| tick <= last) {
            debug!(tick, "Late component for a superseded block ignored");
            return None;
        }

        if let Component::Failed(_) = component {
            self.partials.remove(&tick);
            return None;
        }

        let partial = self.partials.entry(tick).or_default();
        match component {
            Component::Tick(_) => partial.seen = true,
            Component::Condition(c) => partial.condition = Some(c),
            Component::Fee(f) => partial.fee = Some(f),
            Component::Failed(_) => {}
        }

        let opportunity = partial.complete(tick)?;
        self.partials.remove(&tick);

        let newer = self.partials.split_off(&tick);
        let stale = std::mem::replace(&mut self.partials, newer);
        for skipped in stale.keys() {
            debug!(tick = skipped, "Incomplete block skipped");
        }

        self.last_released = Some(tick);
        Some(opportunity)
    }

    /// Ticks still waiting on parts.
    pub fn pending(&self) -> usize {
        self.partials.len()
    }
}
