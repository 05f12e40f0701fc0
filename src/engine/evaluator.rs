//! Opportunity evaluator.
//!
//! Two independent gates, both of which must pass:
//! 1. the edge policy admits the sampled ember for the target;
//! 2. the fee snapshot carries a ceiling candidate at or under the
//!    configured cost ceiling. A snapshot without one is never treated as
//!    free.

use tracing::{debug, info};

use crate::types::{to_fixed_gwei, EdgePolicy, Opportunity, Wei};

/// Result of evaluating one opportunity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    WrongCondition,
    NoCeiling,
    TooExpensive { ceiling: Wei },
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted)
    }
}

#[derive(Debug, Clone)]
pub struct OpportunityEvaluator {
    target: u64,
    policy: EdgePolicy,
    cost_ceiling: Wei,
}

impl OpportunityEvaluator {
    pub fn new(target: u64, policy: EdgePolicy, cost_ceiling: Wei) -> Self {
        Self {
            target,
            policy,
            cost_ceiling,
        }
    }

    pub fn target(&self) -> u64 {
        self.target
    }

    pub fn policy(&self) -> EdgePolicy {
        self.policy
    }

    /// Pure admission decision.
    pub fn admission(&self, opp: &Opportunity) -> Admission {
        if !self.policy.admits(opp.condition.value, self.target) {
            return Admission::WrongCondition;
        }
        match opp.fee.ceiling_candidate {
            None => Admission::NoCeiling,
            Some(ceiling) if ceiling > self.cost_ceiling => Admission::TooExpensive { ceiling },
            Some(_) => Admission::Admitted,
        }
    }

    /// Log the sample, decide, and log the decision.
    pub fn evaluate(&self, opp: &Opportunity) -> Admission {
        info!(
            tick = opp.tick,
            ember = opp.condition.value,
            max_fee_gwei = %to_fixed_gwei(opp.fee.ceiling_candidate.unwrap_or(0), 2),
            "Block sampled"
        );

        let admission = self.admission(opp);
        match admission {
            Admission::Admitted => info!(
                tick = opp.tick,
                ember = opp.condition.value,
                target_ember = self.target,
                policy = %self.policy,
                "Opportunity admitted"
            ),
            Admission::WrongCondition => debug!(
                tick = opp.tick,
                ember = opp.condition.value,
                target_ember = self.target,
                "Not the trigger ember"
            ),
            Admission::NoCeiling => debug!(
                tick = opp.tick,
                floor_gwei = %to_fixed_gwei(opp.fee.fallback_floor, 2),
                "No max fee available, rejected"
            ),
            Admission::TooExpensive { ceiling } => info!(
                tick = opp.tick,
                max_fee_gwei = %to_fixed_gwei(ceiling, 2),
                ceiling_gwei = %to_fixed_gwei(self.cost_ceiling, 2),
                "Too expensive to mint at this block"
            ),
        }
        admission
    }
}
