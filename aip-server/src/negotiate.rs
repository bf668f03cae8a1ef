//! Pre-flight capability and budget negotiation.

use std::sync::Arc;

use aip_primitives::{
    CapabilityCard, ErrorKind, NegotiationRequest, NegotiationResult,
};
use serde_json::Value;
use tracing::debug;

use crate::traits::CostEstimator;

/// Matches a caller's proposal against the capability card.
///
/// Negotiation is a pure function of (card, request, cost estimates): no
/// mutation, no I/O beyond consulting the estimator.
pub struct Negotiator {
    card: Arc<CapabilityCard>,
    estimator: Arc<dyn CostEstimator>,
}

impl Negotiator {
    /// Creates a negotiator over the loaded card and estimator.
    #[must_use]
    pub fn new(card: Arc<CapabilityCard>, estimator: Arc<dyn CostEstimator>) -> Self {
        Self { card, estimator }
    }

    /// Evaluates one proposal.
    ///
    /// Outcomes, in order of precedence:
    /// - no overlap with the card → `rejected` with `VALIDATION_ERROR`;
    /// - overlap, but the budget is below the cheapest overlapping
    ///   capability's minimum → `rejected` with `BUDGET_EXCEEDED`;
    /// - budget covers part of the overlap → `degraded`, the affordable
    ///   subset plus explicitly reduced limits;
    /// - budget covers the full overlap → `accepted`.
    ///
    /// `minimum_cost_usd` always carries the cheapest estimate among the
    /// capabilities the outcome refers to.
    #[must_use]
    pub fn negotiate(&self, request: &NegotiationRequest) -> NegotiationResult {
        let overlap: Vec<(String, f64)> = request
            .capabilities()
            .iter()
            .filter(|name| self.card.supports(name))
            .map(|name| {
                let estimate = self.estimator.estimate(name, &Value::Null);
                (name.clone(), estimate)
            })
            .collect();

        if overlap.is_empty() {
            debug!(requested = ?request.capabilities(), "negotiation rejected: no overlap");
            return NegotiationResult::rejected(ErrorKind::ValidationError, 0.0);
        }

        let budget = request.budget_usd();
        let cheapest = overlap
            .iter()
            .map(|(_, estimate)| *estimate)
            .fold(f64::INFINITY, f64::min);

        let affordable: Vec<(String, f64)> = overlap
            .iter()
            .filter(|(_, estimate)| *estimate <= budget)
            .cloned()
            .collect();

        if affordable.is_empty() {
            debug!(budget, cheapest, "negotiation rejected: budget below minimum");
            return NegotiationResult::rejected(ErrorKind::BudgetExceeded, cheapest);
        }

        let accepted: Vec<String> = affordable.iter().map(|(name, _)| name.clone()).collect();
        let accepted_cheapest = affordable
            .iter()
            .map(|(_, estimate)| *estimate)
            .fold(f64::INFINITY, f64::min);

        if affordable.len() == overlap.len() {
            debug!(?accepted, "negotiation accepted");
            return NegotiationResult::accepted(accepted, accepted_cheapest);
        }

        // Reduced scope: state the tightened output ceiling explicitly,
        // scaled to the share of the per-invoke cost cap the budget covers.
        let limits = *self.card.limits();
        let cap = limits.max_cost_per_invoke();
        let share = (budget / cap).clamp(0.0, 1.0);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let reduced_tokens =
            ((f64::from(limits.max_output_tokens()) * share).floor() as u32).max(1);
        let reduced = limits.with_max_output_tokens(reduced_tokens);

        debug!(?accepted, reduced_tokens, "negotiation degraded");
        NegotiationResult::degraded(accepted, accepted_cheapest, reduced)
    }
}
