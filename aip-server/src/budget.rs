//! Per-call budget arithmetic.

use aip_primitives::{ErrorEnvelope, ErrorKind};
use thiserror::Error;

/// Raised when committed cost would exceed the declared budget.
#[derive(Debug, Error, PartialEq)]
#[error("committed cost {committed_usd:.6} USD exceeds declared budget {budget_usd:.6} USD")]
pub struct BudgetBreach {
    /// Ceiling declared by the caller.
    pub budget_usd: f64,
    /// Cost that would have been committed.
    pub committed_usd: f64,
}

impl BudgetBreach {
    /// Converts the breach into the wire error envelope.
    #[must_use]
    pub fn to_envelope(&self) -> ErrorEnvelope {
        ErrorEnvelope::new(ErrorKind::BudgetExceeded, self.to_string())
    }
}

/// Running ledger for one in-flight call.
///
/// Owned by the call's own execution path; never shared across concurrent
/// calls and never persisted.
#[derive(Clone, Copy, Debug)]
pub struct BudgetLedger {
    budget_usd: f64,
    committed_usd: f64,
}

impl BudgetLedger {
    /// Opens a ledger against the caller-declared ceiling.
    #[must_use]
    pub const fn new(budget_usd: f64) -> Self {
        Self {
            budget_usd,
            committed_usd: 0.0,
        }
    }

    /// Returns the declared ceiling.
    #[must_use]
    pub const fn budget_usd(&self) -> f64 {
        self.budget_usd
    }

    /// Returns the cost committed so far.
    #[must_use]
    pub const fn committed_usd(&self) -> f64 {
        self.committed_usd
    }

    /// Returns `true` when the ceiling covers the supplied amount on top of
    /// what is already committed.
    #[must_use]
    pub fn covers(&self, amount_usd: f64) -> bool {
        self.committed_usd + amount_usd <= self.budget_usd
    }

    /// Commits an incremental cost against the ledger.
    ///
    /// The increment is recorded even when it breaches the ceiling, so the
    /// partial usage reported with an abort reflects what was actually spent.
    ///
    /// # Errors
    ///
    /// Returns [`BudgetBreach`] when the committed total now exceeds the
    /// declared budget.
    pub fn commit(&mut self, amount_usd: f64) -> Result<(), BudgetBreach> {
        self.committed_usd += amount_usd;
        if self.committed_usd > self.budget_usd {
            return Err(BudgetBreach {
                budget_usd: self.budget_usd,
                committed_usd: self.committed_usd,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upfront_check_against_estimate() {
        let ledger = BudgetLedger::new(0.05);
        assert!(ledger.covers(0.002));
        assert!(!ledger.covers(0.06));
    }

    #[test]
    fn commits_accumulate_and_breach() {
        let mut ledger = BudgetLedger::new(0.01);
        ledger.commit(0.004).unwrap();
        ledger.commit(0.004).unwrap();
        let breach = ledger.commit(0.004).expect_err("over budget");
        assert!((breach.committed_usd - 0.012).abs() < 1e-9);
        assert_eq!(breach.to_envelope().code(), -32001);
        // Partial spend stays visible for the abort event.
        assert!((ledger.committed_usd() - 0.012).abs() < 1e-9);
    }

    #[test]
    fn exact_budget_is_not_a_breach() {
        let mut ledger = BudgetLedger::new(0.01);
        assert!(ledger.commit(0.01).is_ok());
    }
}
