//! Cost-limit gate — consulted before every LLM call.
//!
//! The gate is an explicitly constructed service injected into the agent
//! loop, never a process-global. Checks return a verdict value rather
//! than aborting: the loop decides what a denial means for the run.

use crate::usage::{CurrencyConverter, UsageTracker};
use conductor_core::error::CostError;
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

/// The outcome of a gate check.
#[derive(Debug, Clone, PartialEq)]
pub enum GateVerdict {
    /// The run may proceed.
    Allowed,
    /// The ceiling is reached; carries everything the caller needs for a
    /// user-facing message.
    Denied(CostBreach),
}

/// Details of a cost-limit breach.
#[derive(Debug, Clone, PartialEq)]
pub struct CostBreach {
    pub spent: f64,
    pub limit: f64,
    pub currency: String,
    pub sandbox_id: String,
}

impl CostBreach {
    /// The currency-formatted message shown to the user (never a raw
    /// error string).
    pub fn user_message(&self) -> String {
        format!(
            "This session has used {:.2} {} of its {:.2} {} budget. \
             Raise the limit to continue.",
            self.spent, self.currency, self.limit, self.currency
        )
    }
}

impl From<CostBreach> for CostError {
    fn from(breach: CostBreach) -> Self {
        CostError::LimitExceeded {
            spent: breach.spent,
            limit: breach.limit,
            currency: breach.currency,
            sandbox_id: breach.sandbox_id,
        }
    }
}

/// Gates expensive operations behind a spend ceiling.
///
/// The ceiling is the only long-lived mutable state touched from
/// concurrent call paths: writes go through the lock's exclusive side,
/// reads take cheap shared snapshots — a stale read only risks a late
/// gate trip, never a safety violation.
pub struct CostLimitGate {
    ceiling: RwLock<Option<f64>>,
    currency: String,
    per_task_increment: f64,
    exempt_users: Vec<String>,
    sandbox_id: String,
    tracker: Arc<dyn UsageTracker>,
    converter: Arc<dyn CurrencyConverter>,
}

impl CostLimitGate {
    pub fn new(
        tracker: Arc<dyn UsageTracker>,
        converter: Arc<dyn CurrencyConverter>,
        sandbox_id: impl Into<String>,
    ) -> Self {
        Self {
            ceiling: RwLock::new(None),
            currency: "USD".into(),
            per_task_increment: 10.0,
            exempt_users: Vec::new(),
            sandbox_id: sandbox_id.into(),
            tracker,
            converter,
        }
    }

    /// Set the total-cost ceiling.
    pub fn with_ceiling(self, ceiling: f64) -> Self {
        *self.ceiling.write().unwrap() = Some(ceiling);
        self
    }

    /// Set the gate's currency (spend reports are converted into it).
    pub fn with_currency(mut self, currency: impl Into<String>) -> Self {
        self.currency = currency.into();
        self
    }

    /// Set the per-task increment applied by `increase_cost_limit`.
    pub fn with_per_task_increment(mut self, increment: f64) -> Self {
        self.per_task_increment = increment;
        self
    }

    /// Users exempt from gating regardless of spend.
    pub fn with_exempt_users(mut self, users: Vec<String>) -> Self {
        self.exempt_users = users;
        self
    }

    /// Snapshot of the current ceiling.
    pub fn ceiling(&self) -> Option<f64> {
        *self.ceiling.read().unwrap()
    }

    /// The gate's currency code.
    pub fn currency(&self) -> &str {
        &self.currency
    }

    /// Replace the ceiling. Serialized with other writers.
    pub fn set_total_cost_limit(&self, limit: f64) {
        *self.ceiling.write().unwrap() = Some(limit);
    }

    /// Current spend for this gate's sandbox, converted into the gate's
    /// currency when the report is denominated differently.
    pub async fn current_spend(&self) -> Result<f64, CostError> {
        let report = self.tracker.get_cost_report(&self.sandbox_id).await?;
        if report.currency.code == self.currency {
            return Ok(report.total.cost);
        }
        self.converter
            .convert_currency(report.total.cost, &report.currency.code, &self.currency)
    }

    /// Check whether the run may make its next expensive call.
    ///
    /// Allowed when no ceiling is configured, when the user is exempt,
    /// or when converted spend is still below the ceiling. Once the
    /// ceiling is reached, every check is denied until the ceiling is
    /// explicitly raised.
    pub async fn check_total_cost_limit(
        &self,
        user_id: Option<&str>,
    ) -> Result<GateVerdict, CostError> {
        let Some(limit) = self.ceiling() else {
            return Ok(GateVerdict::Allowed);
        };

        if let Some(user) = user_id {
            if self.exempt_users.iter().any(|u| u == user) {
                debug!(user, "Cost gate bypassed for exempt user");
                return Ok(GateVerdict::Allowed);
            }
        }

        let spent = self.current_spend().await?;
        if spent >= limit {
            return Ok(GateVerdict::Denied(CostBreach {
                spent,
                limit,
                currency: self.currency.clone(),
                sandbox_id: self.sandbox_id.clone(),
            }));
        }
        Ok(GateVerdict::Allowed)
    }

    /// Raise the ceiling by exactly one per-task increment — but only if
    /// it is currently reached. Returns whether a raise happened.
    ///
    /// Pre-emptive raising is rejected by design: growth is bounded to
    /// one increment per explicit escalation.
    pub async fn increase_cost_limit(&self) -> Result<bool, CostError> {
        if self.ceiling().is_none() {
            return Ok(false);
        }

        let spent = self.current_spend().await?;

        // Single-writer critical section; the reached-condition is
        // re-checked under the lock so concurrent escalations collapse
        // into one raise.
        let mut ceiling = self.ceiling.write().unwrap();
        match *ceiling {
            Some(limit) if spent >= limit => {
                let raised = limit + self.per_task_increment;
                info!(
                    sandbox_id = %self.sandbox_id,
                    from = limit,
                    to = raised,
                    "Cost ceiling raised by one increment"
                );
                *ceiling = Some(raised);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// The smallest integer multiple of `base` strictly greater than
    /// `current_spend`; `base` itself when nothing is spent yet.
    ///
    /// Used at session start so a resumed sandbox with recorded spend is
    /// never immediately gated.
    pub fn next_ceiling(base: f64, current_spend: f64) -> f64 {
        if current_spend <= 0.0 {
            return base;
        }
        base * ((current_spend / base).floor() + 1.0)
    }

    /// Fetch the sandbox's recorded spend and derive its starting
    /// ceiling via [`Self::next_ceiling`].
    pub async fn calculate_cost_limit(
        base: f64,
        sandbox_id: &str,
        tracker: &dyn UsageTracker,
        converter: &dyn CurrencyConverter,
        currency: &str,
    ) -> Result<f64, CostError> {
        let report = tracker.get_cost_report(sandbox_id).await?;
        let spend = if report.currency.code == currency {
            report.total.cost
        } else {
            converter.convert_currency(report.total.cost, &report.currency.code, currency)?
        };
        Ok(Self::next_ceiling(base, spend))
    }
}
