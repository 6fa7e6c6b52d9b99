//! Usage reporting collaborators consumed by the cost gate.
//!
//! The gate never computes spend itself — it asks a [`UsageTracker`] for a
//! sandbox-scoped cost report and a [`CurrencyConverter`] to bring the
//! report into its own currency. Production deployments back these with a
//! billing service; [`RecordingTracker`] and [`FixedRateConverter`] are
//! the in-process defaults.

use crate::pricing::PricingTable;
use async_trait::async_trait;
use conductor_core::error::CostError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

/// Total spend recorded for a sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostTotal {
    pub cost: f64,
}

/// The currency a report is denominated in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Currency {
    /// ISO 4217 code, e.g. "USD", "CNY"
    pub code: String,
}

/// A sandbox-scoped cost report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostReport {
    pub total: CostTotal,
    pub currency: Currency,
}

impl CostReport {
    pub fn new(cost: f64, currency: impl Into<String>) -> Self {
        Self {
            total: CostTotal { cost },
            currency: Currency {
                code: currency.into(),
            },
        }
    }
}

/// Knows the current spend of a sandbox.
#[async_trait]
pub trait UsageTracker: Send + Sync {
    async fn get_cost_report(&self, sandbox_id: &str) -> Result<CostReport, CostError>;
}

/// Converts an amount between currencies.
pub trait CurrencyConverter: Send + Sync {
    fn convert_currency(&self, amount: f64, from: &str, to: &str) -> Result<f64, CostError>;
}

/// In-memory usage tracker: accumulates spend per sandbox, priced in USD
/// through a [`PricingTable`].
#[derive(Default)]
pub struct RecordingTracker {
    pricing: PricingTable,
    spend: RwLock<HashMap<String, f64>>,
}

impl RecordingTracker {
    pub fn new() -> Self {
        Self {
            pricing: PricingTable::with_defaults(),
            spend: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_pricing(pricing: PricingTable) -> Self {
        Self {
            pricing,
            spend: RwLock::new(HashMap::new()),
        }
    }

    /// Record one model call's token usage against a sandbox.
    pub fn record_usage(
        &self,
        sandbox_id: &str,
        model: &str,
        input_tokens: u32,
        output_tokens: u32,
    ) -> f64 {
        let cost = self.pricing.compute_cost(model, input_tokens, output_tokens);
        self.record_cost(sandbox_id, cost);
        cost
    }

    /// Record an already-priced amount against a sandbox.
    pub fn record_cost(&self, sandbox_id: &str, cost: f64) {
        let mut spend = self.spend.write().unwrap();
        *spend.entry(sandbox_id.to_string()).or_insert(0.0) += cost;
    }

    /// Current recorded spend for a sandbox.
    pub fn spent(&self, sandbox_id: &str) -> f64 {
        self.spend.read().unwrap().get(sandbox_id).copied().unwrap_or(0.0)
    }
}

#[async_trait]
impl UsageTracker for RecordingTracker {
    async fn get_cost_report(&self, sandbox_id: &str) -> Result<CostReport, CostError> {
        Ok(CostReport::new(self.spent(sandbox_id), "USD"))
    }
}

/// Converter over a fixed table of exchange rates.
///
/// Same-currency conversion is always the identity; any other pair must
/// have a configured rate.
#[derive(Default)]
pub struct FixedRateConverter {
    rates: HashMap<(String, String), f64>,
}

impl FixedRateConverter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configure the rate for one direction of a currency pair.
    pub fn with_rate(mut self, from: impl Into<String>, to: impl Into<String>, rate: f64) -> Self {
        self.rates.insert((from.into(), to.into()), rate);
        self
    }
}

impl CurrencyConverter for FixedRateConverter {
    fn convert_currency(&self, amount: f64, from: &str, to: &str) -> Result<f64, CostError> {
        if from == to {
            return Ok(amount);
        }
        self.rates
            .get(&(from.to_string(), to.to_string()))
            .map(|rate| amount * rate)
            .ok_or_else(|| CostError::Conversion {
                from: from.to_string(),
                to: to.to_string(),
                reason: "no exchange rate configured".into(),
            })
    }
}
