//! Cost telemetry for Conductor agents — model pricing, usage reporting
//! seams, and the cost-limit gate the agent loop consults before every
//! LLM call.

pub mod gate;
pub mod pricing;
pub mod usage;

pub use gate::{CostBreach, CostLimitGate, GateVerdict};
pub use pricing::{ModelPricing, PricingTable};
pub use usage::{
    CostReport, CostTotal, Currency, CurrencyConverter, FixedRateConverter, RecordingTracker,
    UsageTracker,
};
