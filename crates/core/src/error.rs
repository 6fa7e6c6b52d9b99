//! Error types for the Conductor domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error variant.

use std::time::Duration;
use thiserror::Error;

/// The top-level error type for all Conductor operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Tool errors ---
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    // --- Parallel runner errors ---
    #[error("Runner error: {0}")]
    Runner(#[from] RunnerError),

    // --- Cost gate errors ---
    #[error("Cost error: {0}")]
    Cost(#[from] CostError),

    // --- Worker supervision errors ---
    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    // --- LLM transport errors ---
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

#[derive(Debug, Clone, Error)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Invalid arguments for {tool_name}: {}", issues.join(", "))]
    InvalidArguments {
        tool_name: String,
        issues: Vec<String>,
    },

    #[error("Tool execution failed: {tool_name} — {reason}")]
    ExecutionFailed { tool_name: String, reason: String },
}

#[derive(Debug, Clone, Error)]
pub enum RunnerError {
    #[error("Invalid group timeout: must be greater than zero")]
    InvalidTimeout,

    #[error("wait() called before start()")]
    NotStarted,

    #[error("Task group timed out after {elapsed:?}")]
    GroupTimeout { elapsed: Duration },
}

#[derive(Debug, Clone, Error)]
pub enum CostError {
    #[error(
        "Cost limit reached: spent {spent:.4} {currency} of {limit:.4} {currency} (sandbox {sandbox_id})"
    )]
    LimitExceeded {
        spent: f64,
        limit: f64,
        currency: String,
        sandbox_id: String,
    },

    #[error("Cost report unavailable: {0}")]
    Report(String),

    #[error("Currency conversion failed ({from} -> {to}): {reason}")]
    Conversion {
        from: String,
        to: String,
        reason: String,
    },
}

#[derive(Debug, Clone, Error)]
pub enum WorkerError {
    #[error("Worker start failed: {name} — {reason}")]
    StartFailure { name: String, reason: String },

    #[error("Worker stop failed: {name} — {reason}")]
    StopFailure { name: String, reason: String },

    #[error("No worker registered under name: {0}")]
    NotFound(String),
}

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError { status_code: u16, message: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),
}

/// Error returned by a lifecycle event handler.
///
/// Handler errors are logged and collected by the event bus; they never
/// abort dispatch to subsequent handlers.
#[derive(Debug, Clone, Error)]
#[error("Event handler '{handler}' failed: {reason}")]
pub struct EventError {
    pub handler: String,
    pub reason: String,
}

impl EventError {
    pub fn new(handler: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            handler: handler.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cost_error_displays_amounts_and_currency() {
        let err = Error::Cost(CostError::LimitExceeded {
            spent: 101.5,
            limit: 100.0,
            currency: "CNY".into(),
            sandbox_id: "sbx-1".into(),
        });
        let msg = err.to_string();
        assert!(msg.contains("101.5"));
        assert!(msg.contains("CNY"));
        assert!(msg.contains("sbx-1"));
    }

    #[test]
    fn invalid_arguments_lists_fields() {
        let err = ToolError::InvalidArguments {
            tool_name: "file_write".into(),
            issues: vec!["missing field: path".into(), "missing field: content".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("path"));
        assert!(msg.contains("content"));
    }

    #[test]
    fn runner_timeout_displays_elapsed() {
        let err = RunnerError::GroupTimeout {
            elapsed: Duration::from_secs(2),
        };
        assert!(err.to_string().contains("2s"));
    }
}
