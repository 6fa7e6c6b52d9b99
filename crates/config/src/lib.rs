//! Configuration loading and validation for Conductor.
//!
//! Loads runtime settings from a TOML file with serde defaults for every
//! field, and validates them before the agent loop is constructed.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tracing::debug;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// The root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConductorConfig {
    /// Agent loop settings
    #[serde(default)]
    pub agent: AgentSettings,

    /// Cost gating settings
    #[serde(default)]
    pub cost: CostSettings,

    /// Background worker supervision settings
    #[serde(default)]
    pub supervisor: SupervisorSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSettings {
    /// Default model
    #[serde(default = "default_model")]
    pub model: String,

    /// Default temperature
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Whether one model turn's tool calls run concurrently
    #[serde(default)]
    pub parallel_tool_calls: bool,

    /// Group timeout for one turn's parallel tool calls, in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_group_timeout_secs: Option<u64>,

    /// Maximum LLM/tool iterations per run (safety limit)
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
}

fn default_model() -> String {
    "anthropic/claude-sonnet-4".into()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_iterations() -> u32 {
    25
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            model: default_model(),
            temperature: default_temperature(),
            parallel_tool_calls: false,
            tool_group_timeout_secs: None,
            max_iterations: default_max_iterations(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostSettings {
    /// Total-cost ceiling; absent means no gating
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ceiling: Option<f64>,

    /// Currency the gate reasons in (ISO 4217)
    #[serde(default = "default_currency")]
    pub currency: String,

    /// How much one explicit escalation raises the ceiling
    #[serde(default = "default_increment")]
    pub per_task_increment: f64,

    /// User ids exempt from gating
    #[serde(default)]
    pub exempt_users: Vec<String>,
}

fn default_currency() -> String {
    "USD".into()
}
fn default_increment() -> f64 {
    10.0
}

impl Default for CostSettings {
    fn default() -> Self {
        Self {
            ceiling: None,
            currency: default_currency(),
            per_task_increment: default_increment(),
            exempt_users: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorSettings {
    /// Seconds to wait for graceful worker shutdown before forcing
    #[serde(default = "default_grace_secs")]
    pub grace_period_secs: u64,
}

fn default_grace_secs() -> u64 {
    5
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            grace_period_secs: default_grace_secs(),
        }
    }
}

impl ConductorConfig {
    /// Load configuration from a TOML file and validate it.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        debug!(path = %path.as_ref().display(), "Loaded config file");
        Self::from_str(&raw)
    }

    /// Parse configuration from TOML text and validate it.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate settings the type system cannot enforce.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agent.max_iterations == 0 {
            return Err(ConfigError::Invalid(
                "agent.max_iterations must be at least 1".into(),
            ));
        }
        if self.agent.tool_group_timeout_secs == Some(0) {
            return Err(ConfigError::Invalid(
                "agent.tool_group_timeout_secs must be greater than zero".into(),
            ));
        }
        if self.cost.per_task_increment <= 0.0 {
            return Err(ConfigError::Invalid(
                "cost.per_task_increment must be positive".into(),
            ));
        }
        if let Some(ceiling) = self.cost.ceiling {
            if ceiling <= 0.0 {
                return Err(ConfigError::Invalid(
                    "cost.ceiling must be positive".into(),
                ));
            }
        }
        let currency = &self.cost.currency;
        if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_uppercase()) {
            return Err(ConfigError::Invalid(format!(
                "cost.currency must be a 3-letter ISO code, got '{currency}'"
            )));
        }
        if self.supervisor.grace_period_secs == 0 {
            return Err(ConfigError::Invalid(
                "supervisor.grace_period_secs must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_config_uses_defaults() {
        let config = ConductorConfig::from_str("").unwrap();
        assert!(!config.agent.parallel_tool_calls);
        assert_eq!(config.agent.max_iterations, 25);
        assert_eq!(config.cost.currency, "USD");
        assert!(config.cost.ceiling.is_none());
        assert_eq!(config.supervisor.grace_period_secs, 5);
    }

    #[test]
    fn full_config_parses() {
        let config = ConductorConfig::from_str(
            r#"
            [agent]
            model = "openai/gpt-4o"
            parallel_tool_calls = true
            tool_group_timeout_secs = 30
            max_iterations = 10

            [cost]
            ceiling = 100.0
            currency = "CNY"
            per_task_increment = 25.0
            exempt_users = ["vip"]

            [supervisor]
            grace_period_secs = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.agent.model, "openai/gpt-4o");
        assert!(config.agent.parallel_tool_calls);
        assert_eq!(config.agent.tool_group_timeout_secs, Some(30));
        assert_eq!(config.cost.ceiling, Some(100.0));
        assert_eq!(config.cost.exempt_users, vec!["vip".to_string()]);
        assert_eq!(config.supervisor.grace_period_secs, 3);
    }

    #[test]
    fn zero_group_timeout_rejected() {
        let err = ConductorConfig::from_str(
            "[agent]\ntool_group_timeout_secs = 0\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn bad_currency_rejected() {
        let err = ConductorConfig::from_str("[cost]\ncurrency = \"yuan\"\n").unwrap_err();
        assert!(err.to_string().contains("ISO"));
    }

    #[test]
    fn non_positive_increment_rejected() {
        let err =
            ConductorConfig::from_str("[cost]\nper_task_increment = 0.0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn load_from_file_roundtrip() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[agent]\nmax_iterations = 7").unwrap();

        let config = ConductorConfig::load_from(file.path()).unwrap();
        assert_eq!(config.agent.max_iterations, 7);
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = ConductorConfig::load_from("/nonexistent/conductor.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
