//! Tool trait — the abstraction over agent capabilities.
//!
//! Tools are what give the agent the ability to act in the world. The
//! orchestration core never knows what a tool does; it only relies on the
//! uniform `execute(context, params)` contract and stamps timing and call
//! identity onto the result itself.

use crate::context::ToolContext;
use crate::error::ToolError;
use crate::provider::ToolDefinition;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// A request to execute a tool, as resolved from the model response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique call ID (matches the LLM's tool_call.id)
    pub id: String,

    /// Name of the tool to execute
    pub name: String,

    /// Arguments as a JSON value
    pub arguments: serde_json::Value,
}

/// The result of a tool execution.
///
/// Every call id the model emits gets exactly one of these back, whether
/// the tool ran, failed, was unknown, or the whole batch timed out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    /// The call ID this result is for
    pub call_id: String,

    /// Whether the tool executed successfully
    pub ok: bool,

    /// The output content (present on success)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,

    /// The error description (present on failure)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Whether this result was synthesized because the call's batch hit
    /// the group timeout rather than the tool itself failing
    #[serde(default)]
    pub timed_out: bool,

    /// Wall-clock time spent executing (zero for synthesized results)
    pub execution_time: Duration,
}

impl ToolResult {
    /// A successful result carrying output content.
    pub fn success(
        call_id: impl Into<String>,
        content: impl Into<String>,
        execution_time: Duration,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            ok: true,
            content: Some(content.into()),
            error: None,
            timed_out: false,
            execution_time,
        }
    }

    /// A failed result carrying an error description.
    pub fn failure(
        call_id: impl Into<String>,
        error: impl Into<String>,
        execution_time: Duration,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            ok: false,
            content: None,
            error: Some(error.into()),
            timed_out: false,
            execution_time,
        }
    }

    /// A synthesized result for a call whose batch hit the group timeout.
    pub fn group_timeout(call_id: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            call_id: call_id.into(),
            ok: false,
            content: None,
            error: Some(format!("Tool call batch timed out after {elapsed:?}")),
            timed_out: true,
            execution_time: Duration::ZERO,
        }
    }
}

/// The core Tool trait.
///
/// Implementations receive the per-call [`ToolContext`] (invocation id,
/// weak agent back-reference, progress bus) and their parsed arguments,
/// and return output content. The dispatcher owns timing, result shaping,
/// and lifecycle events.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool (e.g., "file_write").
    fn name(&self) -> &str;

    /// A description of what this tool does (sent to the LLM).
    fn description(&self) -> &str;

    /// JSON Schema describing this tool's parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Execute the tool with the given arguments.
    async fn execute(
        &self,
        context: &ToolContext,
        params: serde_json::Value,
    ) -> std::result::Result<String, ToolError>;

    /// Convert this tool into a ToolDefinition for sending to the LLM.
    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

/// A registry of available tools.
///
/// Tools are held behind `Arc` so the dispatcher can fan calls out across
/// concurrently running tasks without cloning implementations.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Replaces any existing tool with the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        self.tools.insert(name, tool);
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Get all tool definitions (for sending to the LLM).
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.values().map(|t| t.to_definition()).collect()
    }

    /// List all registered tool names.
    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    /// Number of registered tools.
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether no tools are registered.
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::AgentContext;

    /// A simple test tool for unit tests.
    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "Echoes back the input"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({
                "type": "object",
                "properties": {
                    "text": { "type": "string" }
                },
                "required": ["text"]
            })
        }
        async fn execute(
            &self,
            _context: &ToolContext,
            params: serde_json::Value,
        ) -> Result<String, ToolError> {
            Ok(params["text"].as_str().unwrap_or("").to_string())
        }
    }

    #[test]
    fn registry_register_and_lookup() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));
        assert!(registry.get("echo").is_some());
        assert!(registry.get("nonexistent").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn registry_definitions() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));
        let defs = registry.definitions();
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].name, "echo");
    }

    #[tokio::test]
    async fn tool_executes_through_context() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));

        let agent = AgentContext::builder("task-1").build();
        let ctx = ToolContext::new(
            &agent,
            "echo",
            "call_1",
            serde_json::Map::new(),
        );

        let tool = registry.get("echo").unwrap();
        let out = tool
            .execute(&ctx, serde_json::json!({"text": "hello world"}))
            .await
            .unwrap();
        assert_eq!(out, "hello world");
    }

    #[test]
    fn result_constructors() {
        let ok = ToolResult::success("c1", "out", Duration::from_millis(5));
        assert!(ok.ok);
        assert_eq!(ok.content.as_deref(), Some("out"));
        assert!(ok.error.is_none());

        let err = ToolResult::failure("c2", "boom", Duration::from_millis(1));
        assert!(!err.ok);
        assert_eq!(err.error.as_deref(), Some("boom"));

        let to = ToolResult::group_timeout("c3", Duration::from_secs(2));
        assert!(!to.ok);
        assert!(to.timed_out);
        assert_eq!(to.execution_time, Duration::ZERO);
    }
}
