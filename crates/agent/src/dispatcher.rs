//! Tool-call dispatch — resolve, validate, execute, observe.
//!
//! Every call the model emits goes through the same pipeline: resolve the
//! tool by name, validate arguments against its schema, emit the
//! before-call event, execute, emit the after-call event with elapsed
//! time, and shape a ToolResult. One model turn's calls run either
//! sequentially in model order or fanned out through the parallel runner
//! with a group timeout. Either way the returned results are 1:1 with the
//! input calls, in input order — chat APIs require a result per call id.

use conductor_core::context::{AgentContext, ToolContext};
use conductor_core::error::{RunnerError, ToolError};
use conductor_core::event::AgentEvent;
use conductor_core::tool::{Tool, ToolCall, ToolRegistry, ToolResult};
use conductor_runner::ParallelRunner;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// How one model turn's tool calls are executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// One at a time, in the order the model produced them.
    Sequential,
    /// All calls for the turn run concurrently.
    Parallel,
}

/// Executes the tool calls of one model turn.
pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
    mode: ExecutionMode,
    group_timeout: Option<Duration>,
}

impl ToolDispatcher {
    /// A sequential dispatcher.
    pub fn sequential(registry: Arc<ToolRegistry>) -> Self {
        Self {
            registry,
            mode: ExecutionMode::Sequential,
            group_timeout: None,
        }
    }

    /// A parallel dispatcher with an optional group timeout over each
    /// turn's batch. A zero timeout is rejected here, not at dispatch.
    pub fn parallel(
        registry: Arc<ToolRegistry>,
        group_timeout: Option<Duration>,
    ) -> Result<Self, RunnerError> {
        if group_timeout.is_some_and(|t| t.is_zero()) {
            return Err(RunnerError::InvalidTimeout);
        }
        Ok(Self {
            registry,
            mode: ExecutionMode::Parallel,
            group_timeout,
        })
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Execute every call of one model turn and return one result per
    /// call, aligned with the input order.
    pub async fn dispatch(
        &self,
        calls: &[ToolCall],
        context: &Arc<AgentContext>,
        request_message_id: &str,
    ) -> Vec<ToolResult> {
        match self.mode {
            ExecutionMode::Sequential => {
                let mut results = Vec::with_capacity(calls.len());
                for call in calls {
                    results.push(
                        execute_call(
                            Arc::clone(&self.registry),
                            Arc::clone(context),
                            call.clone(),
                            request_message_id.to_string(),
                        )
                        .await,
                    );
                }
                results
            }
            ExecutionMode::Parallel => {
                self.dispatch_parallel(calls, context, request_message_id)
                    .await
            }
        }
    }

    async fn dispatch_parallel(
        &self,
        calls: &[ToolCall],
        context: &Arc<AgentContext>,
        request_message_id: &str,
    ) -> Vec<ToolResult> {
        let mut runner = match self.group_timeout {
            // Zero was rejected at construction.
            Some(timeout) => ParallelRunner::with_timeout(timeout)
                .unwrap_or_else(|_| ParallelRunner::new()),
            None => ParallelRunner::new(),
        };

        for call in calls {
            let registry = Arc::clone(&self.registry);
            let context = Arc::clone(context);
            let call = call.clone();
            let message_id = request_message_id.to_string();
            runner.add(async move {
                Ok(execute_call(registry, context, call, message_id).await)
            });
        }

        match runner.run().await {
            Ok(outcomes) => outcomes
                .into_iter()
                .zip(calls)
                .map(|(outcome, call)| match outcome {
                    Ok(result) => result,
                    // A panicked or aborted task still owes its call a result.
                    Err(task_err) => {
                        warn!(call_id = %call.id, error = %task_err, "Tool task failed");
                        ToolResult::failure(call.id.as_str(), task_err.to_string(), Duration::ZERO)
                    }
                })
                .collect(),
            Err(RunnerError::GroupTimeout { elapsed }) => {
                warn!(
                    calls = calls.len(),
                    ?elapsed,
                    "Tool call batch timed out; synthesizing results"
                );
                calls
                    .iter()
                    .map(|call| ToolResult::group_timeout(call.id.as_str(), elapsed))
                    .collect()
            }
            Err(other) => calls
                .iter()
                .map(|call| ToolResult::failure(call.id.as_str(), other.to_string(), Duration::ZERO))
                .collect(),
        }
    }
}

/// The per-call pipeline: resolve → validate → before event → execute →
/// after event. Failures are folded into the result, never raised.
async fn execute_call(
    registry: Arc<ToolRegistry>,
    context: Arc<AgentContext>,
    call: ToolCall,
    request_message_id: String,
) -> ToolResult {
    let Some(tool) = registry.get(&call.name) else {
        warn!(tool = %call.name, call_id = %call.id, "Tool not found");
        let err = ToolError::NotFound(call.name.clone());
        return ToolResult::failure(call.id.as_str(), err.to_string(), Duration::ZERO);
    };

    let arguments = match validate_arguments(tool.as_ref(), &call) {
        Ok(args) => args,
        Err(err) => {
            warn!(tool = %call.name, call_id = %call.id, error = %err, "Invalid tool arguments");
            return ToolResult::failure(call.id.as_str(), err.to_string(), Duration::ZERO);
        }
    };

    context
        .dispatch(&AgentEvent::BeforeToolCall {
            tool_name: call.name.clone(),
            call_id: call.id.clone(),
            arguments: call.arguments.clone(),
            request_message_id,
        })
        .await;

    let tool_context = ToolContext::new(&context, call.name.as_str(), call.id.as_str(), arguments.clone());
    let started = Instant::now();
    let outcome = tool
        .execute(&tool_context, serde_json::Value::Object(arguments))
        .await;
    let elapsed = started.elapsed();

    let result = match outcome {
        Ok(content) => {
            debug!(tool = %call.name, call_id = %call.id, ?elapsed, "Tool call succeeded");
            ToolResult::success(call.id.as_str(), content, elapsed)
        }
        Err(e) => {
            warn!(tool = %call.name, call_id = %call.id, error = %e, "Tool call failed");
            ToolResult::failure(call.id.as_str(), e.to_string(), elapsed)
        }
    };

    context
        .dispatch(&AgentEvent::AfterToolCall {
            tool_name: call.name.clone(),
            call_id: call.id.clone(),
            result: result.clone(),
            elapsed,
        })
        .await;

    result
}

/// Check a call's arguments against the tool's declared parameter schema.
///
/// Arguments must be a JSON object; required properties must be present;
/// properties with a declared primitive type must match it. All offending
/// fields are reported together.
fn validate_arguments(
    tool: &dyn Tool,
    call: &ToolCall,
) -> Result<serde_json::Map<String, serde_json::Value>, ToolError> {
    let args = match &call.arguments {
        serde_json::Value::Object(map) => map.clone(),
        serde_json::Value::Null => serde_json::Map::new(),
        other => {
            return Err(ToolError::InvalidArguments {
                tool_name: call.name.clone(),
                issues: vec![format!("expected an argument object, got {}", kind_of(other))],
            });
        }
    };

    let schema = tool.parameters_schema();
    let mut issues = Vec::new();

    if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
        for field in required.iter().filter_map(|f| f.as_str()) {
            if !args.contains_key(field) {
                issues.push(format!("missing required field: {field}"));
            }
        }
    }

    if let Some(properties) = schema.get("properties").and_then(|p| p.as_object()) {
        for (field, prop) in properties {
            let Some(value) = args.get(field) else {
                continue;
            };
            let Some(expected) = prop.get("type").and_then(|t| t.as_str()) else {
                continue;
            };
            if !type_matches(expected, value) {
                issues.push(format!(
                    "field {field}: expected {expected}, got {}",
                    kind_of(value)
                ));
            }
        }
    }

    if issues.is_empty() {
        Ok(args)
    } else {
        Err(ToolError::InvalidArguments {
            tool_name: call.name.clone(),
            issues,
        })
    }
}

fn type_matches(expected: &str, value: &serde_json::Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn kind_of(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use conductor_core::error::EventError;
    use conductor_core::event::{EventHandler, EventKind};
    use std::sync::Mutex;
    use tokio::time::sleep;

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
                "properties": { "text": { "type": "string" } },
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

    /// Sleeps for the requested number of milliseconds, then reports them.
    struct SleepTool;

    #[async_trait]
    impl Tool for SleepTool {
        fn name(&self) -> &str {
            "sleep"
        }
        fn description(&self) -> &str {
            "Sleeps for a while"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({
                "type": "object",
                "properties": { "millis": { "type": "integer" } },
                "required": ["millis"]
            })
        }
        async fn execute(
            &self,
            _context: &ToolContext,
            params: serde_json::Value,
        ) -> Result<String, ToolError> {
            let millis = params["millis"].as_u64().unwrap_or(0);
            sleep(Duration::from_millis(millis)).await;
            Ok(format!("slept {millis}"))
        }
    }

    struct FailingTool;

    #[async_trait]
    impl Tool for FailingTool {
        fn name(&self) -> &str {
            "failing"
        }
        fn description(&self) -> &str {
            "Always fails"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({ "type": "object", "properties": {} })
        }
        async fn execute(
            &self,
            _context: &ToolContext,
            _params: serde_json::Value,
        ) -> Result<String, ToolError> {
            Err(ToolError::ExecutionFailed {
                tool_name: "failing".into(),
                reason: "deliberate".into(),
            })
        }
    }

    struct CountingHandler {
        seen: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl EventHandler for CountingHandler {
        fn name(&self) -> &str {
            "counting"
        }
        async fn handle(&self, event: &AgentEvent) -> Result<(), EventError> {
            let label = match event {
                AgentEvent::BeforeToolCall { call_id, .. } => format!("before:{call_id}"),
                AgentEvent::AfterToolCall { call_id, .. } => format!("after:{call_id}"),
                _ => "other".into(),
            };
            self.seen.lock().unwrap().push(label);
            Ok(())
        }
    }

    fn registry() -> Arc<ToolRegistry> {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));
        registry.register(Arc::new(SleepTool));
        registry.register(Arc::new(FailingTool));
        Arc::new(registry)
    }

    fn call(id: &str, name: &str, arguments: serde_json::Value) -> ToolCall {
        ToolCall {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }

    #[tokio::test]
    async fn sequential_failures_do_not_stop_later_calls() {
        let dispatcher = ToolDispatcher::sequential(registry());
        let context = AgentContext::builder("t").build();

        let calls = vec![
            call("c1", "failing", serde_json::json!({})),
            call("c2", "missing_tool", serde_json::json!({})),
            call("c3", "echo", serde_json::json!({"text": "still ran"})),
        ];
        let results = dispatcher.dispatch(&calls, &context, "msg-1").await;

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].call_id, "c1");
        assert!(!results[0].ok);
        assert!(results[1].error.as_deref().unwrap().contains("not found"));
        assert!(results[2].ok);
        assert_eq!(results[2].content.as_deref(), Some("still ran"));
    }

    #[tokio::test]
    async fn invalid_arguments_list_offending_fields() {
        let dispatcher = ToolDispatcher::sequential(registry());
        let context = AgentContext::builder("t").build();

        let calls = vec![
            call("c1", "echo", serde_json::json!({})),
            call("c2", "echo", serde_json::json!({"text": 42})),
        ];
        let results = dispatcher.dispatch(&calls, &context, "msg-1").await;

        assert!(!results[0].ok);
        assert!(results[0].error.as_deref().unwrap().contains("missing required field: text"));
        assert!(!results[1].ok);
        assert!(results[1].error.as_deref().unwrap().contains("expected string"));
    }

    #[tokio::test(start_paused = true)]
    async fn parallel_results_preserve_call_order() {
        let dispatcher = ToolDispatcher::parallel(registry(), None).unwrap();
        let context = AgentContext::builder("t").build();

        let calls = vec![
            call("c1", "sleep", serde_json::json!({"millis": 300})),
            call("c2", "sleep", serde_json::json!({"millis": 100})),
            call("c3", "sleep", serde_json::json!({"millis": 200})),
        ];
        let results = dispatcher.dispatch(&calls, &context, "msg-1").await;

        let ids: Vec<_> = results.iter().map(|r| r.call_id.as_str()).collect();
        assert_eq!(ids, vec!["c1", "c2", "c3"]);
        assert_eq!(results[0].content.as_deref(), Some("slept 300"));
        assert_eq!(results[1].content.as_deref(), Some("slept 100"));
    }

    #[tokio::test(start_paused = true)]
    async fn group_timeout_synthesizes_a_result_per_call() {
        let dispatcher =
            ToolDispatcher::parallel(registry(), Some(Duration::from_secs(1))).unwrap();
        let context = AgentContext::builder("t").build();

        let calls = vec![
            call("c1", "sleep", serde_json::json!({"millis": 100})),
            call("c2", "sleep", serde_json::json!({"millis": 5000})),
            call("c3", "sleep", serde_json::json!({"millis": 200})),
        ];
        let results = dispatcher.dispatch(&calls, &context, "msg-1").await;

        assert_eq!(results.len(), 3);
        for (result, call) in results.iter().zip(&calls) {
            assert_eq!(result.call_id, call.id);
            assert!(result.timed_out);
            assert!(!result.ok);
        }
    }

    #[tokio::test]
    async fn zero_group_timeout_rejected() {
        let res = ToolDispatcher::parallel(registry(), Some(Duration::ZERO));
        assert!(matches!(res, Err(RunnerError::InvalidTimeout)));
    }

    #[tokio::test]
    async fn before_and_after_events_fire_per_call() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let context = AgentContext::builder("t")
            .on(
                EventKind::BeforeToolCall,
                Arc::new(CountingHandler {
                    seen: Arc::clone(&seen),
                }),
            )
            .on(
                EventKind::AfterToolCall,
                Arc::new(CountingHandler {
                    seen: Arc::clone(&seen),
                }),
            )
            .build();

        let dispatcher = ToolDispatcher::sequential(registry());
        let calls = vec![call("c1", "echo", serde_json::json!({"text": "hi"}))];
        dispatcher.dispatch(&calls, &context, "msg-1").await;

        let entries = seen.lock().unwrap();
        assert_eq!(entries.as_slice(), &["before:c1", "after:c1"]);
    }

    #[tokio::test]
    async fn unknown_tool_skips_lifecycle_events() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let context = AgentContext::builder("t")
            .on(
                EventKind::BeforeToolCall,
                Arc::new(CountingHandler {
                    seen: Arc::clone(&seen),
                }),
            )
            .build();

        let dispatcher = ToolDispatcher::sequential(registry());
        let calls = vec![call("c1", "ghost", serde_json::json!({}))];
        let results = dispatcher.dispatch(&calls, &context, "msg-1").await;

        assert!(!results[0].ok);
        assert!(seen.lock().unwrap().is_empty());
    }
}
