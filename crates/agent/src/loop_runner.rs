//! The agent run loop.
//!
//! Composes the cost gate, the worker supervisor, the tool-call
//! dispatcher and the LLM transport: each iteration checks the gate,
//! calls the model, optionally safety-reviews the output, and either
//! finishes with a response or executes the requested tools and loops.
//! Every termination path tears down the run's background workers.

use crate::dispatcher::ToolDispatcher;
use conductor_config::ConductorConfig;
use conductor_core::context::AgentContext;
use conductor_core::error::RunnerError;
use conductor_core::event::AgentEvent;
use conductor_core::message::{Conversation, Message};
use conductor_core::provider::{Provider, ProviderRequest};
use conductor_core::tool::{ToolCall, ToolRegistry};
use conductor_supervisor::ProcessSupervisor;
use conductor_telemetry::{CostBreach, CostLimitGate, GateVerdict};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Shown to the user when an internal failure ends the run. Full detail
/// goes to the server-side log, never to the user.
const APOLOGY: &str =
    "I ran into an internal problem while working on this. Please try again in a moment.";

/// Verdict from a safety review of model output.
#[derive(Debug, Clone)]
pub struct SafetyVerdict {
    pub passed: bool,
    pub reason: Option<String>,
}

/// Reviews model output before it reaches the user. The loop wraps every
/// review in before/after safety-check events; no reviewer means
/// pass-through.
#[async_trait]
pub trait SafetyReviewer: Send + Sync {
    async fn review(&self, content: &str) -> SafetyVerdict;
}

/// Why a run ended.
#[derive(Debug, Clone)]
pub enum Termination {
    /// The model produced a final response.
    Finished,
    /// The iteration cap was hit before a final response.
    Suspended { reason: String },
    /// The cost gate denied the next LLM call.
    CostLimited(CostBreach),
    /// An internal failure ended the run.
    Failed { message: String },
}

/// The result of one agent run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// The user-facing response text.
    pub response: String,
    pub termination: Termination,
}

/// The core agent loop.
pub struct AgentLoop {
    provider: Arc<dyn Provider>,
    model: String,
    temperature: f32,
    max_tokens: Option<u32>,
    tools: Arc<ToolRegistry>,
    dispatcher: ToolDispatcher,
    gate: Arc<CostLimitGate>,
    supervisor: Arc<ProcessSupervisor>,
    safety: Option<Arc<dyn SafetyReviewer>>,
    max_iterations: u32,
    user_id: Option<String>,
}

impl AgentLoop {
    /// Start building a loop around its injected services.
    pub fn builder(
        provider: Arc<dyn Provider>,
        tools: Arc<ToolRegistry>,
        gate: Arc<CostLimitGate>,
        supervisor: Arc<ProcessSupervisor>,
    ) -> AgentLoopBuilder {
        AgentLoopBuilder {
            provider,
            tools,
            gate,
            supervisor,
            model: "anthropic/claude-sonnet-4".into(),
            temperature: 0.7,
            max_tokens: None,
            parallel_tools: false,
            tool_group_timeout: None,
            safety: None,
            max_iterations: 25,
            user_id: None,
        }
    }

    /// Drive the conversation to completion.
    pub async fn run(
        &self,
        context: &Arc<AgentContext>,
        conversation: &mut Conversation,
    ) -> RunOutcome {
        info!(
            task_id = %context.task_id,
            sandbox_id = %context.sandbox_id,
            messages = conversation.messages.len(),
            "Starting agent run"
        );

        context
            .dispatch(&AgentEvent::BeforeInit {
                task_id: context.task_id.clone(),
            })
            .await;
        context
            .dispatch(&AgentEvent::AfterInit {
                task_id: context.task_id.clone(),
            })
            .await;

        let tool_definitions = self.tools.definitions();
        let mut iteration = 0;

        loop {
            iteration += 1;
            if iteration > self.max_iterations {
                let reason = format!(
                    "Reached the maximum of {} iterations without a final response",
                    self.max_iterations
                );
                warn!(task_id = %context.task_id, %reason, "Suspending run");
                context
                    .dispatch(&AgentEvent::AgentSuspended {
                        reason: reason.clone(),
                    })
                    .await;
                return self
                    .finish(
                        context,
                        RunOutcome {
                            response:
                                "I've reached the maximum number of tool call iterations. \
                                 Please provide further guidance."
                                    .into(),
                            termination: Termination::Suspended { reason },
                        },
                    )
                    .await;
            }

            debug!(task_id = %context.task_id, iteration, "Agent loop iteration");

            // ── Cost gate ──
            match self.gate.check_total_cost_limit(self.user_id.as_deref()).await {
                Ok(GateVerdict::Allowed) => {}
                Ok(GateVerdict::Denied(breach)) => {
                    warn!(
                        task_id = %context.task_id,
                        spent = breach.spent,
                        limit = breach.limit,
                        currency = %breach.currency,
                        "Cost ceiling reached; ending run"
                    );
                    context
                        .dispatch(&AgentEvent::Error {
                            stage: "cost_gate".into(),
                            message: format!(
                                "cost limit reached: {:.4} {} >= {:.4} {}",
                                breach.spent, breach.currency, breach.limit, breach.currency
                            ),
                        })
                        .await;
                    return self
                        .finish(
                            context,
                            RunOutcome {
                                response: breach.user_message(),
                                termination: Termination::CostLimited(breach),
                            },
                        )
                        .await;
                }
                Err(e) => {
                    error!(task_id = %context.task_id, error = %e, "Cost gate check failed");
                    return self.fail(context, "cost_gate", e.to_string()).await;
                }
            }

            // ── LLM request ──
            context
                .dispatch(&AgentEvent::BeforeLlmRequest {
                    model: self.model.clone(),
                    message_count: conversation.messages.len(),
                })
                .await;

            let request = ProviderRequest {
                model: self.model.clone(),
                messages: conversation.messages.clone(),
                temperature: self.temperature,
                max_tokens: self.max_tokens,
                tools: tool_definitions.clone(),
            };

            let response = match self.provider.complete(request).await {
                Ok(response) => response,
                Err(e) => {
                    error!(task_id = %context.task_id, error = %e, "LLM request failed");
                    return self.fail(context, "llm_request", e.to_string()).await;
                }
            };

            context
                .dispatch(&AgentEvent::AfterLlmRequest {
                    model: response.model.clone(),
                    content_preview: preview(&response.message.content),
                    tool_call_count: response.message.tool_calls.len(),
                    usage: response.usage.clone(),
                })
                .await;

            // ── Safety review ──
            if let Some(reviewer) = &self.safety {
                if !response.message.content.is_empty() {
                    context
                        .dispatch(&AgentEvent::BeforeSafetyCheck {
                            content: response.message.content.clone(),
                        })
                        .await;
                    let verdict = reviewer.review(&response.message.content).await;
                    context
                        .dispatch(&AgentEvent::AfterSafetyCheck {
                            passed: verdict.passed,
                            reason: verdict.reason.clone(),
                        })
                        .await;
                    if !verdict.passed {
                        warn!(
                            task_id = %context.task_id,
                            reason = verdict.reason.as_deref().unwrap_or("unspecified"),
                            "Safety review rejected model output"
                        );
                        return self
                            .finish(
                                context,
                                RunOutcome {
                                    response: "I generated a response that didn't pass \
                                               review. Please rephrase your request."
                                        .into(),
                                    termination: Termination::Failed {
                                        message: "safety review rejected output".into(),
                                    },
                                },
                            )
                            .await;
                    }
                }
            }

            // ── Final response? ──
            if response.message.tool_calls.is_empty() {
                let response_text = response.message.content.clone();
                conversation.push(response.message);

                context
                    .dispatch(&AgentEvent::ClientChatAfter {
                        response: response_text.clone(),
                    })
                    .await;
                context
                    .dispatch(&AgentEvent::MainAgentFinished {
                        response: response_text.clone(),
                    })
                    .await;

                info!(task_id = %context.task_id, iterations = iteration, "Agent run finished");
                return self
                    .finish(
                        context,
                        RunOutcome {
                            response: response_text,
                            termination: Termination::Finished,
                        },
                    )
                    .await;
            }

            // ── Tool execution ──
            let request_message_id = response.message.id.clone();
            let calls: Vec<ToolCall> = response
                .message
                .tool_calls
                .iter()
                .map(|tc| ToolCall {
                    id: tc.id.clone(),
                    name: tc.name.clone(),
                    arguments: serde_json::from_str(&tc.arguments)
                        .unwrap_or(serde_json::Value::Null),
                })
                .collect();
            conversation.push(response.message);

            debug!(
                task_id = %context.task_id,
                tool_count = calls.len(),
                "Executing tool calls"
            );
            let results = self
                .dispatcher
                .dispatch(&calls, context, &request_message_id)
                .await;

            for result in &results {
                let content = match (&result.content, &result.error) {
                    (Some(content), _) => content.clone(),
                    (None, Some(error)) => format!("Error: {error}"),
                    (None, None) => String::new(),
                };
                conversation.push(Message::tool_result(&result.call_id, content));
            }
            // Loop back — the model sees the tool results and decides.
        }
    }

    /// Stop the run's background workers, then hand back the outcome.
    async fn finish(&self, context: &Arc<AgentContext>, outcome: RunOutcome) -> RunOutcome {
        let failures = self.supervisor.stop_all().await;
        if !failures.is_empty() {
            warn!(
                task_id = %context.task_id,
                failures = failures.len(),
                "Some workers failed to stop during run teardown"
            );
        }
        outcome
    }

    /// Internal failure: dispatch the error event, log detail, and return
    /// the apologetic user-facing message.
    async fn fail(
        &self,
        context: &Arc<AgentContext>,
        stage: &str,
        message: String,
    ) -> RunOutcome {
        context
            .dispatch(&AgentEvent::Error {
                stage: stage.into(),
                message: message.clone(),
            })
            .await;
        self.finish(
            context,
            RunOutcome {
                response: APOLOGY.into(),
                termination: Termination::Failed { message },
            },
        )
        .await
    }
}

/// Truncate model output for event payloads.
fn preview(content: &str) -> String {
    const MAX: usize = 120;
    if content.len() <= MAX {
        return content.to_string();
    }
    let cut = content
        .char_indices()
        .take_while(|(i, _)| *i < MAX)
        .last()
        .map_or(0, |(i, c)| i + c.len_utf8());
    format!("{}…", &content[..cut])
}

/// Builder for [`AgentLoop`].
pub struct AgentLoopBuilder {
    provider: Arc<dyn Provider>,
    tools: Arc<ToolRegistry>,
    gate: Arc<CostLimitGate>,
    supervisor: Arc<ProcessSupervisor>,
    model: String,
    temperature: f32,
    max_tokens: Option<u32>,
    parallel_tools: bool,
    tool_group_timeout: Option<Duration>,
    safety: Option<Arc<dyn SafetyReviewer>>,
    max_iterations: u32,
    user_id: Option<String>,
}

impl AgentLoopBuilder {
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn max_tokens(mut self, max: u32) -> Self {
        self.max_tokens = Some(max);
        self
    }

    /// Fan one turn's tool calls out concurrently, optionally bounded by
    /// a group timeout.
    pub fn parallel_tools(mut self, group_timeout: Option<Duration>) -> Self {
        self.parallel_tools = true;
        self.tool_group_timeout = group_timeout;
        self
    }

    pub fn safety_reviewer(mut self, reviewer: Arc<dyn SafetyReviewer>) -> Self {
        self.safety = Some(reviewer);
        self
    }

    pub fn max_iterations(mut self, max: u32) -> Self {
        self.max_iterations = max;
        self
    }

    /// The user this run is attributed to, for cost-gate exemptions.
    pub fn user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Apply `[agent]` settings from a loaded configuration.
    pub fn configure(mut self, config: &ConductorConfig) -> Self {
        self.model = config.agent.model.clone();
        self.temperature = config.agent.temperature;
        self.max_iterations = config.agent.max_iterations;
        self.parallel_tools = config.agent.parallel_tool_calls;
        self.tool_group_timeout = config
            .agent
            .tool_group_timeout_secs
            .map(Duration::from_secs);
        self
    }

    pub fn build(self) -> Result<AgentLoop, RunnerError> {
        let dispatcher = if self.parallel_tools {
            ToolDispatcher::parallel(Arc::clone(&self.tools), self.tool_group_timeout)?
        } else {
            ToolDispatcher::sequential(Arc::clone(&self.tools))
        };
        Ok(AgentLoop {
            provider: self.provider,
            model: self.model,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            tools: self.tools,
            dispatcher,
            gate: self.gate,
            supervisor: self.supervisor,
            safety: self.safety,
            max_iterations: self.max_iterations,
            user_id: self.user_id,
        })
    }
}
