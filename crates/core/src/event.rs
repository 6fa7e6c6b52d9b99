//! Lifecycle event system — typed publish/subscribe over agent run phases.
//!
//! Cross-cutting concerns (uploaders, indexers, cost accounting) observe
//! agent progress exclusively through this bus; the orchestration core
//! never imports them directly. Events form a closed tagged union with one
//! statically-known payload per kind, and the bus dispatches by kind so a
//! listener registered for kind K is only ever invoked with K's payload.

use crate::error::EventError;
use crate::provider::Usage;
use crate::tool::ToolResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// All lifecycle events emitted during an agent run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AgentEvent {
    /// The run is about to initialize.
    BeforeInit { task_id: String },

    /// Initialization completed; the conversation loop is about to start.
    AfterInit { task_id: String },

    /// An LLM request is about to be sent.
    BeforeLlmRequest { model: String, message_count: usize },

    /// An LLM response was received.
    AfterLlmRequest {
        model: String,
        content_preview: String,
        tool_call_count: usize,
        usage: Option<Usage>,
    },

    /// Model output is about to be safety-reviewed.
    BeforeSafetyCheck { content: String },

    /// A safety review completed.
    AfterSafetyCheck { passed: bool, reason: Option<String> },

    /// A tool is about to execute.
    BeforeToolCall {
        tool_name: String,
        call_id: String,
        arguments: serde_json::Value,
        /// ID of the assistant message that requested this call.
        request_message_id: String,
    },

    /// A tool finished executing.
    AfterToolCall {
        tool_name: String,
        call_id: String,
        result: ToolResult,
        elapsed: Duration,
    },

    /// The final response was handed to the client.
    ClientChatAfter { response: String },

    /// The run was suspended before producing a final response.
    AgentSuspended { reason: String },

    /// The main agent produced its final response and terminated normally.
    MainAgentFinished { response: String },

    /// A fatal error surfaced during the run.
    Error { stage: String, message: String },

    /// Fine-grained progress from inside a single tool execution.
    /// Dispatched on a ToolContext's per-call sub-bus, not the run bus.
    ToolProgress {
        message: String,
        fraction: Option<f32>,
    },
}

/// Field-less discriminant for [`AgentEvent`] — the dispatch key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    BeforeInit,
    AfterInit,
    BeforeLlmRequest,
    AfterLlmRequest,
    BeforeSafetyCheck,
    AfterSafetyCheck,
    BeforeToolCall,
    AfterToolCall,
    ClientChatAfter,
    AgentSuspended,
    MainAgentFinished,
    Error,
    ToolProgress,
}

impl AgentEvent {
    /// The kind this event dispatches under.
    pub fn kind(&self) -> EventKind {
        match self {
            Self::BeforeInit { .. } => EventKind::BeforeInit,
            Self::AfterInit { .. } => EventKind::AfterInit,
            Self::BeforeLlmRequest { .. } => EventKind::BeforeLlmRequest,
            Self::AfterLlmRequest { .. } => EventKind::AfterLlmRequest,
            Self::BeforeSafetyCheck { .. } => EventKind::BeforeSafetyCheck,
            Self::AfterSafetyCheck { .. } => EventKind::AfterSafetyCheck,
            Self::BeforeToolCall { .. } => EventKind::BeforeToolCall,
            Self::AfterToolCall { .. } => EventKind::AfterToolCall,
            Self::ClientChatAfter { .. } => EventKind::ClientChatAfter,
            Self::AgentSuspended { .. } => EventKind::AgentSuspended,
            Self::MainAgentFinished { .. } => EventKind::MainAgentFinished,
            Self::Error { .. } => EventKind::Error,
            Self::ToolProgress { .. } => EventKind::ToolProgress,
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// A typed lifecycle event handler.
///
/// Handlers for a given kind run strictly in registration order, awaited
/// one at a time — a later handler may depend on state set by an earlier
/// one. A handler that fails is logged and does not stop dispatch.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// A name for logs and dispatch outcomes.
    fn name(&self) -> &str;

    /// React to an event. Only events of the kind this handler was
    /// registered for are ever passed in.
    async fn handle(&self, event: &AgentEvent) -> std::result::Result<(), EventError>;
}

/// Outcome of one `dispatch_event` call.
#[derive(Debug, Default)]
pub struct DispatchOutcome {
    /// How many handlers were invoked.
    pub delivered: usize,
    /// Errors raised by individual handlers, in invocation order.
    pub handler_errors: Vec<EventError>,
}

impl DispatchOutcome {
    /// Whether every invoked handler succeeded.
    pub fn all_ok(&self) -> bool {
        self.handler_errors.is_empty()
    }
}

/// Dispatch table mapping event kind → ordered handler list.
///
/// Registration happens during setup, before the context is frozen into
/// an `Arc`; after that the table is read-only, so dispatch needs no
/// locking.
#[derive(Default)]
pub struct EventBus {
    listeners: HashMap<EventKind, Vec<Arc<dyn EventHandler>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for one event kind. Handlers fire in
    /// registration order.
    pub fn add_event_listener(&mut self, kind: EventKind, handler: Arc<dyn EventHandler>) {
        self.listeners.entry(kind).or_default().push(handler);
    }

    /// Number of handlers registered for a kind.
    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners.get(&kind).map_or(0, Vec::len)
    }

    /// Invoke every handler registered for this event's kind, in
    /// registration order, awaiting each before the next. Handler errors
    /// are logged and collected; they never abort dispatch.
    pub async fn dispatch_event(&self, event: &AgentEvent) -> DispatchOutcome {
        let mut outcome = DispatchOutcome::default();
        let Some(handlers) = self.listeners.get(&event.kind()) else {
            return outcome;
        };

        for handler in handlers {
            outcome.delivered += 1;
            if let Err(e) = handler.handle(event).await {
                warn!(
                    kind = %event.kind(),
                    handler = handler.name(),
                    error = %e,
                    "Event handler failed"
                );
                outcome.handler_errors.push(e);
            }
        }
        outcome
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let counts: HashMap<String, usize> = self
            .listeners
            .iter()
            .map(|(k, v)| (k.to_string(), v.len()))
            .collect();
        f.debug_struct("EventBus").field("listeners", &counts).finish()
    }
}
