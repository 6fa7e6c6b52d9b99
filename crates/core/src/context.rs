//! Run and invocation contexts.
//!
//! An [`AgentContext`] lives for one agent run and owns the run's
//! identifiers, metadata, and event listener registry. A [`ToolContext`]
//! lives for one tool invocation and holds a weak back-reference to its
//! run — tool executions never keep a run alive past its end.

use crate::event::{AgentEvent, DispatchOutcome, EventBus, EventHandler, EventKind};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, Weak};
use uuid::Uuid;

/// Per-run context: identifiers, metadata, and the lifecycle event bus.
///
/// Created at run start via [`AgentContext::builder`], shared as
/// `Arc<AgentContext>` for the duration of the run, discarded at run end.
/// Metadata is the only field mutated after construction; the listener
/// registry is frozen when `build()` is called.
#[derive(Debug)]
pub struct AgentContext {
    /// Task identifier for this run
    pub task_id: String,

    /// Workspace directory the run operates in
    pub workspace_dir: PathBuf,

    /// Sandbox identifier scoping cost accounting and background workers
    pub sandbox_id: String,

    /// Organization code
    pub org_code: String,

    /// Arbitrary run-scoped metadata, mutated by listeners and dispatch
    metadata: RwLock<HashMap<String, Value>>,

    /// Lifecycle event listener registry, keyed by event kind
    events: EventBus,
}

impl AgentContext {
    /// Start building a context for the given task.
    pub fn builder(task_id: impl Into<String>) -> AgentContextBuilder {
        AgentContextBuilder::new(task_id)
    }

    /// The run's event bus.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Dispatch a lifecycle event to every listener of its kind.
    pub async fn dispatch(&self, event: &AgentEvent) -> DispatchOutcome {
        self.events.dispatch_event(event).await
    }

    /// Set a metadata entry, returning the previous value if any.
    pub fn set_metadata(&self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.metadata.write().unwrap().insert(key.into(), value)
    }

    /// Read a metadata entry.
    pub fn get_metadata(&self, key: &str) -> Option<Value> {
        self.metadata.read().unwrap().get(key).cloned()
    }

    /// A point-in-time copy of all metadata.
    pub fn metadata_snapshot(&self) -> HashMap<String, Value> {
        self.metadata.read().unwrap().clone()
    }

    /// Begin a child context for a sub-agent run.
    ///
    /// Copies identifiers and a snapshot of the metadata; listeners are
    /// never inherited — the sub-agent registers its own.
    pub fn child(&self, task_id: impl Into<String>) -> AgentContextBuilder {
        AgentContextBuilder {
            task_id: task_id.into(),
            workspace_dir: self.workspace_dir.clone(),
            sandbox_id: self.sandbox_id.clone(),
            org_code: self.org_code.clone(),
            metadata: self.metadata_snapshot(),
            events: EventBus::new(),
        }
    }
}

/// Builder for [`AgentContext`] — listener registration happens here,
/// before the context is frozen into an `Arc`.
pub struct AgentContextBuilder {
    task_id: String,
    workspace_dir: PathBuf,
    sandbox_id: String,
    org_code: String,
    metadata: HashMap<String, Value>,
    events: EventBus,
}

impl AgentContextBuilder {
    fn new(task_id: impl Into<String>) -> Self {
        let task_id = task_id.into();
        Self {
            workspace_dir: PathBuf::from("."),
            sandbox_id: task_id.clone(),
            org_code: String::new(),
            metadata: HashMap::new(),
            events: EventBus::new(),
            task_id,
        }
    }

    pub fn workspace_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.workspace_dir = dir.as_ref().to_path_buf();
        self
    }

    pub fn sandbox_id(mut self, id: impl Into<String>) -> Self {
        self.sandbox_id = id.into();
        self
    }

    pub fn org_code(mut self, code: impl Into<String>) -> Self {
        self.org_code = code.into();
        self
    }

    /// Seed a metadata entry.
    pub fn metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Register a lifecycle event listener.
    pub fn on(mut self, kind: EventKind, handler: Arc<dyn EventHandler>) -> Self {
        self.events.add_event_listener(kind, handler);
        self
    }

    /// Freeze the context. No further listeners can be registered.
    pub fn build(self) -> Arc<AgentContext> {
        Arc::new(AgentContext {
            task_id: self.task_id,
            workspace_dir: self.workspace_dir,
            sandbox_id: self.sandbox_id,
            org_code: self.org_code,
            metadata: RwLock::new(self.metadata),
            events: self.events,
        })
    }
}

/// Per-invocation context handed to a tool's `execute`.
///
/// Weak-references the owning run: if the run ended, `agent()` returns
/// `None` and the tool should wind down. Carries a per-call progress bus
/// for finer-grained events during this single execution.
#[derive(Debug)]
pub struct ToolContext {
    agent: Weak<AgentContext>,

    /// Generated identifier unique to this invocation
    pub invocation_id: String,

    /// The tool's declared name
    pub tool_name: String,

    /// The call ID from the model response this invocation answers
    pub call_id: String,

    /// The argument mapping for this call
    pub arguments: serde_json::Map<String, Value>,

    /// Per-call sub-bus for progress events during this execution
    progress: EventBus,
}

impl ToolContext {
    pub fn new(
        agent: &Arc<AgentContext>,
        tool_name: impl Into<String>,
        call_id: impl Into<String>,
        arguments: serde_json::Map<String, Value>,
    ) -> Self {
        Self {
            agent: Arc::downgrade(agent),
            invocation_id: Uuid::new_v4().to_string(),
            tool_name: tool_name.into(),
            call_id: call_id.into(),
            arguments,
            progress: EventBus::new(),
        }
    }

    /// Attach a pre-configured progress bus for this call.
    pub fn with_progress(mut self, progress: EventBus) -> Self {
        self.progress = progress;
        self
    }

    /// Upgrade the back-reference to the owning run, if it still exists.
    pub fn agent(&self) -> Option<Arc<AgentContext>> {
        self.agent.upgrade()
    }

    /// The per-call progress bus.
    pub fn progress(&self) -> &EventBus {
        &self.progress
    }

    /// Emit a progress event on the per-call bus.
    pub async fn emit_progress(
        &self,
        message: impl Into<String>,
        fraction: Option<f32>,
    ) -> DispatchOutcome {
        self.progress
            .dispatch_event(&AgentEvent::ToolProgress {
                message: message.into(),
                fraction,
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EventError;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct CountingHandler {
        hits: Arc<Mutex<usize>>,
    }

    #[async_trait]
    impl EventHandler for CountingHandler {
        fn name(&self) -> &str {
            "counting"
        }
        async fn handle(&self, _event: &AgentEvent) -> Result<(), EventError> {
            *self.hits.lock().unwrap() += 1;
            Ok(())
        }
    }

    #[test]
    fn builder_sets_identifiers() {
        let ctx = AgentContext::builder("task-42")
            .workspace_dir("/tmp/ws")
            .sandbox_id("sbx-1")
            .org_code("acme")
            .build();
        assert_eq!(ctx.task_id, "task-42");
        assert_eq!(ctx.workspace_dir, PathBuf::from("/tmp/ws"));
        assert_eq!(ctx.sandbox_id, "sbx-1");
        assert_eq!(ctx.org_code, "acme");
    }

    #[test]
    fn sandbox_defaults_to_task_id() {
        let ctx = AgentContext::builder("task-7").build();
        assert_eq!(ctx.sandbox_id, "task-7");
    }

    #[test]
    fn metadata_roundtrip() {
        let ctx = AgentContext::builder("t").build();
        assert!(ctx.get_metadata("k").is_none());
        ctx.set_metadata("k", serde_json::json!(1));
        assert_eq!(ctx.get_metadata("k"), Some(serde_json::json!(1)));

        let prev = ctx.set_metadata("k", serde_json::json!(2));
        assert_eq!(prev, Some(serde_json::json!(1)));
    }

    #[test]
    fn child_copies_metadata_but_not_listeners() {
        let hits = Arc::new(Mutex::new(0));
        let parent = AgentContext::builder("parent")
            .sandbox_id("sbx")
            .metadata("inherited", serde_json::json!(true))
            .on(
                EventKind::AfterInit,
                Arc::new(CountingHandler {
                    hits: Arc::clone(&hits),
                }),
            )
            .build();

        let sub = parent.child("child-task").build();
        assert_eq!(sub.task_id, "child-task");
        assert_eq!(sub.sandbox_id, "sbx");
        assert_eq!(sub.get_metadata("inherited"), Some(serde_json::json!(true)));
        assert_eq!(sub.events().listener_count(EventKind::AfterInit), 0);
        assert_eq!(parent.events().listener_count(EventKind::AfterInit), 1);
    }

    #[tokio::test]
    async fn tool_context_weak_reference() {
        let agent = AgentContext::builder("t").build();
        let tc = ToolContext::new(&agent, "echo", "call_1", serde_json::Map::new());
        assert!(tc.agent().is_some());
        assert_eq!(tc.tool_name, "echo");
        assert!(!tc.invocation_id.is_empty());

        drop(agent);
        assert!(tc.agent().is_none(), "ToolContext must not keep the run alive");
    }

    #[tokio::test]
    async fn progress_events_stay_on_the_call_bus() {
        let hits = Arc::new(Mutex::new(0));
        let agent = AgentContext::builder("t").build();

        let mut progress = EventBus::new();
        progress.add_event_listener(
            EventKind::ToolProgress,
            Arc::new(CountingHandler {
                hits: Arc::clone(&hits),
            }),
        );
        let tc = ToolContext::new(&agent, "upload", "call_1", serde_json::Map::new())
            .with_progress(progress);

        tc.emit_progress("halfway", Some(0.5)).await;
        assert_eq!(*hits.lock().unwrap(), 1);
        // The run bus saw nothing.
        assert_eq!(agent.events().listener_count(EventKind::ToolProgress), 0);
    }
}
