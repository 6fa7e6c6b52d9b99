//! # Conductor Core
//!
//! Domain types, traits, and error definitions for the Conductor agent
//! runtime. This crate has **zero framework dependencies** — it defines
//! the domain model that all other crates implement against.
//!
//! ## Design Philosophy
//!
//! Every external collaborator is defined as a trait here (tools, LLM
//! transport, event listeners). Implementations live in their respective
//! crates or in downstream applications. This enables:
//! - Swapping implementations via configuration
//! - Easy testing with mock/stub implementations
//! - Clean dependency graph (all crates depend inward on core)

pub mod context;
pub mod error;
pub mod event;
pub mod message;
pub mod provider;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use context::{AgentContext, AgentContextBuilder, ToolContext};
pub use error::{
    CostError, Error, EventError, ProviderError, Result, RunnerError, ToolError, WorkerError,
};
pub use event::{AgentEvent, DispatchOutcome, EventBus, EventHandler, EventKind};
pub use message::{Conversation, ConversationId, Message, MessageToolCall, Role};
pub use provider::{Provider, ProviderRequest, ProviderResponse, ToolDefinition, Usage};
pub use tool::{Tool, ToolCall, ToolRegistry, ToolResult};
