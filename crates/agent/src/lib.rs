//! The Conductor agent crate — the orchestration layer that composes the
//! parallel runner, the lifecycle event bus, the cost gate and the worker
//! supervisor into a conversation-driving loop.
//!
//! [`ToolDispatcher`] executes the tool calls of one model turn;
//! [`AgentLoop`] owns the run: init events, gated LLM calls, safety
//! review, tool dispatch, and worker teardown at every exit.

pub mod dispatcher;
pub mod loop_runner;

pub use dispatcher::{ExecutionMode, ToolDispatcher};
pub use loop_runner::{
    AgentLoop, AgentLoopBuilder, RunOutcome, SafetyReviewer, SafetyVerdict, Termination,
};
