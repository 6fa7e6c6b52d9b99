//! Parallel task runner — N independent operations, concurrent execution,
//! ordered outcomes.
//!
//! Queue tasks with [`ParallelRunner::add`], launch them all with
//! [`ParallelRunner::start`], and collect per-slot outcomes with
//! [`ParallelRunner::wait`]. One task's failure never touches its
//! siblings; a group timeout abandons the whole batch atomically.

use conductor_core::error::RunnerError;
use futures::future::BoxFuture;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, warn};

/// Failure of a single task, captured in that task's output slot.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    /// The task returned an error of its own.
    #[error("{0}")]
    Failed(String),

    /// The task panicked; the panic payload is captured as text.
    #[error("task panicked: {0}")]
    Panicked(String),

    /// The task was aborted before completing.
    #[error("task cancelled")]
    Cancelled,
}

impl TaskError {
    /// Capture an arbitrary error as a task failure.
    pub fn failed(err: impl std::fmt::Display) -> Self {
        Self::Failed(err.to_string())
    }
}

/// A queued unit of work: a boxed future with its arguments already bound.
pub type TaskFuture<T> = BoxFuture<'static, Result<T, TaskError>>;

/// The per-slot result of one task: its value or its captured failure.
pub type TaskOutcome<T> = Result<T, TaskError>;

/// Runs queued tasks concurrently on the tokio scheduler and returns their
/// outcomes in submission order.
///
/// Tasks that perform blocking I/O must offload to a blocking pool
/// (`tokio::task::spawn_blocking`) before being queued; the runner itself
/// adds no threads.
pub struct ParallelRunner<T> {
    queued: Vec<TaskFuture<T>>,
    handles: Option<Vec<JoinHandle<TaskOutcome<T>>>>,
    timeout: Option<Duration>,
}

impl<T: Send + 'static> ParallelRunner<T> {
    /// A runner with no group timeout.
    pub fn new() -> Self {
        Self {
            queued: Vec::new(),
            handles: None,
            timeout: None,
        }
    }

    /// A runner whose whole batch must finish within `timeout`.
    pub fn with_timeout(timeout: Duration) -> Result<Self, RunnerError> {
        if timeout.is_zero() {
            return Err(RunnerError::InvalidTimeout);
        }
        Ok(Self {
            queued: Vec::new(),
            handles: None,
            timeout: Some(timeout),
        })
    }

    /// Queue a task. Arguments are bound by closure capture.
    pub fn add<F>(&mut self, task: F)
    where
        F: Future<Output = TaskOutcome<T>> + Send + 'static,
    {
        self.queued.push(Box::pin(task));
    }

    /// Number of tasks queued but not yet started.
    pub fn queued_len(&self) -> usize {
        self.queued.len()
    }

    /// Schedule every queued task onto the runtime without blocking the
    /// caller. Tasks begin running concurrently immediately.
    pub fn start(&mut self) {
        let spawned: Vec<_> = self.queued.drain(..).map(tokio::spawn).collect();
        debug!(tasks = spawned.len(), "Started parallel task group");
        self.handles.get_or_insert_with(Vec::new).extend(spawned);
    }

    /// Block until all started tasks complete, returning outcomes in
    /// submission order.
    ///
    /// With a group timeout configured, an overrun aborts every
    /// still-pending task and fails the whole call with
    /// [`RunnerError::GroupTimeout`] — already-completed slots are
    /// deliberately not reported.
    pub async fn wait(&mut self) -> Result<Vec<TaskOutcome<T>>, RunnerError> {
        let mut handles = self.handles.take().ok_or(RunnerError::NotStarted)?;

        let gather = async {
            let mut outcomes = Vec::with_capacity(handles.len());
            for handle in &mut handles {
                outcomes.push(flatten(handle.await));
            }
            outcomes
        };

        match self.timeout {
            None => Ok(gather.await),
            Some(limit) => {
                let gathered = tokio::time::timeout(limit, gather).await;
                match gathered {
                    Ok(outcomes) => Ok(outcomes),
                    Err(_) => {
                        warn!(
                            tasks = handles.len(),
                            timeout = ?limit,
                            "Task group timed out; aborting outstanding tasks"
                        );
                        for handle in &handles {
                            handle.abort();
                        }
                        Err(RunnerError::GroupTimeout { elapsed: limit })
                    }
                }
            }
        }
    }

    /// `start()` followed by `wait()`.
    pub async fn run(&mut self) -> Result<Vec<TaskOutcome<T>>, RunnerError> {
        self.start();
        self.wait().await
    }

    /// One-shot batch of differing callables with their argument groups
    /// already bound.
    pub async fn execute(
        operations: impl IntoIterator<Item = TaskFuture<T>>,
    ) -> Result<Vec<TaskOutcome<T>>, RunnerError> {
        let mut runner = Self::new();
        runner.queued.extend(operations);
        runner.run().await
    }
}

impl<T: Send + 'static> Default for ParallelRunner<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Collapse a join result into the task's own outcome, capturing panics
/// and aborts as per-slot errors.
fn flatten<T>(joined: Result<TaskOutcome<T>, JoinError>) -> TaskOutcome<T> {
    match joined {
        Ok(outcome) => outcome,
        Err(join_err) if join_err.is_panic() => {
            let payload = join_err.into_panic();
            let msg = payload
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic payload".to_string());
            Err(TaskError::Panicked(msg))
        }
        Err(_) => Err(TaskError::Cancelled),
    }
}
