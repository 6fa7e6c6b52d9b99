//! Background worker supervision.
//!
//! Auxiliary work whose lifetime is tied to an agent run — file watchers,
//! indexer daemons, preview servers — is started through the supervisor
//! and torn down with it. Workers are either supervised in-runtime tasks
//! with explicit handles and cancellation tokens, or external OS
//! processes. Shutdown is graceful first, forced after a grace window.
//! The supervisor never restarts a worker; restart policy belongs to the
//! caller.

use chrono::{DateTime, Utc};
use conductor_core::error::WorkerError;
use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lifecycle state of a managed worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Starting,
    Running,
    Stopped,
    Failed,
}

/// A snapshot of one worker's state.
#[derive(Debug, Clone)]
pub struct WorkerInfo {
    pub name: String,
    pub status: WorkerStatus,
    /// OS process id for command workers; `None` for task workers.
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
}

enum WorkerHandle {
    /// Supervised in-runtime task with a cooperative cancellation token.
    Task {
        handle: JoinHandle<()>,
        cancel: CancellationToken,
    },
    /// External OS process.
    Process { child: Child },
}

/// A named worker under supervision.
struct ManagedWorker {
    status: WorkerStatus,
    handle: WorkerHandle,
    started_at: DateTime<Utc>,
}

impl ManagedWorker {
    fn pid(&self) -> Option<u32> {
        match &self.handle {
            WorkerHandle::Process { child } => child.id(),
            WorkerHandle::Task { .. } => None,
        }
    }

    /// Refresh status from the underlying handle. A worker that exited
    /// on its own is marked `Failed` — the supervisor did not stop it.
    fn poll_status(&mut self) {
        if self.status != WorkerStatus::Running {
            return;
        }
        let exited = match &mut self.handle {
            WorkerHandle::Task { handle, .. } => handle.is_finished(),
            WorkerHandle::Process { child } => matches!(child.try_wait(), Ok(Some(_)) | Err(_)),
        };
        if exited {
            self.status = WorkerStatus::Failed;
        }
    }
}

/// Registry of named background workers tied to an agent run's lifetime.
///
/// The name→worker map is the shared state: start/stop hold its lock so
/// the at-most-one-running-per-name invariant survives concurrent starts.
pub struct ProcessSupervisor {
    workers: Mutex<HashMap<String, ManagedWorker>>,
    grace_period: Duration,
}

impl ProcessSupervisor {
    /// A supervisor with the default 5 second grace window.
    pub fn new() -> Self {
        Self {
            workers: Mutex::new(HashMap::new()),
            grace_period: Duration::from_secs(5),
        }
    }

    /// Override the graceful-shutdown grace window.
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Launch a supervised in-runtime worker under `name`.
    ///
    /// The factory receives a cancellation token; cancellation is
    /// advisory — the worker observes it at its own suspension points.
    /// Starting under a name that is already running stops the previous
    /// instance first.
    pub async fn start_worker<F, Fut>(&self, name: &str, factory: F) -> Result<(), WorkerError>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut workers = self.workers.lock().await;
        if let Some(previous) = workers.remove(name) {
            debug!(name, "Replacing running worker under the same name");
            self.stop_entry(name, previous).await.ok();
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(factory(cancel.clone()));
        workers.insert(
            name.to_string(),
            ManagedWorker {
                status: WorkerStatus::Running,
                handle: WorkerHandle::Task { handle, cancel },
                started_at: Utc::now(),
            },
        );
        info!(name, "Started task worker");
        Ok(())
    }

    /// Launch an external command under `name`.
    pub async fn start_worker_with_cmd(
        &self,
        name: &str,
        program: &str,
        args: &[&str],
        cwd: Option<&Path>,
    ) -> Result<(), WorkerError> {
        let mut workers = self.workers.lock().await;
        if let Some(previous) = workers.remove(name) {
            debug!(name, "Replacing running worker under the same name");
            self.stop_entry(name, previous).await.ok();
        }

        let mut command = Command::new(program);
        command.args(args).kill_on_drop(true);
        if let Some(dir) = cwd {
            command.current_dir(dir);
        }

        let child = command.spawn().map_err(|e| WorkerError::StartFailure {
            name: name.to_string(),
            reason: e.to_string(),
        })?;

        info!(name, pid = child.id(), program, "Started command worker");
        workers.insert(
            name.to_string(),
            ManagedWorker {
                status: WorkerStatus::Running,
                handle: WorkerHandle::Process { child },
                started_at: Utc::now(),
            },
        );
        Ok(())
    }

    /// Current status and PID for a named worker, or `None` if no worker
    /// is registered under that name.
    pub async fn get_worker_info(&self, name: &str) -> Option<WorkerInfo> {
        let mut workers = self.workers.lock().await;
        let worker = workers.get_mut(name)?;
        worker.poll_status();
        Some(WorkerInfo {
            name: name.to_string(),
            status: worker.status,
            pid: worker.pid(),
            started_at: worker.started_at,
        })
    }

    /// Names of all workers currently believed to be running.
    pub async fn running_workers(&self) -> Vec<String> {
        let mut workers = self.workers.lock().await;
        let mut names: Vec<String> = workers
            .iter_mut()
            .filter_map(|(name, worker)| {
                worker.poll_status();
                (worker.status == WorkerStatus::Running).then(|| name.clone())
            })
            .collect();
        names.sort();
        names
    }

    /// Request graceful termination of a named worker, forcing after the
    /// grace window, and remove its entry.
    pub async fn stop_worker(&self, name: &str) -> Result<(), WorkerError> {
        let worker = {
            let mut workers = self.workers.lock().await;
            workers
                .remove(name)
                .ok_or_else(|| WorkerError::NotFound(name.to_string()))?
        };
        self.stop_entry(name, worker).await
    }

    /// Stop every tracked worker. One stuck or failing worker never
    /// blocks shutdown of the rest; failures are logged and collected.
    pub async fn stop_all(&self) -> Vec<WorkerError> {
        let drained: Vec<(String, ManagedWorker)> = {
            let mut workers = self.workers.lock().await;
            workers.drain().collect()
        };

        let mut failures = Vec::new();
        for (name, worker) in drained {
            if let Err(e) = self.stop_entry(&name, worker).await {
                warn!(name = %name, error = %e, "Worker stop failed during shutdown");
                failures.push(e);
            }
        }
        failures
    }

    async fn stop_entry(&self, name: &str, mut worker: ManagedWorker) -> Result<(), WorkerError> {
        worker.status = WorkerStatus::Stopped;
        match worker.handle {
            WorkerHandle::Task { handle, cancel } => {
                cancel.cancel();
                let abort = handle.abort_handle();
                match tokio::time::timeout(self.grace_period, handle).await {
                    Ok(_) => {
                        debug!(name, "Task worker stopped gracefully");
                        Ok(())
                    }
                    Err(_) => {
                        abort.abort();
                        warn!(name, "Task worker ignored cancellation; aborted");
                        Ok(())
                    }
                }
            }
            WorkerHandle::Process { mut child } => {
                request_termination(&child);
                match tokio::time::timeout(self.grace_period, child.wait()).await {
                    Ok(Ok(status)) => {
                        debug!(name, %status, "Command worker exited");
                        Ok(())
                    }
                    Ok(Err(e)) => Err(WorkerError::StopFailure {
                        name: name.to_string(),
                        reason: e.to_string(),
                    }),
                    Err(_) => {
                        warn!(name, "Command worker ignored SIGTERM; killing");
                        child.kill().await.map_err(|e| WorkerError::StopFailure {
                            name: name.to_string(),
                            reason: e.to_string(),
                        })
                    }
                }
            }
        }
    }
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

/// Ask a child process to terminate gracefully.
#[cfg(unix)]
fn request_termination(child: &Child) {
    if let Some(pid) = child.id() {
        // SAFETY: pid comes from a live child we own; SIGTERM delivery
        // to a reaped pid is a harmless ESRCH.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
}

#[cfg(not(unix))]
fn request_termination(_child: &Child) {
    // No portable graceful signal; the grace window expires into kill().
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_supervisor() -> ProcessSupervisor {
        ProcessSupervisor::new().with_grace_period(Duration::from_millis(100))
    }

    #[tokio::test]
    async fn same_name_keeps_one_running_worker() {
        let supervisor = fast_supervisor();
        supervisor
            .start_worker("indexer", |cancel| async move { cancel.cancelled().await })
            .await
            .unwrap();
        supervisor
            .start_worker("indexer", |cancel| async move { cancel.cancelled().await })
            .await
            .unwrap();

        let running = supervisor.running_workers().await;
        assert_eq!(running, vec!["indexer".to_string()]);

        let info = supervisor.get_worker_info("indexer").await.unwrap();
        assert_eq!(info.status, WorkerStatus::Running);
        supervisor.stop_all().await;
    }

    #[tokio::test]
    async fn stop_all_clears_every_worker_even_stubborn_ones() {
        let supervisor = fast_supervisor();
        supervisor
            .start_worker("polite-1", |cancel| async move { cancel.cancelled().await })
            .await
            .unwrap();
        supervisor
            .start_worker("polite-2", |cancel| async move { cancel.cancelled().await })
            .await
            .unwrap();
        // Ignores its cancellation token entirely.
        supervisor
            .start_worker("stubborn", |_cancel| async move {
                tokio::time::sleep(Duration::from_secs(600)).await;
            })
            .await
            .unwrap();

        supervisor.stop_all().await;
        assert!(supervisor.running_workers().await.is_empty());
        assert!(supervisor.get_worker_info("stubborn").await.is_none());

        // Idempotent on an empty registry.
        assert!(supervisor.stop_all().await.is_empty());
    }

    #[tokio::test]
    async fn graceful_worker_stops_within_grace() {
        let supervisor = fast_supervisor();
        supervisor
            .start_worker("watcher", |cancel| async move { cancel.cancelled().await })
            .await
            .unwrap();

        supervisor.stop_worker("watcher").await.unwrap();
        assert!(supervisor.get_worker_info("watcher").await.is_none());
    }

    #[tokio::test]
    async fn self_exited_worker_is_marked_failed() {
        let supervisor = fast_supervisor();
        supervisor
            .start_worker("one-shot", |_cancel| async move {})
            .await
            .unwrap();

        // Give the task a moment to finish.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let info = supervisor.get_worker_info("one-shot").await.unwrap();
        assert_eq!(info.status, WorkerStatus::Failed);
        assert!(supervisor.running_workers().await.is_empty());
    }

    #[tokio::test]
    async fn stop_unknown_worker_is_not_found() {
        let supervisor = fast_supervisor();
        let err = supervisor.stop_worker("ghost").await.unwrap_err();
        assert!(matches!(err, WorkerError::NotFound(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_worker_start_and_stop() {
        let supervisor = fast_supervisor();
        supervisor
            .start_worker_with_cmd("sleeper", "sh", &["-c", "sleep 600"], None)
            .await
            .unwrap();

        let info = supervisor.get_worker_info("sleeper").await.unwrap();
        assert_eq!(info.status, WorkerStatus::Running);
        assert!(info.pid.is_some());

        supervisor.stop_worker("sleeper").await.unwrap();
        assert!(supervisor.get_worker_info("sleeper").await.is_none());
    }

    #[tokio::test]
    async fn command_worker_spawn_failure_is_start_failure() {
        let supervisor = fast_supervisor();
        let err = supervisor
            .start_worker_with_cmd("broken", "/nonexistent/binary", &[], None)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::StartFailure { .. }));
        assert!(supervisor.get_worker_info("broken").await.is_none());
    }
}
