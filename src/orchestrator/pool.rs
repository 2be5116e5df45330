//! Worker pool supervision.
//!
//! The [`WorkerPoolManager`] spawns one task per [`WorkerAssignment`], each
//! driving one engine process through a [`WorkerRunner`]. Every task owns a
//! `oneshot` sender carrying its single terminal [`WorkerResult`]; the
//! manager awaits the receivers in worker-index order, so results are
//! ordered deterministically regardless of completion order.
//!
//! Per-worker failures stay contained. Pool-wide shutdown goes through
//! [`terminate_all_workers`](WorkerPoolManager::terminate_all_workers),
//! which cancels every worker (each then runs its own `SIGTERM` → grace →
//! `SIGKILL` sequence) and waits for the pool to drain.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Notify, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::runner::{WorkerResult, WorkerRunner, WorkerStatus};
use super::scheduler::Schedule;
use crate::report::Reporter;

/// Why the pool is being shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// A resource emergency was raised.
    Emergency,
    /// The process received an interrupt or terminate signal.
    Signal,
    /// Normal end-of-run cleanup.
    Shutdown,
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TerminationReason::Emergency => write!(f, "emergency"),
            TerminationReason::Signal => write!(f, "signal"),
            TerminationReason::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Results of one pool run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolOutcome {
    /// One result per assignment, in worker-index order.
    pub results: Vec<WorkerResult>,
    pub total_workers: usize,
    pub successful_workers: usize,
    /// Workers that failed tests or timed out.
    pub failed_workers: usize,
    /// Workers that crashed or were terminated.
    pub error_workers: usize,
}

impl PoolOutcome {
    /// Counts worker statuses.
    pub fn from_results(results: Vec<WorkerResult>) -> Self {
        let count = |f: fn(WorkerStatus) -> bool| results.iter().filter(|r| f(r.status)).count();
        Self {
            total_workers: results.len(),
            successful_workers: count(|s| s == WorkerStatus::Succeeded),
            failed_workers: count(|s| matches!(s, WorkerStatus::Failed | WorkerStatus::TimedOut)),
            error_workers: count(|s| {
                matches!(s, WorkerStatus::Crashed | WorkerStatus::Terminated)
            }),
            results,
        }
    }
}

struct PoolShared {
    cancel: CancellationToken,
    completed: Mutex<Vec<WorkerResult>>,
    active: AtomicUsize,
    idle: Notify,
    test_lists: Mutex<Vec<PathBuf>>,
    cleaned: AtomicBool,
}

/// Decrements the active count when a worker task ends, even by panic.
struct ActiveGuard(Arc<PoolShared>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        if self.0.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

/// Spawns and supervises worker processes.
pub struct WorkerPoolManager {
    runner: WorkerRunner,
    reporter: Arc<dyn Reporter>,
    shared: Arc<PoolShared>,
}

impl WorkerPoolManager {
    pub fn new(runner: WorkerRunner, reporter: Arc<dyn Reporter>) -> Self {
        Self {
            runner,
            reporter,
            shared: Arc::new(PoolShared {
                cancel: CancellationToken::new(),
                completed: Mutex::new(Vec::new()),
                active: AtomicUsize::new(0),
                idle: Notify::new(),
                test_lists: Mutex::new(Vec::new()),
                cleaned: AtomicBool::new(false),
            }),
        }
    }

    /// Runs every assignment concurrently and waits for all of them.
    ///
    /// Must be called from within a Tokio runtime. Returns once every worker
    /// is terminal.
    pub async fn run_workers(&self, schedule: &Schedule) -> PoolOutcome {
        let mut receivers = Vec::with_capacity(schedule.assignments.len());

        for assignment in &schedule.assignments {
            let (tx, rx) = oneshot::channel();
            receivers.push((assignment, rx));

            self.lock_lists()
                .push(self.runner.test_list_path(assignment.worker));

            self.reporter.on_worker_start(assignment).await;

            let runner = self.runner.clone();
            let reporter = self.reporter.clone();
            let shared = self.shared.clone();
            let token = self.shared.cancel.child_token();
            let assignment = assignment.clone();

            self.shared.active.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let _guard = ActiveGuard(shared.clone());
                let result = runner.run(&assignment, token).await;
                shared
                    .completed
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push(result.clone());
                reporter.on_worker_complete(&result).await;
                let _ = tx.send(result);
            });
        }

        info!("Started {} workers", receivers.len());

        let mut results = Vec::with_capacity(receivers.len());
        for (assignment, rx) in receivers {
            match rx.await {
                Ok(result) => results.push(result),
                Err(_) => {
                    warn!("Worker {} ended without reporting", assignment.worker);
                    results.push(WorkerResult::crashed(
                        assignment,
                        self.runner.worker_dir(assignment.worker).join("worker.log"),
                        "worker task ended without reporting a result".to_string(),
                    ));
                }
            }
        }

        let outcome = PoolOutcome::from_results(results);
        info!(
            "Workers finished: {} succeeded, {} failed, {} errors",
            outcome.successful_workers, outcome.failed_workers, outcome.error_workers
        );
        outcome
    }

    /// Stops every running worker and waits for the pool to drain.
    ///
    /// Each worker receives `SIGTERM`, gets the grace period to exit, and is
    /// then killed. Waits at most twice the grace period plus one second.
    pub async fn terminate_all_workers(&self, reason: TerminationReason) {
        let active = self.active_workers();
        match reason {
            TerminationReason::Shutdown => {
                debug!("Terminating {} workers ({})", active, reason)
            }
            _ => warn!("Terminating {} workers ({})", active, reason),
        }

        self.shared.cancel.cancel();

        let limit = self.runner.grace() * 2 + Duration::from_secs(1);
        let drained = tokio::time::timeout(limit, async {
            loop {
                let notified = self.shared.idle.notified();
                if self.active_workers() == 0 {
                    break;
                }
                notified.await;
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                "{} workers still running {:?} after termination",
                self.active_workers(),
                limit
            );
        }
    }

    /// Number of workers not yet terminal.
    pub fn active_workers(&self) -> usize {
        self.shared.active.load(Ordering::SeqCst)
    }

    /// Results that have arrived so far, in completion order.
    pub fn completed_results(&self) -> Vec<WorkerResult> {
        self.shared
            .completed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Releases pool resources: cancels anything still running and removes
    /// the per-worker test lists. Logs and artifacts stay. Idempotent.
    pub fn cleanup(&self) {
        if self.shared.cleaned.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.cancel.cancel();

        let lists = std::mem::take(&mut *self.lock_lists());
        for path in &lists {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => debug!("Could not remove {}: {}", path.display(), e),
            }
        }
        debug!("Pool cleaned up ({} test lists)", lists.len());
    }

    fn lock_lists(&self) -> std::sync::MutexGuard<'_, Vec<PathBuf>> {
        self.shared
            .test_lists
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for WorkerPoolManager {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}
