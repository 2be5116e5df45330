//! Worker process execution.
//!
//! A [`WorkerRunner`] runs one [`WorkerAssignment`] as one OS process:
//!
//! 1. Creates the worker's private directory `<output>/workers/worker-<n>/`
//!    and writes the assigned test paths to `tests.txt`.
//! 2. Spawns the engine command in its own process group with stdout and
//!    stderr piped into `worker.log`.
//! 3. Waits for exit, the per-worker timeout, or cancellation.
//! 4. On timeout or cancellation, sends `SIGTERM` to the process group,
//!    waits the grace period, then sends `SIGKILL`.
//! 5. Parses the engine's JSON result from the captured stdout.
//!
//! The runner never fails: every path ends in exactly one [`WorkerResult`].

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::Child;
use tokio_stream::wrappers::LinesStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::scheduler::WorkerAssignment;
use crate::discovery::{serialize_millis, serialize_opt_millis};
use crate::engine::{Engine, EngineReport, WorkerContext};

/// Terminal state of a worker.
///
/// | Status | Meaning | Pool counter |
/// |--------|---------|--------------|
/// | `Succeeded` | Reported, no failures, exit code 0 | successful |
/// | `Failed` | Reported failures or exited non-zero | failed |
/// | `TimedOut` | Exceeded the per-worker timeout and was killed | failed |
/// | `Crashed` | Exited or could not start without reporting | errors |
/// | `Terminated` | Stopped by a pool-wide termination | errors |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WorkerStatus {
    Succeeded,
    Failed,
    Crashed,
    TimedOut,
    Terminated,
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkerStatus::Succeeded => "succeeded",
            WorkerStatus::Failed => "failed",
            WorkerStatus::Crashed => "crashed",
            WorkerStatus::TimedOut => "timedOut",
            WorkerStatus::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// Test counts for one worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStats {
    pub total: u64,
    pub passed: u64,
    pub failed: u64,
    pub skipped: u64,
}

impl From<&EngineReport> for WorkerStats {
    fn from(report: &EngineReport) -> Self {
        Self {
            total: report.tests,
            passed: report.passes,
            failed: report.failures,
            skipped: report.pending,
        }
    }
}

/// The single terminal result of one worker.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerResult {
    pub worker: usize,
    pub status: WorkerStatus,
    pub stats: WorkerStats,
    /// Wall-clock time from spawn to terminal state.
    #[serde(serialize_with = "serialize_millis")]
    pub duration: Duration,
    /// Time the engine reported for its own run.
    #[serde(serialize_with = "serialize_opt_millis")]
    pub engine_duration: Option<Duration>,
    /// Combined stdout/stderr of the worker process.
    pub log_path: PathBuf,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    /// Ids of the assigned tests.
    pub tests: Vec<String>,
}

impl WorkerResult {
    /// Result for a worker that ended without a usable report.
    pub fn crashed(assignment: &WorkerAssignment, log_path: PathBuf, error: String) -> Self {
        Self {
            worker: assignment.worker,
            status: WorkerStatus::Crashed,
            stats: WorkerStats::default(),
            duration: Duration::ZERO,
            engine_duration: None,
            log_path,
            exit_code: None,
            error: Some(error),
            tests: assignment.tests.iter().map(|t| t.id.clone()).collect(),
        }
    }
}

enum WaitOutcome {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

/// Runs assignments as engine processes.
///
/// Cheap to clone; every worker task gets its own copy.
#[derive(Debug, Clone)]
pub struct WorkerRunner {
    engine: Arc<Engine>,
    workers_dir: PathBuf,
    timeout: Duration,
    grace: Duration,
}

impl WorkerRunner {
    /// Creates a runner writing worker directories under
    /// `<output_dir>/workers`.
    pub fn new(engine: Arc<Engine>, output_dir: &Path, timeout: Duration, grace: Duration) -> Self {
        Self {
            engine,
            workers_dir: output_dir.join("workers"),
            timeout,
            grace,
        }
    }

    /// Grace period between `SIGTERM` and `SIGKILL`.
    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Private directory of worker `n`.
    pub fn worker_dir(&self, worker: usize) -> PathBuf {
        self.workers_dir.join(format!("worker-{}", worker))
    }

    /// File listing worker `n`'s tests.
    pub fn test_list_path(&self, worker: usize) -> PathBuf {
        self.worker_dir(worker).join("tests.txt")
    }

    /// Runs one assignment to a terminal state.
    ///
    /// Cancelling `cancel` stops the process gracefully and yields
    /// [`WorkerStatus::Terminated`].
    pub async fn run(&self, assignment: &WorkerAssignment, cancel: CancellationToken) -> WorkerResult {
        let start = Instant::now();
        let worker_dir = self.worker_dir(assignment.worker);
        let log_path = worker_dir.join("worker.log");
        let test_list = self.test_list_path(assignment.worker);

        if let Err(e) = prepare_dir(&worker_dir, &test_list, assignment).await {
            return WorkerResult::crashed(
                assignment,
                log_path,
                format!("failed to prepare {}: {}", worker_dir.display(), e),
            );
        }

        let cmd = self.engine.command(&WorkerContext {
            worker: assignment.worker,
            output_dir: &worker_dir,
            test_list: &test_list,
            tests: &assignment.tests,
        });
        debug!("Worker {}: {}", assignment.worker, cmd.to_shell_string());

        let mut process = cmd.to_tokio();
        process
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        let mut child = match process.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!("Worker {} failed to start: {}", assignment.worker, e);
                return WorkerResult::crashed(
                    assignment,
                    log_path,
                    format!("failed to spawn '{}': {}", cmd.program, e),
                );
            }
        };
        let pgid = child.id().map(|pid| Pid::from_raw(pid as i32));
        info!(
            "Worker {} started with {} tests (pid {:?})",
            assignment.worker,
            assignment.tests.len(),
            child.id()
        );

        let mut collector = tokio::spawn(collect_output(
            child.stdout.take(),
            child.stderr.take(),
            log_path.clone(),
        ));

        let outcome = tokio::select! {
            status = child.wait() => WaitOutcome::Exited(status),
            _ = tokio::time::sleep(self.timeout) => WaitOutcome::TimedOut,
            _ = cancel.cancelled() => WaitOutcome::Cancelled,
        };

        let exit = match &outcome {
            WaitOutcome::Exited(Ok(status)) => {
                // Stray processes left in the worker's group.
                if let Some(pgid) = pgid {
                    let _ = killpg(pgid, Signal::SIGTERM);
                }
                Some(*status)
            }
            WaitOutcome::Exited(Err(_)) => None,
            WaitOutcome::TimedOut => {
                warn!(
                    "Worker {} exceeded {:?}, stopping",
                    assignment.worker, self.timeout
                );
                stop_child(&mut child, pgid, self.grace).await
            }
            WaitOutcome::Cancelled => {
                debug!("Worker {} cancelled, stopping", assignment.worker);
                stop_child(&mut child, pgid, self.grace).await
            }
        };

        let stdout = match tokio::time::timeout(self.grace.max(Duration::from_secs(1)), &mut collector)
            .await
        {
            Ok(Ok(stdout)) => stdout,
            Ok(Err(e)) => {
                warn!("Worker {} output collector failed: {}", assignment.worker, e);
                String::new()
            }
            Err(_) => {
                collector.abort();
                warn!("Worker {} output did not close", assignment.worker);
                String::new()
            }
        };

        let report = EngineReport::parse(&stdout);
        let exit_code = exit.and_then(|s| s.code());
        let (status, error) = match outcome {
            WaitOutcome::Exited(Err(e)) => (
                WorkerStatus::Crashed,
                Some(format!("failed waiting for worker: {}", e)),
            ),
            WaitOutcome::Exited(Ok(exit_status)) => match &report {
                Some(r) if r.failures == 0 && exit_status.success() => (WorkerStatus::Succeeded, None),
                Some(r) if r.failures > 0 => (WorkerStatus::Failed, None),
                Some(_) => (
                    WorkerStatus::Failed,
                    Some(format!("engine exited with {}", exit_status)),
                ),
                None => (
                    WorkerStatus::Crashed,
                    Some(format!(
                        "engine exited with {} without reporting results",
                        exit_status
                    )),
                ),
            },
            WaitOutcome::TimedOut => (
                WorkerStatus::TimedOut,
                Some(format!("timed out after {:?}", self.timeout)),
            ),
            WaitOutcome::Cancelled => (
                WorkerStatus::Terminated,
                Some("terminated by pool shutdown".to_string()),
            ),
        };

        let result = WorkerResult {
            worker: assignment.worker,
            status,
            stats: report.as_ref().map(WorkerStats::from).unwrap_or_default(),
            duration: start.elapsed(),
            engine_duration: report.and_then(|r| r.duration),
            log_path,
            exit_code,
            error,
            tests: assignment.tests.iter().map(|t| t.id.clone()).collect(),
        };

        match result.status {
            WorkerStatus::Succeeded => info!(
                "Worker {} succeeded: {}/{} passed in {:?}",
                result.worker, result.stats.passed, result.stats.total, result.duration
            ),
            _ => warn!(
                "Worker {} {}: {} (log: {})",
                result.worker,
                result.status,
                result.error.as_deref().unwrap_or("test failures"),
                result.log_path.display()
            ),
        }
        result
    }
}

async fn prepare_dir(
    worker_dir: &Path,
    test_list: &Path,
    assignment: &WorkerAssignment,
) -> std::io::Result<()> {
    tokio::fs::create_dir_all(worker_dir).await?;
    let mut list = String::new();
    for test in &assignment.tests {
        list.push_str(&test.path.to_string_lossy());
        list.push('\n');
    }
    tokio::fs::write(test_list, list).await
}

enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Copies merged stdout/stderr into the log and returns stdout.
async fn collect_output(
    stdout: Option<tokio::process::ChildStdout>,
    stderr: Option<tokio::process::ChildStderr>,
    log_path: PathBuf,
) -> String {
    let stdout_stream = match stdout {
        Some(out) => LinesStream::new(BufReader::new(out).lines())
            .filter_map(|line| async move { line.ok().map(OutputLine::Stdout) })
            .boxed(),
        None => stream::empty().boxed(),
    };
    let stderr_stream = match stderr {
        Some(err) => LinesStream::new(BufReader::new(err).lines())
            .filter_map(|line| async move { line.ok().map(OutputLine::Stderr) })
            .boxed(),
        None => stream::empty().boxed(),
    };
    let mut combined = stream::select(stdout_stream, stderr_stream);

    let mut log = match tokio::fs::File::create(&log_path).await {
        Ok(file) => Some(BufWriter::new(file)),
        Err(e) => {
            warn!("Cannot create {}: {}", log_path.display(), e);
            None
        }
    };

    let mut captured = String::new();
    while let Some(line) = combined.next().await {
        let text = match &line {
            OutputLine::Stdout(s) => {
                captured.push_str(s);
                captured.push('\n');
                s
            }
            OutputLine::Stderr(s) => s,
        };
        if let Some(writer) = log.as_mut()
            && (writer.write_all(text.as_bytes()).await.is_err()
                || writer.write_all(b"\n").await.is_err())
        {
            warn!("Write to {} failed, dropping further output", log_path.display());
            log = None;
        }
    }

    if let Some(mut writer) = log {
        let _ = writer.flush().await;
    }
    captured
}

/// `SIGTERM` to the process group, bounded wait, then `SIGKILL`.
async fn stop_child(child: &mut Child, pgid: Option<Pid>, grace: Duration) -> Option<ExitStatus> {
    if let Some(pgid) = pgid
        && let Err(e) = killpg(pgid, Signal::SIGTERM)
    {
        debug!("SIGTERM to process group {} failed: {}", pgid, e);
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            if let Some(pgid) = pgid {
                let _ = killpg(pgid, Signal::SIGKILL);
            }
            return Some(status);
        }
        Ok(Err(e)) => warn!("Waiting for worker failed: {}", e),
        Err(_) => warn!("Worker ignored SIGTERM for {:?}, killing", grace),
    }

    if let Some(pgid) = pgid {
        let _ = killpg(pgid, Signal::SIGKILL);
    }
    if let Err(e) = child.kill().await {
        debug!("Kill failed: {}", e);
    }
    child.try_wait().ok().flatten()
}
