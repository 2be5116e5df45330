//! Run orchestration.
//!
//! This module composes resource admission, scheduling, worker execution
//! and reporting into a single run.
//!
//! # Architecture
//!
//! ```text
//!   TestDiscoverer            ResourceMonitor
//!         │                         │
//!         │ discover()              │ check_resources()
//!         ▼                         ▼
//!    TestCatalog ──────────► safety check + worker count
//!                                   │
//!                                   ▼
//!                       TestScheduler::schedule_tests()
//!                                   │
//!                                   ▼
//!                     Schedule (Vec<WorkerAssignment>)
//!                                   │
//!                                   ▼
//!            WorkerPoolManager::run_workers() ◄──── monitor events,
//!                   │         │                     signals
//!             WorkerRunner  WorkerRunner ...
//!                   │         │
//!                   ▼         ▼
//!             Vec<WorkerResult> (worker-index order)
//!                        │
//!                        ▼
//!      ExecutionReport ──► JSON + text reports, duration history
//! ```
//!
//! # States
//!
//! `Idle → Initializing → Scheduling → Running → Aggregating → Completed`.
//! A resource emergency while workers run goes
//! `Running → EmergencyShutdown → Terminated`; an interrupt or terminate
//! signal, or any fatal error, ends in `Terminated`.
//!
//! # Example
//!
//! ```no_run
//! use shardrun::config::load_config;
//! use shardrun::orchestrator::Orchestrator;
//! use shardrun::report::ConsoleReporter;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("shardrun.toml"))?;
//!     let orchestrator = Orchestrator::system(config, ConsoleReporter::new(false));
//!
//!     let outcome = orchestrator.run().await?;
//!     std::process::exit(outcome.exit_code);
//! }
//! ```

pub mod pool;
pub mod runner;
pub mod scheduler;

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::discovery::{DiscoveryError, DurationHistory, TestCatalog, TestDiscoverer};
use crate::engine::{Engine, EngineError};
use crate::report::{
    ExecutionReport, ExecutionSummary, PartialReport, ReportError, Reporter, text,
};
use crate::resource::{
    EmergencyAlert, ResourceError, ResourceEvent, ResourceMonitor, ResourceSnapshot,
};

pub use pool::{PoolOutcome, TerminationReason, WorkerPoolManager};
pub use runner::{WorkerResult, WorkerRunner, WorkerStats, WorkerStatus};
pub use scheduler::{Schedule, ScheduleConstraints, Strategy, TestScheduler, WorkerAssignment};

/// Lifecycle state of an [`Orchestrator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Initializing,
    Scheduling,
    Running,
    Aggregating,
    Completed,
    EmergencyShutdown,
    Terminated,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RunState::Idle => "idle",
            RunState::Initializing => "initializing",
            RunState::Scheduling => "scheduling",
            RunState::Running => "running",
            RunState::Aggregating => "aggregating",
            RunState::Completed => "completed",
            RunState::EmergencyShutdown => "emergency-shutdown",
            RunState::Terminated => "terminated",
        };
        write!(f, "{}", name)
    }
}

/// Errors that abort a whole run.
///
/// Failures of individual workers are not errors; they are recorded as a
/// [`WorkerStatus`] in the report.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    /// The pre-run resource check failed. No worker was started.
    #[error("System resources are not safe for a run: {}", .0.join("; "))]
    ResourceUnsafe(Vec<String>),

    /// Discovery found no tests.
    #[error("No tests found under {}", .0.display())]
    DiscoveryEmpty(PathBuf),

    /// The scheduler produced no assignments.
    #[error("Schedule is empty")]
    EmptySchedule,

    /// The monitor raised an emergency while workers were running.
    #[error("Emergency shutdown ({}): {}", .0.kind, .0.message)]
    EmergencyResourceBreach(EmergencyAlert),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error(transparent)]
    Resource(#[from] ResourceError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Report(#[from] ReportError),
}

impl RunError {
    /// Process exit status for a failed run.
    pub fn exit_code(&self) -> i32 {
        1
    }
}

/// Result of a run that reached aggregation.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub report: ExecutionReport,
    /// 0 if every worker succeeded with no failing test, 1 otherwise.
    pub exit_code: i32,
    /// Whether the run was cut short by a signal or shutdown request.
    pub interrupted: bool,
}

enum Stop {
    Finished(PoolOutcome),
    Emergency(EmergencyAlert),
    Interrupted,
}

/// Coordinates a complete run.
pub struct Orchestrator<R> {
    config: Config,
    monitor: ResourceMonitor,
    reporter: Arc<R>,
    state: Mutex<RunState>,
    shutdown: CancellationToken,
}

impl<R: Reporter + 'static> Orchestrator<R> {
    /// Creates an orchestrator that samples resources through `monitor`.
    pub fn new(config: Config, monitor: ResourceMonitor, reporter: R) -> Self {
        Self {
            config,
            monitor,
            reporter: Arc::new(reporter),
            state: Mutex::new(RunState::Idle),
            shutdown: CancellationToken::new(),
        }
    }

    /// Creates an orchestrator over the real system.
    pub fn system(config: Config, reporter: R) -> Self {
        let monitor = ResourceMonitor::system(&config.resources);
        Self::new(config, monitor, reporter)
    }

    /// Uses `token` as an additional shutdown trigger, next to `SIGINT` and
    /// `SIGTERM`.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn monitor(&self) -> &ResourceMonitor {
        &self.monitor
    }

    pub fn state(&self) -> RunState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: RunState) {
        let mut current = self.state.lock().unwrap_or_else(|e| e.into_inner());
        debug!("Run state: {} -> {}", *current, state);
        *current = state;
    }

    /// Discovers tests and runs them.
    pub async fn run(&self) -> Result<RunOutcome, RunError> {
        self.set_state(RunState::Initializing);
        let catalog = TestDiscoverer::new(&self.config.discovery, &self.config.groups)
            .and_then(|discoverer| discoverer.discover())
            .inspect_err(|_| self.set_state(RunState::Terminated))?;
        self.run_with_catalog(catalog).await
    }

    /// Runs an already discovered catalog.
    pub async fn run_with_catalog(&self, catalog: TestCatalog) -> Result<RunOutcome, RunError> {
        self.set_state(RunState::Initializing);
        let result = self.execute(catalog).await;
        match &result {
            Ok(outcome) if !outcome.interrupted => self.set_state(RunState::Completed),
            _ => self.set_state(RunState::Terminated),
        }
        result
    }

    /// Takes one resource sample and fails if it is not safe to start.
    pub fn admit(&self) -> Result<ResourceSnapshot, RunError> {
        let snapshot = self.monitor.check_resources()?;
        if !snapshot.safe {
            let reasons = snapshot.unsafe_reasons(self.monitor.thresholds());
            error!("Refusing to start: {}", reasons.join("; "));
            return Err(RunError::ResourceUnsafe(reasons));
        }
        Ok(snapshot)
    }

    /// Worker count for a run: the configured count if set, otherwise the
    /// affordable count capped by the profile.
    pub fn worker_count(&self, snapshot: &ResourceSnapshot) -> usize {
        if let Some(workers) = self.config.runner.workers {
            return workers.max(1);
        }
        let optimal = self.monitor.optimal_workers_for(snapshot);
        match self.config.runner.profile {
            Some(profile) => optimal.min(profile.worker_cap()),
            None => optimal,
        }
    }

    /// Builds the schedule for `catalog` given a resource reading.
    pub fn plan(
        &self,
        catalog: &TestCatalog,
        snapshot: &ResourceSnapshot,
    ) -> Result<Schedule, RunError> {
        let workers = self.worker_count(snapshot);
        let constraints = ScheduleConstraints {
            max_memory: Some(snapshot.memory.free / workers as u64),
            max_workers: Some(workers),
        };

        let schedule =
            TestScheduler::new(catalog, self.config.runner.strategy).schedule_tests(workers, constraints);
        if schedule.is_empty() {
            return Err(RunError::EmptySchedule);
        }

        for problem in schedule.validate(catalog) {
            warn!("Schedule check: {}", problem);
        }
        for warning in &schedule.warnings {
            warn!("{}", warning);
        }
        info!(
            "Scheduled {} tests on {} workers ({}, makespan {:.1}s)",
            schedule.test_count(),
            schedule.worker_count(),
            schedule.strategy,
            schedule.makespan().as_secs_f64()
        );
        Ok(schedule)
    }

    async fn execute(&self, catalog: TestCatalog) -> Result<RunOutcome, RunError> {
        let config = &self.config;

        let snapshot = self.admit()?;
        self.monitor.record(snapshot.clone());

        if catalog.is_empty() {
            return Err(RunError::DiscoveryEmpty(config.discovery.root.clone()));
        }

        self.set_state(RunState::Scheduling);
        let schedule = self.plan(&catalog, &snapshot)?;

        let run_id = Uuid::new_v4();
        let output_dir = &config.report.output_dir;
        std::fs::create_dir_all(output_dir).map_err(|source| ReportError::Io {
            path: output_dir.clone(),
            source,
        })?;

        let engine = Engine::new(&config.engine, &config.runner)?;
        let runner = WorkerRunner::new(
            Arc::new(engine),
            output_dir,
            Duration::from_secs(config.runner.worker_timeout_secs),
            Duration::from_secs(config.runner.shutdown_grace_secs),
        );
        let reporter: Arc<dyn Reporter> = self.reporter.clone();
        let pool = WorkerPoolManager::new(runner, reporter);

        self.reporter.on_schedule_ready(&schedule).await;

        self.set_state(RunState::Running);
        let mut events = self.monitor.subscribe();
        self.monitor
            .start_monitoring(Duration::from_millis(config.runner.monitor_interval_ms));

        let started_at = Utc::now();
        let start = Instant::now();

        let run = pool.run_workers(&schedule);
        tokio::pin!(run);

        let stop = tokio::select! {
            outcome = &mut run => Stop::Finished(outcome),
            alert = next_emergency(&mut events) => Stop::Emergency(alert),
            () = interrupted(self.shutdown.clone()) => Stop::Interrupted,
        };

        let mut interrupted = false;
        let outcome = match stop {
            Stop::Finished(outcome) => outcome,
            Stop::Emergency(alert) => {
                self.set_state(RunState::EmergencyShutdown);
                error!("Resource emergency ({}): {}", alert.kind, alert.message);

                let arrived = pool.completed_results();
                pool.terminate_all_workers(TerminationReason::Emergency).await;
                let _ = run.await;
                self.monitor.stop_monitoring();

                self.write_partial(PartialReport::emergency(run_id, arrived));
                pool.cleanup();
                return Err(RunError::EmergencyResourceBreach(alert));
            }
            Stop::Interrupted => {
                warn!("Interrupted, stopping workers");
                interrupted = true;

                let arrived = pool.completed_results();
                pool.terminate_all_workers(TerminationReason::Signal).await;
                let outcome = run.await;
                self.write_partial(PartialReport::new(run_id, "interrupted", arrived));
                outcome
            }
        };
        self.monitor.stop_monitoring();

        self.set_state(RunState::Aggregating);
        let execution = ExecutionSummary::new(started_at, start.elapsed(), &outcome.results);
        let report = ExecutionReport::new(
            run_id,
            &schedule,
            &outcome,
            execution,
            self.monitor.summary(),
        );

        let json_path = output_dir.join(&config.report.json_file);
        let text_path = output_dir.join(&config.report.text_file);
        report.write_json(&json_path)?;
        text::write_text(&report, &text_path)?;
        info!("Reports written to {}", output_dir.display());

        if !interrupted {
            self.update_history(&schedule, &outcome);
        }
        pool.cleanup();

        self.reporter.on_run_complete(&report).await;

        let exit_code = report.exit_code();
        Ok(RunOutcome {
            report,
            exit_code,
            interrupted,
        })
    }

    fn write_partial(&self, partial: PartialReport) {
        let path = self
            .config
            .report
            .output_dir
            .join(&self.config.report.partial_file);
        match partial.write_json(&path) {
            Ok(()) => warn!(
                "Partial results ({} workers) written to {}",
                partial.results.len(),
                path.display()
            ),
            Err(e) => error!("Could not save partial results: {}", e),
        }
    }

    /// Feeds measured worker times back into the duration history.
    fn update_history(&self, schedule: &Schedule, outcome: &PoolOutcome) {
        let Some(path) = &self.config.discovery.history_file else {
            return;
        };
        let mut history = match DurationHistory::load(path) {
            Ok(history) => history,
            Err(e) => {
                warn!("Not updating duration history: {}", e);
                return;
            }
        };

        for (assignment, result) in schedule.assignments.iter().zip(&outcome.results) {
            if matches!(result.status, WorkerStatus::Succeeded | WorkerStatus::Failed) {
                history.record_assignment(&assignment.tests, result.duration);
            }
        }

        match history.save(path) {
            Ok(()) => debug!("Duration history saved ({} tests)", history.len()),
            Err(e) => warn!("Could not save duration history: {}", e),
        }
    }
}

/// Resolves with the first emergency event. Never resolves if the channel
/// closes.
async fn next_emergency(events: &mut broadcast::Receiver<ResourceEvent>) -> EmergencyAlert {
    loop {
        match events.recv().await {
            Ok(ResourceEvent::Emergency(alert)) => return alert,
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!("Missed {} resource events", missed)
            }
            Err(broadcast::error::RecvError::Closed) => std::future::pending::<()>().await,
        }
    }
}

/// Resolves on `SIGINT`, `SIGTERM` or cancellation of `shutdown`.
async fn interrupted(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Cannot listen for interrupts: {}", e);
            std::future::pending::<()>().await;
        }
    };
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => info!("Received interrupt"),
        _ = terminate => info!("Received SIGTERM"),
        _ = shutdown.cancelled() => info!("Shutdown requested"),
    }
}
