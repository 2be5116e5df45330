//! Result aggregation and report output.
//!
//! Worker results are merged into [`TestTotals`] and [`WorkerTotals`], the
//! run's [`ParallelEfficiency`] is derived from summed worker time against
//! wall-clock time, and the whole thing is persisted as an
//! [`ExecutionReport`] (JSON) plus a plain-text summary.

pub mod json;
pub mod text;

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::orchestrator::{PoolOutcome, Schedule, WorkerAssignment, WorkerResult, WorkerStatus};

pub use json::{ExecutionReport, ExecutionSummary, PartialReport, ReportSummary, ScheduleEntry};

/// Result type for report output.
pub type ReportResult<T> = Result<T, ReportError>;

/// Errors that can occur while writing reports.
#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("Failed to write {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to serialize report: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Writes `contents` to `path`, creating parent directories.
pub(crate) fn write_file(path: &Path, contents: &str) -> ReportResult<()> {
    let io_err = |source| ReportError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }
    std::fs::write(path, contents).map_err(io_err)
}

/// Test counts summed over all workers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestTotals {
    pub total: u64,
    pub passed: u64,
    pub failed: u64,
    pub skipped: u64,
    /// `passed / total * 100`, two decimals; 0 when nothing ran.
    pub pass_rate: f64,
}

impl TestTotals {
    pub fn from_results(results: &[WorkerResult]) -> Self {
        let mut totals = Self::default();
        for result in results {
            totals.total += result.stats.total;
            totals.passed += result.stats.passed;
            totals.failed += result.stats.failed;
            totals.skipped += result.stats.skipped;
        }
        totals.pass_rate = if totals.total == 0 {
            0.0
        } else {
            (totals.passed as f64 / totals.total as f64 * 10_000.0).round() / 100.0
        };
        totals
    }
}

/// Worker counts by terminal status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerTotals {
    pub total: usize,
    pub successful: usize,
    /// Workers with failing tests or a timeout.
    pub failed: usize,
    /// Workers that crashed or were terminated.
    pub errors: usize,
}

impl From<&PoolOutcome> for WorkerTotals {
    fn from(outcome: &PoolOutcome) -> Self {
        Self {
            total: outcome.total_workers,
            successful: outcome.successful_workers,
            failed: outcome.failed_workers,
            errors: outcome.error_workers,
        }
    }
}

/// How much the parallel run saved over running every worker back to back.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParallelEfficiency {
    /// `sequential / wall`, capped at 1.
    pub efficiency: f64,
    /// `sequential / wall`, at least 1.
    pub speedup: f64,
    /// `sequential - wall` in milliseconds, negative when the run was slower.
    pub time_reduction: f64,
    /// Saved time as a percentage of sequential time, within [0, 100].
    pub percentage_improvement: f64,
}

/// Smallest wall time used as a divisor.
const MIN_DURATION: Duration = Duration::from_millis(1);

impl ParallelEfficiency {
    /// Computes efficiency from the summed worker time and the wall time.
    pub fn compute(sequential: Duration, wall: Duration) -> Self {
        let seq_ms = sequential.as_secs_f64() * 1000.0;
        let wall_ms = wall.max(MIN_DURATION).as_secs_f64() * 1000.0;
        let ratio = seq_ms / wall_ms;
        let improvement = if seq_ms > 0.0 {
            (100.0 * (seq_ms - wall_ms) / seq_ms).clamp(0.0, 100.0)
        } else {
            0.0
        };

        Self {
            efficiency: ratio.min(1.0),
            speedup: ratio.max(1.0),
            time_reduction: seq_ms - wall.as_secs_f64() * 1000.0,
            percentage_improvement: improvement,
        }
    }

    /// Efficiency of a set of worker results over `wall`.
    pub fn from_results(results: &[WorkerResult], wall: Duration) -> Self {
        Self::compute(results.iter().map(|r| r.duration).sum(), wall)
    }
}

/// Receives events while a run progresses.
#[async_trait]
pub trait Reporter: Send + Sync {
    /// Called once the schedule is final, before any worker starts.
    async fn on_schedule_ready(&self, schedule: &Schedule);

    /// Called as a worker is spawned.
    async fn on_worker_start(&self, assignment: &WorkerAssignment);

    /// Called with each worker's terminal result.
    async fn on_worker_complete(&self, result: &WorkerResult);

    /// Called after the reports have been written.
    async fn on_run_complete(&self, report: &ExecutionReport);
}

/// A reporter that does nothing.
pub struct NullReporter;

#[async_trait]
impl Reporter for NullReporter {
    async fn on_schedule_ready(&self, _schedule: &Schedule) {}
    async fn on_worker_start(&self, _assignment: &WorkerAssignment) {}
    async fn on_worker_complete(&self, _result: &WorkerResult) {}
    async fn on_run_complete(&self, _report: &ExecutionReport) {}
}

/// Fans events out to several reporters.
#[derive(Default)]
pub struct MultiReporter {
    reporters: Vec<Box<dyn Reporter>>,
}

impl MultiReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reporter<R: Reporter + 'static>(mut self, reporter: R) -> Self {
        self.reporters.push(Box::new(reporter));
        self
    }
}

#[async_trait]
impl Reporter for MultiReporter {
    async fn on_schedule_ready(&self, schedule: &Schedule) {
        for reporter in &self.reporters {
            reporter.on_schedule_ready(schedule).await;
        }
    }

    async fn on_worker_start(&self, assignment: &WorkerAssignment) {
        for reporter in &self.reporters {
            reporter.on_worker_start(assignment).await;
        }
    }

    async fn on_worker_complete(&self, result: &WorkerResult) {
        for reporter in &self.reporters {
            reporter.on_worker_complete(result).await;
        }
    }

    async fn on_run_complete(&self, report: &ExecutionReport) {
        for reporter in &self.reporters {
            reporter.on_run_complete(report).await;
        }
    }
}

/// Terminal reporter with a progress bar over workers.
pub struct ConsoleReporter {
    progress: Mutex<Option<indicatif::ProgressBar>>,
    verbose: bool,
}

impl ConsoleReporter {
    pub fn new(verbose: bool) -> Self {
        Self {
            progress: Mutex::new(None),
            verbose,
        }
    }

    fn with_bar(&self, f: impl FnOnce(&indicatif::ProgressBar)) {
        let guard = self.progress.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(pb) = guard.as_ref() {
            f(pb);
        }
    }
}

#[async_trait]
impl Reporter for ConsoleReporter {
    async fn on_schedule_ready(&self, schedule: &Schedule) {
        println!(
            "Running {} tests on {} workers ({} strategy)",
            schedule.test_count(),
            schedule.worker_count(),
            schedule.strategy
        );
        for warning in &schedule.warnings {
            println!("  {}", console::style(warning).yellow());
        }

        let pb = indicatif::ProgressBar::new(schedule.worker_count() as u64);
        let style = indicatif::ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} workers")
            .unwrap_or_else(|_| indicatif::ProgressStyle::default_bar())
            .progress_chars("#>-");
        pb.set_style(style);

        *self.progress.lock().unwrap_or_else(|e| e.into_inner()) = Some(pb);
    }

    async fn on_worker_start(&self, assignment: &WorkerAssignment) {
        if self.verbose {
            self.with_bar(|pb| {
                pb.println(format!(
                    "Worker {}: {} tests",
                    assignment.worker,
                    assignment.tests.len()
                ))
            });
        }
    }

    async fn on_worker_complete(&self, result: &WorkerResult) {
        self.with_bar(|pb| {
            pb.inc(1);

            let status = match result.status {
                WorkerStatus::Succeeded => console::style("PASS").green(),
                WorkerStatus::Failed => console::style("FAIL").red(),
                WorkerStatus::TimedOut => console::style("TIME").red(),
                WorkerStatus::Crashed => console::style("CRSH").red().bold(),
                WorkerStatus::Terminated => console::style("TERM").yellow(),
            };

            if self.verbose || result.status != WorkerStatus::Succeeded {
                pb.println(format!(
                    "{} worker {} ({}/{} passed, {:.1}s)",
                    status,
                    result.worker,
                    result.stats.passed,
                    result.stats.total,
                    result.duration.as_secs_f64()
                ));
                if let Some(error) = &result.error {
                    pb.println(format!("    {}", console::style(error).dim()));
                }
            }
        });
    }

    async fn on_run_complete(&self, report: &ExecutionReport) {
        if let Some(pb) = self.progress.lock().unwrap_or_else(|e| e.into_inner()).take() {
            pb.finish_and_clear();
        }

        let summary = &report.summary;
        let tests = &summary.tests;
        let workers = &summary.workers;
        let efficiency = &summary.execution.parallel_efficiency;

        println!();
        println!("Execution Summary:");
        println!(
            "  Duration: {:.1}s",
            summary.execution.total_duration.as_secs_f64()
        );
        println!("  Workers:  {}/{} succeeded", workers.successful, workers.total);
        println!("  Total:    {}", tests.total);
        println!("  Passed:   {}", console::style(tests.passed).green());
        println!("  Failed:   {}", console::style(tests.failed).red());
        println!("  Skipped:  {}", console::style(tests.skipped).yellow());
        println!("  Pass rate: {:.2}%", tests.pass_rate);
        println!(
            "  Efficiency: {:.0}% (speedup {:.2}x)",
            efficiency.efficiency * 100.0,
            efficiency.speedup
        );

        println!();
        if report.is_success() {
            println!("{}", console::style("All tests passed!").green().bold());
        } else {
            if tests.failed > 0 {
                println!(
                    "{}",
                    console::style(format!("{} tests failed.", tests.failed))
                        .red()
                        .bold()
                );
            }
            let broken: Vec<&WorkerResult> = report
                .worker_results
                .iter()
                .filter(|r| r.status != WorkerStatus::Succeeded)
                .collect();
            if !broken.is_empty() {
                println!();
                println!("Workers needing attention:");
                for r in broken {
                    println!("  - worker {} ({})", r.worker, r.status);
                    println!(
                        "    {}",
                        console::style(format!("log: {}", r.log_path.display())).dim()
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::WorkerStats;

    pub(crate) fn result(worker: usize, stats: (u64, u64, u64, u64), secs: u64) -> WorkerResult {
        let (total, passed, failed, skipped) = stats;
        WorkerResult {
            worker,
            status: if failed > 0 {
                WorkerStatus::Failed
            } else {
                WorkerStatus::Succeeded
            },
            stats: WorkerStats {
                total,
                passed,
                failed,
                skipped,
            },
            duration: Duration::from_secs(secs),
            engine_duration: Some(Duration::from_secs(secs)),
            log_path: PathBuf::from(format!("workers/worker-{}/worker.log", worker)),
            exit_code: Some(if failed > 0 { 1 } else { 0 }),
            error: None,
            tests: Vec::new(),
        }
    }

    #[test]
    fn test_all_pass_totals() {
        let results: Vec<_> = (0..3).map(|w| result(w, (5, 5, 0, 0), 10)).collect();
        let totals = TestTotals::from_results(&results);
        assert_eq!(totals.total, 15);
        assert_eq!(totals.passed, 15);
        assert_eq!(totals.failed, 0);
        assert_eq!(totals.pass_rate, 100.0);
    }

    #[test]
    fn test_mixed_failure_totals() {
        let results = vec![result(0, (10, 8, 2, 0), 10), result(1, (6, 6, 0, 0), 10)];
        let totals = TestTotals::from_results(&results);
        assert_eq!(totals.total, 16);
        assert_eq!(totals.passed, 14);
        assert_eq!(totals.failed, 2);
        assert_eq!(totals.pass_rate, 87.5);
    }

    #[test]
    fn test_pass_rate_rounding_and_empty() {
        let totals = TestTotals::from_results(&[result(0, (3, 2, 1, 0), 1)]);
        assert_eq!(totals.pass_rate, 66.67);
        assert_eq!(TestTotals::from_results(&[]).pass_rate, 0.0);
    }

    #[test]
    fn test_efficiency_parallel_run() {
        let e = ParallelEfficiency::compute(Duration::from_secs(30), Duration::from_secs(10));
        assert_eq!(e.efficiency, 1.0);
        assert!((e.speedup - 3.0).abs() < 1e-9);
        assert!((e.time_reduction - 20_000.0).abs() < 1e-6);
        assert!((e.percentage_improvement - 66.666).abs() < 0.01);
    }

    #[test]
    fn test_efficiency_bounds_hold_for_degenerate_durations() {
        let cases = [
            (Duration::ZERO, Duration::ZERO),
            (Duration::from_secs(5), Duration::ZERO),
            (Duration::ZERO, Duration::from_secs(5)),
            (Duration::from_secs(4), Duration::from_secs(8)),
        ];
        for (seq, wall) in cases {
            let e = ParallelEfficiency::compute(seq, wall);
            assert!((0.0..=1.0).contains(&e.efficiency), "{:?}", e);
            assert!(e.speedup >= 1.0, "{:?}", e);
            assert!(
                (0.0..=100.0).contains(&e.percentage_improvement),
                "{:?}",
                e
            );
        }
    }

    #[test]
    fn test_worker_totals_from_outcome() {
        let outcome = PoolOutcome::from_results(vec![
            result(0, (10, 8, 2, 0), 1),
            result(1, (6, 6, 0, 0), 1),
        ]);
        let totals = WorkerTotals::from(&outcome);
        assert_eq!(totals.total, 2);
        assert_eq!(totals.successful, 1);
        assert_eq!(totals.failed, 1);
        assert_eq!(totals.errors, 0);
    }

    #[test]
    fn test_write_file_creates_parents() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("a/b/report.txt");
        write_file(&path, "hello").unwrap();
        assert_eq!(std::fs::read_to_string(path).unwrap(), "hello");
    }
}
