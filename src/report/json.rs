//! Machine-readable execution report.
//!
//! ```json
//! {
//!   "summary": {
//!     "execution": { "startTime", "endTime", "totalDuration",
//!       "parallelEfficiency": { "efficiency", "speedup", "timeReduction", "percentageImprovement" } },
//!     "workers": { "total", "successful", "failed", "errors" },
//!     "tests": { "total", "passed", "failed", "skipped", "passRate" },
//!     "resources": { "latest", "samples", "averageMemoryPercentage", ... },
//!     "schedule": [ { "worker", "tests", "estimatedDuration", "estimatedMemory", "groups" } ]
//!   },
//!   "workerResults": [ ... ],
//!   "timestamp", "version", "runId"
//! }
//! ```
//!
//! Durations are milliseconds.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::{ParallelEfficiency, ReportResult, TestTotals, WorkerTotals, write_file};
use crate::discovery::serialize_millis;
use crate::orchestrator::{PoolOutcome, Schedule, WorkerAssignment, WorkerResult, WorkerStatus};
use crate::resource::ResourceSummary;

/// Timing of the execution phase.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSummary {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    #[serde(serialize_with = "serialize_millis")]
    pub total_duration: Duration,
    pub parallel_efficiency: ParallelEfficiency,
}

impl ExecutionSummary {
    /// Summary for a phase that started at `start_time` and ran for
    /// `total_duration` (monotonic).
    pub fn new(start_time: DateTime<Utc>, total_duration: Duration, results: &[WorkerResult]) -> Self {
        let end_time = start_time
            + chrono::Duration::from_std(total_duration).unwrap_or_else(|_| chrono::Duration::zero());
        Self {
            start_time,
            end_time,
            total_duration,
            parallel_efficiency: ParallelEfficiency::from_results(results, total_duration),
        }
    }
}

/// One worker's planned share of the run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleEntry {
    pub worker: usize,
    pub tests: Vec<String>,
    #[serde(serialize_with = "serialize_millis")]
    pub estimated_duration: Duration,
    pub estimated_memory: u64,
    pub groups: Vec<String>,
}

impl From<&WorkerAssignment> for ScheduleEntry {
    fn from(assignment: &WorkerAssignment) -> Self {
        Self {
            worker: assignment.worker,
            tests: assignment.tests.iter().map(|t| t.id.clone()).collect(),
            estimated_duration: assignment.estimated_duration,
            estimated_memory: assignment.estimated_memory,
            groups: assignment.groups().into_iter().map(String::from).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportSummary {
    pub execution: ExecutionSummary,
    pub workers: WorkerTotals,
    pub tests: TestTotals,
    pub resources: ResourceSummary,
    pub schedule: Vec<ScheduleEntry>,
}

/// The persisted result of a complete run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionReport {
    pub summary: ReportSummary,
    pub worker_results: Vec<WorkerResult>,
    pub timestamp: DateTime<Utc>,
    pub version: String,
    pub run_id: Uuid,
}

impl ExecutionReport {
    /// Aggregates a finished pool run.
    pub fn new(
        run_id: Uuid,
        schedule: &Schedule,
        outcome: &PoolOutcome,
        execution: ExecutionSummary,
        resources: ResourceSummary,
    ) -> Self {
        Self {
            summary: ReportSummary {
                execution,
                workers: WorkerTotals::from(outcome),
                tests: TestTotals::from_results(&outcome.results),
                resources,
                schedule: schedule.assignments.iter().map(ScheduleEntry::from).collect(),
            },
            worker_results: outcome.results.clone(),
            timestamp: Utc::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            run_id,
        }
    }

    /// Whether no test failed and every worker finished cleanly.
    pub fn is_success(&self) -> bool {
        self.summary.tests.failed == 0
            && self
                .worker_results
                .iter()
                .all(|r| r.status == WorkerStatus::Succeeded)
    }

    /// Process exit status for this report.
    pub fn exit_code(&self) -> i32 {
        if self.is_success() { 0 } else { 1 }
    }

    pub fn to_json(&self) -> ReportResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Writes the report as pretty-printed JSON.
    pub fn write_json(&self, path: &Path) -> ReportResult<()> {
        write_file(path, &self.to_json()?)
    }
}

/// Whatever results had arrived when a run was cut short.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PartialReport {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub reason: String,
    pub results: Vec<WorkerResult>,
    pub timestamp: DateTime<Utc>,
    pub run_id: Uuid,
}

impl PartialReport {
    pub fn new(run_id: Uuid, reason: impl Into<String>, results: Vec<WorkerResult>) -> Self {
        Self {
            kind: "partial",
            reason: reason.into(),
            results,
            timestamp: Utc::now(),
            run_id,
        }
    }

    /// Partial report for an emergency shutdown.
    pub fn emergency(run_id: Uuid, results: Vec<WorkerResult>) -> Self {
        Self::new(run_id, "emergency_shutdown", results)
    }

    pub fn write_json(&self, path: &Path) -> ReportResult<()> {
        write_file(path, &serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::TestCase;
    use crate::orchestrator::Strategy;
    use crate::report::tests::result;

    fn schedule(workers: usize) -> Schedule {
        Schedule {
            assignments: (0..workers)
                .map(|worker| WorkerAssignment {
                    worker,
                    tests: vec![
                        TestCase::new(format!("w{}/a.spec.js", worker), "fast", Duration::from_secs(2)),
                        TestCase::new(format!("w{}/b.spec.js", worker), "slow", Duration::from_secs(3)),
                    ],
                    estimated_duration: Duration::from_secs(5),
                    estimated_memory: 900,
                })
                .collect(),
            strategy: Strategy::Balanced,
            degraded: false,
            warnings: Vec::new(),
        }
    }

    fn report(results: Vec<WorkerResult>) -> ExecutionReport {
        let outcome = PoolOutcome::from_results(results);
        let execution =
            ExecutionSummary::new(Utc::now(), Duration::from_secs(10), &outcome.results);
        ExecutionReport::new(
            Uuid::new_v4(),
            &schedule(outcome.total_workers),
            &outcome,
            execution,
            ResourceSummary::default(),
        )
    }

    #[test]
    fn test_all_pass_report() {
        let report = report((0..3).map(|w| result(w, (5, 5, 0, 0), 10)).collect());
        assert_eq!(report.summary.tests.total, 15);
        assert_eq!(report.summary.tests.pass_rate, 100.0);
        assert_eq!(report.summary.workers.successful, 3);
        assert_eq!(report.exit_code(), 0);
    }

    #[test]
    fn test_mixed_failure_report() {
        let report = report(vec![result(0, (10, 8, 2, 0), 10), result(1, (6, 6, 0, 0), 10)]);
        assert_eq!(report.summary.tests.total, 16);
        assert_eq!(report.summary.tests.passed, 14);
        assert_eq!(report.summary.tests.failed, 2);
        assert_eq!(report.summary.tests.pass_rate, 87.5);
        assert_eq!(report.exit_code(), 1);
    }

    #[test]
    fn test_crashed_worker_fails_run() {
        let mut crashed = result(1, (0, 0, 0, 0), 1);
        crashed.status = WorkerStatus::Crashed;
        let report = report(vec![result(0, (5, 5, 0, 0), 10), crashed]);
        assert_eq!(report.summary.tests.failed, 0);
        assert_eq!(report.summary.workers.errors, 1);
        assert_eq!(report.exit_code(), 1);
    }

    #[test]
    fn test_json_shape() {
        let report = report(vec![result(0, (5, 5, 0, 0), 10)]);
        let value: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();

        let execution = &value["summary"]["execution"];
        assert_eq!(execution["totalDuration"], 10_000.0);
        assert_eq!(execution["parallelEfficiency"]["efficiency"], 1.0);
        assert!(execution["startTime"].is_string());
        assert!(execution["endTime"].is_string());

        assert_eq!(value["summary"]["workers"]["successful"], 1);
        assert_eq!(value["summary"]["tests"]["passRate"], 100.0);
        assert_eq!(value["summary"]["schedule"][0]["groups"][1], "slow");
        assert_eq!(value["summary"]["schedule"][0]["estimatedDuration"], 5_000.0);
        assert_eq!(value["workerResults"][0]["status"], "succeeded");
        assert_eq!(value["workerResults"][0]["engineDuration"], 10_000.0);
        assert_eq!(value["version"], env!("CARGO_PKG_VERSION"));
        assert!(value["runId"].is_string());
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn test_partial_report_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("partial-results.json");
        PartialReport::emergency(Uuid::new_v4(), vec![result(0, (5, 5, 0, 0), 1)])
            .write_json(&path)
            .unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(value["type"], "partial");
        assert_eq!(value["reason"], "emergency_shutdown");
        assert_eq!(value["results"].as_array().unwrap().len(), 1);
    }
}
