//! Plain-text execution summary.

use std::fmt::Write;
use std::path::Path;

use super::{ExecutionReport, ReportResult, write_file};

/// Renders the summary as it is written to disk.
pub fn render(report: &ExecutionReport) -> String {
    let summary = &report.summary;
    let execution = &summary.execution;
    let efficiency = &execution.parallel_efficiency;
    let workers = &summary.workers;
    let tests = &summary.tests;
    let resources = &summary.resources;

    let mut out = String::new();
    let _ = writeln!(out, "Parallel Test Execution Summary");
    let _ = writeln!(out, "===============================");
    let _ = writeln!(out, "Run:       {}", report.run_id);
    let _ = writeln!(out, "Version:   {}", report.version);
    let _ = writeln!(out, "Generated: {}", report.timestamp.to_rfc3339());
    let _ = writeln!(out);

    let _ = writeln!(out, "Execution");
    let _ = writeln!(out, "  Start:    {}", execution.start_time.to_rfc3339());
    let _ = writeln!(out, "  End:      {}", execution.end_time.to_rfc3339());
    let _ = writeln!(
        out,
        "  Duration: {:.2}s",
        execution.total_duration.as_secs_f64()
    );
    let _ = writeln!(out, "  Efficiency:  {:.1}%", efficiency.efficiency * 100.0);
    let _ = writeln!(out, "  Speedup:     {:.2}x", efficiency.speedup);
    let _ = writeln!(
        out,
        "  Time saved:  {:.2}s ({:.1}%)",
        efficiency.time_reduction / 1000.0,
        efficiency.percentage_improvement
    );
    let _ = writeln!(out);

    let _ = writeln!(out, "Workers");
    let _ = writeln!(out, "  Total:      {}", workers.total);
    let _ = writeln!(out, "  Successful: {}", workers.successful);
    let _ = writeln!(out, "  Failed:     {}", workers.failed);
    let _ = writeln!(out, "  Errors:     {}", workers.errors);
    let _ = writeln!(out);

    let _ = writeln!(out, "Tests");
    let _ = writeln!(out, "  Total:     {}", tests.total);
    let _ = writeln!(out, "  Passed:    {}", tests.passed);
    let _ = writeln!(out, "  Failed:    {}", tests.failed);
    let _ = writeln!(out, "  Skipped:   {}", tests.skipped);
    let _ = writeln!(out, "  Pass rate: {:.2}%", tests.pass_rate);
    let _ = writeln!(out);

    let _ = writeln!(out, "Resources");
    if let Some(latest) = &resources.latest {
        let _ = writeln!(
            out,
            "  Memory: {:.1}% (avg {:.1}%, peak {:.1}%)",
            latest.memory.percentage,
            resources.average_memory_percentage,
            resources.peak_memory_percentage
        );
        let _ = writeln!(
            out,
            "  CPU:    {:.1}% (avg {:.1}%, peak {:.1}%)",
            latest.cpu.percentage,
            resources.average_cpu_percentage,
            resources.peak_cpu_percentage
        );
        let _ = writeln!(
            out,
            "  Disk:   {} MB available",
            latest.disk.available / crate::config::MB
        );
    }
    let _ = writeln!(
        out,
        "  Samples: {} ({} unsafe)",
        resources.samples, resources.unsafe_samples
    );
    let _ = writeln!(out);

    let _ = writeln!(out, "Schedule");
    for entry in &summary.schedule {
        let _ = writeln!(
            out,
            "  Worker {}: {} tests, est. {:.1}s, groups [{}]",
            entry.worker,
            entry.tests.len(),
            entry.estimated_duration.as_secs_f64(),
            entry.groups.join(", ")
        );
    }
    let _ = writeln!(out);

    let _ = writeln!(out, "Worker Results");
    for result in &report.worker_results {
        let _ = writeln!(
            out,
            "  Worker {}: {}, {}/{} passed, {} failed, {} skipped, {:.2}s",
            result.worker,
            result.status,
            result.stats.passed,
            result.stats.total,
            result.stats.failed,
            result.stats.skipped,
            result.duration.as_secs_f64()
        );
        if let Some(engine) = result.engine_duration {
            let _ = writeln!(out, "    engine time: {:.2}s", engine.as_secs_f64());
        }
        if let Some(error) = &result.error {
            let _ = writeln!(out, "    error: {}", error);
        }
        let _ = writeln!(out, "    log: {}", result.log_path.display());
    }

    out
}

/// Writes the rendered summary to `path`.
pub fn write_text(report: &ExecutionReport, path: &Path) -> ReportResult<()> {
    write_file(path, &render(report))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;
    use uuid::Uuid;

    use super::*;
    use crate::orchestrator::{PoolOutcome, Schedule, Strategy};
    use crate::report::ExecutionSummary;
    use crate::report::tests::result;
    use crate::resource::ResourceSummary;

    #[test]
    fn test_render_mirrors_report_fields() {
        let outcome = PoolOutcome::from_results(vec![
            result(0, (10, 8, 2, 0), 6),
            result(1, (6, 6, 0, 0), 4),
        ]);
        let schedule = Schedule {
            assignments: Vec::new(),
            strategy: Strategy::Fastest,
            degraded: false,
            warnings: Vec::new(),
        };
        let execution =
            ExecutionSummary::new(Utc::now(), Duration::from_secs(5), &outcome.results);
        let report = ExecutionReport::new(
            Uuid::new_v4(),
            &schedule,
            &outcome,
            execution,
            ResourceSummary::default(),
        );

        let text = render(&report);
        assert!(text.contains("Pass rate: 87.50%"));
        assert!(text.contains("Successful: 1"));
        assert!(text.contains("Speedup:     2.00x"));
        assert!(text.contains("Worker 0: failed, 8/10 passed"));
        assert!(text.contains("engine time: 6.00s"));
        assert!(text.contains("worker-1/worker.log"));

        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("out/execution-summary.txt");
        write_text(&report, &path).unwrap();
        assert_eq!(std::fs::read_to_string(path).unwrap(), text);
    }
}
