//! Configuration schema definitions for shardrun.
//!
//! This module defines all configuration types that can be deserialized from
//! TOML configuration files. Every section and field is optional; missing
//! values fall back to the defaults documented on each field.
//!
//! # Schema Overview
//!
//! ```text
//! Config (root)
//! ├── RunnerConfig      - Worker count, strategy, browser flags, timeouts
//! ├── ResourceConfig    - Admission-control and emergency thresholds
//! ├── DiscoveryConfig   - Test root, glob patterns, duration history
//! ├── GroupConfig (map) - Named test groups with execution constraints
//! ├── EngineConfig      - Command template that runs one worker's tests
//! └── ReportConfig      - Report output locations
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::discovery::Priority;
use crate::orchestrator::Strategy;

/// Bytes in one megabyte, as used by every `*_mb` field.
pub const MB: u64 = 1024 * 1024;

/// Root configuration structure for shardrun.
///
/// # TOML Structure
///
/// ```toml
/// [runner]
/// strategy = "balanced"
/// browser = "chrome"
///
/// [resources]
/// memory_limit_percent = 85.0
///
/// [discovery]
/// root = "tests"
///
/// [groups.slow]
/// max_workers = 2
/// estimated_time_secs = 180
/// patterns = ["**/slow/**"]
///
/// [engine]
/// command = "npx mocha --reporter json {tests}"
/// ```
///
/// # Example
///
/// ```
/// use shardrun::config::Config;
///
/// let config: Config = toml::from_str(r#"
///     [runner]
///     workers = 2
/// "#).unwrap();
/// assert_eq!(config.runner.workers, Some(2));
/// assert!(config.groups.contains_key("medium"));
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Core run settings.
    #[serde(default)]
    pub runner: RunnerConfig,

    /// Resource thresholds used by the monitor and admission control.
    #[serde(default)]
    pub resources: ResourceConfig,

    /// Test discovery settings.
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Named test groups. When the table is absent the built-in
    /// `smoke`/`fast`/`medium`/`slow` groups are used.
    #[serde(default = "default_groups")]
    pub groups: BTreeMap<String, GroupConfig>,

    /// Per-worker execution engine.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Report output settings.
    #[serde(default)]
    pub report: ReportConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            runner: RunnerConfig::default(),
            resources: ResourceConfig::default(),
            discovery: DiscoveryConfig::default(),
            groups: default_groups(),
            engine: EngineConfig::default(),
            report: ReportConfig::default(),
        }
    }
}

/// Deployment profile that caps the auto-detected worker count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    /// Continuous integration: at most 4 workers.
    Ci,
    /// Local development: at most 6 workers.
    Dev,
}

impl Profile {
    /// Maximum auto-detected workers under this profile.
    pub fn worker_cap(self) -> usize {
        match self {
            Profile::Ci => 4,
            Profile::Dev => 6,
        }
    }
}

/// Core run settings.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `workers` | None (auto-detect) |
/// | `strategy` | `balanced` |
/// | `browser` | `"chrome"` |
/// | `headless` | true |
/// | `video` | true |
/// | `debug` | false |
/// | `profile` | None |
/// | `worker_timeout_secs` | 1800 |
/// | `shutdown_grace_secs` | 10 |
/// | `monitor_interval_ms` | 2000 |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RunnerConfig {
    /// Explicit worker count. Overrides auto-detection and profile caps.
    pub workers: Option<usize>,

    /// Scheduling strategy.
    #[serde(default)]
    pub strategy: Strategy,

    /// Browser name handed to every worker.
    #[serde(default = "default_browser")]
    pub browser: String,

    /// Run browsers without a visible window.
    #[serde(default = "default_true")]
    pub headless: bool,

    /// Record videos of test runs.
    #[serde(default = "default_true")]
    pub video: bool,

    /// Verbose worker output and debug logging.
    #[serde(default)]
    pub debug: bool,

    /// Optional deployment profile.
    pub profile: Option<Profile>,

    /// Wall-clock limit for a single worker process.
    ///
    /// A worker that exceeds it is stopped and recorded as timed out.
    #[serde(default = "default_worker_timeout")]
    pub worker_timeout_secs: u64,

    /// How long a worker may take to exit after a termination request
    /// before it is force-killed.
    #[serde(default = "default_grace")]
    pub shutdown_grace_secs: u64,

    /// Interval between resource monitor samples while workers run.
    #[serde(default = "default_monitor_interval")]
    pub monitor_interval_ms: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            workers: None,
            strategy: Strategy::default(),
            browser: default_browser(),
            headless: true,
            video: true,
            debug: false,
            profile: None,
            worker_timeout_secs: default_worker_timeout(),
            shutdown_grace_secs: default_grace(),
            monitor_interval_ms: default_monitor_interval(),
        }
    }
}

fn default_browser() -> String {
    "chrome".to_string()
}

fn default_true() -> bool {
    true
}

fn default_worker_timeout() -> u64 {
    1800 // 30 minutes
}

fn default_grace() -> u64 {
    10
}

fn default_monitor_interval() -> u64 {
    2000
}

/// Resource thresholds.
///
/// Usage above the `*_limit`/`*_threshold` values marks a sample unsafe and
/// raises a warning; usage above the `*_emergency` values aborts the run.
/// Disk is unsafe below `disk_buffer_mb` available and an emergency below
/// half of it.
///
/// # Example
///
/// ```toml
/// [resources]
/// memory_limit_percent = 80.0
/// disk_buffer_mb = 500
/// max_workers = 6
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ResourceConfig {
    /// Memory usage percentage above which a sample is unsafe. Default: 85.
    #[serde(default = "default_memory_limit")]
    pub memory_limit_percent: f64,

    /// Memory usage percentage that triggers an emergency. Default: 90.
    #[serde(default = "default_memory_emergency")]
    pub memory_emergency_percent: f64,

    /// CPU usage percentage above which a sample is unsafe. Default: 90.
    #[serde(default = "default_cpu_threshold")]
    pub cpu_threshold_percent: f64,

    /// CPU usage percentage that triggers an emergency. Default: 95.
    #[serde(default = "default_cpu_emergency")]
    pub cpu_emergency_percent: f64,

    /// Free disk space that must remain available, in MB. Default: 100.
    #[serde(default = "default_disk_buffer")]
    pub disk_buffer_mb: u64,

    /// Memory budget assumed for each worker when sizing the pool. Default: 400.
    #[serde(default = "default_memory_per_worker")]
    pub memory_per_worker_mb: u64,

    /// Hard cap on auto-detected workers. Default: 8.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Number of snapshots kept in the rolling history. Default: 100.
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,

    /// Path on the filesystem whose free space is checked. Default: `"."`.
    #[serde(default = "default_disk_path")]
    pub disk_path: PathBuf,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            memory_limit_percent: default_memory_limit(),
            memory_emergency_percent: default_memory_emergency(),
            cpu_threshold_percent: default_cpu_threshold(),
            cpu_emergency_percent: default_cpu_emergency(),
            disk_buffer_mb: default_disk_buffer(),
            memory_per_worker_mb: default_memory_per_worker(),
            max_workers: default_max_workers(),
            history_capacity: default_history_capacity(),
            disk_path: default_disk_path(),
        }
    }
}

fn default_memory_limit() -> f64 {
    85.0
}

fn default_memory_emergency() -> f64 {
    90.0
}

fn default_cpu_threshold() -> f64 {
    90.0
}

fn default_cpu_emergency() -> f64 {
    95.0
}

fn default_disk_buffer() -> u64 {
    100
}

fn default_memory_per_worker() -> u64 {
    400
}

fn default_max_workers() -> usize {
    8
}

fn default_history_capacity() -> usize {
    100
}

fn default_disk_path() -> PathBuf {
    PathBuf::from(".")
}

/// Test discovery settings.
///
/// Files under `root` whose relative path matches any of `patterns` are
/// test files. Each file is classified into the first group (in name order)
/// whose own patterns match it, or `default_group` otherwise.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DiscoveryConfig {
    /// Directory searched for test files. Default: `"tests"`.
    #[serde(default = "default_root")]
    pub root: PathBuf,

    /// Glob patterns (relative to `root`) selecting test files.
    #[serde(default = "default_patterns")]
    pub patterns: Vec<String>,

    /// Group assigned to files no group pattern matches. Default: `"medium"`.
    #[serde(default = "default_group_name")]
    pub default_group: String,

    /// JSON file mapping test ids to observed durations in seconds.
    ///
    /// Read during discovery and rewritten after each completed run.
    /// Default: `"test-results/timings.json"`.
    #[serde(default = "default_history_file")]
    pub history_file: Option<PathBuf>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            patterns: default_patterns(),
            default_group: default_group_name(),
            history_file: default_history_file(),
        }
    }
}

fn default_root() -> PathBuf {
    PathBuf::from("tests")
}

fn default_patterns() -> Vec<String> {
    ["**/*.spec.js", "**/*.test.js", "**/*.spec.ts", "**/*.test.ts"]
        .iter()
        .map(|p| p.to_string())
        .collect()
}

fn default_group_name() -> String {
    "medium".to_string()
}

fn default_history_file() -> Option<PathBuf> {
    Some(PathBuf::from("test-results/timings.json"))
}

/// Configuration of one test group.
///
/// # Example
///
/// ```toml
/// [groups.slow]
/// max_workers = 2
/// memory_per_worker_mb = 600
/// estimated_time_secs = 180
/// priority = "low"
/// patterns = ["**/slow/**", "**/*.slow.*"]
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GroupConfig {
    /// Maximum number of workers that may hold this group's tests. Default: 2.
    #[serde(default = "default_group_workers")]
    pub max_workers: usize,

    /// Estimated memory footprint of this group in one worker, in MB. Default: 400.
    #[serde(default = "default_memory_per_worker")]
    pub memory_per_worker_mb: u64,

    /// Duration estimate for tests without history, in seconds. Default: 60.
    #[serde(default = "default_estimated_time")]
    pub estimated_time_secs: u64,

    /// Priority tier used by the `priority` strategy. Default: `medium`.
    #[serde(default)]
    pub priority: Priority,

    /// Glob patterns (relative to the discovery root) classifying files
    /// into this group.
    #[serde(default)]
    pub patterns: Vec<String>,
}

fn default_group_workers() -> usize {
    2
}

fn default_estimated_time() -> u64 {
    60
}

fn group(
    max_workers: usize,
    memory_per_worker_mb: u64,
    estimated_time_secs: u64,
    priority: Priority,
    patterns: &[&str],
) -> GroupConfig {
    GroupConfig {
        max_workers,
        memory_per_worker_mb,
        estimated_time_secs,
        priority,
        patterns: patterns.iter().map(|p| p.to_string()).collect(),
    }
}

/// Built-in groups used when the configuration defines none.
pub fn default_groups() -> BTreeMap<String, GroupConfig> {
    BTreeMap::from([
        (
            "smoke".to_string(),
            group(2, 300, 20, Priority::Critical, &["**/smoke/**", "**/*.smoke.*"]),
        ),
        (
            "fast".to_string(),
            group(4, 300, 30, Priority::High, &["**/fast/**", "**/*.fast.*"]),
        ),
        ("medium".to_string(), group(3, 400, 60, Priority::Medium, &[])),
        (
            "slow".to_string(),
            group(2, 600, 180, Priority::Low, &["**/slow/**", "**/*.slow.*"]),
        ),
    ])
}

/// The per-worker execution engine.
///
/// `command` is split like a shell command line. Supported placeholders:
///
/// | Placeholder | Replaced with |
/// |-------------|---------------|
/// | `{tests}` | One argument per assigned test path (whole argument only) |
/// | `{test_list}` | File listing assigned test paths, one per line |
/// | `{worker}` | Worker index |
/// | `{output_dir}` | The worker's private artifact directory |
/// | `{browser}` | Configured browser name |
///
/// The engine must print its result as JSON on stdout, either
/// `{"tests":N,"passes":N,"failures":N,"pending":N,"duration":MS}` or the
/// same fields nested under `"stats"`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Command template. Default: `"npx mocha --reporter json {tests}"`.
    #[serde(default = "default_engine_command")]
    pub command: String,

    /// Extra environment variables for every worker.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Working directory for worker processes. Default: current directory.
    pub working_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            command: default_engine_command(),
            env: BTreeMap::new(),
            working_dir: None,
        }
    }
}

fn default_engine_command() -> String {
    "npx mocha --reporter json {tests}".to_string()
}

/// Report output settings.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `output_dir` | `"test-results"` |
/// | `json_file` | `"execution-report.json"` |
/// | `text_file` | `"execution-summary.txt"` |
/// | `partial_file` | `"partial-results.json"` |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReportConfig {
    /// Directory for reports and per-worker artifacts.
    #[serde(default = "default_report_dir")]
    pub output_dir: PathBuf,

    /// Machine-readable report, written under `output_dir`.
    #[serde(default = "default_json_file")]
    pub json_file: String,

    /// Human-readable summary, written under `output_dir`.
    #[serde(default = "default_text_file")]
    pub text_file: String,

    /// Partial results written on emergency shutdown, under `output_dir`.
    #[serde(default = "default_partial_file")]
    pub partial_file: String,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            output_dir: default_report_dir(),
            json_file: default_json_file(),
            text_file: default_text_file(),
            partial_file: default_partial_file(),
        }
    }
}

fn default_report_dir() -> PathBuf {
    PathBuf::from("test-results")
}

fn default_json_file() -> String {
    "execution-report.json".to_string()
}

fn default_text_file() -> String {
    "execution-summary.txt".to_string()
}

fn default_partial_file() -> String {
    "partial-results.json".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.runner.workers, None);
        assert_eq!(config.runner.strategy, Strategy::Balanced);
        assert!(config.runner.headless);
        assert!(config.runner.video);
        assert_eq!(config.resources.memory_limit_percent, 85.0);
        assert_eq!(config.resources.disk_buffer_mb, 100);
        assert_eq!(config.resources.memory_per_worker_mb, 400);
        assert_eq!(config.resources.max_workers, 8);
        assert_eq!(config.groups.len(), 4);
        assert_eq!(config.report.output_dir, PathBuf::from("test-results"));
    }

    #[test]
    fn test_groups_replace_defaults() {
        let config: Config = toml::from_str(
            r#"
            [groups.e2e]
            max_workers = 1
            priority = "critical"
            "#,
        )
        .unwrap();
        assert_eq!(config.groups.len(), 1);
        let e2e = &config.groups["e2e"];
        assert_eq!(e2e.max_workers, 1);
        assert_eq!(e2e.priority, Priority::Critical);
        assert_eq!(e2e.estimated_time_secs, 60);
    }

    #[test]
    fn test_profile_caps() {
        assert_eq!(Profile::Ci.worker_cap(), 4);
        assert_eq!(Profile::Dev.worker_cap(), 6);
        let config: Config = toml::from_str("[runner]\nprofile = \"ci\"").unwrap();
        assert_eq!(config.runner.profile, Some(Profile::Ci));
    }

    #[test]
    fn test_unknown_strategy_rejected() {
        let result: Result<Config, _> = toml::from_str("[runner]\nstrategy = \"random\"");
        assert!(result.is_err());
    }
}
