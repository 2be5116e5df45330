//! The per-worker execution engine boundary.
//!
//! Shardrun never interprets individual tests. Each worker runs one external
//! command built from the `[engine]` template and reads back a single
//! structured result: test counts plus a duration.
//!
//! # Command template
//!
//! ```toml
//! [engine]
//! command = "npx mocha --reporter json {tests}"
//! ```
//!
//! The template is split like a shell command line, then each argument is
//! expanded:
//!
//! | Placeholder | Expansion |
//! |-------------|-----------|
//! | `{tests}` | Whole argument only: one argument per assigned test path |
//! | `{test_list}` | Path of a file listing the assigned tests, one per line |
//! | `{worker}` | Worker index |
//! | `{output_dir}` | The worker's private artifact directory |
//! | `{browser}` | Configured browser name |
//!
//! # Result protocol
//!
//! The engine prints JSON on stdout, either flat
//! `{"tests":5,"passes":4,"failures":1,"pending":0,"duration":1234}` or
//! mocha-style with the same fields under `"stats"`. `duration` is in
//! milliseconds. Log lines around the JSON are tolerated.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::config::{EngineConfig, RunnerConfig};
use crate::discovery::TestCase;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors in the engine configuration.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The command template contains no program.
    #[error("Engine command is empty")]
    EmptyCommand,

    /// The command template cannot be split into arguments.
    #[error("Invalid engine command: {0}")]
    InvalidCommand(String),
}

/// A resolved command ready to spawn.
///
/// # Example
///
/// ```
/// use shardrun::engine::Command;
///
/// let cmd = Command::new("npx")
///     .arg("mocha")
///     .args(["a.spec.js", "b.spec.js"])
///     .env("NODE_ENV", "test");
/// assert_eq!(cmd.to_shell_string(), "npx mocha a.spec.js b.spec.js");
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl Command {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Renders the command as a shell-quoted string, for logs.
    pub fn to_shell_string(&self) -> String {
        shell_words::join(std::iter::once(&self.program).chain(self.args.iter()))
    }

    /// Converts into a Tokio command. Stdio is left for the caller.
    pub fn to_tokio(&self) -> tokio::process::Command {
        let mut process = tokio::process::Command::new(&self.program);
        process.args(&self.args);
        for (key, value) in &self.env {
            process.env(key, value);
        }
        if let Some(dir) = &self.working_dir {
            process.current_dir(dir);
        }
        process
    }
}

/// What one worker's command is built from.
#[derive(Debug, Clone, Copy)]
pub struct WorkerContext<'a> {
    pub worker: usize,
    pub output_dir: &'a Path,
    pub test_list: &'a Path,
    pub tests: &'a [TestCase],
}

/// Builds worker commands from the `[engine]` template.
#[derive(Debug, Clone)]
pub struct Engine {
    template: Vec<String>,
    env: BTreeMap<String, String>,
    working_dir: Option<PathBuf>,
    browser: String,
    headless: bool,
    video: bool,
    debug: bool,
}

impl Engine {
    /// Parses the command template.
    ///
    /// # Errors
    ///
    /// [`EngineError::InvalidCommand`] on unbalanced quotes,
    /// [`EngineError::EmptyCommand`] when no program remains.
    pub fn new(engine: &EngineConfig, runner: &RunnerConfig) -> EngineResult<Self> {
        let template = shell_words::split(&engine.command)
            .map_err(|e| EngineError::InvalidCommand(format!("{}: {}", engine.command, e)))?;
        if template.is_empty() {
            return Err(EngineError::EmptyCommand);
        }

        Ok(Self {
            template,
            env: engine.env.clone(),
            working_dir: engine.working_dir.clone(),
            browser: runner.browser.clone(),
            headless: runner.headless,
            video: runner.video,
            debug: runner.debug,
        })
    }

    /// Builds the command for one worker.
    ///
    /// Besides `[engine].env`, every worker gets `SHARDRUN_WORKER`,
    /// `SHARDRUN_OUTPUT_DIR`, `SHARDRUN_BROWSER`, `SHARDRUN_HEADLESS`,
    /// `SHARDRUN_VIDEO` and `SHARDRUN_DEBUG`.
    pub fn command(&self, ctx: &WorkerContext<'_>) -> Command {
        let mut expanded = Vec::with_capacity(self.template.len() + ctx.tests.len());
        for token in &self.template {
            if token == "{tests}" {
                expanded.extend(ctx.tests.iter().map(|t| t.path.to_string_lossy().into_owned()));
            } else {
                expanded.push(self.substitute(token, ctx));
            }
        }

        let mut tokens = expanded.into_iter();
        // A template of only `{tests}` with no tests leaves no program; the
        // spawn then fails and the worker is recorded as crashed.
        let program = tokens.next().unwrap_or_default();

        let mut cmd = Command::new(program)
            .args(tokens)
            .env("SHARDRUN_WORKER", ctx.worker.to_string())
            .env(
                "SHARDRUN_OUTPUT_DIR",
                ctx.output_dir.to_string_lossy().into_owned(),
            )
            .env("SHARDRUN_BROWSER", &self.browser)
            .env("SHARDRUN_HEADLESS", self.headless.to_string())
            .env("SHARDRUN_VIDEO", self.video.to_string())
            .env("SHARDRUN_DEBUG", self.debug.to_string());

        for (key, value) in &self.env {
            cmd = cmd.env(key, value);
        }
        if let Some(dir) = &self.working_dir {
            cmd = cmd.working_dir(dir);
        }
        cmd
    }

    fn substitute(&self, token: &str, ctx: &WorkerContext<'_>) -> String {
        if !token.contains('{') {
            return token.to_string();
        }
        token
            .replace("{worker}", &ctx.worker.to_string())
            .replace("{output_dir}", &ctx.output_dir.to_string_lossy())
            .replace("{test_list}", &ctx.test_list.to_string_lossy())
            .replace("{browser}", &self.browser)
    }
}

/// Counts reported by the engine for one worker.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EngineReport {
    pub tests: u64,
    pub passes: u64,
    pub failures: u64,
    pub pending: u64,
    /// Duration measured by the engine itself, when reported.
    pub duration: Option<Duration>,
}

#[derive(Deserialize)]
struct RawStats {
    tests: u64,
    #[serde(default)]
    passes: u64,
    #[serde(default)]
    failures: u64,
    #[serde(default)]
    pending: u64,
    duration: Option<f64>,
}

impl EngineReport {
    /// Finds and parses the engine's JSON result in captured stdout.
    ///
    /// Tried in order: the whole output, everything from the first line
    /// starting with `{`, and the last line starting with `{`.
    ///
    /// # Example
    ///
    /// ```
    /// use shardrun::engine::EngineReport;
    ///
    /// let stdout = "starting browser\n{\"stats\":{\"tests\":3,\"passes\":3,\"failures\":0,\"pending\":0}}\n";
    /// let report = EngineReport::parse(stdout).unwrap();
    /// assert_eq!(report.passes, 3);
    /// ```
    pub fn parse(stdout: &str) -> Option<Self> {
        let trimmed = stdout.trim();
        if let Some(report) = Self::parse_json(trimmed) {
            return Some(report);
        }

        let lines: Vec<&str> = stdout.lines().collect();
        if let Some(first) = lines.iter().position(|l| l.trim_start().starts_with('{'))
            && let Some(report) = Self::parse_json(&lines[first..].join("\n"))
        {
            return Some(report);
        }

        lines
            .iter()
            .rev()
            .find(|l| l.trim_start().starts_with('{'))
            .and_then(|l| Self::parse_json(l.trim()))
    }

    fn parse_json(text: &str) -> Option<Self> {
        let value: serde_json::Value = serde_json::from_str(text).ok()?;
        let stats = match value.get("stats") {
            Some(stats) if stats.is_object() => stats.clone(),
            _ => value,
        };
        let raw: RawStats = serde_json::from_value(stats).ok()?;

        Some(Self {
            tests: raw.tests,
            passes: raw.passes,
            failures: raw.failures,
            pending: raw.pending,
            duration: raw
                .duration
                .and_then(|ms| Duration::try_from_secs_f64(ms / 1000.0).ok()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(command: &str) -> Engine {
        let config = EngineConfig {
            command: command.to_string(),
            ..EngineConfig::default()
        };
        Engine::new(&config, &RunnerConfig::default()).unwrap()
    }

    fn tests() -> Vec<TestCase> {
        vec![
            TestCase::new("a.spec.js", "medium", Duration::from_secs(1)).with_path("tests/a.spec.js"),
            TestCase::new("b.spec.js", "medium", Duration::from_secs(1)).with_path("tests/b.spec.js"),
        ]
    }

    #[test]
    fn test_tests_placeholder_expands_to_arguments() {
        let tests = tests();
        let cmd = engine("npx mocha --reporter json {tests}").command(&WorkerContext {
            worker: 2,
            output_dir: Path::new("out/worker-2"),
            test_list: Path::new("out/worker-2/tests.txt"),
            tests: &tests,
        });
        assert_eq!(cmd.program, "npx");
        assert_eq!(
            cmd.args,
            vec!["mocha", "--reporter", "json", "tests/a.spec.js", "tests/b.spec.js"]
        );
    }

    #[test]
    fn test_inline_placeholders_and_env() {
        let tests = tests();
        let cmd = engine("run --out={output_dir} --list {test_list} -w {worker} --browser {browser}")
            .command(&WorkerContext {
                worker: 1,
                output_dir: Path::new("out/w1"),
                test_list: Path::new("out/w1/tests.txt"),
                tests: &tests,
            });
        assert_eq!(
            cmd.args,
            vec!["--out=out/w1", "--list", "out/w1/tests.txt", "-w", "1", "--browser", "chrome"]
        );
        assert!(cmd.env.contains(&("SHARDRUN_WORKER".to_string(), "1".to_string())));
        assert!(cmd.env.contains(&("SHARDRUN_HEADLESS".to_string(), "true".to_string())));
    }

    #[test]
    fn test_invalid_templates() {
        let runner = RunnerConfig::default();
        let empty = EngineConfig {
            command: "   ".to_string(),
            ..EngineConfig::default()
        };
        assert!(matches!(
            Engine::new(&empty, &runner),
            Err(EngineError::EmptyCommand)
        ));
        let unbalanced = EngineConfig {
            command: "sh -c 'echo".to_string(),
            ..EngineConfig::default()
        };
        assert!(matches!(
            Engine::new(&unbalanced, &runner),
            Err(EngineError::InvalidCommand(_))
        ));
    }

    #[test]
    fn test_parse_flat_report() {
        let report =
            EngineReport::parse(r#"{"tests":10,"passes":8,"failures":2,"pending":0,"duration":1500}"#)
                .unwrap();
        assert_eq!(report.tests, 10);
        assert_eq!(report.failures, 2);
        assert_eq!(report.duration, Some(Duration::from_millis(1500)));
    }

    #[test]
    fn test_parse_keeps_counts_when_duration_overflows() {
        let report =
            EngineReport::parse(r#"{"tests":3,"passes":3,"failures":0,"pending":0,"duration":1e30}"#)
                .unwrap();
        assert_eq!(report.tests, 3);
        assert_eq!(report.passes, 3);
        assert_eq!(report.duration, None);

        let negative = EngineReport::parse(r#"{"tests":1,"passes":1,"duration":-5}"#).unwrap();
        assert_eq!(negative.duration, None);
    }

    #[test]
    fn test_parse_mocha_report_with_noise() {
        let stdout = "Launching chrome\n{\n  \"stats\": {\"tests\": 4, \"passes\": 3, \"failures\": 0, \"pending\": 1},\n  \"tests\": []\n}\n";
        let report = EngineReport::parse(stdout).unwrap();
        assert_eq!(report.tests, 4);
        assert_eq!(report.pending, 1);
        assert_eq!(report.duration, None);
    }

    #[test]
    fn test_parse_last_json_line() {
        let stdout = "{\"progress\": 1}\nrunning\n{\"tests\":5,\"passes\":5,\"failures\":0,\"pending\":0}\n";
        assert_eq!(EngineReport::parse(stdout).unwrap().passes, 5);
    }

    #[test]
    fn test_parse_no_report() {
        assert_eq!(EngineReport::parse(""), None);
        assert_eq!(EngineReport::parse("all good\n"), None);
        assert_eq!(EngineReport::parse("{\"progress\": 1}"), None);
    }
}
