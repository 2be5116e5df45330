//! shardrun: a resource-aware parallel test orchestrator.
//!
//! This crate discovers test files, partitions them across a bounded number
//! of worker processes with a bin-packing scheduler, watches system memory,
//! CPU and disk while the workers run, and merges the per-worker results
//! into one report with parallel-efficiency metrics.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **Resource**: Sample system usage, admission control, emergency events
//! - **Discovery**: Find test files and classify them into groups
//! - **Orchestrator**: Schedule tests, supervise workers, drive the run
//! - **Engine**: Build the per-worker command and parse its result
//! - **Report**: Aggregate results and write JSON and text reports
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
//!     let outcome = Orchestrator::system(config, ConsoleReporter::new(false))
//!         .run()
//!         .await?;
//!     println!("pass rate: {}%", outcome.report.summary.tests.pass_rate);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod discovery;
pub mod engine;
pub mod orchestrator;
pub mod report;
pub mod resource;

// Re-export commonly used types
pub use config::{Config, load_config};
pub use discovery::{TestCase, TestCatalog, TestDiscoverer};
pub use orchestrator::{Orchestrator, RunError, RunOutcome, RunState};
pub use report::{ExecutionReport, Reporter};
pub use resource::{ResourceMonitor, ResourceSnapshot};
