//! shardrun CLI - Resource-aware parallel test orchestrator.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use shardrun::config::{self, Config, Profile};
use shardrun::discovery::TestDiscoverer;
use shardrun::engine::Engine;
use shardrun::orchestrator::{Orchestrator, RunError, Strategy};
use shardrun::report::{ConsoleReporter, MultiReporter, NullReporter};
use shardrun::resource::ResourceMonitor;

const DEFAULT_CONFIG: &str = "shardrun.toml";

#[derive(Parser)]
#[command(name = "shardrun")]
#[command(about = "Resource-aware parallel test orchestrator", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run tests
    Run(RunArgs),

    /// Discover tests without running them
    Collect {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show the schedule a run would use, without running it
    Plan(RunArgs),

    /// Show current resource usage and the affordable worker count
    Resources {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Validate configuration file
    Validate,

    /// Initialize a new configuration file
    Init {
        /// Test command for each worker
        #[arg(short, long, default_value = "npx mocha --reporter json {tests}")]
        engine: String,
    },
}

#[derive(Args, Clone, Default)]
struct RunArgs {
    /// Number of workers (overrides auto-detection)
    #[arg(short, long)]
    workers: Option<usize>,

    /// Scheduling strategy
    #[arg(short, long, value_enum)]
    strategy: Option<Strategy>,

    /// Browser handed to the workers
    #[arg(long)]
    browser: Option<String>,

    /// Show the browser window
    #[arg(long, conflicts_with = "headless")]
    headed: bool,

    /// Hide the browser window (default)
    #[arg(long)]
    headless: bool,

    /// Record videos (default)
    #[arg(long, conflicts_with = "no_video")]
    video: bool,

    /// Do not record videos
    #[arg(long)]
    no_video: bool,

    /// Debug output from workers and shardrun
    #[arg(long)]
    debug: bool,

    /// CI profile: at most 4 auto-detected workers
    #[arg(long, conflicts_with = "dev")]
    ci: bool,

    /// Development profile: at most 6 auto-detected workers
    #[arg(long)]
    dev: bool,

    /// Memory usage percentage above which a run is refused
    #[arg(long)]
    memory_limit: Option<f64>,

    /// Free disk space (MB) below which a run is refused
    #[arg(long)]
    disk_buffer: Option<u64>,
}

impl RunArgs {
    fn apply(&self, config: &mut Config) {
        let runner = &mut config.runner;
        if let Some(workers) = self.workers {
            runner.workers = Some(workers);
        }
        if let Some(strategy) = self.strategy {
            runner.strategy = strategy;
        }
        if let Some(browser) = &self.browser {
            runner.browser = browser.clone();
        }
        if self.headed {
            runner.headless = false;
        } else if self.headless {
            runner.headless = true;
        }
        if self.no_video {
            runner.video = false;
        } else if self.video {
            runner.video = true;
        }
        if self.debug {
            runner.debug = true;
        }
        if self.ci {
            runner.profile = Some(Profile::Ci);
        } else if self.dev {
            runner.profile = Some(Profile::Dev);
        }

        if let Some(limit) = self.memory_limit {
            config.resources.memory_limit_percent = limit;
        }
        if let Some(buffer) = self.disk_buffer {
            config.resources.disk_buffer_mb = buffer;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let debug = matches!(&cli.command, Commands::Run(args) | Commands::Plan(args) if args.debug);
    let default_level = if cli.verbose || debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let explicit = cli.config.is_some();
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG));

    match cli.command {
        Commands::Run(args) => run_tests(&config_path, explicit, &args, cli.verbose).await,
        Commands::Collect { format } => collect_tests(&config_path, explicit, &format),
        Commands::Plan(args) => plan_tests(&config_path, explicit, &args),
        Commands::Resources { format } => show_resources(&config_path, explicit, &format),
        Commands::Validate => validate_config(&config_path),
        Commands::Init { engine } => init_config(&config_path, &engine),
    }
}

fn load(config_path: &Path, explicit: bool) -> Result<Config> {
    config::load_or_default(config_path, explicit)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))
}

async fn run_tests(config_path: &Path, explicit: bool, args: &RunArgs, verbose: bool) -> Result<()> {
    let mut config = load(config_path, explicit)?;
    args.apply(&mut config);
    config::validate(&config).context("Invalid command-line options")?;

    let reporter = MultiReporter::new().with_reporter(ConsoleReporter::new(verbose || config.runner.debug));
    let orchestrator = Orchestrator::system(config, reporter);

    match orchestrator.run().await {
        Ok(outcome) => {
            if outcome.interrupted {
                eprintln!(
                    "{}",
                    console::style("Run interrupted; partial results were saved.")
                        .yellow()
                        .bold()
                );
            }
            std::process::exit(outcome.exit_code);
        }
        Err(e) => {
            print_fatal(&e);
            std::process::exit(e.exit_code());
        }
    }
}

fn print_fatal(error: &RunError) {
    let headline = match error {
        RunError::EmergencyResourceBreach(_) => "EMERGENCY SHUTDOWN",
        RunError::ResourceUnsafe(_) => "RUN REFUSED",
        _ => "RUN FAILED",
    };
    eprintln!();
    eprintln!("{}", console::style(format!("!!! {} !!!", headline)).red().bold());
    eprintln!("{}", console::style(error).red());
    match error {
        RunError::EmergencyResourceBreach(_) => eprintln!(
            "{}",
            console::style("All workers were stopped. Whatever results had arrived were saved.")
                .dim()
        ),
        RunError::ResourceUnsafe(_) => eprintln!(
            "{}",
            console::style("No worker was started. Free resources or adjust the limits.").dim()
        ),
        _ => {}
    }
}

fn collect_tests(config_path: &Path, explicit: bool, format: &str) -> Result<()> {
    let config = load(config_path, explicit)?;
    let catalog = TestDiscoverer::new(&config.discovery, &config.groups)?.discover()?;

    match format {
        "json" => {
            let json = serde_json::to_string_pretty(&catalog)?;
            println!("{}", json);
        }
        _ => {
            println!("Discovered {} tests:", catalog.len());
            for (group, tests) in &catalog.tests {
                if tests.is_empty() {
                    continue;
                }
                println!("  {} ({} tests)", group, tests.len());
                for test in tests {
                    println!(
                        "    {} [{:.0}s]",
                        test.id,
                        test.estimated_duration.as_secs_f64()
                    );
                }
            }
        }
    }

    Ok(())
}

fn plan_tests(config_path: &Path, explicit: bool, args: &RunArgs) -> Result<()> {
    let mut config = load(config_path, explicit)?;
    args.apply(&mut config);
    config::validate(&config).context("Invalid command-line options")?;

    let catalog = TestDiscoverer::new(&config.discovery, &config.groups)?.discover()?;
    let orchestrator = Orchestrator::system(config, NullReporter);
    let snapshot = orchestrator.monitor().check_resources()?;
    if !snapshot.safe {
        let reasons = snapshot.unsafe_reasons(orchestrator.monitor().thresholds());
        println!(
            "{}",
            console::style(format!("Warning: a run would be refused: {}", reasons.join("; ")))
                .yellow()
        );
    }

    let schedule = orchestrator.plan(&catalog, &snapshot)?;
    println!(
        "{} tests on {} workers ({} strategy, est. {:.1}s)",
        schedule.test_count(),
        schedule.worker_count(),
        schedule.strategy,
        schedule.makespan().as_secs_f64()
    );
    for assignment in &schedule.assignments {
        let groups: Vec<&str> = assignment.groups().into_iter().collect();
        println!(
            "  Worker {}: {} tests, est. {:.1}s, {} MB [{}]",
            assignment.worker,
            assignment.tests.len(),
            assignment.estimated_duration.as_secs_f64(),
            assignment.estimated_memory / config::MB,
            groups.join(", ")
        );
        for test in &assignment.tests {
            println!("    {}", test.id);
        }
    }
    for warning in &schedule.warnings {
        println!("{}", console::style(warning).yellow());
    }

    Ok(())
}

fn show_resources(config_path: &Path, explicit: bool, format: &str) -> Result<()> {
    let config = load(config_path, explicit)?;
    let monitor = ResourceMonitor::system(&config.resources);
    let snapshot = monitor.check_resources()?;
    let optimal = monitor.optimal_workers_for(&snapshot);

    match format {
        "json" => {
            let value = serde_json::json!({
                "snapshot": snapshot,
                "optimalWorkers": optimal,
            });
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        _ => {
            let flag = |safe: bool| {
                if safe {
                    console::style("ok").green()
                } else {
                    console::style("UNSAFE").red().bold()
                }
            };
            println!("Resources:");
            println!(
                "  Memory: {:.1}% used, {} MB free [{}]",
                snapshot.memory.percentage,
                snapshot.memory.free / config::MB,
                flag(snapshot.memory.safe)
            );
            println!(
                "  CPU:    {:.1}% ({} cores, load {:.2}) [{}]",
                snapshot.cpu.percentage,
                snapshot.cpu.cores,
                snapshot.cpu.load_average,
                flag(snapshot.cpu.safe)
            );
            println!(
                "  Disk:   {} MB available [{}]",
                snapshot.disk.available / config::MB,
                flag(snapshot.disk.safe)
            );
            println!("  Optimal workers: {}", optimal);
        }
    }

    Ok(())
}

fn validate_config(config_path: &Path) -> Result<()> {
    let checked = config::load_config(config_path).and_then(|config| {
        TestDiscoverer::new(&config.discovery, &config.groups)?;
        Engine::new(&config.engine, &config.runner)?;
        Ok(config)
    });

    match checked {
        Ok(config) => {
            println!("Configuration is valid!");
            println!();
            println!("Settings:");
            match config.runner.workers {
                Some(workers) => println!("  Workers: {}", workers),
                None => println!("  Workers: auto (max {})", config.resources.max_workers),
            }
            println!("  Strategy: {}", config.runner.strategy);
            println!("  Worker timeout: {}s", config.runner.worker_timeout_secs);
            println!("  Memory limit: {}%", config.resources.memory_limit_percent);
            println!("  Disk buffer: {} MB", config.resources.disk_buffer_mb);
            println!("  Test root: {}", config.discovery.root.display());
            println!(
                "  Groups: {}",
                config.groups.keys().cloned().collect::<Vec<_>>().join(", ")
            );
            println!("  Engine: {}", config.engine.command);
            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            std::process::exit(1);
        }
    }
}

fn init_config(path: &Path, engine: &str) -> Result<()> {
    let config = format!(
        r#"# shardrun configuration file

[runner]
# workers = 4               # omit to size the pool from free resources
strategy = "balanced"       # balanced | fastest | priority
browser = "chrome"
headless = true
video = true
worker_timeout_secs = 1800
shutdown_grace_secs = 10

[resources]
memory_limit_percent = 85.0
memory_emergency_percent = 90.0
cpu_threshold_percent = 90.0
disk_buffer_mb = 100
memory_per_worker_mb = 400
max_workers = 8

[discovery]
root = "tests"
patterns = ["**/*.spec.js", "**/*.test.js", "**/*.spec.ts", "**/*.test.ts"]
default_group = "medium"
history_file = "test-results/timings.json"

[groups.smoke]
max_workers = 2
memory_per_worker_mb = 300
estimated_time_secs = 20
priority = "critical"
patterns = ["**/smoke/**"]

[groups.fast]
max_workers = 4
memory_per_worker_mb = 300
estimated_time_secs = 30
priority = "high"
patterns = ["**/fast/**", "**/*.fast.*"]

[groups.medium]
max_workers = 3
memory_per_worker_mb = 400
estimated_time_secs = 60
priority = "medium"

[groups.slow]
max_workers = 2
memory_per_worker_mb = 600
estimated_time_secs = 180
priority = "low"
patterns = ["**/slow/**", "**/e2e/**"]

[engine]
command = "{}"

[report]
output_dir = "test-results"
"#,
        engine.replace('\\', "\\\\").replace('"', "\\\"")
    );

    if path.exists() {
        eprintln!(
            "{} already exists. Remove it first or edit manually.",
            path.display()
        );
        std::process::exit(1);
    }

    std::fs::write(path, config).with_context(|| format!("Failed to write {}", path.display()))?;
    info!("Wrote {}", path.display());
    println!("Created {}", path.display());
    println!();
    println!("Edit the configuration as needed, then run:");
    println!("  shardrun run");

    Ok(())
}
