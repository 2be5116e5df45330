//! Configuration loading and schema definitions for shardrun.
//!
//! This module provides types and functions for loading shardrun
//! configuration from TOML files or strings. Command-line flags are applied
//! on top of the loaded configuration by the CLI.

pub mod schema;

pub use schema::*;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, ensure};
use tracing::info;

/// Loads shardrun configuration from a TOML file.
///
/// # Errors
///
/// Returns an error if:
/// - The file cannot be read (e.g., doesn't exist or permission denied)
/// - The file contains invalid TOML syntax
/// - The configuration doesn't match the expected schema
/// - The configuration fails [`validate`]
///
/// # Example
///
/// ```no_run
/// use shardrun::config::load_config;
/// use std::path::Path;
///
/// let config = load_config(Path::new("shardrun.toml"))?;
/// println!("Strategy: {:?}", config.runner.strategy);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
    validate(&config)
        .with_context(|| format!("Invalid config file: {}", path.display()))?;

    Ok(expand_paths(config))
}

/// Loads shardrun configuration from a TOML string.
///
/// # Example
///
/// ```
/// use shardrun::config::load_config_str;
///
/// let config = load_config_str(r#"
///     [runner]
///     workers = 4
///     strategy = "fastest"
/// "#)?;
///
/// assert_eq!(config.runner.workers, Some(4));
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config_str(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config")?;
    validate(&config).context("Invalid config")?;

    Ok(expand_paths(config))
}

/// Loads configuration from `path`, falling back to defaults when the file
/// does not exist and was not explicitly requested.
pub fn load_or_default(path: &Path, explicit: bool) -> Result<Config> {
    if !explicit && !path.exists() {
        info!(
            "No config file at {}, using built-in defaults",
            path.display()
        );
        return Ok(Config::default());
    }
    load_config(path)
}

/// Checks settings that parse but cannot describe a sensible run.
///
/// Each warning limit must sit at or below its emergency threshold, so a
/// run that passes admission is not shut down by the first sample. Memory
/// percentages lie in (0, 100]; CPU percentages are load relative to the
/// core count and only need to be positive.
pub fn validate(config: &Config) -> Result<()> {
    let resources = &config.resources;

    for (name, value) in [
        ("memory_limit_percent", resources.memory_limit_percent),
        ("memory_emergency_percent", resources.memory_emergency_percent),
    ] {
        ensure!(
            value > 0.0 && value <= 100.0,
            "resources.{} must be in (0, 100], got {}",
            name,
            value
        );
    }
    for (name, value) in [
        ("cpu_threshold_percent", resources.cpu_threshold_percent),
        ("cpu_emergency_percent", resources.cpu_emergency_percent),
    ] {
        ensure!(
            value.is_finite() && value > 0.0,
            "resources.{} must be a positive number, got {}",
            name,
            value
        );
    }
    ensure!(
        resources.memory_limit_percent <= resources.memory_emergency_percent,
        "resources.memory_limit_percent ({}) exceeds memory_emergency_percent ({})",
        resources.memory_limit_percent,
        resources.memory_emergency_percent
    );
    ensure!(
        resources.cpu_threshold_percent <= resources.cpu_emergency_percent,
        "resources.cpu_threshold_percent ({}) exceeds cpu_emergency_percent ({})",
        resources.cpu_threshold_percent,
        resources.cpu_emergency_percent
    );

    ensure!(!config.groups.is_empty(), "at least one test group is required");
    ensure!(
        config.groups.contains_key(&config.discovery.default_group),
        "discovery.default_group '{}' is not a configured group",
        config.discovery.default_group
    );
    Ok(())
}

/// Expands `~` and environment variables in configured paths.
fn expand_paths(mut config: Config) -> Config {
    config.discovery.root = expand(&config.discovery.root);
    config.discovery.history_file = config.discovery.history_file.as_deref().map(expand);
    config.report.output_dir = expand(&config.report.output_dir);
    config.resources.disk_path = expand(&config.resources.disk_path);
    config.engine.working_dir = config.engine.working_dir.as_deref().map(expand);
    config
}

fn expand(path: &Path) -> PathBuf {
    let raw = path.to_string_lossy();
    match shellexpand::full(&raw) {
        Ok(expanded) => PathBuf::from(expanded.as_ref()),
        Err(_) => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_default_path_falls_back() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = load_or_default(&dir.path().join("shardrun.toml"), false).unwrap();
        assert_eq!(config.runner.browser, "chrome");
    }

    #[test]
    fn test_missing_explicit_path_fails() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(load_or_default(&dir.path().join("missing.toml"), true).is_err());
    }

    #[test]
    fn test_defaults_are_valid() {
        validate(&Config::default()).unwrap();
    }

    #[test]
    fn test_limit_above_emergency_rejected() {
        let err = load_config_str(
            "[resources]\nmemory_limit_percent = 95.0\nmemory_emergency_percent = 90.0\n",
        )
        .unwrap_err();
        assert!(format!("{:#}", err).contains("exceeds memory_emergency_percent"));

        let err = load_config_str(
            "[resources]\ncpu_threshold_percent = 96.0\ncpu_emergency_percent = 95.0\n",
        )
        .unwrap_err();
        assert!(format!("{:#}", err).contains("exceeds cpu_emergency_percent"));
    }

    #[test]
    fn test_memory_percent_range() {
        let mut config = Config::default();
        config.resources.memory_limit_percent = 0.0;
        assert!(validate(&config).is_err());

        config.resources.memory_limit_percent = 85.0;
        config.resources.memory_emergency_percent = 120.0;
        assert!(validate(&config).is_err());

        config.resources.memory_emergency_percent = f64::NAN;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_cpu_may_exceed_one_hundred() {
        let mut config = Config::default();
        config.resources.cpu_threshold_percent = 400.0;
        config.resources.cpu_emergency_percent = 800.0;
        validate(&config).unwrap();

        config.resources.cpu_threshold_percent = -1.0;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_unknown_default_group_rejected() {
        let err = load_config_str("[discovery]\ndefault_group = \"missing\"\n").unwrap_err();
        assert!(format!("{:#}", err).contains("'missing'"));
    }

    #[test]
    fn test_invalid_file_names_path() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("shardrun.toml");
        std::fs::write(&path, "[resources]\nmemory_limit_percent = 150.0\n").unwrap();
        let err = load_config(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("Invalid config file"));
    }

    #[test]
    fn test_load_config_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("shardrun.toml");
        std::fs::write(&path, "[report]\noutput_dir = \"out\"\n").unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.report.output_dir, PathBuf::from("out"));
    }
}
