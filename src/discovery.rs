//! Test discovery and classification.
//!
//! The [`TestDiscoverer`] walks a root directory, selects files matching the
//! configured glob patterns, and classifies each file into a [`TestGroup`].
//! The result is a [`TestCatalog`]: group definitions plus the tests found
//! for each group, every test carrying an estimated duration.
//!
//! ```text
//!   root/ ──walk──► relative paths ──patterns──► test files
//!                                                    │
//!                         group patterns (name order) │ first match wins,
//!                                                    ▼ else default group
//!                                              TestCatalog
//!                                                    │
//!                   duration history ───────────────►│ estimated_duration
//! ```
//!
//! Zero matching files is not an error here; the orchestrator decides what
//! an empty catalog means.

pub mod history;
pub mod pattern;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize, Serializer};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::{DiscoveryConfig, GroupConfig, MB};

pub use history::DurationHistory;
pub use pattern::Pattern;

/// Result type for discovery operations.
pub type DiscoveryResult<T> = Result<T, DiscoveryError>;

/// Errors that can occur during test discovery.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    /// The discovery root does not exist or cannot be listed.
    #[error("Cannot read test root {}: {source}", .path.display())]
    RootUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A configured glob pattern is malformed.
    #[error("Invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// The default group is not among the configured groups.
    #[error("Default group '{0}' is not configured")]
    UnknownGroup(String),

    /// I/O error reading files.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Scheduling priority tier of a test group.
///
/// Ordered `Low < Medium < High < Critical`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Critical => "critical",
        };
        f.write_str(name)
    }
}

/// Serializes a duration as fractional milliseconds, the unit used in every
/// report.
pub(crate) fn serialize_millis<S: Serializer>(
    duration: &Duration,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64() * 1000.0)
}

pub(crate) fn serialize_opt_millis<S: Serializer>(
    duration: &Option<Duration>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match duration {
        Some(duration) => serialize_millis(duration, serializer),
        None => serializer.serialize_none(),
    }
}

/// A single discovered test file.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use shardrun::discovery::{Priority, TestCase};
///
/// let test = TestCase::new("auth/login.spec.js", "fast", Duration::from_secs(30))
///     .with_path("tests/auth/login.spec.js")
///     .with_priority(Priority::Critical);
/// assert_eq!(test.group, "fast");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCase {
    /// Path relative to the discovery root, `/`-separated. Unique.
    pub id: String,

    /// Path handed to the execution engine.
    pub path: PathBuf,

    /// Name of the group this test was classified into.
    pub group: String,

    /// Expected run time, from history or the group default.
    #[serde(serialize_with = "serialize_millis")]
    pub estimated_duration: Duration,

    /// Explicit priority overriding the group's tier.
    pub priority: Option<Priority>,
}

impl TestCase {
    /// Creates a test whose engine path equals its id.
    pub fn new(id: impl Into<String>, group: impl Into<String>, estimated: Duration) -> Self {
        let id = id.into();
        Self {
            path: PathBuf::from(&id),
            id,
            group: group.into(),
            estimated_duration: estimated,
            priority: None,
        }
    }

    /// Sets the path handed to the engine.
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = path.into();
        self
    }

    /// Sets an explicit priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }
}

/// Execution constraints shared by every test of one group.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestGroup {
    pub name: String,

    /// Maximum number of workers that may hold this group's tests.
    pub max_workers: usize,

    /// Memory one worker needs for this group, in bytes.
    pub memory_per_worker: u64,

    /// Duration assumed for tests without history.
    #[serde(serialize_with = "serialize_millis")]
    pub estimated_time: Duration,

    pub priority: Priority,
}

impl TestGroup {
    /// Builds a group from its `[groups.<name>]` configuration.
    pub fn from_config(name: impl Into<String>, config: &GroupConfig) -> Self {
        Self {
            name: name.into(),
            max_workers: config.max_workers,
            memory_per_worker: config.memory_per_worker_mb * MB,
            estimated_time: Duration::from_secs(config.estimated_time_secs),
            priority: config.priority,
        }
    }

    /// Worker limit as enforced by the scheduler. A configured 0 means 1.
    pub fn concurrency_limit(&self) -> usize {
        self.max_workers.max(1)
    }
}

/// Discovered tests grouped by group name.
///
/// Owned by the orchestrator; read-only once handed to the scheduler.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TestCatalog {
    pub groups: BTreeMap<String, TestGroup>,
    pub tests: BTreeMap<String, Vec<TestCase>>,
}

impl TestCatalog {
    /// Creates an empty catalog with the given group definitions.
    pub fn new(groups: impl IntoIterator<Item = TestGroup>) -> Self {
        Self {
            groups: groups.into_iter().map(|g| (g.name.clone(), g)).collect(),
            tests: BTreeMap::new(),
        }
    }

    /// Creates an empty catalog from the `[groups]` configuration table.
    pub fn from_config(groups: &BTreeMap<String, GroupConfig>) -> Self {
        Self::new(
            groups
                .iter()
                .map(|(name, config)| TestGroup::from_config(name, config)),
        )
    }

    /// Adds a test under its group.
    pub fn add(&mut self, test: TestCase) {
        self.tests.entry(test.group.clone()).or_default().push(test);
    }

    /// Looks up a group definition.
    pub fn group(&self, name: &str) -> Option<&TestGroup> {
        self.groups.get(name)
    }

    /// All tests, group by group.
    pub fn iter(&self) -> impl Iterator<Item = &TestCase> {
        self.tests.values().flatten()
    }

    /// Total number of tests.
    pub fn len(&self) -> usize {
        self.tests.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sum of all estimated durations.
    pub fn total_estimated(&self) -> Duration {
        self.iter().map(|t| t.estimated_duration).sum()
    }
}

/// Finds test files and classifies them into groups.
pub struct TestDiscoverer {
    root: PathBuf,
    patterns: Vec<Pattern>,
    group_patterns: Vec<(String, Vec<Pattern>)>,
    default_group: String,
    catalog: TestCatalog,
    history: DurationHistory,
}

impl TestDiscoverer {
    /// Creates a discoverer from configuration.
    ///
    /// Compiles every pattern and loads the duration history when one is
    /// configured.
    ///
    /// # Errors
    ///
    /// [`DiscoveryError::InvalidPattern`] for malformed globs,
    /// [`DiscoveryError::UnknownGroup`] when the default group is not
    /// configured.
    pub fn new(
        config: &DiscoveryConfig,
        groups: &BTreeMap<String, GroupConfig>,
    ) -> DiscoveryResult<Self> {
        if !groups.contains_key(&config.default_group) {
            return Err(DiscoveryError::UnknownGroup(config.default_group.clone()));
        }

        let group_patterns = groups
            .iter()
            .map(|(name, group)| Ok((name.clone(), Pattern::compile_all(&group.patterns)?)))
            .collect::<DiscoveryResult<Vec<_>>>()?;

        let history = match &config.history_file {
            Some(path) => DurationHistory::load(path)?,
            None => DurationHistory::new(),
        };

        Ok(Self {
            root: config.root.clone(),
            patterns: Pattern::compile_all(&config.patterns)?,
            group_patterns,
            default_group: config.default_group.clone(),
            catalog: TestCatalog::from_config(groups),
            history,
        })
    }

    /// Replaces the loaded duration history.
    pub fn with_history(mut self, history: DurationHistory) -> Self {
        self.history = history;
        self
    }

    /// The directory searched for tests.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Walks the root and builds the catalog.
    ///
    /// Hidden directories and `node_modules` are skipped. Files are visited
    /// in name order, so the catalog is deterministic.
    ///
    /// # Errors
    ///
    /// [`DiscoveryError::RootUnreadable`] if the root cannot be listed.
    pub fn discover(&self) -> DiscoveryResult<TestCatalog> {
        std::fs::read_dir(&self.root).map_err(|source| DiscoveryError::RootUnreadable {
            path: self.root.clone(),
            source,
        })?;

        let mut catalog = self.catalog.clone();
        let walker = WalkDir::new(&self.root)
            .follow_links(true)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !is_ignored_dir(e));

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Skipping unreadable entry during discovery: {}", e);
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }

            let Ok(relative) = entry.path().strip_prefix(&self.root) else {
                continue;
            };
            let id = to_slash(relative);
            if !self.patterns.iter().any(|p| p.matches(&id)) {
                continue;
            }

            let group = self.classify(&id);
            let estimated = self
                .history
                .get(&id)
                .or_else(|| catalog.group(group).map(|g| g.estimated_time))
                .unwrap_or_default();

            debug!("Discovered {} in group {} (~{:?})", id, group, estimated);
            catalog.add(TestCase::new(id, group, estimated).with_path(entry.path()));
        }

        info!(
            "Discovered {} tests in {} groups under {}",
            catalog.len(),
            catalog.tests.len(),
            self.root.display()
        );
        Ok(catalog)
    }

    /// First group (in name order) whose patterns match, else the default.
    fn classify(&self, id: &str) -> &str {
        self.group_patterns
            .iter()
            .find(|(_, patterns)| patterns.iter().any(|p| p.matches(id)))
            .map(|(name, _)| name.as_str())
            .unwrap_or(&self.default_group)
    }
}

fn is_ignored_dir(entry: &walkdir::DirEntry) -> bool {
    entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with('.') || name == "node_modules")
}

fn to_slash(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_groups;

    fn touch(root: &Path, rel: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, "").unwrap();
    }

    fn discovery_config(root: &Path) -> DiscoveryConfig {
        DiscoveryConfig {
            root: root.to_path_buf(),
            history_file: None,
            ..DiscoveryConfig::default()
        }
    }

    #[test]
    fn test_discover_classifies_by_group_patterns() {
        let dir = tempfile::TempDir::new().unwrap();
        touch(dir.path(), "smoke/health.spec.js");
        touch(dir.path(), "fast/button.test.ts");
        touch(dir.path(), "wizard/steps.spec.js");
        touch(dir.path(), "reports/export.slow.spec.js");
        touch(dir.path(), "helpers/util.js");

        let discoverer =
            TestDiscoverer::new(&discovery_config(dir.path()), &default_groups()).unwrap();
        let catalog = discoverer.discover().unwrap();

        assert_eq!(catalog.len(), 4);
        assert_eq!(catalog.tests["smoke"][0].id, "smoke/health.spec.js");
        assert_eq!(catalog.tests["fast"][0].id, "fast/button.test.ts");
        assert_eq!(catalog.tests["medium"][0].id, "wizard/steps.spec.js");
        assert_eq!(catalog.tests["slow"][0].id, "reports/export.slow.spec.js");
        assert_eq!(
            catalog.tests["slow"][0].estimated_duration,
            Duration::from_secs(180)
        );
        assert_eq!(
            catalog.tests["medium"][0].path,
            dir.path().join("wizard/steps.spec.js")
        );
    }

    #[test]
    fn test_discover_uses_history() {
        let dir = tempfile::TempDir::new().unwrap();
        touch(dir.path(), "a.spec.js");
        touch(dir.path(), "b.spec.js");

        let mut history = DurationHistory::new();
        history.record("a.spec.js", Duration::from_secs(7));

        let catalog = TestDiscoverer::new(&discovery_config(dir.path()), &default_groups())
            .unwrap()
            .with_history(history)
            .discover()
            .unwrap();

        let medium = &catalog.tests["medium"];
        assert_eq!(medium[0].estimated_duration, Duration::from_secs(7));
        assert_eq!(medium[1].estimated_duration, Duration::from_secs(60));
    }

    #[test]
    fn test_discover_skips_node_modules_and_hidden() {
        let dir = tempfile::TempDir::new().unwrap();
        touch(dir.path(), "node_modules/pkg/x.spec.js");
        touch(dir.path(), ".cache/y.spec.js");
        touch(dir.path(), "real.spec.js");

        let catalog = TestDiscoverer::new(&discovery_config(dir.path()), &default_groups())
            .unwrap()
            .discover()
            .unwrap();
        assert_eq!(catalog.len(), 1);
    }

    #[test]
    fn test_empty_root_is_not_an_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let catalog = TestDiscoverer::new(&discovery_config(dir.path()), &default_groups())
            .unwrap()
            .discover()
            .unwrap();
        assert!(catalog.is_empty());
        assert_eq!(catalog.groups.len(), 4);
    }

    #[test]
    fn test_missing_root_is_unreadable() {
        let dir = tempfile::TempDir::new().unwrap();
        let discoverer =
            TestDiscoverer::new(&discovery_config(&dir.path().join("nope")), &default_groups())
                .unwrap();
        assert!(matches!(
            discoverer.discover(),
            Err(DiscoveryError::RootUnreadable { .. })
        ));
    }

    #[test]
    fn test_unknown_default_group() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = DiscoveryConfig {
            default_group: "nightly".to_string(),
            ..discovery_config(dir.path())
        };
        assert!(matches!(
            TestDiscoverer::new(&config, &default_groups()),
            Err(DiscoveryError::UnknownGroup(name)) if name == "nightly"
        ));
    }

    #[test]
    fn test_priority_order() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Medium);
        assert!(Priority::Medium > Priority::Low);
        assert_eq!(Priority::default(), Priority::Medium);
    }
}
