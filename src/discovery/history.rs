//! Observed test durations, persisted between runs.
//!
//! The history is a flat JSON object mapping test ids to seconds:
//!
//! ```json
//! { "auth/login.spec.js": 12.4, "slow/export.spec.js": 171.0 }
//! ```
//!
//! Workers report one wall time for their whole assignment, so the time is
//! split across the assignment's tests in proportion to their estimates.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{DiscoveryResult, TestCase};

/// Per-test duration history keyed by test id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DurationHistory {
    entries: BTreeMap<String, f64>,
}

impl DurationHistory {
    /// Creates an empty history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a history file. A missing file yields an empty history; a file
    /// that is not a valid history is ignored with a warning.
    pub fn load(path: &Path) -> DiscoveryResult<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No duration history at {}", path.display());
                return Ok(Self::new());
            }
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_str(&content) {
            Ok(history) => Ok(history),
            Err(e) => {
                warn!(
                    "Ignoring malformed duration history {}: {}",
                    path.display(),
                    e
                );
                Ok(Self::new())
            }
        }
    }

    /// Writes the history as pretty-printed JSON, creating parent directories.
    pub fn save(&self, path: &Path) -> DiscoveryResult<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Recorded duration for a test, if a usable one exists.
    pub fn get(&self, id: &str) -> Option<Duration> {
        self.entries
            .get(id)
            .filter(|secs| **secs > 0.0)
            .and_then(|secs| Duration::try_from_secs_f64(*secs).ok())
    }

    /// Records an observed duration, replacing any previous value.
    pub fn record(&mut self, id: impl Into<String>, duration: Duration) {
        self.entries.insert(id.into(), duration.as_secs_f64());
    }

    /// Splits a worker's wall time across its tests in proportion to their
    /// estimates (evenly when every estimate is zero).
    pub fn record_assignment(&mut self, tests: &[TestCase], wall_time: Duration) {
        if tests.is_empty() {
            return;
        }
        let total: f64 = tests.iter().map(|t| t.estimated_duration.as_secs_f64()).sum();
        let wall = wall_time.as_secs_f64();

        for test in tests {
            let share = if total > 0.0 {
                test.estimated_duration.as_secs_f64() / total
            } else {
                1.0 / tests.len() as f64
            };
            self.entries.insert(test.id.clone(), wall * share);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_missing_is_empty() {
        let dir = tempfile::TempDir::new().unwrap();
        let history = DurationHistory::load(&dir.path().join("timings.json")).unwrap();
        assert!(history.is_empty());
    }

    #[test]
    fn test_load_malformed_is_empty() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("timings.json");
        std::fs::write(&path, "[1, 2, 3]").unwrap();
        assert!(DurationHistory::load(&path).unwrap().is_empty());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested/timings.json");

        let mut history = DurationHistory::new();
        history.record("a.spec.js", Duration::from_secs(12));
        history.save(&path).unwrap();

        let loaded = DurationHistory::load(&path).unwrap();
        assert_eq!(loaded.get("a.spec.js"), Some(Duration::from_secs(12)));
        assert_eq!(loaded.get("b.spec.js"), None);
    }

    #[test]
    fn test_non_positive_entries_ignored() {
        let history: DurationHistory = serde_json::from_str(r#"{"a": 0.0, "b": -3.0}"#).unwrap();
        assert_eq!(history.get("a"), None);
        assert_eq!(history.get("b"), None);
    }

    #[test]
    fn test_oversized_entries_ignored() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("timings.json");
        std::fs::write(&path, r#"{"a.spec.js": 1e30, "b.spec.js": 4.5}"#).unwrap();

        let history = DurationHistory::load(&path).unwrap();
        assert_eq!(history.get("a.spec.js"), None);
        assert_eq!(history.get("b.spec.js"), Some(Duration::from_millis(4500)));
    }

    #[test]
    fn test_record_assignment_is_proportional() {
        let tests = vec![
            TestCase::new("a", "medium", Duration::from_secs(30)),
            TestCase::new("b", "medium", Duration::from_secs(10)),
        ];
        let mut history = DurationHistory::new();
        history.record_assignment(&tests, Duration::from_secs(80));

        assert_eq!(history.get("a"), Some(Duration::from_secs(60)));
        assert_eq!(history.get("b"), Some(Duration::from_secs(20)));
    }
}
