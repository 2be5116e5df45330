//! System resource sampling and admission control.
//!
//! A [`ResourceSnapshot`] is one immutable reading of memory, CPU and disk
//! usage, with each reading judged against [`ResourceThresholds`]. The
//! [`monitor::ResourceMonitor`] takes snapshots periodically while workers
//! run and publishes warnings and emergencies; the orchestrator uses a single
//! snapshot before spawning anything to decide whether a run may start and
//! how many workers it can afford.
//!
//! # Thresholds
//!
//! | Resource | Unsafe when | Emergency when |
//! |----------|-------------|----------------|
//! | Memory | usage >= `memory_limit_percent` (85) | usage > `memory_emergency_percent` (90) |
//! | CPU | load >= `cpu_threshold_percent` (90) | load > `cpu_emergency_percent` (95) |
//! | Disk | available <= `disk_buffer` (100 MB) | available < `disk_buffer / 2` |

pub mod monitor;
pub mod probe;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{MB, ResourceConfig};

pub use monitor::{EmergencyAlert, EmergencyKind, ResourceEvent, ResourceMonitor};
pub use probe::{ProcProbe, RawUsage, SystemProbe};

/// Result type for resource operations.
pub type ResourceResult<T> = Result<T, ResourceError>;

/// Errors that can occur while sampling system resources.
#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
    /// The platform does not expose the requested reading.
    #[error("Resource information unavailable: {0}")]
    Unavailable(String),

    /// I/O error reading system information.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Limits that resource readings are judged against.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceThresholds {
    /// Memory percentage at or above which a sample is unsafe.
    pub memory_limit_percent: f64,
    /// Memory percentage above which an emergency is raised.
    pub memory_emergency_percent: f64,
    /// CPU percentage at or above which a sample is unsafe.
    pub cpu_threshold_percent: f64,
    /// CPU percentage above which an emergency is raised.
    pub cpu_emergency_percent: f64,
    /// Minimum available disk space in bytes.
    pub disk_buffer_bytes: u64,
    /// Memory assumed per worker when sizing the pool.
    pub memory_per_worker_bytes: u64,
    /// Hard cap on auto-detected workers.
    pub max_workers: usize,
    /// Rolling history length.
    pub history_capacity: usize,
}

impl Default for ResourceThresholds {
    fn default() -> Self {
        Self::from_config(&ResourceConfig::default())
    }
}

impl ResourceThresholds {
    /// Builds thresholds from the `[resources]` configuration section.
    pub fn from_config(config: &ResourceConfig) -> Self {
        Self {
            memory_limit_percent: config.memory_limit_percent,
            memory_emergency_percent: config.memory_emergency_percent,
            cpu_threshold_percent: config.cpu_threshold_percent,
            cpu_emergency_percent: config.cpu_emergency_percent,
            disk_buffer_bytes: config.disk_buffer_mb * MB,
            memory_per_worker_bytes: config.memory_per_worker_mb * MB,
            max_workers: config.max_workers,
            history_capacity: config.history_capacity.max(1),
        }
    }
}

/// Memory reading. Byte counts; `free` is memory available to new processes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryUsage {
    pub total: u64,
    pub used: u64,
    pub free: u64,
    pub percentage: f64,
    pub safe: bool,
}

/// CPU reading derived from the one-minute load average.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CpuUsage {
    pub cores: usize,
    pub load_average: f64,
    pub percentage: f64,
    pub safe: bool,
}

/// Disk reading for the filesystem holding the artifacts. Byte counts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskUsage {
    pub total: u64,
    pub used: u64,
    pub available: u64,
    pub safe: bool,
}

/// One immutable resource reading.
///
/// `safe` is the conjunction of the memory, CPU and disk checks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSnapshot {
    pub timestamp: DateTime<Utc>,
    pub memory: MemoryUsage,
    pub cpu: CpuUsage,
    pub disk: DiskUsage,
    pub safe: bool,
}

impl ResourceSnapshot {
    /// Judges a raw probe reading against `thresholds`.
    ///
    /// # Example
    ///
    /// ```
    /// use shardrun::resource::{RawUsage, ResourceSnapshot, ResourceThresholds};
    ///
    /// const MB: u64 = 1024 * 1024;
    /// let raw = RawUsage {
    ///     memory_total: 1000 * MB,
    ///     memory_available: 500 * MB,
    ///     cpu_cores: 4,
    ///     load_average: 1.0,
    ///     disk_total: 10_000 * MB,
    ///     disk_used: 1_000 * MB,
    ///     disk_available: 9_000 * MB,
    /// };
    /// let snapshot = ResourceSnapshot::evaluate(&raw, &ResourceThresholds::default());
    /// assert!(snapshot.safe);
    /// assert_eq!(snapshot.memory.percentage, 50.0);
    /// assert_eq!(snapshot.cpu.percentage, 25.0);
    /// ```
    pub fn evaluate(raw: &RawUsage, thresholds: &ResourceThresholds) -> Self {
        Self::evaluate_at(raw, thresholds, Utc::now())
    }

    /// Like [`evaluate`](Self::evaluate) with an explicit timestamp.
    pub fn evaluate_at(
        raw: &RawUsage,
        thresholds: &ResourceThresholds,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let free = raw.memory_available.min(raw.memory_total);
        let used = raw.memory_total - free;
        let mem_percentage = percent(used, raw.memory_total);
        let memory = MemoryUsage {
            total: raw.memory_total,
            used,
            free,
            percentage: mem_percentage,
            safe: mem_percentage < thresholds.memory_limit_percent,
        };

        let cores = raw.cpu_cores.max(1);
        let cpu_percentage = raw.load_average / cores as f64 * 100.0;
        let cpu = CpuUsage {
            cores,
            load_average: raw.load_average,
            percentage: cpu_percentage,
            safe: cpu_percentage < thresholds.cpu_threshold_percent,
        };

        let disk = DiskUsage {
            total: raw.disk_total,
            used: raw.disk_used,
            available: raw.disk_available,
            safe: raw.disk_available > thresholds.disk_buffer_bytes,
        };

        let safe = memory.safe && cpu.safe && disk.safe;
        Self {
            timestamp,
            memory,
            cpu,
            disk,
            safe,
        }
    }

    /// Lists the checks that failed, for diagnostics.
    pub fn unsafe_reasons(&self, thresholds: &ResourceThresholds) -> Vec<String> {
        let mut reasons = Vec::new();
        if !self.memory.safe {
            reasons.push(format!(
                "memory usage {:.1}% exceeds limit {:.1}%",
                self.memory.percentage, thresholds.memory_limit_percent
            ));
        }
        if !self.cpu.safe {
            reasons.push(format!(
                "CPU usage {:.1}% exceeds threshold {:.1}%",
                self.cpu.percentage, thresholds.cpu_threshold_percent
            ));
        }
        if !self.disk.safe {
            reasons.push(format!(
                "available disk {} MB is below buffer {} MB",
                self.disk.available / MB,
                thresholds.disk_buffer_bytes / MB
            ));
        }
        reasons
    }
}

fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    part as f64 / whole as f64 * 100.0
}

/// Computes the number of workers the machine can afford.
///
/// `min(max(2, cores - 1), free / per_worker, hard_cap)`, never below 1.
///
/// # Example
///
/// ```
/// use shardrun::resource::optimal_workers;
///
/// const MB: u64 = 1024 * 1024;
/// assert_eq!(optimal_workers(4, 2048 * MB, 400 * MB, 8), 3);
/// assert_eq!(optimal_workers(16, 100 * MB, 400 * MB, 8), 1);
/// ```
pub fn optimal_workers(
    cores: usize,
    free_memory: u64,
    memory_per_worker: u64,
    hard_cap: usize,
) -> usize {
    let cpu_workers = cores.saturating_sub(1).max(2);
    let memory_workers = if memory_per_worker == 0 {
        usize::MAX
    } else {
        usize::try_from(free_memory / memory_per_worker).unwrap_or(usize::MAX)
    };
    cpu_workers.min(memory_workers).min(hard_cap).max(1)
}

/// Latest reading plus rolling statistics over the monitor history.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSummary {
    pub latest: Option<ResourceSnapshot>,
    pub samples: usize,
    pub average_memory_percentage: f64,
    pub average_cpu_percentage: f64,
    pub peak_memory_percentage: f64,
    pub peak_cpu_percentage: f64,
    pub unsafe_samples: usize,
}

impl ResourceSummary {
    /// Summarizes snapshots ordered oldest first.
    pub fn from_history(history: &[ResourceSnapshot]) -> Self {
        if history.is_empty() {
            return Self::default();
        }
        let n = history.len() as f64;
        Self {
            latest: history.last().cloned(),
            samples: history.len(),
            average_memory_percentage: history.iter().map(|s| s.memory.percentage).sum::<f64>()
                / n,
            average_cpu_percentage: history.iter().map(|s| s.cpu.percentage).sum::<f64>() / n,
            peak_memory_percentage: history
                .iter()
                .map(|s| s.memory.percentage)
                .fold(0.0, f64::max),
            peak_cpu_percentage: history
                .iter()
                .map(|s| s.cpu.percentage)
                .fold(0.0, f64::max),
            unsafe_samples: history.iter().filter(|s| !s.safe).count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(mem_percent: u64, load: f64, disk_available_mb: u64) -> RawUsage {
        RawUsage {
            memory_total: 100 * MB,
            memory_available: (100 - mem_percent) * MB,
            cpu_cores: 4,
            load_average: load,
            disk_total: 10_000 * MB,
            disk_used: 10_000 * MB - disk_available_mb * MB,
            disk_available: disk_available_mb * MB,
        }
    }

    #[test]
    fn test_optimal_workers_formula() {
        assert_eq!(optimal_workers(4, 2048 * MB, 400 * MB, 8), 3);
    }

    #[test]
    fn test_optimal_workers_bounds() {
        // cpu floor of 2 applies on a single core
        assert_eq!(optimal_workers(1, 10_000 * MB, 400 * MB, 8), 2);
        // hard cap
        assert_eq!(optimal_workers(32, 100_000 * MB, 400 * MB, 8), 8);
        // never zero
        assert_eq!(optimal_workers(8, 0, 400 * MB, 8), 1);
        assert_eq!(optimal_workers(8, 10_000 * MB, 400 * MB, 0), 1);
    }

    #[test]
    fn test_snapshot_safe() {
        let snap = ResourceSnapshot::evaluate(&raw(50, 1.0, 5000), &ResourceThresholds::default());
        assert!(snap.memory.safe);
        assert!(snap.cpu.safe);
        assert!(snap.disk.safe);
        assert!(snap.safe);
        assert_eq!(snap.memory.used, 50 * MB);
        assert_eq!(snap.memory.free, 50 * MB);
    }

    #[test]
    fn test_snapshot_memory_unsafe() {
        let thresholds = ResourceThresholds::default();
        let snap = ResourceSnapshot::evaluate(&raw(86, 1.0, 5000), &thresholds);
        assert!(!snap.memory.safe);
        assert!(!snap.safe);
        let reasons = snap.unsafe_reasons(&thresholds);
        assert_eq!(reasons.len(), 1);
        assert!(reasons[0].contains("memory"));
    }

    #[test]
    fn test_snapshot_cpu_and_disk_unsafe() {
        let snap = ResourceSnapshot::evaluate(&raw(10, 3.8, 50), &ResourceThresholds::default());
        assert!(snap.memory.safe);
        assert!(!snap.cpu.safe);
        assert!(!snap.disk.safe);
        assert!(!snap.safe);
    }

    #[test]
    fn test_summary_from_history() {
        let thresholds = ResourceThresholds::default();
        let history = vec![
            ResourceSnapshot::evaluate(&raw(40, 1.0, 5000), &thresholds),
            ResourceSnapshot::evaluate(&raw(60, 2.0, 5000), &thresholds),
        ];
        let summary = ResourceSummary::from_history(&history);
        assert_eq!(summary.samples, 2);
        assert!((summary.average_memory_percentage - 50.0).abs() < 1e-9);
        assert!((summary.average_cpu_percentage - 37.5).abs() < 1e-9);
        assert!((summary.peak_memory_percentage - 60.0).abs() < 1e-9);
        assert_eq!(summary.latest, history.last().cloned());
        assert_eq!(ResourceSummary::from_history(&[]).samples, 0);
    }
}
