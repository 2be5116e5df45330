//! Raw system readings.
//!
//! [`SystemProbe`] is the seam between resource policy and the operating
//! system. [`ProcProbe`] reads Linux `/proc` files and `statvfs(3)`.

use std::path::{Path, PathBuf};

use super::{ResourceError, ResourceResult};

/// Unjudged system readings. Byte counts throughout.
#[derive(Debug, Clone, PartialEq)]
pub struct RawUsage {
    pub memory_total: u64,
    /// Memory available to new processes without swapping.
    pub memory_available: u64,
    pub cpu_cores: usize,
    /// One-minute load average.
    pub load_average: f64,
    pub disk_total: u64,
    pub disk_used: u64,
    /// Space available to unprivileged users.
    pub disk_available: u64,
}

/// Source of raw system readings.
pub trait SystemProbe: Send + Sync {
    /// Takes one synchronous reading.
    fn sample(&self) -> ResourceResult<RawUsage>;
}

/// Probe backed by `/proc/meminfo`, `/proc/loadavg` and `statvfs` on the
/// configured disk path.
pub struct ProcProbe {
    disk_path: PathBuf,
}

impl ProcProbe {
    /// Creates a probe that reports disk usage for the filesystem holding
    /// `disk_path`.
    pub fn new(disk_path: impl Into<PathBuf>) -> Self {
        Self {
            disk_path: disk_path.into(),
        }
    }

    fn memory(&self) -> ResourceResult<(u64, u64)> {
        let content = std::fs::read_to_string("/proc/meminfo").map_err(|e| {
            ResourceError::Unavailable(format!("cannot read /proc/meminfo: {}", e))
        })?;
        parse_meminfo(&content)
            .ok_or_else(|| ResourceError::Unavailable("malformed /proc/meminfo".to_string()))
    }

    fn load_average(&self) -> ResourceResult<f64> {
        let content = std::fs::read_to_string("/proc/loadavg").map_err(|e| {
            ResourceError::Unavailable(format!("cannot read /proc/loadavg: {}", e))
        })?;
        parse_loadavg(&content)
            .ok_or_else(|| ResourceError::Unavailable("malformed /proc/loadavg".to_string()))
    }

    fn disk(&self) -> ResourceResult<(u64, u64, u64)> {
        disk_usage(existing_ancestor(&self.disk_path))
    }
}

impl SystemProbe for ProcProbe {
    fn sample(&self) -> ResourceResult<RawUsage> {
        let (memory_total, memory_available) = self.memory()?;
        let load_average = self.load_average()?;
        let (disk_total, disk_used, disk_available) = self.disk()?;
        let cpu_cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        Ok(RawUsage {
            memory_total,
            memory_available,
            cpu_cores,
            load_average,
            disk_total,
            disk_used,
            disk_available,
        })
    }
}

/// Returns `(total, used, available)` bytes for the filesystem at `path`.
fn disk_usage(path: &Path) -> ResourceResult<(u64, u64, u64)> {
    let stat = nix::sys::statvfs::statvfs(path)
        .map_err(|e| ResourceError::Io(std::io::Error::from(e)))?;
    let fragment = stat.fragment_size() as u64;
    let total = stat.blocks() as u64 * fragment;
    let free = stat.blocks_free() as u64 * fragment;
    let available = stat.blocks_available() as u64 * fragment;
    Ok((total, total.saturating_sub(free), available))
}

/// The output directory may not exist yet; walk up to something that does.
fn existing_ancestor(path: &Path) -> &Path {
    path.ancestors()
        .find(|p| !p.as_os_str().is_empty() && p.exists())
        .unwrap_or_else(|| Path::new("."))
}

/// Parses `(MemTotal, MemAvailable)` in bytes.
fn parse_meminfo(content: &str) -> Option<(u64, u64)> {
    let mut total = None;
    let mut available = None;
    let mut free = None;

    for line in content.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            total = parse_kb(rest);
        } else if let Some(rest) = line.strip_prefix("MemAvailable:") {
            available = parse_kb(rest);
        } else if let Some(rest) = line.strip_prefix("MemFree:") {
            free = parse_kb(rest);
        }
    }

    // Kernels before 3.14 lack MemAvailable.
    let total = total?;
    Some((total, available.or(free)?))
}

fn parse_kb(rest: &str) -> Option<u64> {
    rest.split_whitespace()
        .next()
        .and_then(|s| s.parse::<u64>().ok())
        .map(|kb| kb * 1024)
}

fn parse_loadavg(content: &str) -> Option<f64> {
    content.split_whitespace().next()?.parse().ok()
}

#[cfg(test)]
pub(crate) use fixed::{FixedProbe, usage_with_memory_percent};

#[cfg(test)]
mod fixed {
    use std::sync::Mutex;

    use super::*;

    /// Probe returning a reading that tests can change mid-run.
    pub(crate) struct FixedProbe {
        usage: Mutex<RawUsage>,
    }

    impl FixedProbe {
        pub(crate) fn new(usage: RawUsage) -> Self {
            Self {
                usage: Mutex::new(usage),
            }
        }

        /// Reading with the given memory percentage and otherwise idle,
        /// roomy machine: 4 cores, 4 GB RAM, 10 GB free disk.
        pub(crate) fn with_memory_percent(percent: u64) -> Self {
            Self::new(usage_with_memory_percent(percent))
        }

        pub(crate) fn set(&self, usage: RawUsage) {
            *self.usage.lock().unwrap() = usage;
        }
    }

    pub(crate) fn usage_with_memory_percent(percent: u64) -> RawUsage {
        const MB: u64 = 1024 * 1024;
        let total = 4096 * MB;
        RawUsage {
            memory_total: total,
            memory_available: total / 100 * (100 - percent),
            cpu_cores: 4,
            load_average: 0.5,
            disk_total: 20_000 * MB,
            disk_used: 10_000 * MB,
            disk_available: 10_000 * MB,
        }
    }

    impl SystemProbe for FixedProbe {
        fn sample(&self) -> ResourceResult<RawUsage> {
            Ok(self.usage.lock().unwrap().clone())
        }
    }
}
