//! Periodic resource monitoring with published warning and emergency events.
//!
//! The [`ResourceMonitor`] is an explicitly owned instance with a
//! `start_monitoring` / `stop_monitoring` lifecycle. Each tick samples the
//! system, appends the snapshot to a bounded history and publishes
//! [`ResourceEvent`]s on a broadcast channel. The monitor only reports; the
//! subscriber (the orchestrator) decides what an emergency means for the run.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::{
    ProcProbe, ResourceResult, ResourceSnapshot, ResourceSummary, ResourceThresholds,
    SystemProbe, optimal_workers,
};
use crate::config::{MB, ResourceConfig};

/// Capacity of the event channel. Slow subscribers lose the oldest events.
const EVENT_CAPACITY: usize = 64;

/// Which resource crossed its emergency threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmergencyKind {
    Memory,
    Cpu,
    Disk,
}

impl std::fmt::Display for EmergencyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EmergencyKind::Memory => write!(f, "memory"),
            EmergencyKind::Cpu => write!(f, "cpu"),
            EmergencyKind::Disk => write!(f, "disk"),
        }
    }
}

/// Payload of an emergency event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmergencyAlert {
    #[serde(rename = "type")]
    pub kind: EmergencyKind,
    pub message: String,
    #[serde(rename = "data")]
    pub snapshot: ResourceSnapshot,
}

/// Events published by the monitor on every tick that finds a problem.
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceEvent {
    MemoryWarning(ResourceSnapshot),
    CpuWarning(ResourceSnapshot),
    DiskWarning(ResourceSnapshot),
    Emergency(EmergencyAlert),
}

/// Derives the events a snapshot warrants.
///
/// Warnings mirror the snapshot's `safe` flags. Emergencies use the stricter
/// thresholds: memory above `memory_emergency_percent`, CPU above
/// `cpu_emergency_percent`, available disk below half the buffer.
pub fn events_for(snapshot: &ResourceSnapshot, thresholds: &ResourceThresholds) -> Vec<ResourceEvent> {
    let mut events = Vec::new();

    if !snapshot.memory.safe {
        events.push(ResourceEvent::MemoryWarning(snapshot.clone()));
    }
    if !snapshot.cpu.safe {
        events.push(ResourceEvent::CpuWarning(snapshot.clone()));
    }
    if !snapshot.disk.safe {
        events.push(ResourceEvent::DiskWarning(snapshot.clone()));
    }

    if snapshot.memory.percentage > thresholds.memory_emergency_percent {
        events.push(ResourceEvent::Emergency(EmergencyAlert {
            kind: EmergencyKind::Memory,
            message: format!(
                "memory usage {:.1}% above emergency threshold {:.1}%",
                snapshot.memory.percentage, thresholds.memory_emergency_percent
            ),
            snapshot: snapshot.clone(),
        }));
    }
    if snapshot.cpu.percentage > thresholds.cpu_emergency_percent {
        events.push(ResourceEvent::Emergency(EmergencyAlert {
            kind: EmergencyKind::Cpu,
            message: format!(
                "CPU usage {:.1}% above emergency threshold {:.1}%",
                snapshot.cpu.percentage, thresholds.cpu_emergency_percent
            ),
            snapshot: snapshot.clone(),
        }));
    }
    if snapshot.disk.available < thresholds.disk_buffer_bytes / 2 {
        events.push(ResourceEvent::Emergency(EmergencyAlert {
            kind: EmergencyKind::Disk,
            message: format!(
                "available disk {} MB below half the {} MB buffer",
                snapshot.disk.available / MB,
                thresholds.disk_buffer_bytes / MB
            ),
            snapshot: snapshot.clone(),
        }));
    }

    events
}

struct MonitorShared {
    probe: Arc<dyn SystemProbe>,
    thresholds: ResourceThresholds,
    history: Mutex<VecDeque<ResourceSnapshot>>,
    events: broadcast::Sender<ResourceEvent>,
}

impl MonitorShared {
    fn check(&self) -> ResourceResult<ResourceSnapshot> {
        let raw = self.probe.sample()?;
        Ok(ResourceSnapshot::evaluate(&raw, &self.thresholds))
    }

    fn record(&self, snapshot: ResourceSnapshot) {
        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        while history.len() >= self.thresholds.history_capacity {
            history.pop_front();
        }
        history.push_back(snapshot);
    }

    fn tick(&self) -> ResourceResult<ResourceSnapshot> {
        let snapshot = self.check()?;
        self.record(snapshot.clone());

        for event in events_for(&snapshot, &self.thresholds) {
            match &event {
                ResourceEvent::MemoryWarning(s) => {
                    warn!("Memory usage high: {:.1}%", s.memory.percentage)
                }
                ResourceEvent::CpuWarning(s) => warn!("CPU usage high: {:.1}%", s.cpu.percentage),
                ResourceEvent::DiskWarning(s) => {
                    warn!("Disk space low: {} MB available", s.disk.available / MB)
                }
                ResourceEvent::Emergency(alert) => {
                    error!("Resource emergency ({}): {}", alert.kind, alert.message)
                }
            }
            // No subscribers is fine; the history still records the sample.
            let _ = self.events.send(event);
        }

        Ok(snapshot)
    }
}

/// Samples system resources and publishes pressure signals.
///
/// # Example
///
/// ```no_run
/// use std::time::Duration;
/// use shardrun::config::ResourceConfig;
/// use shardrun::resource::{ResourceEvent, ResourceMonitor};
///
/// # async fn example() -> anyhow::Result<()> {
/// let monitor = ResourceMonitor::system(&ResourceConfig::default());
/// let mut events = monitor.subscribe();
/// monitor.start_monitoring(Duration::from_secs(2));
///
/// if let Ok(ResourceEvent::Emergency(alert)) = events.recv().await {
///     eprintln!("emergency: {}", alert.message);
/// }
/// monitor.stop_monitoring();
/// # Ok(())
/// # }
/// ```
pub struct ResourceMonitor {
    shared: Arc<MonitorShared>,
    task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl ResourceMonitor {
    /// Creates a monitor that judges readings from `probe`.
    pub fn new(thresholds: ResourceThresholds, probe: Arc<dyn SystemProbe>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let capacity = thresholds.history_capacity;
        Self {
            shared: Arc::new(MonitorShared {
                probe,
                thresholds,
                history: Mutex::new(VecDeque::with_capacity(capacity)),
                events,
            }),
            task: Mutex::new(None),
        }
    }

    /// Creates a monitor over the real system, configured from `[resources]`.
    pub fn system(config: &ResourceConfig) -> Self {
        Self::new(
            ResourceThresholds::from_config(config),
            Arc::new(ProcProbe::new(&config.disk_path)),
        )
    }

    /// The thresholds this monitor judges against.
    pub fn thresholds(&self) -> &ResourceThresholds {
        &self.shared.thresholds
    }

    /// Takes one synchronous sample. Does not touch the history.
    pub fn check_resources(&self) -> ResourceResult<ResourceSnapshot> {
        self.shared.check()
    }

    /// Appends a snapshot to the rolling history, evicting the oldest entry
    /// once the capacity is reached.
    pub fn record(&self, snapshot: ResourceSnapshot) {
        self.shared.record(snapshot);
    }

    /// Performs one monitoring tick: sample, record, publish.
    pub fn tick(&self) -> ResourceResult<ResourceSnapshot> {
        self.shared.tick()
    }

    /// Workers affordable on the machine right now.
    pub fn calculate_optimal_workers(&self) -> ResourceResult<usize> {
        let snapshot = self.check_resources()?;
        Ok(self.optimal_workers_for(&snapshot))
    }

    /// Workers affordable given an existing snapshot.
    pub fn optimal_workers_for(&self, snapshot: &ResourceSnapshot) -> usize {
        optimal_workers(
            snapshot.cpu.cores,
            snapshot.memory.free,
            self.shared.thresholds.memory_per_worker_bytes,
            self.shared.thresholds.max_workers,
        )
    }

    /// Subscribes to warning and emergency events.
    pub fn subscribe(&self) -> broadcast::Receiver<ResourceEvent> {
        self.shared.events.subscribe()
    }

    /// Starts the background sampling loop. The first sample is taken
    /// immediately. Calling this while already monitoring does nothing.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start_monitoring(&self, interval: Duration) {
        let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if task.is_some() {
            debug!("Resource monitoring already running");
            return;
        }

        let token = CancellationToken::new();
        let shared = self.shared.clone();
        let cancelled = token.clone();
        let period = interval.max(Duration::from_millis(10));

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = shared.tick() {
                            warn!("Resource sample failed: {}", e);
                        }
                    }
                }
            }
            debug!("Resource monitoring stopped");
        });

        debug!("Resource monitoring started every {:?}", period);
        *task = Some((token, handle));
    }

    /// Stops the background sampling loop. Safe to call when not running.
    pub fn stop_monitoring(&self) {
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some((token, handle)) = task {
            token.cancel();
            handle.abort();
        }
    }

    /// Whether the background loop is running.
    pub fn is_monitoring(&self) -> bool {
        self.task
            .lock()
            .map(|t| t.is_some())
            .unwrap_or(false)
    }

    /// Snapshots in the rolling history, oldest first.
    pub fn history(&self) -> Vec<ResourceSnapshot> {
        self.shared
            .history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    /// Latest snapshot plus rolling averages.
    pub fn summary(&self) -> ResourceSummary {
        ResourceSummary::from_history(&self.history())
    }
}

impl Drop for ResourceMonitor {
    fn drop(&mut self) {
        self.stop_monitoring();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::probe::{FixedProbe, usage_with_memory_percent};

    fn monitor_with(probe: Arc<FixedProbe>, capacity: usize) -> ResourceMonitor {
        let thresholds = ResourceThresholds {
            history_capacity: capacity,
            ..ResourceThresholds::default()
        };
        ResourceMonitor::new(thresholds, probe)
    }

    #[test]
    fn test_history_is_bounded() {
        let monitor = monitor_with(Arc::new(FixedProbe::with_memory_percent(50)), 3);
        for _ in 0..5 {
            monitor.tick().unwrap();
        }
        assert_eq!(monitor.history().len(), 3);
    }

    #[test]
    fn test_check_does_not_record() {
        let monitor = monitor_with(Arc::new(FixedProbe::with_memory_percent(50)), 10);
        let snapshot = monitor.check_resources().unwrap();
        assert!(snapshot.safe);
        assert!(monitor.history().is_empty());
    }

    #[test]
    fn test_warning_without_emergency() {
        let snapshot = ResourceSnapshot::evaluate(
            &usage_with_memory_percent(87),
            &ResourceThresholds::default(),
        );
        let events = events_for(&snapshot, &ResourceThresholds::default());
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], ResourceEvent::MemoryWarning(_)));
    }

    #[test]
    fn test_memory_emergency() {
        let thresholds = ResourceThresholds::default();
        let snapshot = ResourceSnapshot::evaluate(&usage_with_memory_percent(91), &thresholds);
        let events = events_for(&snapshot, &thresholds);
        assert!(events.iter().any(|e| matches!(e, ResourceEvent::MemoryWarning(_))));
        let emergency = events
            .iter()
            .find_map(|e| match e {
                ResourceEvent::Emergency(alert) => Some(alert),
                _ => None,
            })
            .unwrap();
        assert_eq!(emergency.kind, EmergencyKind::Memory);
    }

    #[test]
    fn test_disk_emergency_below_half_buffer() {
        let thresholds = ResourceThresholds::default();
        let mut usage = usage_with_memory_percent(10);
        usage.disk_available = 40 * MB;
        let snapshot = ResourceSnapshot::evaluate(&usage, &thresholds);
        let events = events_for(&snapshot, &thresholds);
        assert!(events.iter().any(|e| matches!(e, ResourceEvent::DiskWarning(_))));
        assert!(events.iter().any(|e| matches!(
            e,
            ResourceEvent::Emergency(EmergencyAlert { kind: EmergencyKind::Disk, .. })
        )));
    }

    #[test]
    fn test_optimal_workers_from_snapshot() {
        let monitor = monitor_with(Arc::new(FixedProbe::with_memory_percent(50)), 10);
        // 4 cores -> 3; 2 GB free / 400 MB -> 5; cap 8
        assert_eq!(monitor.calculate_optimal_workers().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_monitoring_publishes_emergency() {
        let probe = Arc::new(FixedProbe::with_memory_percent(50));
        let monitor = monitor_with(probe.clone(), 100);
        let mut events = monitor.subscribe();

        monitor.start_monitoring(Duration::from_millis(20));
        assert!(monitor.is_monitoring());
        probe.set(usage_with_memory_percent(91));

        let alert = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(ResourceEvent::Emergency(alert)) = events.recv().await {
                    return alert;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(alert.kind, EmergencyKind::Memory);

        monitor.stop_monitoring();
        assert!(!monitor.is_monitoring());
        assert!(!monitor.history().is_empty());
    }
}
