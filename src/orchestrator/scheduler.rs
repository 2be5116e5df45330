//! Test scheduling across workers.
//!
//! The [`TestScheduler`] partitions a [`TestCatalog`] into one
//! [`WorkerAssignment`] per worker with a longest-processing-time-first
//! bin-packing heuristic.
//!
//! # Strategies
//!
//! | Strategy | Order | Rebalancing |
//! |----------|-------|-------------|
//! | [`Strategy::Balanced`] | Longest first | Yes |
//! | [`Strategy::Fastest`] | Longest first | No |
//! | [`Strategy::Priority`] | Priority tier, then longest first | No |
//!
//! # Constraints
//!
//! A test may only be placed on a worker that already holds its group, or
//! on a new worker while fewer than the group's `max_workers` hold it. A
//! worker's memory is the sum of `memory_per_worker` over the distinct
//! groups it holds and must stay within [`ScheduleConstraints::max_memory`].
//! When no worker can take a test within the memory budget, the budget is
//! relaxed for that test and the schedule is marked degraded; the group
//! limit is never relaxed, so over-concurrent groups are packed onto fewer
//! workers.
//!
//! # Rebalancing
//!
//! After the greedy pass the balanced strategy repeatedly takes the most and
//! least loaded workers and moves one test whose duration is strictly less
//! than their load gap, choosing the test closest to half the gap. Each move
//! strictly narrows the pair's spread and never raises the maximum load.
//! The loop stops when no legal move exists or after `10 × workers`
//! iterations.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use shardrun::discovery::{TestCase, TestCatalog, TestGroup, Priority};
//! use shardrun::orchestrator::{ScheduleConstraints, Strategy, TestScheduler};
//!
//! let mut catalog = TestCatalog::new([TestGroup {
//!     name: "medium".into(),
//!     max_workers: 4,
//!     memory_per_worker: 0,
//!     estimated_time: Duration::from_secs(60),
//!     priority: Priority::Medium,
//! }]);
//! for (id, secs) in [("a", 40), ("b", 30), ("c", 20), ("d", 10)] {
//!     catalog.add(TestCase::new(id, "medium", Duration::from_secs(secs)));
//! }
//!
//! let schedule = TestScheduler::new(&catalog, Strategy::Balanced)
//!     .schedule_tests(2, ScheduleConstraints::default());
//! assert_eq!(schedule.assignments.len(), 2);
//! assert_eq!(schedule.makespan(), Duration::from_secs(50));
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::discovery::{Priority, TestCase, TestCatalog, serialize_millis};

/// How tests are ordered and balanced.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Longest-first greedy placement followed by rebalancing.
    #[default]
    Balanced,
    /// Longest-first greedy placement only.
    Fastest,
    /// Critical groups first, then longest first.
    Priority,
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Strategy::Balanced => write!(f, "balanced"),
            Strategy::Fastest => write!(f, "fastest"),
            Strategy::Priority => write!(f, "priority"),
        }
    }
}

/// Limits the schedule must respect.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ScheduleConstraints {
    /// Memory budget per worker, in bytes.
    pub max_memory: Option<u64>,
    /// Upper bound on the number of workers.
    pub max_workers: Option<usize>,
}

/// The tests given to one worker.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerAssignment {
    pub worker: usize,
    pub tests: Vec<TestCase>,
    #[serde(serialize_with = "serialize_millis")]
    pub estimated_duration: Duration,
    /// Bytes.
    pub estimated_memory: u64,
}

impl WorkerAssignment {
    /// Distinct groups held by this worker, in name order.
    pub fn groups(&self) -> BTreeSet<&str> {
        self.tests.iter().map(|t| t.group.as_str()).collect()
    }
}

/// A complete schedule.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Schedule {
    pub assignments: Vec<WorkerAssignment>,
    pub strategy: Strategy,
    /// Whether a constraint had to be relaxed to place every test.
    pub degraded: bool,
    pub warnings: Vec<String>,
}

impl Schedule {
    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }

    pub fn worker_count(&self) -> usize {
        self.assignments.len()
    }

    pub fn test_count(&self) -> usize {
        self.assignments.iter().map(|a| a.tests.len()).sum()
    }

    /// Estimated completion time of the most loaded worker.
    pub fn makespan(&self) -> Duration {
        self.assignments
            .iter()
            .map(|a| a.estimated_duration)
            .max()
            .unwrap_or_default()
    }

    /// Checks the schedule against the catalog it was built from.
    ///
    /// Returns one message per violation: tests missing, duplicated or not
    /// in the catalog, and groups held by more workers than allowed.
    pub fn validate(&self, catalog: &TestCatalog) -> Vec<String> {
        let mut violations = Vec::new();

        let mut seen: BTreeMap<&str, usize> = BTreeMap::new();
        for test in self.assignments.iter().flat_map(|a| &a.tests) {
            *seen.entry(test.id.as_str()).or_default() += 1;
        }
        let expected: BTreeSet<&str> = catalog.iter().map(|t| t.id.as_str()).collect();

        for id in &expected {
            match seen.get(id) {
                None => violations.push(format!("test {} is not scheduled", id)),
                Some(n) if *n > 1 => {
                    violations.push(format!("test {} is scheduled {} times", id, n))
                }
                _ => {}
            }
        }
        for id in seen.keys().filter(|id| !expected.contains(*id)) {
            violations.push(format!("test {} is not in the catalog", id));
        }

        let mut holders: BTreeMap<&str, usize> = BTreeMap::new();
        for assignment in &self.assignments {
            for group in assignment.groups() {
                *holders.entry(group).or_default() += 1;
            }
        }
        for (group, count) in holders {
            if let Some(def) = catalog.group(group)
                && count > def.concurrency_limit()
            {
                violations.push(format!(
                    "group {} runs on {} workers, limit is {}",
                    group,
                    count,
                    def.concurrency_limit()
                ));
            }
        }

        violations
    }
}

/// Working state of one worker during scheduling.
#[derive(Default)]
struct Bin {
    tests: Vec<TestCase>,
    load: Duration,
    groups: BTreeMap<String, usize>,
    memory: u64,
}

impl Bin {
    fn holds(&self, group: &str) -> bool {
        self.groups.contains_key(group)
    }
}

/// Partitions a catalog into worker assignments.
pub struct TestScheduler<'a> {
    catalog: &'a TestCatalog,
    strategy: Strategy,
}

impl<'a> TestScheduler<'a> {
    pub fn new(catalog: &'a TestCatalog, strategy: Strategy) -> Self {
        Self { catalog, strategy }
    }

    /// Builds a schedule for up to `worker_count` workers.
    ///
    /// The number of assignments is capped by `constraints.max_workers` and
    /// by the number of tests; workers left without tests are dropped. An
    /// empty catalog yields an empty schedule.
    pub fn schedule_tests(&self, worker_count: usize, constraints: ScheduleConstraints) -> Schedule {
        let total = self.catalog.len();
        let mut workers = worker_count.max(1);
        if let Some(cap) = constraints.max_workers {
            workers = workers.min(cap.max(1));
        }
        workers = workers.min(total);

        let mut schedule = Schedule {
            assignments: Vec::new(),
            strategy: self.strategy,
            degraded: false,
            warnings: Vec::new(),
        };
        if workers == 0 {
            debug!("Nothing to schedule");
            return schedule;
        }

        let mut bins: Vec<Bin> = (0..workers).map(|_| Bin::default()).collect();
        let mut relaxed: BTreeSet<String> = BTreeSet::new();

        for test in self.ordered_tests() {
            let slot = self
                .pick_bin(&bins, test, constraints.max_memory)
                .or_else(|| {
                    relaxed.insert(test.group.clone());
                    self.pick_bin(&bins, test, None)
                });
            // `pick_bin` without a memory budget always finds a worker: some
            // worker either holds the group already or may start holding it.
            let Some(slot) = slot else {
                continue;
            };
            self.place(&mut bins[slot], test.clone());
        }

        if !relaxed.is_empty() {
            schedule.degraded = true;
            for group in &relaxed {
                let message = format!(
                    "memory budget exceeded to place group {}; workers may use more than {} MB",
                    group,
                    constraints.max_memory.unwrap_or_default() / crate::config::MB
                );
                warn!("{}", message);
                schedule.warnings.push(message);
            }
        }

        if self.strategy == Strategy::Balanced {
            let moves = self.rebalance(&mut bins, constraints.max_memory);
            debug!("Rebalancing made {} moves", moves);
        }

        schedule.assignments = bins
            .into_iter()
            .filter(|b| !b.tests.is_empty())
            .enumerate()
            .map(|(worker, bin)| WorkerAssignment {
                worker,
                tests: bin.tests,
                estimated_duration: bin.load,
                estimated_memory: bin.memory,
            })
            .collect();

        info!(
            "Scheduled {} tests on {} workers ({} strategy, makespan ~{:?})",
            total,
            schedule.worker_count(),
            self.strategy,
            schedule.makespan()
        );
        schedule
    }

    fn ordered_tests(&self) -> Vec<&'a TestCase> {
        let mut tests: Vec<&TestCase> = self.catalog.iter().collect();
        match self.strategy {
            Strategy::Balanced | Strategy::Fastest => tests.sort_by(|a, b| {
                b.estimated_duration
                    .cmp(&a.estimated_duration)
                    .then_with(|| a.id.cmp(&b.id))
            }),
            Strategy::Priority => tests.sort_by(|a, b| {
                self.priority_of(b)
                    .cmp(&self.priority_of(a))
                    .then_with(|| b.estimated_duration.cmp(&a.estimated_duration))
                    .then_with(|| a.id.cmp(&b.id))
            }),
        }
        tests
    }

    fn priority_of(&self, test: &TestCase) -> Priority {
        test.priority
            .or_else(|| self.catalog.group(&test.group).map(|g| g.priority))
            .unwrap_or_default()
    }

    fn group_limit(&self, group: &str) -> usize {
        self.catalog
            .group(group)
            .map(|g| g.concurrency_limit())
            .unwrap_or(usize::MAX)
    }

    fn group_memory(&self, group: &str) -> u64 {
        self.catalog
            .group(group)
            .map(|g| g.memory_per_worker)
            .unwrap_or(0)
    }

    fn holders(bins: &[Bin], group: &str) -> usize {
        bins.iter().filter(|b| b.holds(group)).count()
    }

    /// Least loaded worker that may take `test`, lowest index on ties.
    fn pick_bin(&self, bins: &[Bin], test: &TestCase, max_memory: Option<u64>) -> Option<usize> {
        let group_open = Self::holders(bins, &test.group) < self.group_limit(&test.group);
        let extra_memory = self.group_memory(&test.group);

        bins.iter()
            .enumerate()
            .filter(|(_, bin)| {
                if bin.holds(&test.group) {
                    return true;
                }
                group_open
                    && max_memory.is_none_or(|limit| bin.memory + extra_memory <= limit)
            })
            .min_by_key(|(i, bin)| (bin.load, *i))
            .map(|(i, _)| i)
    }

    fn place(&self, bin: &mut Bin, test: TestCase) {
        let count = bin.groups.entry(test.group.clone()).or_default();
        if *count == 0 {
            bin.memory += self.group_memory(&test.group);
        }
        *count += 1;
        bin.load += test.estimated_duration;
        bin.tests.push(test);
    }

    fn remove(&self, bin: &mut Bin, index: usize) -> TestCase {
        let test = bin.tests.remove(index);
        if let Some(count) = bin.groups.get_mut(&test.group) {
            *count -= 1;
            if *count == 0 {
                bin.groups.remove(&test.group);
                bin.memory = bin.memory.saturating_sub(self.group_memory(&test.group));
            }
        }
        bin.load = bin.load.saturating_sub(test.estimated_duration);
        test
    }

    fn rebalance(&self, bins: &mut [Bin], max_memory: Option<u64>) -> usize {
        let cap = bins.len() * 10;
        let mut moves = 0;

        for _ in 0..cap {
            let Some(heavy) = (0..bins.len()).max_by_key(|&i| (bins[i].load, std::cmp::Reverse(i)))
            else {
                break;
            };
            let Some(light) = (0..bins.len()).min_by_key(|&i| (bins[i].load, i)) else {
                break;
            };
            if heavy == light || bins[heavy].load <= bins[light].load {
                break;
            }

            let gap = bins[heavy].load - bins[light].load;
            let half = gap / 2;

            let candidate = bins[heavy]
                .tests
                .iter()
                .enumerate()
                .filter(|(_, t)| !t.estimated_duration.is_zero() && t.estimated_duration < gap)
                .filter(|(_, t)| self.can_move(bins, heavy, light, t, max_memory))
                .min_by_key(|(i, t)| (t.estimated_duration.abs_diff(half), *i))
                .map(|(i, _)| i);

            let Some(index) = candidate else {
                break;
            };
            let test = self.remove(&mut bins[heavy], index);
            self.place(&mut bins[light], test);
            moves += 1;
        }

        moves
    }

    fn can_move(
        &self,
        bins: &[Bin],
        from: usize,
        to: usize,
        test: &TestCase,
        max_memory: Option<u64>,
    ) -> bool {
        let group = test.group.as_str();
        if bins[to].holds(group) {
            return true;
        }

        let leaves_source = bins[from].groups.get(group).copied() == Some(1);
        let holders_after = Self::holders(bins, group) + 1 - usize::from(leaves_source);
        if holders_after > self.group_limit(group) {
            return false;
        }

        max_memory.is_none_or(|limit| bins[to].memory + self.group_memory(group) <= limit)
    }
}
