//! Time and memory budgets for a processing cycle.

use std::sync::Mutex;
use std::time::Duration;
use sysinfo::{ProcessesToUpdate, System};
use tokio::time::Instant;

/// Limits a single cycle must stay within before handing off to a fresh invocation.
///
/// The memory check is only as good as the probe's ceiling: deployments with a known
/// memory limit should pass it to [`SystemMemoryProbe::with_limit`].
#[derive(Debug, Clone)]
pub struct Budget {
    /// Wall-clock time a cycle may spend processing items.
    pub time_limit: Duration,
    /// Fraction of the memory limit at which a cycle stops.
    pub memory_ratio: f64,
    /// Optional hard cap on items per cycle.
    pub item_limit: Option<usize>,
}

impl Default for Budget {
    fn default() -> Self {
        Self {
            time_limit: Duration::from_secs(20),
            memory_ratio: 0.9,
            item_limit: None,
        }
    }
}

impl Budget {
    /// Wall-clock time per cycle.
    pub fn with_time_limit(mut self, limit: Duration) -> Self {
        self.time_limit = limit;
        self
    }

    /// Fraction of the memory ceiling at which to stop, clamped to `0.0..=1.0`.
    pub fn with_memory_ratio(mut self, ratio: f64) -> Self {
        self.memory_ratio = ratio.clamp(0.0, 1.0);
        self
    }

    /// Stop after `limit` items, whatever the time and memory readings.
    pub fn with_item_limit(mut self, limit: usize) -> Self {
        self.item_limit = Some(limit);
        self
    }
}

/// Why a cycle stopped before draining its queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The time limit ran out.
    Time,
    /// Memory use reached the configured fraction of the ceiling.
    Memory,
    /// The per-cycle item cap was reached.
    ItemLimit,
}

/// Snapshot of memory use against the configured ceiling, in bytes.
#[derive(Debug, Clone, Copy)]
pub struct MemoryUsage {
    /// Resident memory of the process.
    pub used: u64,
    /// The ceiling `used` is compared against.
    pub limit: u64,
}

/// Source of memory readings for the budget check.
pub trait MemoryProbe: Send + Sync + 'static {
    /// Current usage, or `None` when it cannot be measured.
    fn usage(&self) -> Option<MemoryUsage>;
}

/// Reads the resident memory of the current process via `sysinfo`.
///
/// The ceiling is the explicit limit if one was set, else the cgroup memory limit when the
/// process runs in a container, else total system memory. The last fallback is far above
/// what a worker ever reaches, so set [`SystemMemoryProbe::with_limit`] when the real
/// ceiling is known.
pub struct SystemMemoryProbe {
    limit: Option<u64>,
    system: Mutex<System>,
}

impl SystemMemoryProbe {
    /// A probe with the cgroup or system ceiling.
    pub fn new() -> Self {
        Self {
            limit: None,
            system: Mutex::new(System::new()),
        }
    }

    /// Measure against a fixed ceiling of `bytes`.
    pub fn with_limit(mut self, bytes: u64) -> Self {
        self.limit = Some(bytes);
        self
    }
}

impl Default for SystemMemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SystemMemoryProbe {
    fn usage(&self) -> Option<MemoryUsage> {
        let pid = sysinfo::get_current_pid().ok()?;
        let mut system = self.system.lock().ok()?;
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), false);
        let used = system.process(pid)?.memory();
        let limit = match self.limit {
            Some(limit) => limit,
            None => {
                system.refresh_memory();
                system
                    .cgroup_limits()
                    .map(|cgroup| cgroup.total_memory)
                    .filter(|&total| total > 0)
                    .unwrap_or_else(|| system.total_memory())
            }
        };
        (limit > 0).then_some(MemoryUsage { used, limit })
    }
}

/// Tracks consumption of a [`Budget`] during one cycle.
pub(crate) struct BudgetTracker<'a> {
    budget: &'a Budget,
    probe: &'a dyn MemoryProbe,
    started: Instant,
    processed: usize,
}

impl<'a> BudgetTracker<'a> {
    pub(crate) fn start(budget: &'a Budget, probe: &'a dyn MemoryProbe) -> Self {
        Self {
            budget,
            probe,
            started: Instant::now(),
            processed: 0,
        }
    }

    pub(crate) fn record_item(&mut self) {
        self.processed += 1;
    }

    pub(crate) fn exceeded(&self) -> Option<StopReason> {
        if self
            .budget
            .item_limit
            .is_some_and(|limit| self.processed >= limit)
        {
            return Some(StopReason::ItemLimit);
        }
        if self.started.elapsed() >= self.budget.time_limit {
            return Some(StopReason::Time);
        }
        if let Some(usage) = self.probe.usage() {
            if usage.used as f64 >= usage.limit as f64 * self.budget.memory_ratio {
                return Some(StopReason::Memory);
            }
        }
        None
    }
}
