//! Slot accounting for concurrent executions, with a soft host-memory
//! probe.
//!
//! The monitor is plain integer bookkeeping: the pool asks for a slot
//! before dispatching and returns it on completion. Saturation is a normal
//! condition, not an error. Releasing more than was allocated is clamped —
//! an over-release is a benign caller bug the engine tolerates.

use serde::{Deserialize, Serialize};
use sysinfo::System;

/// Fraction of total host memory below which the probe reports pressure.
const LOW_MEMORY_FRACTION: f64 = 0.05;

/// Read-only concurrency metrics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MonitorMetrics {
    pub peak_concurrency: usize,
    /// Mean of the allocation-history samples (one sample per allocate or
    /// release).
    pub average_concurrency: f64,
    pub total_allocations: u64,
    pub total_releases: u64,
    pub current_utilization_percent: f64,
}

/// Host memory reading reported when availability drops below 5% of total.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemoryPressure {
    pub available_bytes: u64,
    pub total_bytes: u64,
    pub percent_available: f64,
}

/// Integer slot counter with a fixed maximum.
#[derive(Debug)]
pub struct ResourceMonitor {
    max: usize,
    current: usize,
    peak: usize,
    total_allocations: u64,
    total_releases: u64,
    sample_sum: u64,
    sample_count: u64,
    system: System,
}

impl ResourceMonitor {
    pub fn new(max: usize) -> Self {
        Self {
            max,
            current: 0,
            peak: 0,
            total_allocations: 0,
            total_releases: 0,
            sample_sum: 0,
            sample_count: 0,
            system: System::new(),
        }
    }

    pub fn max(&self) -> usize {
        self.max
    }

    pub fn current(&self) -> usize {
        self.current
    }

    pub fn free_slots(&self) -> usize {
        self.max.saturating_sub(self.current)
    }

    pub fn can_allocate(&self, count: usize) -> bool {
        self.current + count <= self.max
    }

    /// Take `count` slots. Returns false, with no side effects, when that
    /// would exceed the maximum.
    pub fn try_allocate(&mut self, count: usize) -> bool {
        if !self.can_allocate(count) {
            return false;
        }
        self.current += count;
        self.peak = self.peak.max(self.current);
        self.total_allocations += count as u64;
        self.sample();
        true
    }

    /// Return `count` slots. Clamped at zero.
    pub fn release(&mut self, count: usize) {
        self.current = self.current.saturating_sub(count);
        self.total_releases += count as u64;
        self.sample();
    }

    fn sample(&mut self) {
        self.sample_sum += self.current as u64;
        self.sample_count += 1;
    }

    pub fn metrics(&self) -> MonitorMetrics {
        let average = if self.sample_count == 0 {
            0.0
        } else {
            self.sample_sum as f64 / self.sample_count as f64
        };
        let utilization = if self.max == 0 {
            0.0
        } else {
            self.current as f64 * 100.0 / self.max as f64
        };
        MonitorMetrics {
            peak_concurrency: self.peak,
            average_concurrency: average,
            total_allocations: self.total_allocations,
            total_releases: self.total_releases,
            current_utilization_percent: utilization,
        }
    }

    /// Probe host memory; `Some` when available memory is below 5% of
    /// total. A probe that cannot read the host returns `None` — the check
    /// is advisory and its failures are swallowed.
    pub fn memory_pressure(&mut self) -> Option<MemoryPressure> {
        self.system.refresh_memory();
        let total = self.system.total_memory();
        let available = self.system.available_memory();
        if total == 0 {
            return None;
        }

        let fraction = available as f64 / total as f64;
        if fraction < LOW_MEMORY_FRACTION {
            Some(MemoryPressure {
                available_bytes: available,
                total_bytes: total,
                percent_available: fraction * 100.0,
            })
        } else {
            None
        }
    }
}
