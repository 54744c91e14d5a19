// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Pipeline counters

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

#[derive(Default)]
pub struct PipelineStats {
    pub submitted: AtomicU64,
    pub dispatched: AtomicU64,
    pub completed: AtomicU64,
    pub map_failures: AtomicU64,
    pub hw_faults: AtomicU64,
    pub mmu_faults: AtomicU64,
    pub watchdog_timeouts: AtomicU64,
    pub resets: AtomicU64,
    pub spurious_irqs: AtomicU64,
    pub max_in_flight: AtomicUsize,
}

/// Point-in-time copy of [`PipelineStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsReport {
    pub submitted: u64,
    pub dispatched: u64,
    pub completed: u64,
    pub map_failures: u64,
    pub hw_faults: u64,
    pub mmu_faults: u64,
    pub watchdog_timeouts: u64,
    pub resets: u64,
    pub spurious_irqs: u64,
    /// High-water mark of the in-flight list
    pub max_in_flight: usize,
}

impl PipelineStats {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_in_flight(&self, depth: usize) {
        self.max_in_flight.fetch_max(depth, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsReport {
        StatsReport {
            submitted: self.submitted.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            map_failures: self.map_failures.load(Ordering::Relaxed),
            hw_faults: self.hw_faults.load(Ordering::Relaxed),
            mmu_faults: self.mmu_faults.load(Ordering::Relaxed),
            watchdog_timeouts: self.watchdog_timeouts.load(Ordering::Relaxed),
            resets: self.resets.load(Ordering::Relaxed),
            spurious_irqs: self.spurious_irqs.load(Ordering::Relaxed),
            max_in_flight: self.max_in_flight.load(Ordering::Relaxed),
        }
    }
}
