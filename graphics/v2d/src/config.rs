// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Pipeline configuration
//!
//! Defaults match the production board configuration. Every field can be
//! overridden from the environment of the driver daemon.

use std::time::Duration;

use log::warn;

use crate::error::{Error, Result};
use crate::iommu::PAGE_SIZE;

/// Driver configuration
#[derive(Debug, Clone)]
pub struct V2dConfig {
    /// Maximum number of jobs dispatched to hardware at once
    pub max_in_flight: usize,
    /// How long the worker waits for a free slot before assuming a hang
    pub watchdog_timeout: Duration,
    /// First wait on a job's input fence
    pub fence_wait_short: Duration,
    /// Second, final wait on a job's input fence
    pub fence_wait_long: Duration,
    /// Upper bound on reset-done polls before the device is declared dead
    pub reset_poll_limit: u32,
    /// Number of translation-table instances
    pub tbu_count: usize,
    /// Entries per translation table
    pub tbu_entries: usize,
    /// Base of the flat device-visible window managed by the IOMMU
    pub iova_base: u64,
    /// Size of the window slice owned by each instance
    pub iova_step: u64,
    /// QoS level programmed into each instance
    pub tbu_qos: u8,
    /// Enable table prefetch
    pub tbu_preload: bool,
    /// Table-walk timeout in engine cycles
    pub mmu_timeout_cycles: u32,
    /// Physical base of the register window
    pub reg_base: u64,
    /// Length of the register window
    pub reg_len: u64,
    /// Capacity of the interrupt token queue
    pub irq_queue_depth: usize,
}

impl Default for V2dConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 1,
            watchdog_timeout: Duration::from_millis(2500),
            fence_wait_short: Duration::from_millis(100),
            fence_wait_long: Duration::from_millis(2500),
            reset_poll_limit: 100_000,
            tbu_count: 4,
            tbu_entries: 8192,
            iova_base: 0x8000_0000,
            iova_step: 0x200_0000,
            tbu_qos: 2,
            tbu_preload: true,
            mmu_timeout_cycles: 0x80000,
            reg_base: 0xc010_0000,
            reg_len: 0x1000,
            irq_queue_depth: 16,
        }
    }
}

impl V2dConfig {
    /// Build a configuration from the process environment
    pub fn from_env() -> Self {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Build a configuration from an arbitrary variable lookup
    pub fn from_vars<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let num = |name: &str| lookup(name).and_then(|v| v.trim().parse::<u64>().ok());

        if let Some(n) = num("V2D_MAX_IN_FLIGHT") {
            config.max_in_flight = n as usize;
        }
        if let Some(ms) = num("V2D_WATCHDOG_MS") {
            config.watchdog_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = num("V2D_FENCE_SHORT_MS") {
            config.fence_wait_short = Duration::from_millis(ms);
        }
        if let Some(ms) = num("V2D_FENCE_LONG_MS") {
            config.fence_wait_long = Duration::from_millis(ms);
        }
        if let Some(n) = num("V2D_RESET_POLL_LIMIT") {
            config.reset_poll_limit = n.min(u32::MAX as u64) as u32;
        }
        if let Some(n) = num("V2D_TBU_COUNT") {
            config.tbu_count = n as usize;
        }
        if let Some(n) = num("V2D_TBU_ENTRIES") {
            config.tbu_entries = n as usize;
        }
        if let Some(val) = lookup("V2D_TBU_PRELOAD") {
            config.tbu_preload = val == "1" || val.to_lowercase() == "true";
        }

        config
    }

    /// Reject configurations the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.max_in_flight == 0 {
            return Err(Error::InvalidConfig("max_in_flight must be at least 1"));
        }
        if self.tbu_count == 0 || self.tbu_entries == 0 {
            return Err(Error::InvalidConfig("at least one non-empty table required"));
        }
        // TCR0 size field is 13 bits wide
        if self.tbu_entries > 0x2000 {
            return Err(Error::InvalidConfig("tbu_entries exceeds the size field"));
        }
        if self.iova_step == 0 || self.iova_step % PAGE_SIZE != 0 {
            return Err(Error::InvalidConfig("iova_step must be a page multiple"));
        }
        if self.fence_wait_short > self.fence_wait_long {
            return Err(Error::InvalidConfig("short fence wait exceeds long wait"));
        }
        if self.reset_poll_limit == 0 {
            return Err(Error::InvalidConfig("reset_poll_limit must be non-zero"));
        }
        if self.irq_queue_depth == 0 {
            return Err(Error::InvalidConfig("irq_queue_depth must be non-zero"));
        }
        if (self.tbu_entries as u64) * PAGE_SIZE < self.iova_step {
            warn!(
                "v2d: tables cover {:#x} bytes, windows are {:#x}; tail of each window is unmappable",
                self.tbu_entries as u64 * PAGE_SIZE,
                self.iova_step
            );
        }
        Ok(())
    }
}
