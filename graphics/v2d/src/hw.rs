// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Platform collaborators
//!
//! The pipeline core never touches the bus directly. Register access, the
//! compositor programming sequence, clock gating, coherent memory and buffer
//! export are supplied by the embedding driver through these traits.

use std::sync::Arc;

use crate::dmabuf::DmaBufExporter;
use crate::error::Result;
use crate::task::ResolvedTask;

/// 32-bit access to the engine's register window
pub trait RegisterIo: Send + Sync {
    /// Read a register at `reg` (byte offset into the window)
    fn read(&self, reg: u32) -> u32;

    /// Write a register at `reg` (byte offset into the window)
    fn write(&self, reg: u32, val: u32);
}

/// Programs the compositing hardware for a fully resolved task
pub trait Compositor: Send + Sync {
    /// Program layers/blend/rotation/CSC and issue the go trigger.
    ///
    /// Must not block for completion; the end of the frame is reported
    /// through the interrupt line.
    fn program(&self, task: &ResolvedTask);
}

/// Clock and power gating for the engine
pub trait PowerControl: Send + Sync {
    /// Ungate clocks and unmask the interrupt line
    fn enable(&self);

    /// Mask the interrupt line and gate clocks
    fn disable(&self);

    /// Current core clock in Hz
    fn clock_rate(&self) -> u64;

    /// Request a new core clock
    fn set_clock_rate(&self, hz: u64) -> Result<()>;
}

/// Physically contiguous, CPU-visible memory holding one translation table
pub trait CoherentTable: Send {
    /// Bus address of the first entry
    fn phys(&self) -> u64;

    /// Entries as seen by the CPU
    fn entries(&self) -> &[u32];

    /// Mutable entries as seen by the CPU
    fn entries_mut(&mut self) -> &mut [u32];
}

/// Source of coherent memory for translation tables
pub trait CoherentAllocator: Send + Sync {
    /// Allocate a zeroed table of `entries` 32-bit entries
    fn alloc_table(&self, entries: usize) -> Result<Box<dyn CoherentTable>>;
}

/// Everything the pipeline needs from the platform
#[derive(Clone)]
pub struct Platform {
    pub regs: Arc<dyn RegisterIo>,
    pub compositor: Arc<dyn Compositor>,
    pub power: Arc<dyn PowerControl>,
    pub exporter: Arc<dyn DmaBufExporter>,
    pub allocator: Arc<dyn CoherentAllocator>,
}
