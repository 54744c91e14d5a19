// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Software model of the V2D engine and its platform
//!
//! [`SimEngine`] stands in for the register window, the compositor and the
//! clock gate. [`HeapAllocator`] hands out heap-backed translation tables and
//! [`FakeExporter`] counts every buffer reference so tests can check that
//! acquisition and release stay balanced.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use log::trace;
use spin::Mutex as SpinMutex;

use crate::device::IrqHandle;
use crate::dmabuf::{AttachmentHandle, DmaBufExporter, DmaBufHandle, SgTableHandle};
use crate::error::{Error, Result};
use crate::hw::{CoherentAllocator, CoherentTable, Compositor, Platform, PowerControl, RegisterIo};
use crate::iommu::{ScatterList, PAGE_SIZE};
use crate::regs::*;
use crate::task::{BufferFd, ResolvedTask};

/// Reset latency that never completes
const RESET_NEVER: u32 = u32::MAX;

/// Number of TBU status registers the model clears on ERROR_CLEAR
const SIM_MAX_TBUS: usize = 8;

pub struct SimEngine {
    regs: SpinMutex<HashMap<u32, u32>>,
    writes: SpinMutex<Vec<(u32, u32)>>,
    dispatched: SpinMutex<Vec<ResolvedTask>>,
    irq: SpinMutex<Option<IrqHandle>>,
    auto_complete: AtomicBool,
    reset_latency: AtomicU32,
    reset_reads_left: AtomicU32,
    resets: AtomicU64,
    powered: AtomicBool,
    enables: AtomicU64,
    disables: AtomicU64,
    clock_hz: AtomicU64,
}

impl SimEngine {
    pub fn new() -> Self {
        Self {
            regs: SpinMutex::new(HashMap::new()),
            writes: SpinMutex::new(Vec::new()),
            dispatched: SpinMutex::new(Vec::new()),
            irq: SpinMutex::new(None),
            auto_complete: AtomicBool::new(false),
            reset_latency: AtomicU32::new(3),
            reset_reads_left: AtomicU32::new(0),
            resets: AtomicU64::new(0),
            powered: AtomicBool::new(false),
            enables: AtomicU64::new(0),
            disables: AtomicU64::new(0),
            clock_hz: AtomicU64::new(409_600_000),
        }
    }

    /// Raw register value, without read side effects
    pub fn reg(&self, reg: u32) -> u32 {
        self.regs.lock().get(&reg).copied().unwrap_or(0)
    }

    /// Set a register behind the driver's back
    pub fn set_reg(&self, reg: u32, val: u32) {
        self.regs.lock().insert(reg, val);
    }

    /// Every value the driver wrote to `reg`, oldest first
    pub fn writes_to(&self, reg: u32) -> Vec<u32> {
        self.writes
            .lock()
            .iter()
            .filter(|(r, _)| *r == reg)
            .map(|(_, v)| *v)
            .collect()
    }

    /// Latch status bits as if the engine raised them
    pub fn raise(&self, bits: IrqStatus) {
        let mut regs = self.regs.lock();
        *regs.entry(V2D_IRQ_STATUS).or_insert(0) |= bits.bits();
    }

    /// Latch an IOMMU access fault at `va` on instance `tbu`
    pub fn raise_mmu_fault(&self, tbu: usize, va: u64) {
        {
            let mut regs = self.regs.lock();
            *regs.entry(V2D_MMU_IRQ_STATUS).or_insert(0) |= MmuIrq::ACCESS_FAULT.bits();
            regs.insert(V2D_MMU_LAST_VA_LO, va as u32);
            regs.insert(V2D_MMU_LAST_VA_HI, (va >> 32) as u32);
            regs.insert(tbu_reg(tbu, TBU_STATUS), 1);
        }
        self.raise(IrqStatus::MMU_FAULT);
    }

    /// Deliver the interrupt line to the connected device
    pub fn fire(&self) -> bool {
        let irq = self.irq.lock().clone();
        match irq {
            Some(irq) => irq.fire(),
            None => false,
        }
    }

    pub fn connect_irq(&self, irq: IrqHandle) {
        *self.irq.lock() = Some(irq);
    }

    /// Finish every frame as soon as it is programmed
    pub fn set_auto_complete(&self, on: bool) {
        self.auto_complete.store(on, Ordering::SeqCst);
    }

    /// Number of busy reads before a reset completes
    pub fn set_reset_latency(&self, reads: u32) {
        self.reset_latency.store(reads, Ordering::SeqCst);
    }

    /// Make every later reset hang forever
    pub fn break_reset(&self) {
        self.reset_latency.store(RESET_NEVER, Ordering::SeqCst);
    }

    pub fn resets(&self) -> u64 {
        self.resets.load(Ordering::SeqCst)
    }

    /// Tasks programmed so far, in order
    pub fn dispatched(&self) -> Vec<ResolvedTask> {
        self.dispatched.lock().clone()
    }

    pub fn dispatch_count(&self) -> usize {
        self.dispatched.lock().len()
    }

    /// `(enables, disables)` seen by the clock gate
    pub fn power_transitions(&self) -> (u64, u64) {
        (
            self.enables.load(Ordering::SeqCst),
            self.disables.load(Ordering::SeqCst),
        )
    }

    pub fn is_powered(&self) -> bool {
        self.powered.load(Ordering::SeqCst)
    }
}

impl Default for SimEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl RegisterIo for SimEngine {
    fn read(&self, reg: u32) -> u32 {
        let mut regs = self.regs.lock();
        let val = regs.get(&reg).copied().unwrap_or(0);
        if reg == V2D_GLOBAL_RESET && val & RESET_BUSY != 0 {
            let left = self.reset_reads_left.load(Ordering::SeqCst);
            if left == 0 {
                regs.insert(reg, 0);
            } else if left != RESET_NEVER {
                self.reset_reads_left.store(left - 1, Ordering::SeqCst);
            }
        }
        val
    }

    fn write(&self, reg: u32, val: u32) {
        self.writes.lock().push((reg, val));
        let mut regs = self.regs.lock();
        match reg {
            V2D_IRQ_STATUS | V2D_MMU_IRQ_STATUS => {
                let cur = regs.entry(reg).or_insert(0);
                *cur &= !val;
            }
            V2D_MMU_ERROR_CLEAR => {
                for tbu in 0..SIM_MAX_TBUS {
                    regs.insert(tbu_reg(tbu, TBU_STATUS), 0);
                }
            }
            V2D_GLOBAL_RESET if val & RESET_BUSY != 0 => {
                self.resets.fetch_add(1, Ordering::SeqCst);
                self.reset_reads_left
                    .store(self.reset_latency.load(Ordering::SeqCst), Ordering::SeqCst);
                regs.insert(reg, RESET_BUSY);
                regs.insert(V2D_IRQ_STATUS, 0);
            }
            _ => {
                regs.insert(reg, val);
            }
        }
    }
}

impl Compositor for SimEngine {
    fn program(&self, task: &ResolvedTask) {
        trace!("sim: program {}", task.job);
        self.dispatched.lock().push(task.clone());
        if self.auto_complete.load(Ordering::SeqCst) {
            let mut done = IrqStatus::EOF;
            if task.params.destination.compressed {
                done |= IrqStatus::FBCENC_DONE;
            }
            self.raise(done);
            self.fire();
        }
    }
}

impl PowerControl for SimEngine {
    fn enable(&self) {
        self.enables.fetch_add(1, Ordering::SeqCst);
        self.powered.store(true, Ordering::SeqCst);
    }

    fn disable(&self) {
        self.disables.fetch_add(1, Ordering::SeqCst);
        self.powered.store(false, Ordering::SeqCst);
    }

    fn clock_rate(&self) -> u64 {
        self.clock_hz.load(Ordering::SeqCst)
    }

    fn set_clock_rate(&self, hz: u64) -> Result<()> {
        if hz == 0 {
            return Err(Error::InvalidConfig("clock rate must be non-zero"));
        }
        self.clock_hz.store(hz, Ordering::SeqCst);
        Ok(())
    }
}

pub struct HeapTable {
    phys: u64,
    entries: Vec<u32>,
}

impl CoherentTable for HeapTable {
    fn phys(&self) -> u64 {
        self.phys
    }

    fn entries(&self) -> &[u32] {
        &self.entries
    }

    fn entries_mut(&mut self) -> &mut [u32] {
        &mut self.entries
    }
}

/// Hands out heap tables at increasing fake bus addresses
pub struct HeapAllocator {
    next_phys: AtomicU64,
    fail: AtomicBool,
}

impl HeapAllocator {
    pub fn new() -> Self {
        Self {
            next_phys: AtomicU64::new(0x3000_0000),
            fail: AtomicBool::new(false),
        }
    }

    /// Make every later allocation fail
    pub fn fail_allocations(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }
}

impl Default for HeapAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl CoherentAllocator for HeapAllocator {
    fn alloc_table(&self, entries: usize) -> Result<Box<dyn CoherentTable>> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::TableAlloc);
        }
        let bytes = (entries as u64 * 4).div_ceil(PAGE_SIZE) * PAGE_SIZE;
        let phys = self.next_phys.fetch_add(bytes, Ordering::SeqCst);
        Ok(Box::new(HeapTable {
            phys,
            entries: vec![0; entries],
        }))
    }
}

/// Totals of every exporter call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExporterCounters {
    pub gets: u64,
    pub puts: u64,
    pub attaches: u64,
    pub detaches: u64,
    pub maps: u64,
    pub unmaps: u64,
}

#[derive(Default)]
struct ExporterState {
    buffers: HashMap<BufferFd, ScatterList>,
    /// Attachment handle to the buffer it belongs to
    attachments: HashMap<u64, BufferFd>,
    failing_maps: Vec<BufferFd>,
    next_handle: u64,
    counters: ExporterCounters,
}

/// Exporter over an in-memory table of scatter lists
pub struct FakeExporter {
    state: SpinMutex<ExporterState>,
}

impl FakeExporter {
    pub fn new() -> Self {
        Self {
            state: SpinMutex::new(ExporterState {
                next_handle: 1,
                ..Default::default()
            }),
        }
    }

    pub fn add(&self, fd: BufferFd, sg: ScatterList) {
        self.state.lock().buffers.insert(fd, sg);
    }

    pub fn add_contiguous(&self, fd: BufferFd, phys: u64, len: u64) {
        self.add(fd, ScatterList::contiguous(phys, len));
    }

    /// Make mapping `fd` fail
    pub fn fail_map(&self, fd: BufferFd) {
        self.state.lock().failing_maps.push(fd);
    }

    pub fn counters(&self) -> ExporterCounters {
        self.state.lock().counters
    }

    /// References currently held across get, attach and map
    pub fn outstanding(&self) -> u64 {
        let c = self.counters();
        (c.gets - c.puts) + (c.attaches - c.detaches) + (c.maps - c.unmaps)
    }
}

impl Default for FakeExporter {
    fn default() -> Self {
        Self::new()
    }
}

impl DmaBufExporter for FakeExporter {
    fn is_valid(&self, fd: BufferFd) -> bool {
        self.state.lock().buffers.contains_key(&fd)
    }

    fn get(&self, fd: BufferFd) -> Result<DmaBufHandle> {
        let mut state = self.state.lock();
        if !state.buffers.contains_key(&fd) {
            return Err(Error::InvalidBuffer(fd));
        }
        state.counters.gets += 1;
        Ok(DmaBufHandle(u64::from(fd)))
    }

    fn attach(&self, buf: DmaBufHandle) -> Result<AttachmentHandle> {
        let mut state = self.state.lock();
        let handle = state.next_handle;
        state.next_handle += 1;
        state.attachments.insert(handle, buf.0 as BufferFd);
        state.counters.attaches += 1;
        Ok(AttachmentHandle(handle))
    }

    fn map_attachment(&self, att: AttachmentHandle) -> Result<(SgTableHandle, ScatterList)> {
        let mut state = self.state.lock();
        let fd = *state
            .attachments
            .get(&att.0)
            .ok_or(Error::Exporter("unknown attachment"))?;
        if state.failing_maps.contains(&fd) {
            return Err(Error::Exporter("map_attachment failed"));
        }
        let sg = state
            .buffers
            .get(&fd)
            .cloned()
            .ok_or(Error::InvalidBuffer(fd))?;
        state.counters.maps += 1;
        Ok((SgTableHandle(att.0), sg))
    }

    fn unmap_attachment(&self, _att: AttachmentHandle, _sgt: SgTableHandle) {
        self.state.lock().counters.unmaps += 1;
    }

    fn detach(&self, _buf: DmaBufHandle, att: AttachmentHandle) {
        let mut state = self.state.lock();
        state.attachments.remove(&att.0);
        state.counters.detaches += 1;
    }

    fn put(&self, _buf: DmaBufHandle) {
        self.state.lock().counters.puts += 1;
    }
}

/// Bundle a sim engine, allocator and exporter into a [`Platform`]
pub fn platform(engine: &Arc<SimEngine>, exporter: &Arc<FakeExporter>) -> Platform {
    Platform {
        regs: engine.clone(),
        compositor: engine.clone(),
        power: engine.clone(),
        exporter: exporter.clone(),
        allocator: Arc::new(HeapAllocator::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_irq_status_is_write_one_to_clear() {
        let engine = SimEngine::new();
        engine.raise(IrqStatus::EOF | IrqStatus::DMA_RD_ERR);
        engine.write(V2D_IRQ_STATUS, IrqStatus::EOF.bits());
        assert_eq!(engine.reg(V2D_IRQ_STATUS), IrqStatus::DMA_RD_ERR.bits());
    }

    #[test]
    fn test_reset_clears_after_latency() {
        let engine = SimEngine::new();
        engine.set_reset_latency(2);
        engine.write(V2D_GLOBAL_RESET, RESET_BUSY);
        assert_eq!(engine.read(V2D_GLOBAL_RESET), RESET_BUSY);
        assert_eq!(engine.read(V2D_GLOBAL_RESET), RESET_BUSY);
        assert_eq!(engine.read(V2D_GLOBAL_RESET), RESET_BUSY);
        assert_eq!(engine.read(V2D_GLOBAL_RESET), 0);
        assert_eq!(engine.resets(), 1);
    }

    #[test]
    fn test_exporter_rejects_unknown_fd() {
        let exporter = FakeExporter::new();
        assert!(!exporter.is_valid(4));
        assert_eq!(exporter.get(4), Err(Error::InvalidBuffer(4)));
        assert_eq!(exporter.outstanding(), 0);
    }
}
