// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Private IOMMU of the V2D engine
//!
//! The engine translates a flat device-visible window starting at
//! `iova_base`. The window is cut into `tbu_count` slices of `iova_step`
//! bytes, one per translation buffer unit (TBU). Each TBU walks a single-level
//! table of 32-bit entries, one per 4 KiB page, held in coherent memory.
//!
//! ```text
//!  iova_base            + step                + 2 * step
//!  ├── window 0 ─────────┼── window 1 ─────────┼── window 2 ──────────┤
//!  │ TBU0 table          │ TBU1 table          │ TBU2 table           │
//! ```
//!
//! Tables are only written while the owning instance is disabled in the
//! hardware: every job maps all of its buffers before it is posted, and
//! [`Iommu::unmap_end`] disables everything once the job is finished.

use log::{debug, error, trace};

use crate::config::V2dConfig;
use crate::error::{Error, Result};
use crate::hw::{CoherentAllocator, CoherentTable, RegisterIo};
use crate::regs::*;

/// Translation granule
pub const PAGE_SIZE: u64 = 4096;
const PAGE_SHIFT: u32 = 12;

/// Start of the high alias of DRAM as seen from the CPU
const DRAM_HIGH_ALIAS: u64 = 0x1_0000_0000;
/// Distance between the CPU view and the bus view of the high alias
const DRAM_HIGH_OFFSET: u64 = 0x8000_0000;

/// Translate a CPU physical address into the engine's bus address space.
///
/// DRAM above 4 GiB is visible to the engine 2 GiB lower.
pub fn phys_cpu_to_dev(phys: u64) -> u64 {
    if phys >= DRAM_HIGH_ALIAS {
        phys - DRAM_HIGH_OFFSET
    } else {
        phys
    }
}

/// Encode a table entry for a page at bus address `dev_phys`
pub fn pte(dev_phys: u64) -> u32 {
    (dev_phys >> PAGE_SHIFT) as u32
}

/// One physically contiguous piece of a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SgSegment {
    /// Physical address of the first page
    pub page_phys: u64,
    /// Byte offset into the first page
    pub offset: u64,
    /// Length in bytes
    pub len: u64,
}

impl SgSegment {
    pub fn new(page_phys: u64, offset: u64, len: u64) -> Self {
        Self {
            page_phys,
            offset,
            len,
        }
    }

    /// Physical address of the first byte
    pub fn phys(&self) -> u64 {
        self.page_phys + self.offset
    }
}

/// Buffer described as a list of physical segments
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScatterList {
    segments: Vec<SgSegment>,
}

impl ScatterList {
    pub fn new(segments: Vec<SgSegment>) -> Self {
        Self { segments }
    }

    /// Single contiguous segment
    pub fn contiguous(phys: u64, len: u64) -> Self {
        Self::new(vec![SgSegment::new(phys, 0, len)])
    }

    pub fn segments(&self) -> &[SgSegment] {
        &self.segments
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

/// Where a mapped buffer ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mapping {
    /// Single contiguous buffer outside the window, used by physical address
    Direct { addr: u64 },
    /// Buffer placed in a TBU table at `iova`
    Translated { iova: u64, len: u64 },
}

impl Mapping {
    /// Address the engine should be given
    pub fn device_addr(&self) -> u64 {
        match *self {
            Mapping::Direct { addr } => addr,
            Mapping::Translated { iova, .. } => iova,
        }
    }
}

/// Index of a window slice in the flat IOVA range
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WindowId(pub usize);

/// One translation buffer unit
pub struct Tbu {
    id: usize,
    table: Box<dyn CoherentTable>,
    capacity: usize,
    window: Option<WindowId>,
    va_base: u64,
    entry_count: usize,
    qos: u8,
    preload: bool,
}

impl Tbu {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn window(&self) -> Option<WindowId> {
        self.window
    }

    pub fn entry_count(&self) -> usize {
        self.entry_count
    }

    pub fn entries(&self) -> &[u32] {
        self.table.entries()
    }

    /// Bound address range, if any
    pub fn va_range(&self, step: u64) -> Option<(u64, u64)> {
        self.window.map(|_| (self.va_base, self.va_base + step))
    }
}

/// Fault latched by one instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TbuFault {
    pub tbu: usize,
    pub status: u32,
}

/// Diagnostics read from the IOMMU on a fault interrupt
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FaultReport {
    pub irq: MmuIrq,
    pub last_va: u64,
    pub last_pa: u64,
    pub timeout_va: u64,
    pub tbus: Vec<TbuFault>,
}

/// Translation-table allocator and address-space mapper
pub struct Iommu {
    tbus: Vec<Tbu>,
    iova_base: u64,
    iova_step: u64,
    timeout_cycles: u32,
    hw_enabled: bool,
}

impl Iommu {
    /// Allocate the fixed pool of instances
    pub fn new(config: &V2dConfig, allocator: &dyn CoherentAllocator) -> Result<Self> {
        let mut tbus = Vec::with_capacity(config.tbu_count);
        for id in 0..config.tbu_count {
            let table = allocator.alloc_table(config.tbu_entries)?;
            if table.entries().len() < config.tbu_entries {
                error!("v2d: TBU{} table allocation came back short", id);
                return Err(Error::TableAlloc);
            }
            debug!(
                "v2d: TBU{} table at {:#x}, {} entries",
                id,
                table.phys(),
                config.tbu_entries
            );
            tbus.push(Tbu {
                id,
                table,
                capacity: config.tbu_entries,
                window: None,
                va_base: 0,
                entry_count: 0,
                qos: config.tbu_qos,
                preload: config.tbu_preload,
            });
        }

        Ok(Self {
            tbus,
            iova_base: config.iova_base,
            iova_step: config.iova_step,
            timeout_cycles: config.mmu_timeout_cycles,
            hw_enabled: false,
        })
    }

    pub fn tbus(&self) -> &[Tbu] {
        &self.tbus
    }

    pub fn iova_step(&self) -> u64 {
        self.iova_step
    }

    pub fn is_hw_enabled(&self) -> bool {
        self.hw_enabled
    }

    /// First address of the window assigned to `slot`
    pub fn window_base(&self, slot: usize) -> u64 {
        self.iova_base + slot as u64 * self.iova_step
    }

    fn in_window(&self, iova: u64) -> bool {
        let end = self.iova_base + self.tbus.len() as u64 * self.iova_step;
        iova >= self.iova_base && iova < end
    }

    /// Program the global IOMMU registers. The block loses them whenever the
    /// engine clock is gated, so this runs on every power-up.
    pub fn init_hw(&mut self, regs: &dyn RegisterIo) {
        regs.write(V2D_MMU_BVA_LO, self.iova_base as u32);
        regs.write(V2D_MMU_BVA_HI, (self.iova_base >> 32) as u32);
        regs.write(V2D_MMU_TIMEOUT_VALUE, self.timeout_cycles);
        regs.write(V2D_MMU_IRQ_ENABLE, MmuIrq::all().bits());
        for tbu in &self.tbus {
            regs.write(tbu_reg(tbu.id, TBU_TCR0), 0);
        }
        regs.write(V2D_MMU_TOP_CTRL, 0);
        self.hw_enabled = false;
        trace!(
            "v2d: iommu version {:#x} initialised",
            regs.read(V2D_MMU_VERSION)
        );
    }

    /// Map `sg` at `iova`.
    ///
    /// An address outside the managed window is only accepted for a single
    /// contiguous segment, which the engine then reaches by physical address.
    pub fn map(&mut self, regs: &dyn RegisterIo, iova: u64, sg: &ScatterList) -> Result<Mapping> {
        if sg.is_empty() {
            return Err(Error::Exporter("empty scatter list"));
        }
        if !self.in_window(iova) {
            if sg.len() == 1 {
                let addr = phys_cpu_to_dev(sg.segments()[0].phys());
                trace!("v2d: direct mapping at {:#x}", addr);
                return Ok(Mapping::Direct { addr });
            }
            return Err(Error::OutOfWindow { iova });
        }
        if iova % PAGE_SIZE != 0 {
            return Err(Error::Misaligned { offset: iova });
        }

        let id = ((iova - self.iova_base) / self.iova_step) as usize;
        let step = self.iova_step;
        let window_base = self.window_base(id);
        let tbu = self.tbus.get_mut(id).ok_or(Error::InvalidInstance(id))?;

        // First touch binds the instance to the window holding `iova`
        let binding = tbu.entry_count == 0;
        let va_base = if binding { window_base } else { tbu.va_base };
        if iova < va_base || iova >= va_base + step {
            return Err(Error::OutOfWindow { iova });
        }

        let mut cur = iova;
        let mut high = tbu.entry_count;
        for seg in sg.segments() {
            if seg.offset % PAGE_SIZE != 0 {
                return Err(Error::Misaligned { offset: seg.offset });
            }
            let pages = seg.len.div_ceil(PAGE_SIZE);
            let first = ((cur - va_base) >> PAGE_SHIFT) as usize;
            let last = first + pages as usize;
            if last > tbu.capacity || cur + pages * PAGE_SIZE > va_base + step {
                return Err(Error::TableOverflow {
                    tbu: id,
                    index: last,
                });
            }
            let dev = phys_cpu_to_dev(seg.phys());
            let entries = tbu.table.entries_mut();
            for (page, index) in (first..last).enumerate() {
                entries[index] = pte(dev + page as u64 * PAGE_SIZE);
            }
            cur += pages * PAGE_SIZE;
            high = high.max(last);
        }

        if binding {
            tbu.window = Some(WindowId(id));
            tbu.va_base = va_base;
        }
        tbu.entry_count = high;

        let tcr = tcr0(tbu.entry_count, tbu.qos, tbu.preload);
        let phys = tbu.table.phys();
        regs.write(tbu_reg(id, TBU_TTBLR), phys as u32);
        regs.write(tbu_reg(id, TBU_TTBHR), (phys >> 32) as u32);
        regs.write(tbu_reg(id, TBU_TCR0), tcr);
        trace!(
            "v2d: TBU{} mapped {:#x}..{:#x}, {} entries",
            id,
            iova,
            cur,
            tbu.entry_count
        );

        if !self.hw_enabled {
            regs.write(V2D_MMU_TOP_CTRL, 1);
            self.hw_enabled = true;
        }

        Ok(Mapping::Translated {
            iova,
            len: cur - iova,
        })
    }

    /// Disable every instance and release their windows
    pub fn unmap_end(&mut self, regs: &dyn RegisterIo) {
        for tbu in &mut self.tbus {
            regs.write(tbu_reg(tbu.id, TBU_TCR0), 0);
            tbu.entry_count = 0;
            tbu.window = None;
        }
        if self.hw_enabled {
            regs.write(V2D_MMU_TOP_CTRL, 0);
            self.hw_enabled = false;
        }
    }
}

/// Read and clear latched IOMMU faults.
///
/// Runs in the interrupt fast path, so it only touches registers and never
/// the tables.
pub fn report_faults(regs: &dyn RegisterIo, tbu_count: usize) -> FaultReport {
    let irq = MmuIrq::from_bits_truncate(regs.read(V2D_MMU_IRQ_STATUS));
    let read64 = |lo, hi| regs.read(lo) as u64 | ((regs.read(hi) as u64) << 32);

    let mut report = FaultReport {
        irq,
        last_va: read64(V2D_MMU_LAST_VA_LO, V2D_MMU_LAST_VA_HI),
        last_pa: read64(V2D_MMU_LAST_PA_LO, V2D_MMU_LAST_PA_HI),
        timeout_va: 0,
        tbus: Vec::new(),
    };
    if irq.contains(MmuIrq::WALK_TIMEOUT) {
        report.timeout_va = read64(V2D_MMU_TIMEOUT_VA_LO, V2D_MMU_TIMEOUT_VA_HI);
    }

    for id in 0..tbu_count {
        let status = regs.read(tbu_reg(id, TBU_STATUS));
        if status != 0 {
            report.tbus.push(TbuFault { tbu: id, status });
        }
    }

    error!(
        "v2d: iommu fault {:?}: last va {:#x} pa {:#x} timeout va {:#x}",
        report.irq, report.last_va, report.last_pa, report.timeout_va
    );
    for fault in &report.tbus {
        error!("v2d:   TBU{} status {:#x}", fault.tbu, fault.status);
    }

    regs.write(V2D_MMU_ERROR_CLEAR, 1);
    regs.write(V2D_MMU_IRQ_STATUS, irq.bits());
    report
}
