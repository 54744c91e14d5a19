// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! V2D register map
//!
//! Only the registers the pipeline core touches are described here. The
//! compositing/blend/scaler registers belong to the [`Compositor`] backend.
//!
//! [`Compositor`]: crate::hw::Compositor

use bitflags::bitflags;

/// Global soft reset control
pub const V2D_GLOBAL_RESET: u32 = 0x0000;
/// Raw interrupt status, write one to clear
pub const V2D_IRQ_STATUS: u32 = 0x0004;
/// Interrupt enable mask
pub const V2D_IRQ_ENABLE: u32 = 0x0008;
/// Latched AXI error detail, read-only
pub const V2D_ERR_DETAIL: u32 = 0x000c;
/// Engine busy/idle state, read-only
pub const V2D_DEBUG_STATE: u32 = 0x0010;

/// Offset of the IOMMU block inside the register window
pub const V2D_MMU_BASE: u32 = 0x0800;

/// IOMMU base virtual address, low word
pub const V2D_MMU_BVA_LO: u32 = V2D_MMU_BASE + 0x00;
/// IOMMU base virtual address, high word
pub const V2D_MMU_BVA_HI: u32 = V2D_MMU_BASE + 0x04;
/// Address that hit the table-walk timeout, low word
pub const V2D_MMU_TIMEOUT_VA_LO: u32 = V2D_MMU_BASE + 0x08;
/// Address that hit the table-walk timeout, high word
pub const V2D_MMU_TIMEOUT_VA_HI: u32 = V2D_MMU_BASE + 0x0c;
/// IOMMU interrupt status
pub const V2D_MMU_IRQ_STATUS: u32 = V2D_MMU_BASE + 0x10;
/// IOMMU interrupt enable
pub const V2D_MMU_IRQ_ENABLE: u32 = V2D_MMU_BASE + 0x14;
/// Table-walk timeout in cycles
pub const V2D_MMU_TIMEOUT_VALUE: u32 = V2D_MMU_BASE + 0x18;
/// Write to clear latched fault state
pub const V2D_MMU_ERROR_CLEAR: u32 = V2D_MMU_BASE + 0x1c;
/// Last faulting virtual address, low word
pub const V2D_MMU_LAST_VA_LO: u32 = V2D_MMU_BASE + 0x20;
/// Last faulting virtual address, high word
pub const V2D_MMU_LAST_VA_HI: u32 = V2D_MMU_BASE + 0x24;
/// Physical address of the last faulting walk, low word
pub const V2D_MMU_LAST_PA_LO: u32 = V2D_MMU_BASE + 0x28;
/// Physical address of the last faulting walk, high word
pub const V2D_MMU_LAST_PA_HI: u32 = V2D_MMU_BASE + 0x2c;
/// Collective enable for all instances
pub const V2D_MMU_TOP_CTRL: u32 = V2D_MMU_BASE + 0x30;
/// IP version
pub const V2D_MMU_VERSION: u32 = V2D_MMU_BASE + 0x3c;

/// First per-instance register block
pub const V2D_MMU_TBU_BASE: u32 = V2D_MMU_BASE + 0x40;
/// Stride between per-instance blocks
pub const V2D_MMU_TBU_STEP: u32 = 0x20;

/// Table physical base, low word
pub const TBU_TTBLR: u32 = 0x00;
/// Table physical base, high word
pub const TBU_TTBHR: u32 = 0x04;
/// Size, QoS, preload and enable
pub const TBU_TCR0: u32 = 0x08;
/// Per-instance fault status
pub const TBU_STATUS: u32 = 0x10;

/// Register address of a per-instance register
pub const fn tbu_reg(id: usize, reg: u32) -> u32 {
    V2D_MMU_TBU_BASE + id as u32 * V2D_MMU_TBU_STEP + reg
}

/// Set in [`V2D_GLOBAL_RESET`] to start a reset; reads back set while busy
pub const RESET_BUSY: u32 = 1 << 0;

/// Instance enable bit in TCR0
pub const TCR0_ENABLE: u32 = 1 << 0;
/// Table prefetch bit in TCR0
pub const TCR0_PRELOAD: u32 = 1 << 2;
/// QoS field position in TCR0
pub const TCR0_QOS_SHIFT: u32 = 4;
/// QoS field mask (before shifting)
pub const TCR0_QOS_MASK: u32 = 0xf;
/// Size field position in TCR0
pub const TCR0_SIZE_SHIFT: u32 = 16;
/// Size field mask (before shifting), holds entry count minus one
pub const TCR0_SIZE_MASK: u32 = 0x1fff;

/// Encode a TCR0 value for an enabled instance with `entries` live entries
pub const fn tcr0(entries: usize, qos: u8, preload: bool) -> u32 {
    let size = (entries.saturating_sub(1) as u32) & TCR0_SIZE_MASK;
    let mut val = (size << TCR0_SIZE_SHIFT) | ((qos as u32 & TCR0_QOS_MASK) << TCR0_QOS_SHIFT);
    if preload {
        val |= TCR0_PRELOAD;
    }
    val | TCR0_ENABLE
}

/// Decode the size field of a TCR0 value
pub const fn tcr0_size(val: u32) -> u32 {
    (val >> TCR0_SIZE_SHIFT) & TCR0_SIZE_MASK
}

bitflags! {
    /// Top-level interrupt status bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct IrqStatus: u32 {
        /// End of frame, normal completion
        const EOF = 1 << 0;
        /// Frame-buffer-compression encoder finished
        const FBCENC_DONE = 1 << 1;
        /// AXI read error
        const DMA_RD_ERR = 1 << 4;
        /// AXI write error
        const DMA_WR_ERR = 1 << 5;
        /// FBC decoder error
        const FBCDEC_ERR = 1 << 6;
        /// IOMMU access fault or table-walk timeout
        const MMU_FAULT = 1 << 8;

        const DONE = Self::EOF.bits() | Self::FBCENC_DONE.bits();
        const ERRORS = Self::DMA_RD_ERR.bits()
            | Self::DMA_WR_ERR.bits()
            | Self::FBCDEC_ERR.bits()
            | Self::MMU_FAULT.bits();
    }
}

bitflags! {
    /// IOMMU interrupt status bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MmuIrq: u32 {
        /// Access to an address without a valid entry
        const ACCESS_FAULT = 1 << 0;
        /// Table walk exceeded the programmed timeout
        const WALK_TIMEOUT = 1 << 1;
        /// Access outside the instance's programmed size
        const RANGE_FAULT = 1 << 2;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tcr0_encoding() {
        let val = tcr0(5, 2, true);
        assert_eq!(tcr0_size(val), 4);
        assert_ne!(val & TCR0_ENABLE, 0);
        assert_ne!(val & TCR0_PRELOAD, 0);
        assert_eq!((val >> TCR0_QOS_SHIFT) & TCR0_QOS_MASK, 2);
    }

    #[test]
    fn test_tbu_register_layout() {
        assert_eq!(tbu_reg(0, TBU_TCR0), V2D_MMU_BASE + 0x48);
        assert_eq!(tbu_reg(2, TBU_STATUS), V2D_MMU_BASE + 0x40 + 0x40 + 0x10);
    }
}
