// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Task descriptors
//!
//! A task describes one composition: up to two input layers blended onto a
//! destination, optionally through an alpha mask. The core only cares about
//! the buffer handles; everything else is passed through to the compositor.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::fence::Fence;
use crate::job::JobId;

/// Largest surface edge the engine accepts
pub const MAX_SURFACE_DIM: u32 = 4096;

/// Number of surface slots per task
pub const SURFACE_SLOTS: usize = 4;

/// Externally owned buffer handle
pub type BufferFd = u32;

/// Pixel formats understood by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Argb8888,
    Rgb888,
    Rgb565,
    /// Two-plane YUV 4:2:0, luma stride given
    Nv12,
    Nv21,
    /// 8-bit alpha, mask only
    A8,
}

impl PixelFormat {
    /// Bytes per pixel of the first plane
    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            PixelFormat::Argb8888 => 4,
            PixelFormat::Rgb888 => 3,
            PixelFormat::Rgb565 => 2,
            PixelFormat::Nv12 | PixelFormat::Nv21 | PixelFormat::A8 => 1,
        }
    }

    pub fn is_yuv(self) -> bool {
        matches!(self, PixelFormat::Nv12 | PixelFormat::Nv21)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Rotation {
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
    MirrorH,
    MirrorV,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlendMode {
    /// Foreground replaces background
    #[default]
    Copy,
    /// Straight alpha source-over
    SrcOver,
    /// Premultiplied alpha source-over
    Premultiplied,
    /// Per-pixel alpha from the mask surface
    Masked,
}

/// Colour-space conversion applied to YUV inputs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CscMode {
    #[default]
    None,
    Bt601Limited,
    Bt601Full,
    Bt709Limited,
    Bt709Full,
}

/// Per-task surface slot; each maps to a fixed IOMMU window
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SurfaceSlot {
    Background = 0,
    Foreground = 1,
    Destination = 2,
    Mask = 3,
}

impl SurfaceSlot {
    pub const ALL: [SurfaceSlot; SURFACE_SLOTS] = [
        SurfaceSlot::Background,
        SurfaceSlot::Foreground,
        SurfaceSlot::Destination,
        SurfaceSlot::Mask,
    ];

    pub fn index(self) -> usize {
        self as usize
    }
}

/// One image in memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Surface {
    pub fd: BufferFd,
    pub width: u32,
    pub height: u32,
    /// Bytes per line of the first plane
    pub stride: u32,
    pub format: PixelFormat,
    /// Frame-buffer compressed layout
    pub compressed: bool,
}

impl Surface {
    /// Linear surface with a tightly packed stride
    pub fn linear(fd: BufferFd, width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            fd,
            width,
            height,
            stride: width * format.bytes_per_pixel(),
            format,
            compressed: false,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(Error::InvalidTask("zero-sized surface"));
        }
        if self.width > MAX_SURFACE_DIM || self.height > MAX_SURFACE_DIM {
            return Err(Error::InvalidTask("surface exceeds engine limits"));
        }
        let min_stride = self.width as u64 * self.format.bytes_per_pixel() as u64;
        if (self.stride as u64) < min_stride {
            return Err(Error::InvalidTask("stride shorter than a line"));
        }
        if self.compressed && self.format.is_yuv() {
            return Err(Error::InvalidTask("compression requires an RGB format"));
        }
        Ok(())
    }
}

/// Everything the compositor needs apart from buffer addresses
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskParams {
    pub background: Option<Surface>,
    pub foreground: Option<Surface>,
    pub destination: Surface,
    pub mask: Option<Surface>,
    pub blend: BlendMode,
    /// Plane alpha applied to the foreground
    pub global_alpha: u8,
    pub rotation: Rotation,
    pub csc: CscMode,
}

impl TaskParams {
    /// Plain copy of `src` into `dst`
    pub fn copy(src: Surface, dst: Surface) -> Self {
        Self {
            background: Some(src),
            foreground: None,
            destination: dst,
            mask: None,
            blend: BlendMode::Copy,
            global_alpha: 0xff,
            rotation: Rotation::Deg0,
            csc: CscMode::None,
        }
    }

    pub fn surface(&self, slot: SurfaceSlot) -> Option<&Surface> {
        match slot {
            SurfaceSlot::Background => self.background.as_ref(),
            SurfaceSlot::Foreground => self.foreground.as_ref(),
            SurfaceSlot::Destination => Some(&self.destination),
            SurfaceSlot::Mask => self.mask.as_ref(),
        }
    }

    /// Buffer handles referenced by this task, by slot
    pub fn buffers(&self) -> impl Iterator<Item = (SurfaceSlot, BufferFd)> + '_ {
        SurfaceSlot::ALL
            .into_iter()
            .filter_map(move |slot| self.surface(slot).map(|s| (slot, s.fd)))
    }

    pub fn validate(&self) -> Result<()> {
        if self.background.is_none() && self.foreground.is_none() {
            return Err(Error::InvalidTask("no input layer"));
        }
        for slot in SurfaceSlot::ALL {
            if let Some(surface) = self.surface(slot) {
                surface.validate()?;
            }
        }
        match (self.blend, &self.mask) {
            (BlendMode::Masked, None) => {
                return Err(Error::InvalidTask("masked blend without a mask"));
            }
            (BlendMode::Masked, Some(mask)) if mask.format != PixelFormat::A8 => {
                return Err(Error::InvalidTask("mask must be A8"));
            }
            (mode, Some(_)) if mode != BlendMode::Masked => {
                return Err(Error::InvalidTask("mask given without masked blend"));
            }
            _ => {}
        }
        if self.destination.format.is_yuv() && self.destination.compressed {
            return Err(Error::InvalidTask("compressed YUV output"));
        }
        if self.csc != CscMode::None
            && !self
                .background
                .iter()
                .chain(self.foreground.iter())
                .any(|s| s.format.is_yuv())
        {
            return Err(Error::InvalidTask("colour conversion without a YUV input"));
        }
        Ok(())
    }
}

/// A submission as handed to [`V2dDevice::submit`](crate::V2dDevice::submit)
#[derive(Debug, Clone)]
pub struct V2dTask {
    pub params: TaskParams,
    /// Wait for this fence before the engine touches any buffer
    pub in_fence: Option<Arc<Fence>>,
    /// Create an output fence for this job
    pub out_fence: bool,
}

impl V2dTask {
    pub fn new(params: TaskParams) -> Self {
        Self {
            params,
            in_fence: None,
            out_fence: true,
        }
    }

    pub fn with_in_fence(mut self, fence: Arc<Fence>) -> Self {
        self.in_fence = Some(fence);
        self
    }

    pub fn without_out_fence(mut self) -> Self {
        self.out_fence = false;
        self
    }
}

/// Task with every buffer resolved to a device-visible address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTask {
    pub job: JobId,
    pub params: TaskParams,
    /// Device address per slot, `None` where the slot is unused
    pub addrs: [Option<u64>; SURFACE_SLOTS],
}

impl ResolvedTask {
    pub fn addr(&self, slot: SurfaceSlot) -> Option<u64> {
        self.addrs[slot.index()]
    }
}
