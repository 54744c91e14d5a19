// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Buffer reference manager
//!
//! Pins externally owned buffers for device access for the lifetime of one
//! job. Acquisition is get → attach → map → IOMMU; release walks the same
//! steps backwards and skips any step that never happened, so a reference
//! left half-acquired by a failed mapping is released cleanly.

use log::trace;

use crate::error::{Error, Result};
use crate::hw::RegisterIo;
use crate::iommu::{phys_cpu_to_dev, Iommu, Mapping, ScatterList};
use crate::task::{BufferFd, SurfaceSlot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DmaBufHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttachmentHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SgTableHandle(pub u64);

/// Owner of shareable buffers
pub trait DmaBufExporter: Send + Sync {
    /// Cheap validity check used at submission time
    fn is_valid(&self, fd: BufferFd) -> bool;

    /// Take a reference on the buffer behind `fd`
    fn get(&self, fd: BufferFd) -> Result<DmaBufHandle>;

    /// Attach the engine as a consumer
    fn attach(&self, buf: DmaBufHandle) -> Result<AttachmentHandle>;

    /// Pin the pages for bidirectional access and describe them
    fn map_attachment(&self, att: AttachmentHandle) -> Result<(SgTableHandle, ScatterList)>;

    fn unmap_attachment(&self, att: AttachmentHandle, sgt: SgTableHandle);

    fn detach(&self, buf: DmaBufHandle, att: AttachmentHandle);

    /// Drop the reference taken by [`get`](Self::get)
    fn put(&self, buf: DmaBufHandle);
}

/// One pinned buffer
#[derive(Debug, Default)]
pub struct BufferRef {
    fd: Option<BufferFd>,
    buf: Option<DmaBufHandle>,
    attachment: Option<AttachmentHandle>,
    sgt: Option<SgTableHandle>,
    mapping: Option<Mapping>,
}

impl BufferRef {
    /// Pin `fd` and place it in the window reserved for `slot`.
    ///
    /// On error the reference keeps whatever was acquired so far; the caller
    /// must still call [`release`](Self::release).
    pub fn acquire(
        &mut self,
        exporter: &dyn DmaBufExporter,
        iommu: &mut Iommu,
        regs: &dyn RegisterIo,
        slot: SurfaceSlot,
        fd: BufferFd,
    ) -> Result<u64> {
        if self.is_held() {
            return Err(Error::Exporter("buffer slot already in use"));
        }
        self.fd = Some(fd);

        let buf = exporter.get(fd)?;
        self.buf = Some(buf);

        let att = exporter.attach(buf)?;
        self.attachment = Some(att);

        let (sgt, sg) = exporter.map_attachment(att)?;
        self.sgt = Some(sgt);

        // A single contiguous buffer is reached by physical address and
        // never touches a translation table
        let mapping = match sg.segments() {
            [seg] => Mapping::Direct {
                addr: phys_cpu_to_dev(seg.phys()),
            },
            _ => iommu.map(regs, iommu.window_base(slot.index()), &sg)?,
        };
        self.mapping = Some(mapping);

        trace!(
            "v2d: {:?} fd {} -> {:#x} ({} segments)",
            slot,
            fd,
            mapping.device_addr(),
            sg.len()
        );
        Ok(mapping.device_addr())
    }

    /// Unwind everything [`acquire`](Self::acquire) managed to do
    pub fn release(&mut self, exporter: &dyn DmaBufExporter) {
        self.mapping = None;
        if let (Some(att), Some(sgt)) = (self.attachment, self.sgt.take()) {
            exporter.unmap_attachment(att, sgt);
        }
        if let Some(att) = self.attachment.take() {
            if let Some(buf) = self.buf {
                exporter.detach(buf, att);
            }
        }
        if let Some(buf) = self.buf.take() {
            exporter.put(buf);
        }
        self.fd = None;
    }

    /// A buffer reference is held
    pub fn is_held(&self) -> bool {
        self.buf.is_some()
    }

    /// Fully acquired and mapped
    pub fn is_mapped(&self) -> bool {
        self.mapping.is_some()
    }

    pub fn fd(&self) -> Option<BufferFd> {
        self.fd
    }

    pub fn mapping(&self) -> Option<Mapping> {
        self.mapping
    }
}
