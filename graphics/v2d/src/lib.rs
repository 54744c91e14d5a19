// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! V2D 2D compositing accelerator
//!
//! Asynchronous job pipeline for the V2D blit/blend engine, together with the
//! engine's private IOMMU.
//!
//! # Architecture
//!
//! Clients submit [`V2dTask`]s and get back an output [`Fence`]. A dedicated
//! worker thread takes jobs off the pending queue one at a time, waits on
//! their input fence, pins their buffers, maps them through the IOMMU and
//! programs the engine. Completion is reported by interrupt; the fast path
//! only latches status and hands off to a completion thread which releases
//! everything the job held and signals its fence. A watchdog on the in-flight
//! slot drains a hung engine and resets it.
//!
//! Buffers outside the translated window are used by physical address. Inside
//! it, each surface slot owns one translation table instance and its slice of
//! the window.
//!
//! The embedding driver provides register access, clock gating, coherent
//! memory and buffer export through the traits in [`hw`] and [`dmabuf`].
//!
//! # Usage
//!
//! ```ignore
//! use v2d::{PixelFormat, Surface, TaskParams, V2dConfig, V2dDevice, V2dTask};
//!
//! let device = V2dDevice::new(V2dConfig::from_env(), platform)?;
//! irq_thread.register(device.irq_handle());
//!
//! let src = Surface::linear(src_fd, 1920, 1080, PixelFormat::Argb8888);
//! let dst = Surface::linear(dst_fd, 1920, 1080, PixelFormat::Argb8888);
//! let submission = device.submit(V2dTask::new(TaskParams::copy(src, dst)))?;
//! ```

pub mod config;
pub mod device;
pub mod dmabuf;
pub mod error;
pub mod fence;
pub mod hw;
pub mod iommu;
pub mod job;
pub mod power;
pub mod regs;
pub mod semaphore;
#[cfg(any(test, feature = "sim"))]
pub mod sim;
pub mod stats;
pub mod task;
pub mod workqueue;

pub use config::V2dConfig;
pub use device::{IrqHandle, RegisterWindow, Submission, TbuSnapshot, V2dDevice};
pub use dmabuf::DmaBufExporter;
pub use error::{Error, Result};
pub use fence::{Fence, FenceContext, FenceStatus, JobError, WaitResult};
pub use hw::{CoherentAllocator, CoherentTable, Compositor, Platform, PowerControl, RegisterIo};
pub use iommu::{Mapping, ScatterList, SgSegment, WindowId};
pub use job::JobId;
pub use power::EngineState;
pub use stats::StatsReport;
pub use task::{
    BlendMode, CscMode, PixelFormat, ResolvedTask, Rotation, Surface, SurfaceSlot, TaskParams,
    V2dTask,
};
