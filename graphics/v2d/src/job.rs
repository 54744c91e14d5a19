// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Jobs and the lists they move between

use core::fmt;
use std::sync::Arc;

use crate::dmabuf::{BufferRef, DmaBufExporter};
use crate::fence::{Fence, FenceStatus, JobError};
use crate::task::{TaskParams, SURFACE_SLOTS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job#{}", self.0)
    }
}

/// One submitted unit of work, owned by exactly one list at a time
pub struct Job {
    pub id: JobId,
    pub params: TaskParams,
    pub in_fence: Option<Arc<Fence>>,
    pub out_fence: Option<Arc<Fence>>,
    pub bufs: [BufferRef; SURFACE_SLOTS],
    /// Set when the job failed before reaching the hardware
    pub error: Option<JobError>,
}

impl Job {
    pub fn new(
        id: JobId,
        params: TaskParams,
        in_fence: Option<Arc<Fence>>,
        out_fence: Option<Arc<Fence>>,
    ) -> Self {
        Self {
            id,
            params,
            in_fence,
            out_fence,
            bufs: Default::default(),
            error: None,
        }
    }

    /// Release every buffer reference the job still holds
    pub fn release_buffers(&mut self, exporter: &dyn DmaBufExporter) {
        for bref in self.bufs.iter_mut() {
            bref.release(exporter);
        }
    }

    /// Signal the output fence, if any, and drop our reference to it
    pub fn finish(&mut self, status: FenceStatus) {
        if let Some(fence) = self.out_fence.take() {
            fence.signal(status);
        }
        self.in_fence = None;
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("error", &self.error)
            .field("out_fence", &self.out_fence)
            .finish()
    }
}
