// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Completion fences
//!
//! A fence is a one-shot signal. The completion path signals it exactly once
//! with the job's disposition; any number of waiters may block on it with a
//! bounded timeout or poll it.

use core::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::warn;
use parking_lot::{Condvar, Mutex};

/// Next fence context ID
static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Why a job did not complete normally
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobError {
    /// A buffer could not be resolved to a device address
    MapFailed,
    /// The engine raised an error interrupt while the job was running
    HardwareFault,
    /// Drained by the watchdog after the engine stopped making progress
    Timeout,
    /// The engine could not be reset
    DeviceUnusable,
    /// The device shut down before the job ran
    Cancelled,
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobError::MapFailed => write!(f, "buffer mapping failed"),
            JobError::HardwareFault => write!(f, "hardware fault"),
            JobError::Timeout => write!(f, "timed out"),
            JobError::DeviceUnusable => write!(f, "device unusable"),
            JobError::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Disposition a fence was signalled with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceStatus {
    Signaled,
    Error(JobError),
}

impl FenceStatus {
    pub fn is_ok(self) -> bool {
        self == FenceStatus::Signaled
    }
}

/// Wait result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    /// The fence was signalled, with this disposition
    Signaled(FenceStatus),
    /// Timeout occurred
    Timeout,
}

/// One-shot completion signal
pub struct Fence {
    context: u64,
    seqno: u64,
    status: Mutex<Option<FenceStatus>>,
    signaled: Condvar,
}

impl Fence {
    /// Create an unsignalled fence outside any device context
    pub fn new(context: u64, seqno: u64) -> Self {
        Self {
            context,
            seqno,
            status: Mutex::new(None),
            signaled: Condvar::new(),
        }
    }

    pub fn context(&self) -> u64 {
        self.context
    }

    pub fn seqno(&self) -> u64 {
        self.seqno
    }

    /// Signal the fence.
    ///
    /// Returns `false` and leaves the first disposition in place if the fence
    /// was already signalled.
    pub fn signal(&self, status: FenceStatus) -> bool {
        let mut slot = self.status.lock();
        if let Some(prev) = *slot {
            warn!(
                "fence {}:{} already signalled ({:?}), ignoring {:?}",
                self.context, self.seqno, prev, status
            );
            return false;
        }
        *slot = Some(status);
        self.signaled.notify_all();
        true
    }

    /// Disposition if signalled
    pub fn status(&self) -> Option<FenceStatus> {
        *self.status.lock()
    }

    pub fn is_signaled(&self) -> bool {
        self.status().is_some()
    }

    /// Block until signalled or `timeout` elapses
    pub fn wait(&self, timeout: Duration) -> WaitResult {
        let mut slot = self.status.lock();
        if slot.is_none() {
            // wait_while_for re-checks on spurious wakeups
            self.signaled
                .wait_while_for(&mut slot, |s| s.is_none(), timeout);
        }
        match *slot {
            Some(status) => WaitResult::Signaled(status),
            None => WaitResult::Timeout,
        }
    }
}

impl fmt::Debug for Fence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fence")
            .field("context", &self.context)
            .field("seqno", &self.seqno)
            .field("status", &self.status())
            .finish()
    }
}

/// Per-device fence timeline
pub struct FenceContext {
    id: u64,
    next_seqno: AtomicU64,
}

impl FenceContext {
    pub fn new() -> Self {
        Self {
            id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
            next_seqno: AtomicU64::new(1),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Create the next fence on this timeline
    pub fn create(&self) -> Arc<Fence> {
        let seqno = self.next_seqno.fetch_add(1, Ordering::Relaxed);
        Arc::new(Fence::new(self.id, seqno))
    }
}

impl Default for FenceContext {
    fn default() -> Self {
        Self::new()
    }
}
