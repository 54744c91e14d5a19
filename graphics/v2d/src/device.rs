// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! V2D device: job queue, worker thread, completion path and recovery
//!
//! ```text
//!  submit() ──► pending ──► v2d-worker ──────────────► in-flight ──► engine
//!                            │ slot (watchdog)             ▲            │
//!                            │ input fence                 │            │ irq
//!                            │ power ref, map buffers      │            ▼
//!                            └────────── recover() ◄───────┘      handle_irq()
//!                                                                       │ token
//!  fence.signal() ◄── release buffers, unmap, put power ◄── v2d-irq-bh ◄┘
//! ```
//!
//! Lock order: pending → in-flight → iommu. The device state spinlock is a
//! leaf and is never held across a call into the platform other than the
//! clock gate hooks.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_queue::ArrayQueue;
use log::{debug, error, info, trace, warn};
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::config::V2dConfig;
use crate::error::{Error, Result};
use crate::fence::{Fence, FenceContext, FenceStatus, JobError, WaitResult};
use crate::hw::Platform;
use crate::iommu::{self, Iommu, WindowId, PAGE_SIZE};
use crate::job::{Job, JobId};
use crate::power::{EngineState, Power};
use crate::regs::*;
use crate::semaphore::Semaphore;
use crate::stats::{PipelineStats, StatsReport};
use crate::task::{ResolvedTask, SurfaceSlot, V2dTask, SURFACE_SLOTS};
use crate::workqueue::WorkItem;

/// Longest a blocked worker goes without checking for shutdown
const SHUTDOWN_POLL: Duration = Duration::from_millis(50);

/// How long recovery waits for in-progress completion work
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Result of a successful submission
#[derive(Debug, Clone)]
pub struct Submission {
    pub job: JobId,
    /// Output fence, when one was requested
    pub fence: Option<Arc<Fence>>,
}

/// Physical register range to map for direct access
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterWindow {
    pub phys: u64,
    pub len: u64,
}

/// Diagnostic view of one translation instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TbuSnapshot {
    pub id: usize,
    pub window: Option<WindowId>,
    pub entry_count: usize,
    pub entries: Vec<u32>,
}

/// State shared between the API, the worker, the interrupt path and the
/// completion thread
struct Shared {
    config: V2dConfig,
    platform: Platform,
    fences: FenceContext,
    next_job: AtomicU64,

    pending: Mutex<VecDeque<Job>>,
    work_ready: Condvar,
    in_flight: Mutex<Vec<Job>>,
    slots: Semaphore,

    power: Power,
    iommu: Mutex<Iommu>,

    irq_tokens: ArrayQueue<IrqStatus>,
    completion: WorkItem,

    running: AtomicBool,
    unusable: AtomicBool,
    stats: PipelineStats,
}

/// Handle the platform's interrupt thread uses to deliver the V2D line
#[derive(Clone)]
pub struct IrqHandle {
    shared: Weak<Shared>,
}

impl IrqHandle {
    /// Run the interrupt fast path. Returns `true` if the interrupt was ours.
    pub fn fire(&self) -> bool {
        match self.shared.upgrade() {
            Some(shared) => shared.handle_irq(),
            None => false,
        }
    }
}

/// A V2D engine and its job pipeline
pub struct V2dDevice {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
    bottom_half: Option<JoinHandle<()>>,
}

impl V2dDevice {
    /// Bring up the pipeline and spawn its threads
    pub fn new(config: V2dConfig, platform: Platform) -> Result<Self> {
        config.validate()?;
        let iommu = Iommu::new(&config, platform.allocator.as_ref())?;

        let shared = Arc::new(Shared {
            slots: Semaphore::new(config.max_in_flight),
            irq_tokens: ArrayQueue::new(config.irq_queue_depth),
            power: Power::new(Arc::clone(&platform.power)),
            iommu: Mutex::new(iommu),
            fences: FenceContext::new(),
            next_job: AtomicU64::new(1),
            pending: Mutex::new(VecDeque::new()),
            work_ready: Condvar::new(),
            in_flight: Mutex::new(Vec::with_capacity(config.max_in_flight)),
            completion: WorkItem::new(),
            running: AtomicBool::new(true),
            unusable: AtomicBool::new(false),
            stats: PipelineStats::default(),
            config,
            platform,
        });

        let bottom_half = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("v2d-irq-bh".to_string())
                .spawn(move || shared.completion_loop())
                .map_err(|_| Error::ThreadSpawn("v2d-irq-bh"))?
        };

        let worker = {
            let shared_for_worker = Arc::clone(&shared);
            thread::Builder::new()
                .name("v2d-worker".to_string())
                .spawn(move || shared_for_worker.worker_loop())
        };
        let worker = match worker {
            Ok(handle) => handle,
            Err(_) => {
                shared.completion.stop();
                let _ = bottom_half.join();
                return Err(Error::ThreadSpawn("v2d-worker"));
            }
        };

        info!(
            "v2d: ready, {} TBUs x {} entries, {} in flight, fence context {}",
            shared.config.tbu_count,
            shared.config.tbu_entries,
            shared.config.max_in_flight,
            shared.fences.id()
        );

        Ok(Self {
            shared,
            worker: Some(worker),
            bottom_half: Some(bottom_half),
        })
    }

    /// Queue a task. On error nothing is queued.
    pub fn submit(&self, task: V2dTask) -> Result<Submission> {
        let shared = &self.shared;
        if shared.unusable.load(Ordering::Acquire) {
            return Err(Error::DeviceUnusable);
        }
        task.params.validate()?;
        for (_, fd) in task.params.buffers() {
            if !shared.platform.exporter.is_valid(fd) {
                return Err(Error::InvalidBuffer(fd));
            }
        }

        let mut pending = shared.pending.lock();
        if !shared.running.load(Ordering::Acquire) {
            return Err(Error::Shutdown);
        }
        let id = JobId(shared.next_job.fetch_add(1, Ordering::Relaxed));
        let fence = if task.out_fence {
            Some(shared.fences.create())
        } else {
            None
        };
        pending.push_back(Job::new(id, task.params, task.in_fence, fence.clone()));
        shared.work_ready.notify_one();
        drop(pending);

        PipelineStats::bump(&shared.stats.submitted);
        debug!("v2d: queued {}", id);
        Ok(Submission { job: id, fence })
    }

    /// Handle for the platform interrupt thread
    pub fn irq_handle(&self) -> IrqHandle {
        IrqHandle {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Run the interrupt fast path directly
    pub fn handle_irq(&self) -> bool {
        self.shared.handle_irq()
    }

    /// Drain everything in flight and reset the engine
    pub fn recover(&self) {
        self.shared.recover();
    }

    pub fn stats(&self) -> StatsReport {
        self.shared.stats.snapshot()
    }

    pub fn config(&self) -> &V2dConfig {
        &self.shared.config
    }

    pub fn pending_len(&self) -> usize {
        self.shared.pending.lock().len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.shared.in_flight.lock().len()
    }

    pub fn engine_state(&self) -> EngineState {
        self.shared.power.engine_state()
    }

    pub fn power_refcount(&self) -> u32 {
        self.shared.power.refcount()
    }

    pub fn is_usable(&self) -> bool {
        !self.shared.unusable.load(Ordering::Acquire)
    }

    /// Current state of every translation instance
    pub fn tbu_snapshot(&self) -> Vec<TbuSnapshot> {
        let iommu = self.shared.iommu.lock();
        iommu
            .tbus()
            .iter()
            .map(|tbu| TbuSnapshot {
                id: tbu.id(),
                window: tbu.window(),
                entry_count: tbu.entry_count(),
                entries: tbu.entries()[..tbu.entry_count()].to_vec(),
            })
            .collect()
    }

    /// Validate a request to map part of the register window uncached
    pub fn register_window(&self, offset: u64, len: u64) -> Result<RegisterWindow> {
        let reg_len = self.shared.config.reg_len;
        let in_range = offset
            .checked_add(len)
            .map_or(false, |end| end <= reg_len);
        if len == 0 || offset % PAGE_SIZE != 0 || !in_range {
            return Err(Error::InvalidWindow { offset, len });
        }
        Ok(RegisterWindow {
            phys: self.shared.config.reg_base + offset,
            len,
        })
    }

    pub fn clock_rate(&self) -> u64 {
        self.shared.power.control().clock_rate()
    }

    pub fn set_clock_rate(&self, hz: u64) -> Result<()> {
        self.shared.power.control().set_clock_rate(hz)?;
        info!("v2d: core clock set to {} Hz", hz);
        Ok(())
    }

    /// Stop both threads. Every job still queued or in flight has its fence
    /// signalled with [`JobError::Cancelled`].
    pub fn shutdown(&mut self) {
        let worker = match self.worker.take() {
            Some(worker) => worker,
            None => return,
        };
        let shared = &self.shared;

        {
            let _pending = shared.pending.lock();
            shared.running.store(false, Ordering::Release);
            shared.work_ready.notify_all();
        }
        if worker.join().is_err() {
            error!("v2d: worker thread panicked");
        }

        shared.drain_in_flight(
            shared.in_flight.lock(),
            FenceStatus::Error(JobError::Cancelled),
            false,
        );

        shared.completion.stop();
        if let Some(bottom_half) = self.bottom_half.take() {
            if bottom_half.join().is_err() {
                error!("v2d: completion thread panicked");
            }
        }

        let queued: Vec<Job> = shared.pending.lock().drain(..).collect();
        let cancelled = queued.len();
        for mut job in queued {
            job.finish(FenceStatus::Error(JobError::Cancelled));
        }
        info!("v2d: shut down, {} queued jobs cancelled", cancelled);
    }
}

impl Drop for V2dDevice {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Shared {
    fn running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    // ------------------------------------------------------------------
    // Worker
    // ------------------------------------------------------------------

    fn worker_loop(&self) {
        debug!("v2d: worker started");
        while self.wait_for_work() {
            if !self.acquire_slot() {
                break;
            }
            let job = self.pending.lock().pop_front();
            match job {
                Some(job) => self.run_job(job),
                None => self.slots.release(),
            }
        }
        debug!("v2d: worker exiting");
    }

    /// Block until a job is queued. Returns `false` on shutdown.
    fn wait_for_work(&self) -> bool {
        let mut pending = self.pending.lock();
        loop {
            if !self.running() {
                return false;
            }
            if !pending.is_empty() {
                return true;
            }
            self.work_ready.wait(&mut pending);
        }
    }

    /// Take an in-flight slot, running recovery each time the watchdog
    /// expires. Retries until it succeeds or the device shuts down.
    fn acquire_slot(&self) -> bool {
        let watchdog = self.config.watchdog_timeout;
        let mut deadline = Instant::now() + watchdog;
        loop {
            if !self.running() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                warn!(
                    "v2d: no free slot after {:?}, engine hung; recovering",
                    watchdog
                );
                PipelineStats::bump(&self.stats.watchdog_timeouts);
                self.recover();
                deadline = Instant::now() + watchdog;
                continue;
            }
            if self.slots.acquire_timeout((deadline - now).min(SHUTDOWN_POLL)) {
                return true;
            }
        }
    }

    fn run_job(&self, mut job: Job) {
        if let Some(fence) = job.in_fence.clone() {
            self.wait_in_fence(job.id, &fence);
        }

        // Shutdown may have begun while the producer was late
        if !self.running() {
            debug!("v2d: {} cancelled before dispatch", job.id);
            job.finish(FenceStatus::Error(JobError::Cancelled));
            self.slots.release();
            return;
        }

        // Mapping and triggering happen under the in-flight lock, so neither
        // completion nor recovery can reset the engine in between
        let mut in_flight = self.in_flight.lock();
        if self.unusable.load(Ordering::Acquire) {
            drop(in_flight);
            job.finish(FenceStatus::Error(JobError::DeviceUnusable));
            self.slots.release();
            return;
        }

        if self.power.get() {
            self.on_power_up();
        }

        match self.resolve(&mut job) {
            Ok(task) => {
                let awaiting = if job.params.destination.compressed {
                    IrqStatus::EOF | IrqStatus::FBCENC_DONE
                } else {
                    IrqStatus::EOF
                };
                let id = job.id;
                in_flight.push(job);
                self.stats.record_in_flight(in_flight.len());
                self.power.lock().arm(awaiting);
                PipelineStats::bump(&self.stats.dispatched);
                trace!("v2d: dispatching {}", id);
                self.platform.compositor.program(&task);
            }
            Err(err) => {
                warn!("v2d: {} failed to map buffers: {}", job.id, err);
                PipelineStats::bump(&self.stats.map_failures);
                job.error = Some(JobError::MapFailed);
                in_flight.push(job);
                drop(in_flight);
                self.completion.schedule();
            }
        }
    }

    /// Wait on a job's input fence, short then long. A producer that never
    /// signals must not stall the engine, so the job runs regardless.
    fn wait_in_fence(&self, id: JobId, fence: &Fence) {
        let short = self.config.fence_wait_short;
        match fence.wait(short) {
            WaitResult::Signaled(status) => {
                if !status.is_ok() {
                    debug!("v2d: {} input fence carried {:?}", id, status);
                }
                return;
            }
            WaitResult::Timeout => warn!(
                "v2d: {} input fence {}:{} not signalled after {:?}",
                id,
                fence.context(),
                fence.seqno(),
                short
            ),
        }
        if fence.wait(self.config.fence_wait_long) == WaitResult::Timeout {
            error!(
                "v2d: {} input fence {}:{} stuck, running without it",
                id,
                fence.context(),
                fence.seqno()
            );
        }
    }

    /// Pin every buffer of `job` and build the address-resolved task
    fn resolve(&self, job: &mut Job) -> Result<ResolvedTask> {
        let exporter = self.platform.exporter.as_ref();
        let regs = self.platform.regs.as_ref();
        let mut iommu = self.iommu.lock();
        let mut addrs = [None; SURFACE_SLOTS];

        for slot in SurfaceSlot::ALL {
            let fd = match job.params.surface(slot) {
                Some(surface) => surface.fd,
                None => continue,
            };
            let addr = job.bufs[slot.index()].acquire(exporter, &mut iommu, regs, slot, fd)?;
            addrs[slot.index()] = Some(addr);
        }

        Ok(ResolvedTask {
            job: job.id,
            params: job.params.clone(),
            addrs,
        })
    }

    /// Clock just came up: interrupts and the IOMMU start from scratch
    fn on_power_up(&self) {
        let regs = self.platform.regs.as_ref();
        regs.write(V2D_IRQ_STATUS, IrqStatus::all().bits());
        regs.write(V2D_IRQ_ENABLE, (IrqStatus::DONE | IrqStatus::ERRORS).bits());
        self.iommu.lock().init_hw(regs);
    }

    // ------------------------------------------------------------------
    // Interrupt fast path
    // ------------------------------------------------------------------

    fn handle_irq(&self) -> bool {
        let regs = self.platform.regs.as_ref();
        let mut state = self.power.lock();

        let status = IrqStatus::from_bits_truncate(regs.read(V2D_IRQ_STATUS));
        if state.refcount == 0 || status.is_empty() {
            PipelineStats::bump(&self.stats.spurious_irqs);
            trace!("v2d: spurious irq, status {:?}", status);
            return false;
        }

        // Latched IOMMU state must be cleared before the top-level bit
        if status.contains(IrqStatus::MMU_FAULT) {
            iommu::report_faults(regs, self.config.tbu_count);
            PipelineStats::bump(&self.stats.mmu_faults);
        }
        regs.write(
            V2D_IRQ_STATUS,
            (status & (IrqStatus::ERRORS | IrqStatus::DONE)).bits(),
        );

        if status.intersects(IrqStatus::ERRORS) {
            error!(
                "v2d: engine error {:?}, detail {:#x}",
                status,
                regs.read(V2D_ERR_DETAIL)
            );
            state.fault();
            PipelineStats::bump(&self.stats.hw_faults);
        }

        let done = state.note_done(status & IrqStatus::DONE);
        let wake = done || state.engine == EngineState::Faulted;
        drop(state);

        if wake {
            if self.irq_tokens.push(status).is_err() {
                trace!("v2d: irq token queue full, coalescing");
            }
            self.completion.schedule();
        }
        true
    }

    // ------------------------------------------------------------------
    // Completion path
    // ------------------------------------------------------------------

    fn completion_loop(&self) {
        debug!("v2d: completion thread started");
        while self.completion.wait() {
            self.complete_jobs();
            self.completion.done();
        }
        debug!("v2d: completion thread exiting");
    }

    fn complete_jobs(&self) {
        let mut seen = IrqStatus::empty();
        while let Some(status) = self.irq_tokens.pop() {
            seen |= status;
        }

        // The list stays locked until the reset is done, so the worker cannot
        // trigger a frame that the reset would then wipe
        let mut in_flight = self.in_flight.lock();
        let (finished, faulted, reset) = {
            let mut state = self.power.lock();
            let (finished, faulted) = state.take_finished();
            (finished, faulted, std::mem::take(&mut state.reset_pending))
        };

        // Jobs that failed before dispatch are always done; dispatched ones
        // finish oldest first
        let mut budget = finished;
        let mut done = Vec::new();
        for job in std::mem::take(&mut *in_flight) {
            if job.error.is_some() {
                done.push(job);
            } else if budget > 0 {
                budget -= 1;
                done.push(job);
            } else {
                in_flight.push(job);
            }
        }
        if done.is_empty() && !reset {
            return;
        }
        trace!(
            "v2d: completing {} jobs, irq {:?}, reset {}",
            done.len(),
            seen,
            reset
        );

        let status = if faulted {
            FenceStatus::Error(JobError::HardwareFault)
        } else {
            FenceStatus::Signaled
        };
        self.finish_jobs(&mut done, status);
        if in_flight.is_empty() {
            self.iommu.lock().unmap_end(self.platform.regs.as_ref());
        }
        // Reset needs the clock, so it runs before the power references go
        if reset {
            self.hw_reset();
        }
        drop(in_flight);
        self.release_jobs(done);
    }

    /// Release each job's buffers and signal its fence. Jobs that already
    /// carry an error keep it; the rest get `status`.
    fn finish_jobs(&self, jobs: &mut [Job], status: FenceStatus) {
        let exporter = self.platform.exporter.as_ref();
        for job in jobs.iter_mut() {
            job.release_buffers(exporter);
            let disposition = match job.error {
                Some(err) => FenceStatus::Error(err),
                None => status,
            };
            debug!("v2d: {} done: {:?}", job.id, disposition);
            job.finish(disposition);
            PipelineStats::bump(&self.stats.completed);
        }
    }

    /// Drop the power reference and the slot each finished job held
    fn release_jobs(&self, jobs: Vec<Job>) {
        for _ in jobs {
            self.power.put();
            self.slots.release();
        }
    }

    /// Drain the whole in-flight list with `status`. With `reset`, the engine
    /// is reset before the drained jobs give back their slots.
    fn drain_in_flight(
        &self,
        mut in_flight: MutexGuard<'_, Vec<Job>>,
        status: FenceStatus,
        reset: bool,
    ) {
        let mut jobs = std::mem::take(&mut *in_flight);
        self.power.lock().clear_frames();

        self.finish_jobs(&mut jobs, status);
        self.iommu.lock().unmap_end(self.platform.regs.as_ref());
        if reset {
            self.hw_reset();
            // A late error interrupt from a drained frame is covered too
            let mut state = self.power.lock();
            if matches!(state.engine, EngineState::TimedOut | EngineState::Faulted) {
                state.engine = EngineState::Idle;
            }
            state.reset_pending = false;
        }
        drop(in_flight);
        self.release_jobs(jobs);
    }

    // ------------------------------------------------------------------
    // Recovery
    // ------------------------------------------------------------------

    fn recover(&self) {
        let in_flight = self.in_flight.lock();
        {
            let mut state = self.power.lock();
            if state.engine != EngineState::Unusable {
                state.engine = EngineState::TimedOut;
            }
            state.reset_pending = false;
        }

        let regs = self.platform.regs.as_ref();
        warn!(
            "v2d: recovery: draining {} jobs, irq {:#x} detail {:#x} state {:#x}",
            in_flight.len(),
            regs.read(V2D_IRQ_STATUS),
            regs.read(V2D_ERR_DETAIL),
            regs.read(V2D_DEBUG_STATE)
        );

        self.drain_in_flight(in_flight, FenceStatus::Error(JobError::Timeout), true);

        if !self.completion.flush(FLUSH_TIMEOUT) {
            warn!("v2d: completion work still running after recovery");
        }
    }

    /// Soft-reset the engine. Polls the busy bit at most `reset_poll_limit`
    /// times; a reset that never finishes leaves the device unusable.
    fn hw_reset(&self) -> bool {
        let regs = self.platform.regs.as_ref();
        self.power.get();

        regs.write(V2D_GLOBAL_RESET, RESET_BUSY);
        let mut polls = 0u32;
        while regs.read(V2D_GLOBAL_RESET) & RESET_BUSY != 0 {
            polls += 1;
            if polls >= self.config.reset_poll_limit {
                error!(
                    "v2d: reset still busy after {} polls, device unusable",
                    polls
                );
                self.unusable.store(true, Ordering::Release);
                self.power.lock().engine = EngineState::Unusable;
                self.power.put();
                return false;
            }
            std::hint::spin_loop();
        }

        PipelineStats::bump(&self.stats.resets);
        self.on_power_up();
        self.power.put();
        info!("v2d: engine reset done after {} polls", polls);
        true
    }
}
