// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Device state and reference-counted clock gating
//!
//! The state lock is a spinlock: the interrupt fast path takes it to decide
//! whether an interrupt belongs to us, so it must never sleep while held.

use std::collections::VecDeque;
use std::sync::Arc;

use log::{debug, error};
use spin::{Mutex as SpinMutex, MutexGuard as SpinMutexGuard};

use crate::hw::PowerControl;
use crate::regs::IrqStatus;

/// Engine state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    /// A frame has been triggered and not yet reported done
    Dispatched,
    /// Done interrupt seen, completion work pending
    Completed,
    /// Error interrupt seen, reset pending
    Faulted,
    /// Drained by the watchdog
    TimedOut,
    /// Reset never completed; terminal
    Unusable,
}

/// Everything guarded by the device lock
#[derive(Debug)]
pub struct DeviceState {
    pub refcount: u32,
    pub engine: EngineState,
    pub reset_pending: bool,
    /// Done bits each triggered frame still needs, oldest first
    frames: VecDeque<IrqStatus>,
    /// Done bits seen so far for the oldest frame
    seen: IrqStatus,
    /// Frames reported done but not yet handed to the completion path
    finished: usize,
}

impl DeviceState {
    fn new() -> Self {
        Self {
            refcount: 0,
            engine: EngineState::Idle,
            reset_pending: false,
            frames: VecDeque::new(),
            seen: IrqStatus::empty(),
            finished: 0,
        }
    }

    /// Track a freshly triggered frame that completes once `awaiting` is seen.
    ///
    /// A completion or fault not yet handled stays visible.
    pub fn arm(&mut self, awaiting: IrqStatus) {
        if self.frames.is_empty() {
            self.seen = IrqStatus::empty();
        }
        self.frames.push_back(awaiting);
        if self.engine == EngineState::Idle {
            self.engine = EngineState::Dispatched;
        }
    }

    /// Account done bits against the oldest frames. Returns `true` if at
    /// least one frame finished.
    pub fn note_done(&mut self, bits: IrqStatus) -> bool {
        if self.frames.is_empty() {
            return false;
        }
        self.seen |= bits;
        let mut any = false;
        while let Some(&need) = self.frames.front() {
            if !self.seen.contains(need) {
                break;
            }
            self.frames.pop_front();
            self.seen.remove(need);
            self.finished += 1;
            any = true;
        }
        if any && self.engine == EngineState::Dispatched {
            self.engine = EngineState::Completed;
        }
        any
    }

    /// Error interrupt: every frame on the engine is lost and a reset is due
    pub fn fault(&mut self) {
        if self.engine != EngineState::Unusable {
            self.engine = EngineState::Faulted;
        }
        self.reset_pending = true;
    }

    /// Hand finished frames to the completion path. Returns how many of the
    /// oldest dispatched jobs are done and whether they faulted; a fault
    /// takes every frame still on the engine.
    pub fn take_finished(&mut self) -> (usize, bool) {
        let faulted = self.engine == EngineState::Faulted;
        let mut count = std::mem::take(&mut self.finished);
        if faulted {
            count += self.frames.len();
            self.frames.clear();
            self.seen = IrqStatus::empty();
        }
        if matches!(self.engine, EngineState::Faulted | EngineState::Completed) {
            self.engine = if self.frames.is_empty() {
                EngineState::Idle
            } else {
                EngineState::Dispatched
            };
        }
        (count, faulted)
    }

    /// Forget every frame; used when the in-flight list is drained wholesale
    pub fn clear_frames(&mut self) {
        self.frames.clear();
        self.seen = IrqStatus::empty();
        self.finished = 0;
        if matches!(self.engine, EngineState::Dispatched | EngineState::Completed) {
            self.engine = EngineState::Idle;
        }
    }

    /// Frames triggered and not yet reported done
    pub fn frames_on_engine(&self) -> usize {
        self.frames.len()
    }
}

pub struct Power {
    state: SpinMutex<DeviceState>,
    control: Arc<dyn PowerControl>,
}

impl Power {
    pub fn new(control: Arc<dyn PowerControl>) -> Self {
        Self {
            state: SpinMutex::new(DeviceState::new()),
            control,
        }
    }

    /// Take the device lock
    pub fn lock(&self) -> SpinMutexGuard<'_, DeviceState> {
        self.state.lock()
    }

    /// Take a power reference. Returns `true` if this call ungated the clock.
    pub fn get(&self) -> bool {
        let mut state = self.state.lock();
        state.refcount += 1;
        if state.refcount == 1 {
            self.control.enable();
            debug!("v2d: clock on");
            return true;
        }
        false
    }

    /// Drop a power reference. Returns `true` if this call gated the clock.
    pub fn put(&self) -> bool {
        let mut state = self.state.lock();
        match state.refcount {
            0 => {
                error!("v2d: power reference underflow");
                false
            }
            1 => {
                state.refcount = 0;
                self.control.disable();
                debug!("v2d: clock off");
                true
            }
            _ => {
                state.refcount -= 1;
                false
            }
        }
    }

    pub fn refcount(&self) -> u32 {
        self.state.lock().refcount
    }

    pub fn engine_state(&self) -> EngineState {
        self.state.lock().engine
    }

    pub fn control(&self) -> &Arc<dyn PowerControl> {
        &self.control
    }
}
