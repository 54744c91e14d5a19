// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Deferred work item
//!
//! A single coalescing work item, serviced by one dedicated thread.
//! Scheduling while already pending is a no-op; [`WorkItem::flush`] waits
//! until nothing is pending or running.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct WorkState {
    pending: bool,
    running: bool,
    stopped: bool,
}

pub struct WorkItem {
    state: Mutex<WorkState>,
    changed: Condvar,
}

impl WorkItem {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(WorkState::default()),
            changed: Condvar::new(),
        }
    }

    /// Queue the work. Returns `false` if it was already pending.
    pub fn schedule(&self) -> bool {
        let mut state = self.state.lock();
        if state.pending || state.stopped {
            return false;
        }
        state.pending = true;
        self.changed.notify_all();
        true
    }

    /// Block the servicing thread until work is pending. Marks it running
    /// and returns `true`, or returns `false` once the item is stopped.
    pub fn wait(&self) -> bool {
        let mut state = self.state.lock();
        loop {
            if state.pending {
                state.pending = false;
                state.running = true;
                return true;
            }
            if state.stopped {
                return false;
            }
            self.changed.wait(&mut state);
        }
    }

    /// Called by the servicing thread after a run
    pub fn done(&self) {
        let mut state = self.state.lock();
        state.running = false;
        self.changed.notify_all();
    }

    /// Wait until the work is neither pending nor running.
    ///
    /// Returns `false` if `timeout` elapsed first.
    pub fn flush(&self, timeout: Duration) -> bool {
        let mut state = self.state.lock();
        let busy = |s: &mut WorkState| (s.pending || s.running) && !s.stopped;
        self.changed.wait_while_for(&mut state, busy, timeout);
        !busy(&mut *state)
    }

    /// Stop the servicing thread after it finishes any pending run
    pub fn stop(&self) {
        let mut state = self.state.lock();
        state.stopped = true;
        self.changed.notify_all();
    }
}

impl Default for WorkItem {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_schedule_coalesces() {
        let work = WorkItem::new();
        assert!(work.schedule());
        assert!(!work.schedule());
        assert!(work.wait());
        work.done();
        assert!(work.flush(Duration::ZERO));
    }

    #[test]
    fn test_flush_waits_for_run() {
        let work = Arc::new(WorkItem::new());
        let runs = Arc::new(AtomicUsize::new(0));
        let servicer = {
            let work = Arc::clone(&work);
            let runs = Arc::clone(&runs);
            thread::spawn(move || {
                while work.wait() {
                    thread::sleep(Duration::from_millis(10));
                    runs.fetch_add(1, Ordering::SeqCst);
                    work.done();
                }
            })
        };

        work.schedule();
        assert!(work.flush(Duration::from_secs(5)));
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        work.stop();
        servicer.join().unwrap();
        assert!(!work.schedule());
    }
}
