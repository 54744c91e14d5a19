// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Counting semaphore bounding the number of in-flight jobs

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

pub struct Semaphore {
    permits: Mutex<usize>,
    capacity: usize,
    available: Condvar,
}

impl Semaphore {
    pub fn new(capacity: usize) -> Self {
        Self {
            permits: Mutex::new(capacity),
            capacity,
            available: Condvar::new(),
        }
    }

    /// Take one permit, waiting at most `timeout`. Returns `false` on timeout.
    pub fn acquire_timeout(&self, timeout: Duration) -> bool {
        let mut permits = self.permits.lock();
        self.available
            .wait_while_for(&mut permits, |p| *p == 0, timeout);
        if *permits == 0 {
            return false;
        }
        *permits -= 1;
        true
    }

    /// Return one permit
    pub fn release(&self) {
        let mut permits = self.permits.lock();
        if *permits >= self.capacity {
            log::error!("v2d: semaphore released above capacity {}", self.capacity);
            return;
        }
        *permits += 1;
        self.available.notify_one();
    }

    pub fn available(&self) -> usize {
        *self.permits.lock()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
