// Copyright 2024 vdigitizer Authors
// SPDX-License-Identifier: Apache-2.0

//! Process-wide stop latch
//!
//! Set once by the signal handler, observed by the supervisor, the mainloop
//! and every worker thread. Reads are a single atomic load; blocking waits
//! park on a condition variable and wake as soon as the latch is asserted.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct Latch {
    asserted: AtomicBool,
    lock: Mutex<()>,
    cond: Condvar,
}

/// Shared stop signal handle
///
/// Cloning is cheap and every clone observes the same latch. Once set it
/// stays set.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    latch: Arc<Latch>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check whether shutdown was requested
    pub fn is_set(&self) -> bool {
        self.latch.asserted.load(Ordering::Acquire)
    }

    /// Request shutdown and wake every waiter
    pub fn set(&self) {
        self.latch.asserted.store(true, Ordering::Release);
        let _guard = self.latch.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.latch.cond.notify_all();
    }

    /// Block until the latch is set or `timeout` elapses.
    ///
    /// Returns the latch state on return.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.latch.lock.lock().unwrap_or_else(PoisonError::into_inner);
        while !self.is_set() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            guard = self
                .latch
                .cond
                .wait_timeout(guard, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        self.is_set()
    }

    /// Block until the latch is set or `keep_waiting` returns `false`.
    ///
    /// `keep_waiting` is evaluated under the latch lock. Whoever changes the
    /// state it reads must call [`StopSignal::wake_all`] afterwards.
    pub fn wait_while<F: FnMut() -> bool>(&self, mut keep_waiting: F) {
        let mut guard = self.latch.lock.lock().unwrap_or_else(PoisonError::into_inner);
        while !self.is_set() && keep_waiting() {
            guard = self
                .latch
                .cond
                .wait(guard)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Wake every waiter without setting the latch
    pub fn wake_all(&self) {
        let _guard = self.latch.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.latch.cond.notify_all();
    }

    /// Block until the latch is set
    pub fn wait(&self) {
        let mut guard = self.latch.lock.lock().unwrap_or_else(PoisonError::into_inner);
        while !self.is_set() {
            guard = self
                .latch
                .cond
                .wait(guard)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}
