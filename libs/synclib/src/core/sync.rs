// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Wait/wake primitive for bounded blocking.
//!
//! A manual-reset event: once set it stays set until explicitly reset, and
//! any number of waiters observe it. Used for the coordinator-wide
//! "synchronization may have completed" broadcast and for the per-stream
//! abortable decode-window wait. Waiters must treat a wakeup as a hint and
//! re-check their actual condition; the broadcast is fire-and-forget.

use parking_lot::{Condvar, Mutex};
use std::time::Duration;

pub struct ManualResetEvent {
    signalled: Mutex<bool>,
    cond: Condvar,
}

impl ManualResetEvent {
    pub fn new() -> Self {
        Self {
            signalled: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    /// Signal the event and wake every waiter. The event stays signalled
    /// until [`reset`](Self::reset).
    pub fn set(&self) {
        let mut signalled = self.signalled.lock();
        *signalled = true;
        self.cond.notify_all();
    }

    /// Clear the signal. Waiters already woken are unaffected.
    pub fn reset(&self) {
        *self.signalled.lock() = false;
    }

    pub fn is_set(&self) -> bool {
        *self.signalled.lock()
    }

    /// Block until the event is signalled or `timeout` elapses.
    ///
    /// Returns `true` if the event was signalled (including before entry),
    /// `false` on timeout.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let mut signalled = self.signalled.lock();
        if *signalled {
            return true;
        }
        let deadline = std::time::Instant::now() + timeout;
        while !*signalled {
            if self.cond.wait_until(&mut signalled, deadline).timed_out() {
                return *signalled;
            }
        }
        true
    }
}

impl Default for ManualResetEvent {
    fn default() -> Self {
        Self::new()
    }
}
