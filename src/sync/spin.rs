//! A single-byte test-and-set guard, used both as the scheduler's
//! re-entrancy guard (`block` in the original) and as each mutex's guard
//! byte. Unlike a general-purpose spinlock, this does not wrap a payload —
//! the data it protects (queues, TCB fields) lives in ordinary fields next
//! to it and is only touched while the flag is held, by convention.
//!
//! Grounded in the same test-and-set discipline as the original's
//! `__sync_lock_test_and_set`/`__sync_val_compare_and_swap` calls.

use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Default)]
pub struct GuardFlag(AtomicBool);

impl GuardFlag {
    pub const fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    /// Spins until the flag is claimed, then returns a guard that releases
    /// it on drop.
    pub fn acquire(&self) -> GuardHandle<'_> {
        while self
            .0
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.0.load(Ordering::Relaxed) {
                std::hint::spin_loop();
            }
        }
        GuardHandle(self)
    }

    /// Attempts to atomically claim the flag (`0 -> 1`). Returns `true` if
    /// this call claimed it — used by the scheduler, which must return
    /// immediately rather than spin when re-entered from a signal handler.
    pub fn try_claim(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Unconditionally claims the flag without checking its previous
    /// value — the Rust analogue of the original's bare `block = 1;`
    /// assignment at the top of a public API entry point. Only safe where
    /// the caller knows the flag cannot already be held by anyone but a
    /// signal handler, which backs off via `try_claim` instead of spinning.
    pub fn claim(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn release(&self) {
        self.0.store(false, Ordering::Release);
    }

    pub fn is_held(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[must_use]
pub struct GuardHandle<'a>(&'a GuardFlag);

impl Drop for GuardHandle<'_> {
    fn drop(&mut self) {
        self.0.release();
    }
}
