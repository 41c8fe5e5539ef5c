//! The public, priority-inheriting mutex (spec.md §4.2 / §6).
//!
//! This is the thin glue layer `sync::mutex::Mutex`'s own doc comment
//! anticipates: the bookkeeping (who owns it, who's waiting, what priority
//! to restore) lives in [`crate::sync::Mutex`]; this type adds the
//! scheduler calls that bookkeeping implies — blocking the caller,
//! applying priority inheritance, and waking the next owner — the same
//! split `my_pthread_mutex_lock`/`_unlock` don't have (the original
//! inlines scheduler and mutex logic together) but `kwast-os-kwast` does
//! between its `sync` and `tasking` modules.

use std::cell::UnsafeCell;

use crate::runtime;
use crate::sync::mutex::{LockOutcome, Mutex as Inner};
use crate::tasking::thread::ThreadState;

pub struct Mutex(UnsafeCell<Inner>);

// Safety: all access to the inner `Inner` happens while `Runtime`'s
// scheduler guard is effectively held (we're the single OS thread driving
// it), never concurrently — see spec.md §5.
unsafe impl Sync for Mutex {}
unsafe impl Send for Mutex {}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

impl Mutex {
    pub const fn new() -> Self {
        Self(UnsafeCell::new(Inner::new()))
    }

    /// `mutex_lock` (spec.md §4.2). Blocks until acquired. If the mutex is
    /// already held and the caller is higher-priority (numerically lower)
    /// than the owner's current effective priority, the owner's priority
    /// is raised to match (priority inheritance) before the caller
    /// deschedules. Returns once this thread is the owner — either right
    /// away (uncontended) or after being woken by `unlock`, which hands
    /// ownership directly to the next waiter without this thread needing
    /// to retry.
    pub fn lock(&self) {
        let decision = runtime::with_runtime_mut(|rt| {
            rt.scheduler.enter_guarded();
            let me = rt.current().expect("Mutex::lock() called with no current thread");
            let inner = unsafe { &mut *self.0.get() };
            let me_priority = rt
                .scheduler
                .priority_of(me)
                .expect("current thread missing from scheduler");
            let owner_priority = inner
                .owner()
                .and_then(|o| rt.scheduler.priority_of(o))
                .unwrap_or(me_priority);

            match inner.lock(me, me_priority, owner_priority) {
                LockOutcome::Acquired => {
                    rt.scheduler.leave_guarded();
                    None
                }
                LockOutcome::Blocked { inherit } => {
                    if let Some(inherit) = inherit {
                        rt.scheduler.set_priority(inherit.owner, inherit.to);
                    }
                    rt.scheduler.block(me, ThreadState::BlockedOnMutex);
                    Some(rt.scheduler.on_current_left())
                }
            }
        });
        if let Some(decision) = decision {
            runtime::with_runtime_mut(|rt| rt.apply_decision(decision));
        }
    }

    /// `mutex_unlock` (spec.md §4.2). A no-op if the caller isn't the
    /// recorded owner (spec.md §7's "unlock by non-owner"). Hands
    /// ownership to the oldest waiter, if any, continuing priority
    /// inheritance at the unlocking thread's current (possibly inherited)
    /// level, then restores the unlocking thread's own priority if it had
    /// been raised while it held the mutex.
    ///
    /// The scheduler guard is claimed before `inner.unlock` and held across
    /// the wake/restore calls below, the same bracket `Mutex::lock` uses —
    /// without it a timer tick landing mid-`wake` (a `push_back` into a
    /// ready queue) could re-enter the scheduler through `on_timer_tick`
    /// and pop a half-mutated queue.
    pub fn unlock(&self) {
        runtime::with_runtime_mut(|rt| {
            rt.scheduler.enter_guarded();
            let me = rt.current().expect("Mutex::unlock() called with no current thread");
            let priority_before_restore = rt
                .scheduler
                .priority_of(me)
                .expect("current thread missing from scheduler");
            let inner = unsafe { &mut *self.0.get() };
            let outcome = inner.unlock(me);

            if let Some(next_owner) = outcome.wake {
                rt.scheduler.set_priority(next_owner, priority_before_restore);
                rt.scheduler.wake(next_owner);
            }
            if let Some(original) = outcome.restore_priority {
                rt.scheduler.set_priority(me, original);
            }
            rt.scheduler.leave_guarded();
        });
    }

    /// `mutex_destroy` (spec.md §4.2). A no-op if the mutex is currently
    /// held or has waiters (spec.md §7's "destroy of an already-destroyed
    /// mutex" / "Lock state on a destroyed mutex is undefined").
    pub fn destroy(&self) -> bool {
        unsafe { &mut *self.0.get() }.destroy()
    }

    pub fn is_locked(&self) -> bool {
        unsafe { &*self.0.get() }.is_locked()
    }
}
