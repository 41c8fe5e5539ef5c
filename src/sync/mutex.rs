//! Priority-inheriting mutex.
//!
//! Grounded in `original_source/my_pthread_t.h`'s `my_pthread_mutex_t`
//! (`guard`, `locker`, `waiters`) and `my_pthread.c`'s
//! `my_pthread_mutex_lock`/`_unlock`. `Mutex` only owns the bookkeeping —
//! whose turn it is, who is waiting, what priority to restore. The actual
//! context switch and ready-queue requeueing is driven by whoever calls
//! these methods (`crate::Runtime`), the same split `kwast-os-kwast` draws
//! between `sync::wait_queue::WaitQueue` (pure queue) and
//! `tasking::scheduler::Scheduler` (the thing that actually switches
//! contexts). A `Mutex` never reads a thread's priority out of the thread
//! table itself — callers pass it in, since the table is owned elsewhere.

use std::collections::VecDeque;

use super::spin::GuardFlag;
use crate::tasking::thread::Priority;
use crate::tasking::ThreadId;

/// What a caller must do after a `lock` call that didn't immediately
/// succeed.
pub struct Inherit {
    /// The current owner, whose priority should be raised to `to`.
    pub owner: ThreadId,
    pub to: Priority,
}

pub enum LockOutcome {
    /// The mutex was free; `by` is now the owner.
    Acquired,
    /// The mutex was held; `by` has been enqueued as a waiter and must be
    /// descheduled by the caller. `inherit` is set when `by` is
    /// higher-priority (numerically lower) than the owner's current
    /// effective priority, in which case the owner's priority must be
    /// raised to `inherit.to` before rescheduling it.
    Blocked { inherit: Option<Inherit> },
}

/// What a caller must do after `unlock`.
pub struct UnlockOutcome {
    /// Restore the previous owner's priority to this, if it had been
    /// raised by inheritance while it held the mutex.
    pub restore_priority: Option<Priority>,
    /// The next owner to wake and make ready, if any waiter was queued.
    pub wake: Option<ThreadId>,
}

pub struct Mutex {
    guard: GuardFlag,
    owner: Option<ThreadId>,
    waiters: VecDeque<(ThreadId, Priority)>,
    /// The owner's priority before inheritance raised it. `None` means the
    /// current owner is still running at its own natural priority.
    original_priority: Option<Priority>,
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

impl Mutex {
    pub const fn new() -> Self {
        Self {
            guard: GuardFlag::new(),
            owner: None,
            waiters: VecDeque::new(),
            original_priority: None,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.owner.is_some()
    }

    pub fn owner(&self) -> Option<ThreadId> {
        self.owner
    }

    /// Attempts to lock the mutex on behalf of `by`, whose current
    /// effective priority is `by_priority`. `owner_priority` is the
    /// current owner's effective priority, as read by the caller out of
    /// the thread table (ignored if the mutex is free). Uses the guard
    /// byte exactly as `my_pthread_mutex_lock` does: spin for exclusive
    /// access to the mutex's own bookkeeping, not for the mutex itself.
    pub fn lock(&mut self, by: ThreadId, by_priority: Priority, owner_priority: Priority) -> LockOutcome {
        let handle = self.guard.acquire();
        let outcome = match self.owner {
            None => {
                self.owner = Some(by);
                LockOutcome::Acquired
            }
            Some(owner) => {
                let inherit = if by_priority < owner_priority {
                    if self.original_priority.is_none() {
                        self.original_priority = Some(owner_priority);
                    }
                    Some(Inherit {
                        owner,
                        to: by_priority,
                    })
                } else {
                    None
                };
                self.waiters.push_back((by, by_priority));
                LockOutcome::Blocked { inherit }
            }
        };
        drop(handle);
        outcome
    }

    /// Unlocks on behalf of `by`. A no-op (spec.md §7's "unlock by
    /// non-owner") if `by` does not currently hold the mutex — returns an
    /// outcome with nothing to restore and nothing to wake.
    pub fn unlock(&mut self, by: ThreadId) -> UnlockOutcome {
        let handle = self.guard.acquire();
        let outcome = if self.owner != Some(by) {
            UnlockOutcome {
                restore_priority: None,
                wake: None,
            }
        } else {
            let restore_priority = self.original_priority.take();
            match self.waiters.pop_front() {
                Some((next, _)) => {
                    self.owner = Some(next);
                    UnlockOutcome {
                        restore_priority,
                        wake: Some(next),
                    }
                }
                None => {
                    self.owner = None;
                    UnlockOutcome {
                        restore_priority,
                        wake: None,
                    }
                }
            }
        };
        drop(handle);
        outcome
    }

    /// Destroys the mutex. A no-op (spec.md §7's "double destroy"/"destroy
    /// while locked") if it is currently held or has waiters; returns
    /// `true` if destruction actually happened.
    pub fn destroy(&mut self) -> bool {
        let handle = self.guard.acquire();
        let destroyed = self.owner.is_none() && self.waiters.is_empty();
        drop(handle);
        destroyed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u64) -> ThreadId {
        // ThreadId has no public constructor outside `next()`; tests reach
        // into its transparent repr via transmute, the same identity trick
        // the original C tests use raw tcb pointers for.
        unsafe { std::mem::transmute::<u64, ThreadId>(n) }
    }

    #[test]
    fn uncontended_lock_acquires_immediately() {
        let mut m = Mutex::new();
        match m.lock(id(1), 0, 0) {
            LockOutcome::Acquired => {}
            LockOutcome::Blocked { .. } => panic!("expected immediate acquisition"),
        }
        assert_eq!(m.owner(), Some(id(1)));
    }

    #[test]
    fn second_locker_blocks_and_queues_p7() {
        let mut m = Mutex::new();
        let _ = m.lock(id(1), 1, 1);
        match m.lock(id(2), 0, 1) {
            LockOutcome::Blocked { inherit } => {
                let inherit = inherit.expect("higher priority waiter should inherit");
                assert_eq!(inherit.owner, id(1));
                assert_eq!(inherit.to, 0);
            }
            LockOutcome::Acquired => panic!("mutex was held, should not acquire"),
        }
    }

    #[test]
    fn lower_priority_waiter_does_not_inherit() {
        let mut m = Mutex::new();
        let _ = m.lock(id(1), 0, 0);
        match m.lock(id(2), 2, 0) {
            LockOutcome::Blocked { inherit } => assert!(inherit.is_none()),
            LockOutcome::Acquired => panic!("mutex was held, should not acquire"),
        }
    }

    #[test]
    fn unlock_hands_off_to_next_waiter() {
        let mut m = Mutex::new();
        let _ = m.lock(id(1), 1, 1);
        let _ = m.lock(id(2), 0, 1);
        let out = m.unlock(id(1));
        assert_eq!(out.wake, Some(id(2)));
        assert_eq!(out.restore_priority, Some(1));
        assert_eq!(m.owner(), Some(id(2)));
    }

    #[test]
    fn unlock_by_non_owner_is_a_no_op() {
        let mut m = Mutex::new();
        let _ = m.lock(id(1), 0, 0);
        let out = m.unlock(id(2));
        assert!(out.wake.is_none());
        assert_eq!(m.owner(), Some(id(1)));
    }

    #[test]
    fn destroy_while_locked_is_a_no_op() {
        let mut m = Mutex::new();
        let _ = m.lock(id(1), 0, 0);
        assert!(!m.destroy());
        let _ = m.unlock(id(1));
        assert!(m.destroy());
    }
}
