//! Thread control block.
//!
//! Grounded in `original_source/my_pthread_t.h`'s `tcb` struct and
//! `kwast-os-kwast`'s `tasking::thread::{Thread, ThreadId}` split between a
//! per-thread record and a small newtype identifier handed out to callers.

use std::ffi::c_void;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::arch::{self, Context};
use crate::config::PRIORITY_LEVELS;

/// Opaque handle returned by [`crate::create`], analogous to `my_pthread_t`.
#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
#[repr(transparent)]
pub struct ThreadId(u64);

impl ThreadId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// A thread's stack. Always allocated out of the arena's library partition
/// (spec.md §3: "Stack is allocated by the library partition and freed on
/// join"), independent of where the TCB record itself lives.
#[derive(Debug)]
pub struct Stack {
    pub base: *mut u8,
    pub size: usize,
}

// Safety: a Stack's pointer is only ever touched while the scheduler guard
// is held, by whichever single OS thread is running the runtime.
unsafe impl Send for Stack {}

/// Priority level 0 is highest; demotion increments the level, wrapping
/// back to 0 at `PRIORITY_LEVELS - 1` (the "maintenance cycle", spec.md §4.1
/// and §9's resolved priority convention).
pub type Priority = u8;

pub const HIGHEST_PRIORITY: Priority = 0;
pub const LOWEST_PRIORITY: Priority = (PRIORITY_LEVELS - 1) as Priority;

/// Where a thread is currently sitting, for debugging/assertions only — the
/// authoritative state is "which queue (if any) holds this id", not a field
/// on the TCB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Ready,
    Running,
    BlockedOnMutex,
    BlockedOnJoin,
    Done,
}

pub struct Tcb {
    pub id: ThreadId,
    pub context: Context,
    pub stack: Stack,
    pub state: ThreadState,
    pub priority: Priority,
    pub last_dispatch: Instant,
    /// Set once `exit` has run.
    pub done: bool,
    pub retval: *mut c_void,
    /// The single joiner slot (spec.md §9: a weak back-reference, not an
    /// owning pointer — the joiner owns itself via whatever queue it's in).
    pub joiner: Option<ThreadId>,
}

// Safety: see `Stack`.
unsafe impl Send for Tcb {}

impl Tcb {
    pub fn new(id: ThreadId, stack: Stack) -> Self {
        Self {
            id,
            context: arch::zeroed_context(),
            stack,
            state: ThreadState::Ready,
            priority: HIGHEST_PRIORITY,
            last_dispatch: Instant::now(),
            done: false,
            retval: std::ptr::null_mut(),
            joiner: None,
        }
    }

    /// Demotes this thread's priority by one level, wrapping to the highest
    /// priority at the bottom (spec.md §4.1's "maintenance cycle").
    pub fn demote(&mut self) {
        self.priority = if self.priority < LOWEST_PRIORITY {
            self.priority + 1
        } else {
            HIGHEST_PRIORITY
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// P7 (scheduler fairness, weak): a thread demoted all the way to
    /// `LOWEST_PRIORITY` wraps back to `HIGHEST_PRIORITY` (PQ[0]) on its
    /// next demotion, rather than staying pinned at the bottom forever.
    #[test]
    fn demote_wraps_from_lowest_back_to_highest_p7() {
        let mut tcb = Tcb::new(ThreadId::next(), Stack { base: std::ptr::null_mut(), size: 0 });
        assert_eq!(tcb.priority, HIGHEST_PRIORITY);
        for _ in 0..LOWEST_PRIORITY {
            tcb.demote();
        }
        assert_eq!(tcb.priority, LOWEST_PRIORITY);
        tcb.demote();
        assert_eq!(tcb.priority, HIGHEST_PRIORITY);
    }
}
