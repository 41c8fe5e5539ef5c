//! The multi-level feedback scheduler.
//!
//! Grounded in `original_source/my_pthread.c`'s `initializePQs`,
//! `enqueue`/`dequeue`/`getNextTcb`, and `schedule(int signum)`, restructured
//! around an owning `Scheduler` the way `kwast-os-kwast`'s
//! `tasking::scheduler::Scheduler` owns a `HashMap<ThreadId, Thread>` plus a
//! run queue instead of the original's raw `tcb*` linked lists.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use log::{debug, trace};

use crate::arch::{self, Context};
use crate::config::{RuntimeConfig, PRIORITY_LEVELS};
use crate::sync::GuardFlag;

use super::thread::{Priority, Stack, Tcb, ThreadId, ThreadState, HIGHEST_PRIORITY};

/// What the caller (the timer signal handler, or a voluntary yield) must do
/// after a scheduling decision.
#[derive(Debug)]
pub enum Decision {
    /// No other thread is runnable, or the current thread hasn't used up
    /// its time slice yet — keep running, nothing to switch.
    KeepRunning,
    /// Switch from `from` to `to`. The caller performs the actual
    /// `swapcontext`/`setcontext` (the scheduler hands back the two
    /// `Context` pointers it owns so the caller can do so without a second
    /// mutable borrow of the thread table).
    SwitchTo { from: ThreadId, to: ThreadId },
    /// There is no current thread (first dispatch, or the current thread
    /// just exited) and `to` should simply be `setcontext`'d into.
    DispatchOnly { to: ThreadId },
    /// No thread is runnable at all (every thread is blocked or the table
    /// is empty).
    Idle,
}

pub struct Scheduler {
    /// Re-entrancy guard: a `SIGVTALRM` delivered while already inside
    /// `schedule` must return immediately, mirroring the original's
    /// `__sync_val_compare_and_swap(&scheduling, 0, 1)` guard.
    guard: GuardFlag,
    queues: [VecDeque<ThreadId>; PRIORITY_LEVELS],
    time_slices: [Duration; PRIORITY_LEVELS],
    threads: HashMap<ThreadId, Tcb>,
    current: Option<ThreadId>,
}

impl Scheduler {
    pub fn new(config: &RuntimeConfig) -> Self {
        let mut time_slices = [Duration::ZERO; PRIORITY_LEVELS];
        for (level, slice) in time_slices.iter_mut().enumerate() {
            *slice = Duration::from_micros(config.base_time_slice_micros << level);
        }
        Self {
            guard: GuardFlag::new(),
            queues: Default::default(),
            time_slices,
            threads: HashMap::new(),
            current: None,
        }
    }

    pub fn current(&self) -> Option<ThreadId> {
        self.current
    }

    pub fn thread(&self, id: ThreadId) -> Option<&Tcb> {
        self.threads.get(&id)
    }

    pub fn thread_mut(&mut self, id: ThreadId) -> Option<&mut Tcb> {
        self.threads.get_mut(&id)
    }

    pub fn priority_of(&self, id: ThreadId) -> Option<Priority> {
        self.threads.get(&id).map(|t| t.priority)
    }

    /// Registers a freshly created thread and places it at the back of the
    /// highest-priority queue (spec.md §4.1: new threads start at priority
    /// 0), matching `my_pthread_create`'s call to `enqueue`.
    pub fn spawn(&mut self, id: ThreadId, stack: Stack) {
        let tcb = Tcb::new(id, stack);
        self.threads.insert(id, tcb);
        self.queues[HIGHEST_PRIORITY as usize].push_back(id);
        trace!("scheduler: spawned {id:?} at priority {HIGHEST_PRIORITY}");
    }

    /// Registers the thread already running on the real OS stack (the
    /// embedder's own call stack, at `Runtime::init` time) as `current`
    /// directly, without ever sitting in a ready queue — mirroring the
    /// original's `initializeThreads` setting `currentTcb = getNewTcb()`
    /// for the thread that happens to call `my_pthread_create` first.
    pub fn adopt_current(&mut self, id: ThreadId, stack: Stack) {
        let mut tcb = Tcb::new(id, stack);
        tcb.state = ThreadState::Running;
        tcb.last_dispatch = Instant::now();
        self.threads.insert(id, tcb);
        self.current = Some(id);
    }

    /// Removes a completed thread's record and frees its stack. Called
    /// once its joiner (if any) has copied out the return value, or
    /// immediately if nobody ever joins it — mirroring the original's
    /// `mydeallocate` of the stack at `my_pthread_exit`/`my_pthread_join`.
    pub fn reap(&mut self, id: ThreadId) -> Option<Tcb> {
        self.threads.remove(&id)
    }

    /// Moves `id` back onto a ready queue at its current priority, without
    /// demoting it — the voluntary-yield path (`my_pthread_yield`), as
    /// opposed to the timer-preemption path which demotes first.
    pub fn requeue_ready(&mut self, id: ThreadId) {
        if let Some(tcb) = self.threads.get_mut(&id) {
            tcb.state = ThreadState::Ready;
            let level = tcb.priority as usize;
            self.queues[level].push_back(id);
        }
    }

    /// Raises (or restores) a blocked/ready thread's priority without
    /// touching its place in whatever queue it is already in — used for
    /// mutex priority inheritance (spec.md §4.2) and its unwind on unlock.
    /// If the thread is sitting in a ready queue its queue slot is
    /// corrected to match, since queue index IS priority level here.
    pub fn set_priority(&mut self, id: ThreadId, priority: Priority) {
        let Some(tcb) = self.threads.get_mut(&id) else {
            return;
        };
        let old = tcb.priority;
        if old == priority {
            return;
        }
        tcb.priority = priority;
        if tcb.state == ThreadState::Ready {
            if let Some(pos) = self.queues[old as usize].iter().position(|q| *q == id) {
                self.queues[old as usize].remove(pos);
                self.queues[priority as usize].push_back(id);
            }
        }
        debug!("scheduler: {id:?} priority {old} -> {priority}");
    }

    /// Marks `id` blocked (on a mutex or a join) and removes it from
    /// whatever ready queue it was in, if any.
    pub fn block(&mut self, id: ThreadId, state: ThreadState) {
        if let Some(tcb) = self.threads.get_mut(&id) {
            let level = tcb.priority as usize;
            tcb.state = state;
            if let Some(pos) = self.queues[level].iter().position(|q| *q == id) {
                self.queues[level].remove(pos);
            }
        }
    }

    /// Wakes a blocked thread, making it ready at its current priority.
    pub fn wake(&mut self, id: ThreadId) {
        self.requeue_ready(id);
    }

    fn pick_next(&mut self) -> Option<ThreadId> {
        for level in 0..PRIORITY_LEVELS {
            if let Some(id) = self.queues[level].pop_front() {
                return Some(id);
            }
        }
        None
    }

    /// The timer-tick entry point (spec.md §4.1, `schedule` in the
    /// original). Re-entrancy-guarded with `try_claim`: a `SIGVTALRM`
    /// delivered while already inside a schedule (e.g. during a voluntary
    /// yield) returns `KeepRunning` immediately rather than spin, since
    /// spinning inside a signal handler on a flag the interrupted code
    /// holds would deadlock the one OS thread we have.
    pub fn on_timer_tick(&mut self) -> Decision {
        if !self.guard.try_claim() {
            return Decision::KeepRunning;
        }
        let decision = self.schedule_locked(true);
        self.guard.release();
        decision
    }

    /// Unconditionally claims the scheduler guard — the analogue of the
    /// original's bare `block = 1;` assignment at the top of every public
    /// API entry point that touches the ready/waiter queues
    /// (`my_pthread_create`/`_yield`/`_exit`/`_join`,
    /// `my_pthread_mutex_lock`/`_unlock`). Callers must hold this across
    /// their whole critical section, through to `on_yield`/`on_current_left`
    /// below, which release it on their way out rather than claiming it
    /// themselves.
    pub fn enter_guarded(&self) {
        self.guard.claim();
    }

    /// Releases the scheduler guard. Called either immediately, when a
    /// scheduling decision doesn't switch contexts, or by
    /// `Runtime::perform_switch`/`perform_dispatch_only` right before the
    /// actual `swapcontext`/`setcontext`, mirroring the original's
    /// `block = 0;` placed just ahead of the switch.
    pub fn leave_guarded(&self) {
        self.guard.release();
    }

    /// Non-blocking variant for the `SIGSEGV` handler, which may run while
    /// the interrupted code already holds the guard. Returns `true` if this
    /// call claimed it, in which case (and only then) the caller must
    /// release it again.
    pub fn try_enter_guarded(&self) -> bool {
        self.guard.try_claim()
    }

    /// The voluntary-yield entry point (`my_pthread_yield`). The caller must
    /// already hold the scheduler guard (`enter_guarded`); it is released
    /// here immediately if nothing ends up switching, or left held for the
    /// caller's context-switch step to release when it does. Always
    /// re-enqueues the current thread without demotion, then dispatches
    /// whichever thread is next, even if the current thread's time slice
    /// has not elapsed.
    pub fn on_yield(&mut self) -> Decision {
        let Some(id) = self.current.take() else {
            self.guard.release();
            return Decision::Idle;
        };
        self.requeue_ready(id);
        match self.pick_next() {
            Some(next) => {
                self.dispatch(next);
                Decision::SwitchTo { from: id, to: next }
            }
            None => {
                // nobody else runnable; go right back to running `id`.
                self.dispatch(id);
                self.guard.release();
                Decision::KeepRunning
            }
        }
    }

    /// Called when the current thread has exited or is blocking; there is
    /// nothing to requeue. Picks whatever runs next. Same guard contract as
    /// `on_yield`: the caller must already hold it, and it is only released
    /// here for the `Idle` outcome — `SwitchTo`/`DispatchOnly` leave it held
    /// for the caller's switch step.
    pub fn on_current_left(&mut self) -> Decision {
        let from = self.current.take();
        match (from, self.pick_next()) {
            (Some(from), Some(next)) => {
                self.dispatch(next);
                Decision::SwitchTo { from, to: next }
            }
            (None, Some(next)) => {
                self.dispatch(next);
                Decision::DispatchOnly { to: next }
            }
            (_, None) => {
                self.guard.release();
                Decision::Idle
            }
        }
    }

    fn schedule_locked(&mut self, from_timer: bool) -> Decision {
        let Some(id) = self.current else {
            return match self.pick_next() {
                Some(next) => {
                    self.dispatch(next);
                    Decision::DispatchOnly { to: next }
                }
                None => Decision::Idle,
            };
        };

        let elapsed = {
            let tcb = self.threads.get(&id).expect("current thread vanished");
            tcb.last_dispatch.elapsed()
        };
        let level = self.threads[&id].priority as usize;
        if from_timer && elapsed < self.time_slices[level] {
            return Decision::KeepRunning;
        }

        // Time slice exhausted: demote and requeue, "maintenance cycle"
        // wraps back to priority 0 at the bottom (spec.md §4.1).
        if let Some(tcb) = self.threads.get_mut(&id) {
            tcb.demote();
            tcb.state = ThreadState::Ready;
            let new_level = tcb.priority as usize;
            self.queues[new_level].push_back(id);
        }

        match self.pick_next() {
            Some(next) => {
                self.dispatch(next);
                Decision::SwitchTo { from: id, to: next }
            }
            None => {
                // Nothing else runnable (can happen right after the only
                // other thread was just dequeued above) — put `id` back at
                // the front of its new queue and keep running it.
                let level = self.threads[&id].priority as usize;
                if let Some(pos) = self.queues[level].iter().position(|q| *q == id) {
                    self.queues[level].remove(pos);
                }
                self.dispatch(id);
                Decision::KeepRunning
            }
        }
    }

    fn dispatch(&mut self, id: ThreadId) {
        if let Some(tcb) = self.threads.get_mut(&id) {
            tcb.state = ThreadState::Running;
            tcb.last_dispatch = Instant::now();
        }
        self.current = Some(id);
    }

    /// Performs the actual context switch for a [`Decision::SwitchTo`].
    ///
    /// # Safety
    /// Both `from` and `to` must currently be present in the thread table
    /// (true for any `SwitchTo` this scheduler itself produced).
    pub unsafe fn switch(&mut self, from: ThreadId, to: ThreadId) {
        let from_ctx: *mut Context = &mut self
            .threads
            .get_mut(&from)
            .expect("`from` thread missing")
            .context;
        let to_ctx: *const Context = &self.threads.get(&to).expect("`to` thread missing").context;
        // `from` and `to` are distinct keys in the map, so these two raw
        // pointers never alias; `swapcontext` needs simultaneous access
        // that a safe `HashMap` borrow can't express.
        arch::swapcontext(&mut *from_ctx, &*to_ctx);
    }

    /// Performs the context switch for a [`Decision::DispatchOnly`] — used
    /// the first time any thread runs, when there is no "from" to save.
    ///
    /// # Safety
    /// `to` must currently be present in the thread table, and this must be
    /// called from the one OS thread driving the whole runtime.
    pub unsafe fn dispatch_only(&mut self, to: ThreadId) -> ! {
        let to_ctx: *const Context = &self.threads.get(&to).expect("`to` thread missing").context;
        arch::setcontext(&*to_ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stack() -> Stack {
        Stack { base: std::ptr::null_mut(), size: 0 }
    }

    fn config() -> RuntimeConfig {
        RuntimeConfig {
            base_time_slice_micros: 1,
            ..RuntimeConfig::small_for_tests()
        }
    }

    #[test]
    fn newly_spawned_thread_dispatches_at_highest_priority() {
        let mut s = Scheduler::new(&config());
        let a = ThreadId::next();
        s.spawn(a, stack());
        assert_eq!(s.priority_of(a), Some(HIGHEST_PRIORITY));
        match s.schedule_locked(false) {
            Decision::DispatchOnly { to } => assert_eq!(to, a),
            other => panic!("expected DispatchOnly, got a different decision: {other:?}"),
        }
        assert_eq!(s.current(), Some(a));
    }

    /// P7 (scheduler fairness, weak): repeated timer-driven demotion of a
    /// single runnable thread wraps it back to priority 0 rather than
    /// leaving it stuck at the bottom queue forever.
    #[test]
    fn repeated_time_slice_exhaustion_wraps_priority_p7() {
        let mut s = Scheduler::new(&config());
        let a = ThreadId::next();
        s.spawn(a, stack());
        s.schedule_locked(false); // first dispatch, a is now current/Running

        for _ in 0..(PRIORITY_LEVELS - 1) {
            std::thread::sleep(Duration::from_micros(5));
            s.schedule_locked(true);
        }
        assert_eq!(s.priority_of(a), Some((PRIORITY_LEVELS - 1) as Priority));

        std::thread::sleep(Duration::from_micros(5));
        s.schedule_locked(true);
        assert_eq!(s.priority_of(a), Some(HIGHEST_PRIORITY));
    }

    #[test]
    fn on_current_left_reports_idle_when_table_is_empty() {
        let mut s = Scheduler::new(&config());
        assert!(matches!(s.on_current_left(), Decision::Idle));
    }
}
