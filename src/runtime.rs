//! Ties the scheduler, the arena, and the host signal/timer primitives
//! together into one process-wide runtime, and exposes the raw (`*mut
//! c_void`-based) primitives the public `thread`/`mutex`/`mem` modules are
//! built on.
//!
//! Grounded in `original_source/my_pthread.c`'s global state (`currentTcb`,
//! `PQs`, `block`, `initialized`) and `initializeThreads`/`schedule`, but
//! restructured the way spec.md §9's "Global state" note recommends: one
//! `Runtime` object instead of free-floating globals, reached from the
//! installed signal handlers through a single `static mut` the way
//! `kwast-os-kwast`'s `tasking::scheduler` reaches its per-core `SCHEDULER`
//! (see that crate's `with_core_scheduler`). This is still, fundamentally,
//! global mutable state accessed from a signal handler — there is no way
//! around that for a user-level threading runtime on a single OS thread —
//! but it is reached through one typed accessor instead of scattered
//! `static mut`s.

use std::ffi::c_void;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, error, trace};

use crate::arch;
use crate::config::RuntimeConfig;
use crate::error::{InitError, InitResult};
use crate::mm::Arena;
use crate::tasking::scheduler::Decision;
use crate::tasking::thread::{Stack, ThreadState, HIGHEST_PRIORITY};
use crate::tasking::{Scheduler, ThreadId};

pub struct Runtime {
    pub(crate) scheduler: Scheduler,
    pub(crate) arena: Arena,
}

// Safety: every field is only touched by the single OS thread driving the
// runtime (including from within its own signal handlers, which run on
// that same thread and never re-enter each other — see the guard
// discipline in `tasking::scheduler` and spec.md §5).
unsafe impl Send for Runtime {}

static mut RUNTIME: Option<Runtime> = None;

fn unique_swap_path() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir()
        .join(format!("uthreads-swap-{}-{n}", std::process::id()))
        .to_string_lossy()
        .into_owned()
}

/// Brings up the process-wide runtime with `config`. Installs the
/// `SIGSEGV`/`SIGVTALRM` handlers and arms the virtual interval timer, the
/// same set of effects `initializeThreads` has in the original, minus the
/// "only runs once, implicitly, on first `create`" part — this crate makes
/// that step explicit (spec.md §9's "Global state" note; see also
/// `DESIGN.md`).
pub fn init(config: RuntimeConfig) -> InitResult<()> {
    unsafe {
        if RUNTIME.is_some() {
            return Err(InitError::AlreadyInitialized);
        }

        let swap_path = unique_swap_path();
        let mut scheduler = Scheduler::new(&config);
        let arena = Arena::new(&config, &swap_path)?;

        let main_id = ThreadId::next();
        scheduler.adopt_current(main_id, Stack { base: std::ptr::null_mut(), size: 0 });

        arch::install_segv_handler(on_segv)?;
        arch::install_timer_handler(on_timer)?;
        arch::arm_virtual_timer(config.base_time_slice_micros)?;

        debug!("runtime initialized: main thread is {main_id:?}");
        RUNTIME = Some(Runtime { scheduler, arena });
        Ok(())
    }
}

/// Tears down the process-wide runtime: disarms the timer and drops the
/// scheduler and arena. Supplements the original, which relies on process
/// exit (`atexit`) to reclaim the arena and swap file — needed here because
/// a hosted test binary builds many runtimes in one process (spec.md §9's
/// "Swap-file lifecycle" note; see `DESIGN.md`).
pub fn shutdown() {
    arch::disarm_virtual_timer();
    unsafe {
        RUNTIME = None;
    }
}

pub(crate) fn is_initialized() -> bool {
    unsafe { RUNTIME.is_some() }
}

pub(crate) fn with_runtime_mut<R>(f: impl FnOnce(&mut Runtime) -> R) -> R {
    unsafe {
        let rt = RUNTIME
            .as_mut()
            .expect("uthreads: runtime not initialized; call Runtime::init() first");
        f(rt)
    }
}

impl Runtime {
    pub(crate) fn current(&self) -> Option<ThreadId> {
        self.scheduler.current()
    }

    /// Applies a scheduling [`Decision`] that isn't a blocking-path special
    /// case: performs the context switch for `SwitchTo`/`DispatchOnly`,
    /// does nothing for `KeepRunning`/`Idle`. Used by `yield_now` and by
    /// mutex lock/unlock, where "nobody else runnable" is a perfectly
    /// ordinary outcome.
    pub(crate) fn apply_decision(&mut self, decision: Decision) {
        match decision {
            Decision::SwitchTo { from, to } => self.perform_switch(from, to),
            Decision::DispatchOnly { to } => self.perform_dispatch_only(to),
            Decision::KeepRunning | Decision::Idle => {
                self.scheduler.leave_guarded();
            }
        }
    }

    /// Performs the context switch for a `SwitchTo` decision. The scheduler
    /// guard is released here, right before `swapcontext` — the same point
    /// the original sets `block = 0;`, immediately ahead of the protect/
    /// unprotect pair and the switch itself. Holding it any later would
    /// leave it stuck claimed once control actually transfers away, since
    /// the code that would release it is suspended, not running.
    fn perform_switch(&mut self, from: ThreadId, to: ThreadId) {
        trace!("runtime: context switch {from:?} -> {to:?}");
        let _ = self.arena.protect_all();
        let _ = self.arena.unprotect_owned(to);
        self.scheduler.leave_guarded();
        unsafe {
            self.scheduler.switch(from, to);
        }
    }

    fn perform_dispatch_only(&mut self, to: ThreadId) -> ! {
        trace!("runtime: first dispatch -> {to:?}");
        let _ = self.arena.protect_all();
        let _ = self.arena.unprotect_owned(to);
        self.scheduler.leave_guarded();
        unsafe { self.scheduler.dispatch_only(to) }
    }

    /// Spawns a new thread running `entry(arg)` on a freshly allocated
    /// stack (from the library partition), enters it in `PQ[0]`, and
    /// returns its id. `entry` must eventually call [`exit_raw`] instead of
    /// returning (the generic `thread::spawn` wrapper's trampoline does
    /// this for every caller; there is no `uc_link` fallback, unlike the
    /// original's `exitContext`, since this crate's only entry point is the
    /// one trampoline that is known to always call `exit_raw`).
    pub(crate) fn spawn_raw(&mut self, entry: extern "C" fn(u32, u32), arg: u64, stack_size: usize) -> ThreadId {
        self.scheduler.enter_guarded();
        let id = ThreadId::next();
        let stack_ptr = self
            .arena
            .library
            .allocate(stack_size)
            .expect("uthreads: library partition exhausted, cannot allocate a thread stack");
        let stack = Stack {
            base: stack_ptr.as_ptr(),
            size: stack_size,
        };
        self.scheduler.spawn(id, stack);
        let tcb = self.scheduler.thread_mut(id).expect("just inserted");
        arch::getcontext(&mut tcb.context);
        tcb.context.uc_stack.ss_sp = stack_ptr.as_ptr().cast();
        tcb.context.uc_stack.ss_size = stack_size;
        tcb.context.uc_link = std::ptr::null_mut();
        unsafe {
            arch::makecontext_trampoline(&mut tcb.context, entry, arg);
        }
        self.scheduler.leave_guarded();
        debug!("runtime: spawned {id:?} with a {stack_size}B stack");
        id
    }
}

pub(crate) fn spawn_raw(entry: extern "C" fn(u32, u32), arg: u64, stack_size: usize) -> ThreadId {
    with_runtime_mut(|rt| rt.spawn_raw(entry, arg, stack_size))
}

/// `yield()` (spec.md §4.1, "Voluntary yield"): re-enqueues the caller at
/// its current priority (no demotion) and switches to the next runnable
/// thread, if any.
pub(crate) fn yield_raw() {
    with_runtime_mut(|rt| {
        rt.scheduler.enter_guarded();
        let decision = rt.scheduler.on_yield();
        rt.apply_decision(decision);
    });
}

/// `exit(value)` (spec.md §4.1): never returns. Marks the caller done,
/// stores its return value, promotes a waiting joiner (if any) to `PQ[0]`,
/// releases its paged memory, and dispatches whatever runs next.
///
/// The scheduler guard is claimed here, at the very top, and held across
/// the whole body — matching `my_pthread_exit`'s `block = 1;`...`block = 0;`
/// bracket around the same sequence. Without it, a `SIGVTALRM` landing
/// between marking this TCB `Done` and `on_current_left` picking a
/// successor could demote and requeue it through `on_timer_tick`, letting
/// it be redispatched and re-run `exit_raw` a second time.
pub(crate) fn exit_raw(retval: *mut c_void) -> ! {
    with_runtime_mut(|rt| {
        rt.scheduler.enter_guarded();
        let me = rt.current().expect("exit() called with no current thread");

        let joiner = {
            let tcb = rt.scheduler.thread_mut(me).expect("current thread's tcb vanished");
            tcb.done = true;
            tcb.retval = retval;
            tcb.state = ThreadState::Done;
            tcb.joiner.take()
        };
        rt.arena.release_thread(me);

        if let Some(joiner) = joiner {
            rt.scheduler.set_priority(joiner, HIGHEST_PRIORITY);
            rt.scheduler.wake(joiner);
            debug!("runtime: {me:?} exited, promoted joiner {joiner:?} to priority {HIGHEST_PRIORITY}");
        } else {
            debug!("runtime: {me:?} exited with no joiner");
        }

        match rt.scheduler.on_current_left() {
            Decision::SwitchTo { from, to } => rt.perform_switch(from, to),
            Decision::DispatchOnly { to } => rt.perform_dispatch_only(to),
            Decision::Idle => {
                rt.scheduler.leave_guarded();
                error!("uthreads: last runnable thread exited with nothing left to resume into");
                std::process::abort();
            }
            Decision::KeepRunning => {
                unreachable!("on_current_left never reports KeepRunning")
            }
        }
    });
    unreachable!("exit_raw only returns by diverging into another thread or aborting")
}

/// `join(handle, value_out)` (spec.md §4.1): blocks until `target` is done
/// (returning immediately if it already is, per spec.md §7's "Policy"
/// category), then reclaims its stack and TCB and returns its stored
/// return value.
///
/// The scheduler guard is claimed at the top, before the fast `done` check,
/// matching `my_pthread_join`'s `block = 1;`...`block = 0;` bracket around
/// the whole function body: released immediately on the fast path, held
/// through `on_current_left` and into the context switch on the blocking
/// path.
pub(crate) fn join_raw(target: ThreadId) -> *mut c_void {
    with_runtime_mut(|rt| {
        rt.scheduler.enter_guarded();
        let done = rt.scheduler.thread(target).map(|t| t.done).unwrap_or(true);
        if done {
            rt.scheduler.leave_guarded();
            return;
        }
        let me = rt.current().expect("join() called with no current thread");
        if let Some(tcb) = rt.scheduler.thread_mut(target) {
            tcb.joiner = Some(me);
        }
        rt.scheduler.block(me, ThreadState::BlockedOnJoin);
        match rt.scheduler.on_current_left() {
            Decision::SwitchTo { from, to } => rt.perform_switch(from, to),
            Decision::DispatchOnly { to } => rt.perform_dispatch_only(to),
            Decision::Idle => {
                rt.scheduler.leave_guarded();
                error!("uthreads: join() blocked with nothing else runnable");
                std::process::abort();
            }
            Decision::KeepRunning => unreachable!("on_current_left never reports KeepRunning"),
        }
        // Resumed here once `target`'s exit promotes us back to PQ[0] and
        // we are eventually redispatched.
    });

    with_runtime_mut(|rt| {
        let tcb = rt.scheduler.reap(target).expect("joined thread's tcb missing");
        if !tcb.stack.base.is_null() {
            unsafe {
                rt.arena.library.deallocate(NonNull::new_unchecked(tcb.stack.base));
            }
        }
        tcb.retval
    })
}

extern "C" fn on_timer(_signum: i32) {
    with_runtime_mut(|rt| {
        let decision = rt.scheduler.on_timer_tick();
        rt.apply_decision(decision);
    });
}

extern "C" fn on_segv(_signum: i32, info: *mut libc::siginfo_t, _ucontext: *mut c_void) {
    let addr = arch::fault_address(info);
    let resolved = with_runtime_mut(|rt| {
        let Some(current) = rt.current() else {
            return false;
        };
        // `SIGVTALRM` is also blocked for the duration of this handler (see
        // `arch::install_segv_handler`'s `sa_mask`); the guard is claimed
        // too, in case a fault is ever delivered from a path that doesn't
        // already hold it.
        let claimed = rt.scheduler.try_enter_guarded();
        let resolved = rt.arena.handle_fault(addr, current).is_some();
        if claimed {
            rt.scheduler.leave_guarded();
        }
        resolved
    });
    if !resolved {
        // Outside the paged region entirely: a genuine access violation,
        // not a paging fault. spec.md §7: "system-level faults inside the
        // fault handler escalate to process abort."
        error!("uthreads: unhandled segmentation fault at {addr:p}");
        std::process::abort();
    }
}
