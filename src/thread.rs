//! The ergonomic, `std::thread`-shaped public surface over the runtime's
//! raw `create`/`yield`/`exit`/`join` primitives (spec.md §4.5's "renamed
//! to Rust's `snake_case` convention" note — `create` becomes
//! [`spawn`], `join` becomes [`JoinHandle::join`]).
//!
//! The original's `function(arg)` signature is a single `void*` in, a
//! single `void*` out. Here the entry point is a `FnOnce() -> T` closure;
//! [`spawn`] boxes it (twice — once for the closure itself, once for its
//! eventual return value) and the runtime passes the first box's address
//! through as the raw `arg` a context-switch primitive can carry, the same
//! trick `fiber`'s `Fiber::with_stack_and_local` uses to smuggle a typed
//! closure across a context switch via a raw pointer on the new stack.

use std::ffi::c_void;
use std::marker::PhantomData;

use crate::config::STACK_SIZE;
use crate::runtime;
use crate::tasking::ThreadId;

type BoxedEntry = Box<dyn FnOnce() -> *mut c_void>;

/// The single, non-generic context-switch entry point every spawned thread
/// starts at. Reassembles the boxed closure from `arg`, runs it, and hands
/// its boxed return value to [`runtime::exit_raw`] — which never returns,
/// so this function's own body never falls off the end.
extern "C" fn trampoline(arg_hi: u32, arg_lo: u32) {
    let raw = (((arg_hi as u64) << 32) | arg_lo as u64) as *mut BoxedEntry;
    // Safety: `raw` was produced by `Box::into_raw` in `spawn` below and is
    // only ever handed to this trampoline once, by `makecontext`.
    let entry = unsafe { Box::from_raw(raw) };
    let retval = entry();
    runtime::exit_raw(retval);
}

/// A handle to a spawned thread, returned by [`spawn`]. Analogous to
/// `my_pthread_t`, but carries the return type statically instead of an
/// untyped `void*`.
#[derive(Debug)]
pub struct JoinHandle<T> {
    id: ThreadId,
    _retval: PhantomData<fn() -> T>,
}

impl<T> JoinHandle<T> {
    pub fn thread_id(&self) -> ThreadId {
        self.id
    }

    /// `join(handle, &value)` (spec.md §4.1/§4.5). Blocks until the thread
    /// has run to completion (returning immediately if it already has,
    /// per spec.md §7's "Policy" category) and returns its result.
    pub fn join(self) -> T {
        let retval = runtime::join_raw(self.id);
        // Safety: `retval` is exactly the pointer `spawn`'s closure below
        // produced via `Box::into_raw(Box::new(result))` for this same
        // `T`, handed back unmodified by `exit_raw`/`join_raw`.
        unsafe { *Box::from_raw(retval as *mut T) }
    }
}

/// `create(out handle, attr, fn, arg)` (spec.md §4.5), generalized from a
/// raw function pointer + `void*` argument to an arbitrary closure.
/// `attr` is a non-goal in the original and has no equivalent here. Starts
/// the thread at `PQ[0]` with a fresh stack allocated from the library
/// partition (spec.md §3: "Stack is allocated by the library partition
/// and freed on join").
///
/// # Panics
/// Panics if [`crate::Runtime::init`] has not been called, or if the
/// library partition has no room left for a new stack.
pub fn spawn<F, T>(f: F) -> JoinHandle<T>
where
    F: FnOnce() -> T + 'static,
    T: 'static,
{
    let entry: BoxedEntry = Box::new(move || Box::into_raw(Box::new(f())) as *mut c_void);
    let raw = Box::into_raw(Box::new(entry)) as u64;
    let id = runtime::spawn_raw(trampoline, raw, STACK_SIZE);
    JoinHandle {
        id,
        _retval: PhantomData,
    }
}

/// `yield()` (spec.md §4.1/§4.5): voluntarily gives up the remainder of
/// this thread's time slice. Re-enqueued at its current priority, no
/// demotion.
pub fn yield_now() {
    runtime::yield_raw();
}

/// Returns the currently running thread's id, or `None` if called outside
/// any thread the runtime scheduled (i.e. before [`crate::Runtime::init`]).
pub fn current() -> Option<ThreadId> {
    if !runtime::is_initialized() {
        return None;
    }
    runtime::with_runtime_mut(|rt| rt.current())
}
