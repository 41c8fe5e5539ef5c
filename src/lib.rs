//! `uthreads`: a user-level cooperative/preemptive threading runtime with
//! its own paged memory manager, built entirely on top of a single OS
//! thread.
//!
//! Three subsystems do the real work, each in its own module:
//!
//! - [`tasking`]: the thread control block and the multi-level feedback
//!   scheduler (a virtual-time interval timer preempts the running
//!   thread; voluntary [`thread::yield_now`] and [`JoinHandle::join`] are
//!   the other two places control can change hands).
//! - [`sync`] (internal bookkeeping) / [`Mutex`] (the public face): a
//!   mutex with a FIFO waiter queue and priority inheritance.
//! - [`mm`]: the arena — a single fixed-size allocation carved into a
//!   library partition, a page table, and physical frames, plus a swap
//!   file — and the paging engine that gives every thread the illusion of
//!   owning its own private memory, backed by a `SIGSEGV` handler that
//!   migrates pages to/from frames on access.
//!
//! [`Runtime::init`] brings the whole thing up (installing the signal
//! handlers and arming the timer); [`thread::spawn`], [`Mutex`], and the
//! [`mem`] functions are the day-to-day surface built on top of it.
//!
//! This crate requires a POSIX-like host (`mmap`/`mprotect`, `sigaction`,
//! `ucontext_t`, `setitimer`) and is not safe to use across multiple OS
//! threads in the same process — it *is* the thing that multiplexes many
//! logical threads onto one.

mod arch;
mod config;
mod error;
mod mm;
mod runtime;
mod sync;
mod tasking;

pub mod mem;
mod mutex;
pub mod thread;

pub use config::RuntimeConfig;
pub use error::{InitError, InitResult};
pub use mutex::Mutex;
pub use tasking::ThreadId;
pub use thread::JoinHandle;

/// Handle to the process-wide runtime. Zero-sized — all state actually
/// lives behind [`runtime::with_runtime_mut`]'s `static mut`; this type
/// exists purely to give the lifecycle operations (`init`/`shutdown`) a
/// conventional, discoverable home (spec.md §9's "Global state" note:
/// "In a redesign they become fields of a single Runtime object").
pub struct Runtime {
    _private: (),
}

impl Runtime {
    /// Brings up the runtime with [`RuntimeConfig::default`]'s arena size,
    /// swap size, and timing constants — spec.md §6's configured
    /// constants, unchanged.
    pub fn init() -> InitResult<()> {
        Self::init_with_config(RuntimeConfig::default())
    }

    /// Brings up the runtime with a caller-supplied configuration. Mainly
    /// useful for tests that want a much smaller arena than the 8 MB
    /// default so that a thread's working set overflows a page (and
    /// exercises paging/swap) cheaply — see [`RuntimeConfig::small_for_tests`].
    ///
    /// # Errors
    /// Returns [`InitError`] for any of spec.md §7's "Initialization-fatal"
    /// conditions (page size query, arena allocation, swap file creation,
    /// signal handler installation, timer arming), or
    /// [`InitError::AlreadyInitialized`] if called again before
    /// [`Runtime::shutdown`].
    pub fn init_with_config(config: RuntimeConfig) -> InitResult<()> {
        runtime::init(config)
    }

    /// Tears down the runtime: disarms the virtual timer and frees the
    /// arena and swap file. Not present in the original, which relies on
    /// process exit to reclaim these (spec.md §9's "Swap-file lifecycle"
    /// note); needed here because a single test process creates many
    /// runtimes over its lifetime. Any threads still alive at this point
    /// are simply dropped along with their TCBs — there is no graceful
    /// shutdown of running threads (not in scope; see spec.md §1's
    /// non-goals).
    pub fn shutdown() {
        runtime::shutdown();
    }

    /// Whether [`Runtime::init`]/[`Runtime::init_with_config`] has been
    /// called and [`Runtime::shutdown`] hasn't undone it since.
    pub fn is_running() -> bool {
        runtime::is_initialized()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    // The runtime is process-wide singleton state (one `static mut
    // RUNTIME`), so tests that call `Runtime::init`/`shutdown` cannot run
    // concurrently with each other inside this test binary. `cargo test`
    // runs unit tests in the same process as other unit tests, so guard
    // with a plain std mutex (distinct from our own `Mutex`) the same way
    // the integration tests under `tests/` use `serial_test`.
    static SERIAL: StdMutex<()> = StdMutex::new(());

    #[test]
    fn init_then_shutdown_then_init_again() {
        let _guard = SERIAL.lock().unwrap();
        assert!(!Runtime::is_running());
        Runtime::init_with_config(RuntimeConfig::small_for_tests()).unwrap();
        assert!(Runtime::is_running());
        Runtime::shutdown();
        assert!(!Runtime::is_running());
        Runtime::init_with_config(RuntimeConfig::small_for_tests()).unwrap();
        Runtime::shutdown();
    }

    #[test]
    fn double_init_is_an_error() {
        let _guard = SERIAL.lock().unwrap();
        Runtime::init_with_config(RuntimeConfig::small_for_tests()).unwrap();
        let err = Runtime::init_with_config(RuntimeConfig::small_for_tests());
        assert!(matches!(err, Err(InitError::AlreadyInitialized)));
        Runtime::shutdown();
    }

    #[test]
    fn spawn_and_join_returns_exit_value_p1() {
        let _guard = SERIAL.lock().unwrap();
        Runtime::init_with_config(RuntimeConfig::small_for_tests()).unwrap();

        let handle = thread::spawn(|| 41 + 1);
        let result = handle.join();
        assert_eq!(result, 42);

        Runtime::shutdown();
    }

    #[test]
    fn two_threads_share_a_counter_under_mutex_p2() {
        let _guard = SERIAL.lock().unwrap();
        Runtime::init_with_config(RuntimeConfig::small_for_tests()).unwrap();

        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        static LOCK: Mutex = Mutex::new();
        COUNTER.store(0, Ordering::SeqCst);

        let make_worker = || {
            thread::spawn(|| {
                for _ in 0..500 {
                    LOCK.lock();
                    COUNTER.fetch_add(1, Ordering::SeqCst);
                    LOCK.unlock();
                    thread::yield_now();
                }
            })
        };
        let a = make_worker();
        let b = make_worker();
        a.join();
        b.join();

        assert_eq!(COUNTER.load(Ordering::SeqCst), 1000);
        assert!(LOCK.destroy());

        Runtime::shutdown();
    }
}
