//! Host-OS primitives the runtime is built on.
//!
//! The rest of the crate treats context switching, page protection, signal
//! delivery, and the virtual interval timer as black boxes (per spec.md §9,
//! "Context-switch primitive") and only talks to the `unix` backend through
//! the functions and types re-exported here. A second backend could be
//! added the way `fiber`'s `arch/` module branches on `cfg(windows)`, but
//! the spec's non-goal list excludes anything beyond a POSIX-like host, so
//! only `unix` is implemented.

#[cfg(unix)]
mod unix;

#[cfg(unix)]
pub use unix::*;

#[cfg(not(unix))]
compile_error!("uthreads requires a POSIX-like host (mmap/mprotect/sigaction/ucontext)");
