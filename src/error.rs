//! Error types for the runtime's fallible, non-allocator operations.
//!
//! Per the spec's error taxonomy: allocator exhaustion and no-op conditions
//! (unlock by a non-owner, double mutex destroy, stray frees) are handled
//! locally and never reach here — only initialization failures, which are
//! the one category the original C implementation reported by printing to
//! stderr and calling `exit()` from inside the library. We return a typed
//! error instead and let the caller decide whether to abort.

use thiserror::Error;

/// Fatal conditions that can occur while bringing up the runtime.
#[derive(Debug, Error)]
pub enum InitError {
    #[error("failed to query host page size: {0}")]
    PageSize(#[source] std::io::Error),

    #[error("failed to allocate a {size}-byte page-aligned arena: {source}")]
    ArenaAlloc {
        size: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to open swap file {path}: {source}")]
    SwapFileOpen {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to size swap file to {size} bytes: {source}")]
    SwapFileResize {
        size: u64,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to install SIGSEGV handler: {0}")]
    SigactionSegv(#[source] std::io::Error),

    #[error("failed to install SIGVTALRM handler: {0}")]
    SigactionTimer(#[source] std::io::Error),

    #[error("failed to arm the virtual interval timer: {0}")]
    Setitimer(#[source] std::io::Error),

    #[error("failed to protect {pages} frame(s) starting at {addr:#x}: {source}")]
    Mprotect {
        pages: usize,
        addr: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("the runtime has already been initialized")]
    AlreadyInitialized,
}

pub type InitResult<T> = Result<T, InitError>;
