//! Runtime configuration.
//!
//! The original C implementation hardcodes these as preprocessor constants
//! (`MEM_SIZE`, `SWAP_SIZE`, `SHRD_MEM_SIZE`, `NUM_PRIORITY_LVLS`,
//! `BASE_TIME_SLICE`). We group them into one struct with a `Default` that
//! reproduces those exact values, so tests can build a runtime with a small
//! arena without touching production defaults.

/// Number of feedback-queue priority levels. Fixed by the data model (§3):
/// queues are stored in a `[_; PRIORITY_LEVELS]` array, not a `Vec`.
pub const PRIORITY_LEVELS: usize = 4;

/// Stack size handed to every `thread::spawn`ed thread, carved out of the
/// library partition. The original hardcodes 4096 bytes (`TEMP_SIZE`) for
/// both the exit trampoline's stack and every thread's stack; that's too
/// small for a `ucontext_t`-switched hosted Rust call stack (closures,
/// panics-as-aborts unwinding tables, etc.), so this crate uses a larger
/// default and documents the deviation in `DESIGN.md`.
pub const STACK_SIZE: usize = 256 * 1024;

#[derive(Debug, Clone, Copy)]
pub struct RuntimeConfig {
    /// Total size in bytes of the main arena, including metadata, the
    /// library partition, the page table, and the physical frames.
    pub arena_size: usize,
    /// Size of the swap file, in bytes.
    pub swap_size: usize,
    /// Size of the shared partition, in pages.
    pub shared_partition_pages: usize,
    /// Base time slice of priority level 0, in microseconds. Level `i` gets
    /// `base_time_slice_micros << i`.
    pub base_time_slice_micros: u64,
    /// Relative weight of the library partition vs. the combined thread
    /// partitions (page table + physical frames) when dividing up the
    /// arena. The original uses 1:1.
    pub library_weight: usize,
    pub threads_weight: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            arena_size: 8_000_000,
            swap_size: 16_000_000,
            shared_partition_pages: 4,
            base_time_slice_micros: 25_000,
            library_weight: 1,
            threads_weight: 1,
        }
    }
}

impl RuntimeConfig {
    /// A configuration tuned for tests: a much smaller arena so that a
    /// thread's working set overflows a single page quickly (exercising
    /// paging/swap) without allocating megabytes per test.
    pub fn small_for_tests() -> Self {
        Self {
            arena_size: 512 * 1024,
            swap_size: 1024 * 1024,
            shared_partition_pages: 4,
            base_time_slice_micros: 2_000,
            library_weight: 1,
            threads_weight: 1,
        }
    }
}
