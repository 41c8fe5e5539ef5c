//! The memory arena: one big page-aligned allocation split into a library
//! partition (for TCBs, stacks, and general library bookkeeping), a
//! physical-frame region backing per-thread paged memory, and a shared
//! partition reachable by every thread without going through the page
//! table at all.
//!
//! Grounded in `original_source/mylib.c`'s `initializeMemory` and
//! `memoryMetadata`. The original sizes the library partition by repeatedly
//! shrinking it one byte at a time until `(header + library + page table)`
//! lands on a page boundary; per the closed-form REDESIGN (see
//! `DESIGN.md`) this computes the same split directly. Unlike the original,
//! the page table itself is an ordinary growable `Vec` owned by
//! [`PagingEngine`] rather than a fixed-size slice carved out of the arena
//! buffer (see `DESIGN.md`) — only the library partition and the physical
//! frames need a byte budget up front.

use std::collections::HashMap;
use std::mem::size_of;
use std::ptr::NonNull;

use log::debug;

use crate::arch::{self, SwapFile};
use crate::config::RuntimeConfig;
use crate::error::InitError;
use crate::tasking::ThreadId;

use super::block::{BlockHeader, Partition};
use super::page_table::{FaultResolution, PagingEngine};

fn round_up(value: usize, align: usize) -> usize {
    (value + align - 1) / align * align
}

/// Lives at the start of a thread's logical page 0, ahead of its partition
/// (spec.md §4.3, "If this is logical page 0, initialize an in-page
/// `threadMemoryMetadata` struct at the start of the page, exposing a
/// partition spanning the rest of the page"). Purely a marker here — the
/// partition bounds are recomputed from the page count on every call (see
/// `Arena::thread_partition_view`), so nothing downstream actually reads
/// this back; it exists so the page's first bytes are accounted for and
/// match the original's layout.
#[repr(C)]
struct ThreadMemoryMetadata {
    magic: u32,
}

const THREAD_META_MAGIC: u32 = 0x5448_5254; // b"THRT"

impl ThreadMemoryMetadata {
    fn new() -> Self {
        Self { magic: THREAD_META_MAGIC }
    }
}

pub struct Arena {
    /// The single allocation backing `library` and the frame region.
    main_alloc: *mut u8,
    main_alloc_len: usize,
    /// A second, separate allocation backing `shared` — not page-table
    /// managed, so it doesn't need to sit adjacent to the frame region.
    shared_alloc: *mut u8,
    shared_alloc_len: usize,

    pub library: Partition,
    pub shared: Partition,
    pub paging: PagingEngine,
    page_size: usize,

    /// Number of logical pages each thread has touched so far, keyed by
    /// thread. A thread's per-thread partition always spans pages
    /// `0..pages_mapped` of its own logical address space (spec.md §4.4,
    /// "Thread partition growth"); the bound pointers are recomputed from
    /// this count rather than stored, since the frame addressing scheme
    /// places logical page `K` at the same address for every thread.
    thread_pages: HashMap<ThreadId, usize>,
}

// Safety: every field is only touched while the runtime's scheduler guard
// is held, by the single OS thread driving it.
unsafe impl Send for Arena {}

impl Arena {
    pub fn new(config: &RuntimeConfig, swap_path: &str) -> Result<Self, InitError> {
        let page_size = arch::page_size()?;

        let weight_sum = (config.library_weight + config.threads_weight).max(1);
        let raw_library = config.arena_size * config.library_weight / weight_sum;
        let library_bytes = round_up(raw_library.max(page_size), page_size);
        let threads_budget = config.arena_size.saturating_sub(library_bytes);

        let num_frames = (threads_budget / page_size).max(1);
        let frames_bytes = num_frames * page_size;

        let main_len = library_bytes + frames_bytes;
        let main_alloc = arch::alloc_aligned(main_len, page_size)?;

        let library_ptr = main_alloc;
        let frames_ptr = unsafe { main_alloc.add(library_bytes) };

        let library = unsafe { Partition::create(library_ptr, library_bytes) };

        let shared_len = round_up(config.shared_partition_pages * page_size, page_size).max(page_size);
        let shared_alloc = arch::alloc_aligned(shared_len, page_size)?;
        let shared = unsafe { Partition::create(shared_alloc, shared_len) };

        let swap_file = SwapFile::create(swap_path, config.swap_size as u64)?;

        let paging = PagingEngine::new(frames_ptr, page_size, num_frames, swap_file);

        debug!(
            "arena: library={library_bytes}B frames={frames_bytes}B ({num_frames} frames) shared={shared_len}B"
        );

        Ok(Self {
            main_alloc,
            main_alloc_len: main_len,
            shared_alloc,
            shared_alloc_len: shared_len,
            library,
            shared,
            paging,
            page_size,
            thread_pages: HashMap::new(),
        })
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Forces logical page `idx` of `thread` to be resident and mapped,
    /// the same way any ordinary access from user code would: a volatile
    /// read at the page's address. If the page is not yet resident (or
    /// not yet mapped for this thread at all), the frame is `PROT_NONE`
    /// and this read raises the real `SIGSEGV` the runtime's own fault
    /// handler is installed for; the handler resolves it and returns, the
    /// read retries, and this call returns normally. This is the same
    /// demand-paging trick spec.md §4.3 describes for ordinary accesses —
    /// `threadAllocate` uses no separate, handler-bypassing path.
    fn touch_page(&self, idx: usize) {
        let addr = unsafe { self.paging.frames_base().add(idx * self.page_size) };
        unsafe {
            std::ptr::read_volatile(addr);
        }
    }

    fn thread_partition_view(&self, pages_mapped: usize) -> Partition {
        let meta_size = size_of::<ThreadMemoryMetadata>();
        let base = self.paging.frames_base();
        // `last_tail` points at the final block's tail header, which sits
        // `HEADER_SIZE` bytes before the end of the mapped region — not at
        // the region's end itself (see `block::Partition::create`, which
        // establishes this same offset for a freshly created partition).
        Partition {
            first_head: unsafe { base.add(meta_size).cast::<BlockHeader>() },
            last_tail: unsafe { base.add(pages_mapped * self.page_size).cast::<BlockHeader>().sub(1) },
        }
    }

    /// `threadAllocate` (spec.md §4.5): allocates `size` bytes from the
    /// calling thread's own page-backed partition, growing it one logical
    /// page at a time (up to the number of physical frames, spec.md §4.4)
    /// as it fills up. Returns `None` ("Allocation-null", spec.md §7) if
    /// `size` is zero or the thread's resident cap is reached.
    pub fn thread_allocate(&mut self, thread: ThreadId, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }
        let meta_size = size_of::<ThreadMemoryMetadata>();
        let num_frames = self.paging.num_frames();
        let mut pages_mapped = *self.thread_pages.get(&thread).unwrap_or(&0);

        let mut partition = if pages_mapped == 0 {
            self.touch_page(0);
            let base = self.paging.frames_base();
            unsafe {
                base.cast::<ThreadMemoryMetadata>().write(ThreadMemoryMetadata::new());
            }
            pages_mapped = 1;
            self.thread_pages.insert(thread, pages_mapped);
            unsafe { Partition::create(base.add(meta_size), self.page_size - meta_size) }
        } else {
            self.thread_partition_view(pages_mapped)
        };

        loop {
            if let Some(ptr) = partition.allocate(size) {
                return Some(ptr);
            }
            if pages_mapped >= num_frames {
                return None;
            }
            self.touch_page(pages_mapped);
            unsafe {
                partition.extend(self.page_size);
            }
            pages_mapped += 1;
            self.thread_pages.insert(thread, pages_mapped);
        }
    }

    /// `threadDeallocate`'s thread-partition half (spec.md §4.5): returns
    /// `false` if `ptr` is not within `thread`'s currently-mapped
    /// partition, so the caller can fall back to the shared partition.
    pub fn thread_deallocate(&mut self, thread: ThreadId, ptr: NonNull<u8>) -> bool {
        let pages_mapped = *self.thread_pages.get(&thread).unwrap_or(&0);
        if pages_mapped == 0 {
            return false;
        }
        let mut partition = self.thread_partition_view(pages_mapped);
        unsafe { partition.deallocate(ptr) }
    }

    /// `shalloc` (spec.md §4.5): allocates from the shared partition,
    /// reachable by every thread without going through the page table.
    pub fn shalloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }
        self.shared.allocate(size)
    }

    /// Handles a `SIGSEGV` at `fault_addr` for the currently running
    /// `thread`. `None` means the fault was outside the paged region
    /// entirely and is a genuine access violation.
    pub fn handle_fault(&mut self, fault_addr: *mut u8, thread: ThreadId) -> Option<FaultResolution> {
        self.paging.handle_fault(fault_addr, thread)
    }

    pub fn protect_all(&self) -> Result<(), InitError> {
        self.paging.protect_all()
    }

    pub fn unprotect_owned(&self, thread: ThreadId) -> Result<(), InitError> {
        self.paging.unprotect_owned(thread)
    }

    pub fn release_thread(&mut self, thread: ThreadId) {
        self.paging.release_thread(thread);
        self.thread_pages.remove(&thread);
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        // Frames must be made writable before the allocator touches them
        // again on the next `Runtime::new` in the same process (tests
        // build many runtimes); leaving them `PROT_NONE` would fault the
        // allocator itself on reuse of the address range by the OS.
        let _ = self.paging.protect_all_rw_for_teardown();
        unsafe {
            arch::free_aligned(self.main_alloc);
            arch::free_aligned(self.shared_alloc);
        }
        let _ = self.main_alloc_len;
        let _ = self.shared_alloc_len;
    }
}
