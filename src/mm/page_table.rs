//! Per-thread logical pages, physical frames, and the swap file that backs
//! pages which don't fit in a frame.
//!
//! Grounded directly in `original_source/mylib.c`'s `pageTableRow`,
//! `swapPages`, and `onBadAccess`. The key trick, taken straight from the
//! original's `pageNumber = (faultAddr - framesBase) / pageSize`: every
//! thread addresses its own logical page `K` at the *same* virtual address
//! `framesBase + K * pageSize`, regardless of which thread it is. Only one
//! thread's pages are ever mapped at once, so the frame at that address is
//! free to hold a different thread's page `K` at a different time — the
//! fault handler's job is exactly to swap in "whoever owns page `K` right
//! now" each time a different thread touches it.

use std::io;

use log::{debug, trace};

use crate::arch::{self, SwapFile};
use crate::tasking::ThreadId;

/// One (thread, logical page) binding. `page_number` doubles as the frame
/// slot this binding occupies while resident — `framesBase + page_number *
/// pageSize` is the only address this binding is ever placed at, so a row
/// fully determines its own physical location whenever `resident` is true.
#[derive(Debug, Clone, Copy)]
struct PageTableRow {
    owner: ThreadId,
    page_number: u64,
    resident: bool,
    /// Set once this binding has been evicted at least once, so the same
    /// swap-file slot can be reused across repeated swap-outs.
    swap_slot: Option<u64>,
}

/// What happened as a result of handling one faulting access. Logged by
/// the caller; call sites don't otherwise need to distinguish these.
#[derive(Debug, PartialEq, Eq)]
pub enum FaultResolution {
    /// A page already resident for this thread; the fault was just the
    /// first touch after a context switch re-armed `PROT_NONE` on it.
    AlreadyResident,
    /// A previously-touched page, evicted to swap, was brought back in.
    SwappedIn,
    /// The thread's first-ever touch of this logical page; a fresh frame
    /// (zeroed) was assigned.
    FirstTouch,
}

pub struct PagingEngine {
    frames_base: *mut u8,
    page_size: usize,
    num_frames: usize,
    /// One entry per (thread, page_number) binding ever created. Grows on
    /// demand rather than being preallocated to `numMemPages +
    /// numSwapPages` the way the original's array is — a Rust `Vec` makes
    /// the fixed-capacity preallocation unnecessary (see `DESIGN.md`).
    rows: Vec<PageTableRow>,
    swap_file: SwapFile,
    next_swap_slot: u64,
}

// Safety: `frames_base` is only dereferenced while the scheduler guard is
// held, by the single OS thread driving the runtime (including from within
// its SIGSEGV handler, which runs on that same thread).
unsafe impl Send for PagingEngine {}

impl PagingEngine {
    pub fn new(frames_base: *mut u8, page_size: usize, num_frames: usize, swap_file: SwapFile) -> Self {
        Self {
            frames_base,
            page_size,
            num_frames,
            rows: Vec::new(),
            swap_file,
            next_swap_slot: 0,
        }
    }

    pub fn num_frames(&self) -> usize {
        self.num_frames
    }

    /// Base address of the frame region. Every thread's logical page `K`
    /// lives at `frames_base() + K * page_size()` while resident, per the
    /// addressing trick described at the top of this module.
    pub fn frames_base(&self) -> *mut u8 {
        self.frames_base
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    fn frame_addr(&self, slot: usize) -> *mut u8 {
        unsafe { self.frames_base.add(slot * self.page_size) }
    }

    fn claim_swap_slot(&mut self) -> u64 {
        let slot = self.next_swap_slot;
        self.next_swap_slot += 1;
        slot
    }

    fn swap_offset(&self, slot: u64) -> u64 {
        slot * self.page_size as u64
    }

    /// Makes every frame inaccessible. Called right before dispatching a
    /// new thread, before [`unprotect_owned`] re-opens just its own pages —
    /// together these are `protectAllPages`/`unprotectAllPages` wrapped
    /// around a context switch in the original's scheduler.
    pub fn protect_all(&self) -> Result<(), crate::error::InitError> {
        if self.num_frames == 0 {
            return Ok(());
        }
        arch::protect_none(self.frames_base, self.num_frames * self.page_size)
    }

    /// Makes every frame accessible regardless of ownership. Used once,
    /// right before the arena's backing allocation is freed, so the
    /// allocator doesn't hand out `PROT_NONE` memory to something else.
    pub fn protect_all_rw_for_teardown(&self) -> Result<(), crate::error::InitError> {
        if self.num_frames == 0 {
            return Ok(());
        }
        arch::protect_rw(self.frames_base, self.num_frames * self.page_size)
    }

    /// Re-opens every frame currently resident for `thread`.
    pub fn unprotect_owned(&self, thread: ThreadId) -> Result<(), crate::error::InitError> {
        for row in &self.rows {
            if row.resident && row.owner == thread {
                arch::protect_rw(self.frame_addr(row.page_number as usize), self.page_size)?;
            }
        }
        Ok(())
    }

    /// Resolves a `SIGSEGV` at `fault_addr` for the currently-scheduled
    /// `thread`. Returns `None` if `fault_addr` falls outside the frame
    /// region entirely — a genuine access violation, not a paging fault.
    pub fn handle_fault(&mut self, fault_addr: *mut u8, thread: ThreadId) -> Option<FaultResolution> {
        let arena_start = self.frames_base as usize;
        let addr = fault_addr as usize;
        if addr < arena_start {
            return None;
        }
        let slot = (addr - arena_start) / self.page_size;
        if slot >= self.num_frames {
            return None;
        }
        let page_number = slot as u64;

        if let Some(idx) = self
            .rows
            .iter()
            .position(|r| r.owner == thread && r.page_number == page_number && r.resident)
        {
            // Already resident for this thread; the fault was just the
            // protection re-arm after the last context switch away.
            let _ = arch::protect_rw(self.frame_addr(slot), self.page_size);
            let _ = idx;
            trace!("paging: {thread:?} page {page_number} already resident, re-opening");
            return Some(FaultResolution::AlreadyResident);
        }

        // Whoever currently occupies this address has to make way: at most
        // one binding may be resident at a given slot at a time.
        if let Some(victim) = self
            .rows
            .iter()
            .position(|r| r.resident && r.page_number == page_number)
        {
            self.evict(victim);
        }

        if let Some(idx) = self
            .rows
            .iter()
            .position(|r| r.owner == thread && r.page_number == page_number)
        {
            self.swap_in(idx, slot);
            debug!("paging: {thread:?} page {page_number} swapped in");
            return Some(FaultResolution::SwappedIn);
        }

        self.rows.push(PageTableRow {
            owner: thread,
            page_number,
            resident: true,
            swap_slot: None,
        });
        unsafe {
            std::ptr::write_bytes(self.frame_addr(slot), 0, self.page_size);
        }
        let _ = arch::protect_rw(self.frame_addr(slot), self.page_size);
        debug!("paging: {thread:?} page {page_number} first touch");
        Some(FaultResolution::FirstTouch)
    }

    fn evict(&mut self, idx: usize) {
        let row = self.rows[idx];
        let slot = row.page_number as usize;
        let swap_slot = row.swap_slot.unwrap_or_else(|| self.claim_swap_slot());
        let offset = self.swap_offset(swap_slot);
        let mut buf = vec![0u8; self.page_size];
        unsafe {
            std::ptr::copy_nonoverlapping(self.frame_addr(slot), buf.as_mut_ptr(), self.page_size);
        }
        if let Err(err) = self.swap_file.write_page_at(offset, &buf) {
            log_swap_io_error("write", err);
        }
        self.rows[idx].resident = false;
        self.rows[idx].swap_slot = Some(swap_slot);
    }

    fn swap_in(&mut self, idx: usize, slot: usize) {
        let swap_slot = self.rows[idx]
            .swap_slot
            .expect("swap_in called on a row that was never swapped out");
        let offset = self.swap_offset(swap_slot);
        let mut buf = vec![0u8; self.page_size];
        if let Err(err) = self.swap_file.read_page_at(offset, &mut buf) {
            log_swap_io_error("read", err);
        }
        unsafe {
            std::ptr::copy_nonoverlapping(buf.as_ptr(), self.frame_addr(slot), self.page_size);
        }
        self.rows[idx].resident = true;
        let _ = arch::protect_rw(self.frame_addr(slot), self.page_size);
    }

    /// Drops every row belonging to `thread`, freeing its frame(s) and
    /// orphaning its swap slot(s) — called from `join`/`exit` cleanup.
    pub fn release_thread(&mut self, thread: ThreadId) {
        self.rows.retain(|r| r.owner != thread);
    }
}

fn log_swap_io_error(op: &str, err: io::Error) {
    log::error!("paging: swap file {op} failed: {err}");
}
