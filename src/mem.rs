//! The memory-facing half of the public API (spec.md §4.5/§6):
//! `threadAllocate`/`threadDeallocate`/`shalloc`, mapped to the current
//! thread's own page-backed partition or the shared partition.
//!
//! Null-returning on failure, exactly as spec.md §7's "Allocation-null"
//! category describes — these are the one part of the public surface that
//! stays close to the original's raw-pointer shape rather than being
//! wrapped in `Option`/`Result`, since a thread's private heap is
//! inherently an unsafe, manually-managed region from Rust's point of
//! view (there is no way to express "this pointer is only valid while
//! this logical page stays resident for this thread" in the type system).

use std::ptr::NonNull;

use crate::runtime;

/// `threadAllocate(size)` (spec.md §4.5): allocates from the calling
/// thread's own page-backed partition, growing it by one logical page at a
/// time as needed (up to the thread's resident cap, spec.md §4.4). Returns
/// a null pointer if `size` is zero or the cap is reached.
pub fn thread_allocate(size: usize) -> *mut u8 {
    runtime::with_runtime_mut(|rt| {
        let me = rt
            .current()
            .expect("thread_allocate() called with no current thread");
        rt.arena
            .thread_allocate(me, size)
            .map_or(std::ptr::null_mut(), NonNull::as_ptr)
    })
}

/// `threadDeallocate(ptr)` (spec.md §4.5): frees `ptr` back to the calling
/// thread's partition; falls back to the shared partition if `ptr` isn't
/// within it (spec.md §4.5, "tries thread partition then shared"). A no-op
/// if `ptr` is null or not within either (spec.md §7's defensive range
/// check).
pub fn thread_deallocate(ptr: *mut u8) {
    let Some(ptr) = NonNull::new(ptr) else {
        return;
    };
    runtime::with_runtime_mut(|rt| {
        let me = rt
            .current()
            .expect("thread_deallocate() called with no current thread");
        if !rt.arena.thread_deallocate(me, ptr) {
            let _ = unsafe { rt.arena.shared.deallocate(ptr) };
        }
    });
}

/// `shalloc(size)` (spec.md §4.5): allocates from the shared partition,
/// reachable by every thread without going through the page table. Returns
/// a null pointer if `size` is zero or the partition is full.
pub fn shalloc(size: usize) -> *mut u8 {
    runtime::with_runtime_mut(|rt| rt.arena.shalloc(size).map_or(std::ptr::null_mut(), NonNull::as_ptr))
}
