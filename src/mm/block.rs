//! Boundary-tag, first-fit free-list allocator.
//!
//! Every allocated or free region is flanked by two bitwise-identical
//! [`BlockHeader`] structs (spec.md §3, "Block header/footer"). This is a
//! direct port of `original_source/mylib.c`'s `allocateFrom`/
//! `deallocateFrom`/`extendPartition`, restructured around a safe-ish
//! `Partition` handle instead of raw macros, in the spirit of
//! `linked-list-allocator`'s `Heap`/`HoleList` split (see
//! `examples/JonasKruckenberg-k23/libs/linked-list-allocator`) but keeping
//! the original's exact splitting and coalescing rules rather than that
//! crate's hole-list representation.

use std::mem::size_of;
use std::ptr::NonNull;

/// Head and tail of every block. `used` and `payload_size` must always
/// agree between a block's head and tail (spec.md §3's block invariant).
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct BlockHeader {
    pub used: bool,
    pub payload_size: usize,
}

pub const HEADER_SIZE: usize = size_of::<BlockHeader>();
pub const DOUBLE_HEADER_SIZE: usize = HEADER_SIZE * 2;

static_assertions::const_assert!(HEADER_SIZE > 0);

/// A bounded region of the arena served by this allocator: `first_head`
/// and `last_tail` bound the partition (spec.md §3, "Partition").
#[derive(Clone, Copy, Debug)]
pub struct Partition {
    pub first_head: *mut BlockHeader,
    pub last_tail: *mut BlockHeader,
}

// Safety: a Partition's pointers are only dereferenced while the owning
// Runtime's scheduler guard is held.
unsafe impl Send for Partition {}

#[inline]
fn blk_size(payload_size: usize) -> usize {
    payload_size + DOUBLE_HEADER_SIZE
}

/// # Safety
/// `head` must point at a properly initialized block header whose tail (at
/// `head + HEADER_SIZE + payload_size`) is within the partition.
unsafe fn tail_of(head: *mut BlockHeader) -> *mut BlockHeader {
    let payload = (*head).payload_size;
    head.cast::<u8>()
        .add(HEADER_SIZE + payload)
        .cast::<BlockHeader>()
}

/// # Safety
/// `tail` must point at a properly initialized block tail.
unsafe fn head_of(tail: *mut BlockHeader) -> *mut BlockHeader {
    let payload = (*tail).payload_size;
    tail.cast::<u8>()
        .sub(HEADER_SIZE + payload)
        .cast::<BlockHeader>()
}

unsafe fn set_metadata(head: *mut BlockHeader, used: bool, payload_size: usize) {
    *head = BlockHeader {
        used,
        payload_size,
    };
    *tail_of(head) = *head;
}

unsafe fn set_used(head: *mut BlockHeader, used: bool) {
    (*head).used = used;
    (*tail_of(head)).used = used;
}

unsafe fn set_payload_size(head: *mut BlockHeader, payload_size: usize) {
    (*head).payload_size = payload_size;
    (*tail_of(head)).payload_size = payload_size;
}

impl Partition {
    /// Creates a partition spanning `size` bytes starting at `ptr`, as one
    /// big free block. `size` must be at least `DOUBLE_HEADER_SIZE`.
    ///
    /// # Safety
    /// `ptr` must be valid and writable for `size` bytes, and that memory
    /// must not be used for anything else.
    pub unsafe fn create(ptr: *mut u8, size: usize) -> Self {
        debug_assert!(size >= DOUBLE_HEADER_SIZE);
        let head = ptr.cast::<BlockHeader>();
        set_metadata(head, false, size - DOUBLE_HEADER_SIZE);
        Self {
            first_head: head,
            last_tail: tail_of(head),
        }
    }

    /// Grows the partition by `size` bytes, attaching a new free block
    /// after `last_tail` if it was used, or absorbing into it if free
    /// (spec.md §4.4, "Thread partition growth").
    ///
    /// # Safety
    /// The `size` bytes immediately following the partition's current
    /// `last_tail` must be valid, writable, and otherwise unused.
    pub unsafe fn extend(&mut self, size: usize) {
        if (*self.last_tail).used {
            let new_head = self.last_tail.add(1);
            set_metadata(new_head, false, size - DOUBLE_HEADER_SIZE);
            self.last_tail = tail_of(new_head);
        } else {
            let last_head = head_of(self.last_tail);
            let grown = (*last_head).payload_size + size;
            set_payload_size(last_head, grown);
            self.last_tail = tail_of(last_head);
        }
    }

    /// First-fit allocation. Returns `None` if no free block is large
    /// enough. A block whose remainder after placement would be `<=
    /// DOUBLE_HEADER_SIZE` is taken whole instead of being split (spec.md
    /// §4.4).
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        unsafe {
            let mut head = self.first_head;
            loop {
                if !(*head).used && size <= (*head).payload_size {
                    break;
                }
                head = head
                    .cast::<u8>()
                    .add(blk_size((*head).payload_size))
                    .cast::<BlockHeader>();
                if head.offset(-1) == self.last_tail {
                    return None;
                }
            }

            if size + DOUBLE_HEADER_SIZE >= (*head).payload_size {
                set_used(head, true);
            } else {
                let remainder = (*head).payload_size - (size + DOUBLE_HEADER_SIZE);
                set_metadata(head, true, size);
                let new_head = tail_of(head).add(1);
                set_metadata(new_head, false, remainder);
            }

            Some(NonNull::new_unchecked(head.add(1).cast::<u8>()))
        }
    }

    /// Frees `ptr`'s block, coalescing with an adjacent free neighbor on
    /// either side. Returns `false` (and does nothing) if `ptr` does not
    /// fall within this partition — the defensive range check spec.md §7
    /// calls for on a "free of a pointer not in the expected partition".
    ///
    /// # Safety
    /// If `ptr` is within the partition, it must be a live allocation
    /// previously returned by [`allocate`](Self::allocate) on this same
    /// partition, not already freed.
    pub unsafe fn deallocate(&mut self, ptr: NonNull<u8>) -> bool {
        let ptr = ptr.as_ptr();
        let lo = self.first_head.add(1).cast::<u8>();
        let hi = self.last_tail.cast::<u8>();
        if ptr < lo || ptr >= hi {
            return false;
        }

        let mut head = ptr.cast::<BlockHeader>().sub(1);
        let mut tail = tail_of(head);

        if head != self.first_head {
            let prev_tail = head.sub(1);
            if !(*prev_tail).used {
                let merged = (*head).payload_size + (*prev_tail).payload_size + DOUBLE_HEADER_SIZE;
                head = head_of(prev_tail);
                set_payload_size(head, merged);
            }
        }
        if tail != self.last_tail {
            let next_head = tail.add(1);
            if !(*next_head).used {
                let merged = (*tail).payload_size + (*next_head).payload_size + DOUBLE_HEADER_SIZE;
                tail = tail_of(next_head);
                set_payload_size(head, merged);
                let _ = tail;
            }
        }

        set_used(head, false);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_partition(bytes: &mut [u8]) -> Partition {
        unsafe { Partition::create(bytes.as_mut_ptr(), bytes.len()) }
    }

    #[test]
    fn allocate_fits_in_fresh_partition() {
        let mut mem = vec![0u8; 1024];
        let mut p = make_partition(&mut mem);
        let a = p.allocate(64).expect("room for one block");
        unsafe {
            std::ptr::write_bytes(a.as_ptr(), 0xAB, 64);
        }
    }

    #[test]
    fn first_fit_reuses_freed_slot_s3() {
        // S3: malloc(100), malloc(100), malloc(sizeof(int)); free first
        // 100; malloc(100) again lands in the freed slot, no growth.
        let mut mem = vec![0u8; 4096];
        let mut p = make_partition(&mut mem);
        let a = p.allocate(100).unwrap();
        let b = p.allocate(100).unwrap();
        let _c = p.allocate(std::mem::size_of::<i32>()).unwrap();

        unsafe {
            assert!(p.deallocate(a));
        }
        let high_water_before = p.last_tail as usize;
        let d = p.allocate(100).unwrap();
        assert_eq!(d.as_ptr(), a.as_ptr(), "first-fit must reuse freed slot");
        assert_eq!(p.last_tail as usize, high_water_before, "no growth expected");
        let _ = b;
    }

    #[test]
    fn coalesces_middle_free_block_p6() {
        let mut mem = vec![0u8; 4096];
        let mut p = make_partition(&mut mem);
        let a = p.allocate(64).unwrap();
        let b = p.allocate(64).unwrap();
        let c = p.allocate(64).unwrap();

        unsafe {
            assert!(p.deallocate(a));
            assert!(p.deallocate(c));
            assert!(p.deallocate(b));
        }

        // The whole partition should now be a single free block again.
        let head = p.first_head;
        unsafe {
            assert!(!(*head).used);
            assert_eq!(head, p.first_head);
            assert_eq!(tail_of(head), p.last_tail);
        }
    }

    #[test]
    fn boundary_tags_stay_equal_p5() {
        let mut mem = vec![0u8; 4096];
        let mut p = make_partition(&mut mem);
        let mut live = Vec::new();
        for size in [16usize, 32, 8, 64, 4, 128] {
            if let Some(ptr) = p.allocate(size) {
                live.push(ptr);
            }
            if live.len() > 2 {
                let freed = live.remove(0);
                unsafe {
                    p.deallocate(freed);
                }
            }
        }
        for ptr in &live {
            unsafe {
                let head = ptr.as_ptr().cast::<BlockHeader>().sub(1);
                let tail = tail_of(head);
                assert_eq!((*head).used, (*tail).used);
                assert_eq!((*head).payload_size, (*tail).payload_size);
            }
        }
    }
}
