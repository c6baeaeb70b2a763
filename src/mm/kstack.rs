//! Kernel Stack Arena
//!
//! Per-CPU kernel stacks are carved out of one reserved region using
//! `linked_list_allocator`. Every CPU gets its own stack, so two CPUs
//! trapping at the same time never push onto the same memory.

use alloc::boxed::Box;
use alloc::vec;
use core::alloc::Layout;

use linked_list_allocator::LockedHeap;

use super::memlayout::{KSTKSIZE, PGSIZE};

/// Alignment of a kernel stack.
const KSTACK_ALIGN: usize = 16;

/// One kernel stack: `[base, base + size)` inside the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelStack {
    base: usize,
    size: usize,
}

impl KernelStack {
    /// Lowest byte of the stack.
    pub const fn bottom(&self) -> usize {
        self.base
    }

    /// One past the highest byte; the initial stack pointer.
    pub const fn top(&self) -> usize {
        self.base + self.size
    }

    pub const fn size(&self) -> usize {
        self.size
    }

    /// Check whether two stacks share any byte.
    pub const fn overlaps(&self, other: &KernelStack) -> bool {
        self.base < other.top() && other.base < self.top()
    }
}

/// Backing region plus the allocator that hands out stacks from it.
pub struct KernelStackArena {
    heap: LockedHeap,
    /// Owns the memory `heap` manages; never touched directly.
    _region: Box<[u8]>,
}

impl KernelStackArena {
    /// Reserve room for `stacks` kernel stacks.
    pub fn new(stacks: usize) -> Self {
        // One spare page absorbs alignment padding of the region itself.
        let len = stacks * KSTKSIZE as usize + PGSIZE as usize;
        let mut region = vec![0u8; len].into_boxed_slice();

        // SAFETY:
        // - `region` is a live heap allocation of `len` bytes
        // - it is owned by the arena and dropped only with it, and moving the
        //   Box does not move the bytes
        // - nothing else reads or writes the region
        let heap = unsafe { LockedHeap::new(region.as_mut_ptr(), len) };

        Self {
            heap,
            _region: region,
        }
    }

    /// Carve out one kernel stack, or `None` if the arena is exhausted.
    pub fn allocate(&self) -> Option<KernelStack> {
        let layout = Layout::from_size_align(KSTKSIZE as usize, KSTACK_ALIGN).ok()?;
        let ptr = self.heap.lock().allocate_first_fit(layout).ok()?;

        Some(KernelStack {
            base: ptr.as_ptr() as usize,
            size: KSTKSIZE as usize,
        })
    }

    /// Bytes still available for new stacks.
    pub fn free_bytes(&self) -> usize {
        self.heap.lock().free()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    #[test]
    fn test_stacks_are_disjoint() {
        let arena = KernelStackArena::new(4);
        let stacks: Vec<KernelStack> = (0..4).map(|_| arena.allocate().unwrap()).collect();

        for (i, a) in stacks.iter().enumerate() {
            assert_eq!(a.size(), KSTKSIZE as usize);
            assert_eq!(a.bottom() % KSTACK_ALIGN, 0);
            for b in &stacks[i + 1..] {
                assert!(!a.overlaps(b));
            }
        }
    }

    #[test]
    fn test_arena_exhaustion() {
        let arena = KernelStackArena::new(1);
        assert!(arena.allocate().is_some());
        assert!(arena.allocate().is_none());
    }
}
