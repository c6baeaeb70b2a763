//! Physical Frame Allocator
//!
//! Manages physical memory pages (frames) using a bitmap allocator with a
//! reference count per frame.
//!
//! # Design
//! - Each bit in the bitmap represents one 4KB frame
//! - Bit = 0: frame is free
//! - Bit = 1: frame is allocated
//! - `refs[i]` counts the page table entries (and page directories) that
//!   point at frame `i`; the frame returns to the pool when it drops to 0
//!
//! # Security Properties
//! - All allocated frames are zeroed before returning
//! - Double-free is detected and causes a panic
//! - Reference counts saturate at [`MAX_REFS`]; taking one more fails
//!   instead of wrapping
//! - The allocator itself is only reached through the kernel lock

use alloc::vec;
use alloc::vec::Vec;

use super::memlayout::{PhysAddr, FRAME_BASE, PGSHIFT, PGSIZE};
use crate::error::Error;

const FRAME_BYTES: usize = PGSIZE as usize;

/// Most references a single frame can carry.
pub const MAX_REFS: u16 = u16::MAX;

/// Frame allocator state.
pub struct FrameAllocator {
    /// Bitmap tracking allocated frames (1 = allocated, 0 = free).
    bitmap: Vec<u8>,
    /// Reference count of every frame.
    refs: Vec<u16>,
    /// Backing store for frame contents.
    memory: Vec<u8>,
    /// Number of free frames remaining.
    free_count: usize,
    /// Total frames under management.
    total_frames: usize,
}

impl FrameAllocator {
    /// Create an allocator managing `nframes` frames starting at
    /// `FRAME_BASE`.
    pub fn new(nframes: usize) -> Self {
        Self {
            bitmap: vec![0; nframes.div_ceil(8)],
            refs: vec![0; nframes],
            memory: vec![0; nframes * FRAME_BYTES],
            free_count: nframes,
            total_frames: nframes,
        }
    }

    /// Set a bit in the bitmap.
    #[inline]
    fn set_bit(&mut self, frame: usize, allocated: bool) {
        let byte_idx = frame / 8;
        let bit_idx = frame % 8;

        if allocated {
            self.bitmap[byte_idx] |= 1 << bit_idx;
        } else {
            self.bitmap[byte_idx] &= !(1 << bit_idx);
        }
    }

    /// Check if a frame is allocated.
    #[inline]
    fn is_allocated(&self, frame: usize) -> bool {
        let byte_idx = frame / 8;
        let bit_idx = frame % 8;

        if frame >= self.total_frames {
            return true; // Out of range = allocated
        }

        (self.bitmap[byte_idx] >> bit_idx) & 1 == 1
    }

    /// Frame index of `addr`, panicking on addresses we never handed out.
    fn index(&self, addr: PhysAddr) -> usize {
        if !addr.is_aligned() {
            panic!("unaligned frame address: {:?}", addr);
        }

        let frame = addr
            .as_u32()
            .checked_sub(FRAME_BASE)
            .map(|off| (off >> PGSHIFT) as usize);

        match frame {
            Some(frame) if frame < self.total_frames => frame,
            _ => panic!("frame outside managed range: {:?}", addr),
        }
    }

    /// Allocate a single zeroed frame with a reference count of 0.
    ///
    /// Returns `None` when physical memory is exhausted.
    pub fn alloc(&mut self) -> Option<PhysAddr> {
        if self.free_count == 0 {
            return None;
        }

        // Linear search for a free frame
        for byte_idx in 0..self.bitmap.len() {
            if self.bitmap[byte_idx] == 0xFF {
                continue;
            }

            for bit_idx in 0..8 {
                let frame = byte_idx * 8 + bit_idx;
                if frame >= self.total_frames {
                    break;
                }

                if !self.is_allocated(frame) {
                    self.set_bit(frame, true);
                    self.free_count -= 1;
                    self.refs[frame] = 0;

                    let start = frame * FRAME_BYTES;
                    self.memory[start..start + FRAME_BYTES].fill(0);

                    return Some(PhysAddr::new(FRAME_BASE + ((frame as u32) << PGSHIFT)));
                }
            }
        }

        None
    }

    /// Return a frame to the pool.
    ///
    /// # Panics
    /// Panics if the frame is still referenced, was not allocated
    /// (double-free), or lies outside the managed range.
    pub fn free(&mut self, addr: PhysAddr) {
        let frame = self.index(addr);

        if !self.is_allocated(frame) {
            panic!("Double free detected for frame: {:?}", addr);
        }

        if self.refs[frame] != 0 {
            panic!("freeing frame {:?} with {} references", addr, self.refs[frame]);
        }

        self.set_bit(frame, false);
        self.free_count += 1;
    }

    /// Add one reference to an allocated frame.
    ///
    /// Fails with [`Error::NoMem`] once the frame holds [`MAX_REFS`]
    /// references; the count is left unchanged.
    pub fn incref(&mut self, addr: PhysAddr) -> Result<(), Error> {
        let frame = self.index(addr);
        debug_assert!(self.is_allocated(frame));
        self.refs[frame] = self.refs[frame]
            .checked_add(1)
            .ok_or(Error::NoMem)?;
        Ok(())
    }

    /// Drop one reference, freeing the frame when none remain.
    pub fn decref(&mut self, addr: PhysAddr) {
        let frame = self.index(addr);

        match self.refs[frame] {
            0 => panic!("reference underflow on frame {:?}", addr),
            1 => {
                self.refs[frame] = 0;
                self.free(addr);
            }
            _ => self.refs[frame] -= 1,
        }
    }

    /// Current reference count of a frame.
    pub fn refs(&self, addr: PhysAddr) -> u16 {
        self.refs[self.index(addr)]
    }

    /// Contents of a frame.
    pub fn page(&self, addr: PhysAddr) -> &[u8] {
        let start = self.index(addr) * FRAME_BYTES;
        &self.memory[start..start + FRAME_BYTES]
    }

    /// Mutable contents of a frame.
    pub fn page_mut(&mut self, addr: PhysAddr) -> &mut [u8] {
        let start = self.index(addr) * FRAME_BYTES;
        &mut self.memory[start..start + FRAME_BYTES]
    }

    /// Get the number of free frames.
    pub fn free_frames(&self) -> usize {
        self.free_count
    }

    /// Total frames under management.
    pub fn total_frames(&self) -> usize {
        self.total_frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_until_exhausted() {
        let mut frames = FrameAllocator::new(3);
        let a = frames.alloc().unwrap();
        let b = frames.alloc().unwrap();
        let c = frames.alloc().unwrap();
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_eq!(a.as_u32(), FRAME_BASE);
        assert!(frames.alloc().is_none());
        assert_eq!(frames.free_frames(), 0);
    }

    #[test]
    fn test_last_reference_frees() {
        let mut frames = FrameAllocator::new(1);
        let a = frames.alloc().unwrap();
        frames.incref(a).unwrap();
        frames.incref(a).unwrap();
        frames.decref(a);
        assert_eq!(frames.refs(a), 1);
        assert_eq!(frames.free_frames(), 0);
        frames.decref(a);
        assert_eq!(frames.free_frames(), 1);
    }

    #[test]
    fn test_reallocated_frame_is_zeroed() {
        let mut frames = FrameAllocator::new(1);
        let a = frames.alloc().unwrap();
        frames.page_mut(a)[17] = 0xAA;
        frames.free(a);
        let b = frames.alloc().unwrap();
        assert_eq!(a, b);
        assert!(frames.page(b).iter().all(|&byte| byte == 0));
    }

    #[test]
    #[should_panic(expected = "Double free")]
    fn test_double_free_panics() {
        let mut frames = FrameAllocator::new(2);
        let a = frames.alloc().unwrap();
        frames.free(a);
        frames.free(a);
    }

    #[test]
    fn test_incref_saturates() {
        let mut frames = FrameAllocator::new(1);
        let a = frames.alloc().unwrap();
        for _ in 0..MAX_REFS {
            frames.incref(a).unwrap();
        }
        assert_eq!(frames.incref(a), Err(Error::NoMem));
        assert_eq!(frames.refs(a), MAX_REFS);

        // Still releasable one by one.
        frames.decref(a);
        assert_eq!(frames.refs(a), MAX_REFS - 1);
        frames.incref(a).unwrap();
    }
}
