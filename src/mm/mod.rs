//! Memory management module
//!
//! Provides:
//! - Address types and the fixed virtual layout
//! - Physical frame allocation with reference counts
//! - Per-process two-level page tables
//! - The arena that per-CPU kernel stacks are carved from
//!
//! # Security Principles
//! - All allocations are bounds-checked
//! - Frames are zeroed before reuse
//! - A frame is only released when its last mapping goes away

pub mod frame;
pub mod kstack;
pub mod memlayout;
pub mod paging;

pub use frame::FrameAllocator;
pub use kstack::{KernelStack, KernelStackArena};
pub use memlayout::{PhysAddr, VirtAddr};
pub use paging::{AddressSpace, PageTableEntry, PteFlags};
