//! Physical and Virtual Address Types and the Memory Layout
//!
//! Type-safe wrappers for 32-bit addresses plus the fixed virtual layout
//! shared by the kernel and the user library.
//!
//! # Virtual Layout
//! ```text
//!  KERNBASE, KSTACKTOP ---> +------------------------------+ 0xf0000000
//!                           |  CPU0 kernel stack, gap, ...  |
//!  ULIM ------------------> +------------------------------+ 0xef800000
//!                           |  read-only page table views   |
//!  UTOP, UXSTACKTOP ------> +------------------------------+ 0xeec00000
//!                           |  user exception stack (1 pg)  |
//!                           +------------------------------+
//!                           |  empty guard page             |
//!  USTACKTOP -------------> +------------------------------+ 0xeebfe000
//!                           |  normal user stack            |
//!                           |  ...                          |
//!  UTEXT -----------------> +------------------------------+ 0x00800000
//!  PFTEMP ----------------> |  COW scratch page             | 0x007ff000
//!  UTEMP -----------------> +------------------------------+ 0x00400000
//! ```

use core::fmt;

/// Page size (4 KiB)
pub const PGSIZE: u32 = 4096;
/// Page size mask
pub const PGMASK: u32 = PGSIZE - 1;
/// Bits to shift for page number
pub const PGSHIFT: u32 = 12;
/// Bytes mapped by one page directory entry
pub const PTSIZE: u32 = PGSIZE * NPTENTRIES as u32;
/// Bits to shift for the page directory index
pub const PDXSHIFT: u32 = 22;

/// Entries per page directory
pub const NPDENTRIES: usize = 1024;
/// Entries per page table
pub const NPTENTRIES: usize = 1024;

/// Kernel virtual base; everything above belongs to the kernel.
pub const KERNBASE: u32 = 0xF000_0000;
/// Top of CPU 0's kernel stack.
pub const KSTACKTOP: u32 = KERNBASE;
/// Size of one per-CPU kernel stack.
pub const KSTKSIZE: u32 = 8 * PGSIZE;
/// Unmapped guard between two per-CPU kernel stacks.
pub const KSTKGAP: u32 = 8 * PGSIZE;
/// Memory-mapped I/O window.
pub const MMIOLIM: u32 = KSTACKTOP - PTSIZE;
pub const MMIOBASE: u32 = MMIOLIM - PTSIZE;

/// Highest address user space can read.
pub const ULIM: u32 = MMIOBASE;
/// Read-only page table views.
pub const UVPT: u32 = ULIM - PTSIZE;
pub const UPAGES: u32 = UVPT - PTSIZE;
pub const UENVS: u32 = UPAGES - PTSIZE;

/// Top of user-writable memory.
pub const UTOP: u32 = UENVS;
/// Top of the one-page user exception stack.
pub const UXSTACKTOP: u32 = UTOP;
/// Top of the normal user stack; the page below UXSTACKTOP is a guard.
pub const USTACKTOP: u32 = UTOP - 2 * PGSIZE;

/// Where user programs are loaded.
pub const UTEXT: u32 = 2 * PTSIZE;
/// Scratch mappings for user code.
pub const UTEMP: u32 = PTSIZE;
/// Scratch page used by the copy-on-write fault handler.
pub const PFTEMP: u32 = UTEMP + PTSIZE - PGSIZE;

/// First physical address handed out by the frame allocator
/// (skips the low 1 MiB of legacy I/O holes).
pub const FRAME_BASE: u32 = 0x0010_0000;

/// A physical memory address.
///
/// Physical addresses cannot be dereferenced; they name frames owned by
/// the frame allocator.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct PhysAddr(u32);

impl PhysAddr {
    /// Create a new physical address.
    #[inline]
    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    /// Get the raw address value.
    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Check if the address is page-aligned.
    #[inline]
    pub const fn is_aligned(self) -> bool {
        self.0 & PGMASK == 0
    }

    /// Align the address down to the nearest page boundary.
    #[inline]
    pub const fn align_down(self) -> Self {
        Self(self.0 & !PGMASK)
    }

    /// Get the page frame number.
    #[inline]
    pub const fn page_frame_number(self) -> u32 {
        self.0 >> PGSHIFT
    }

    /// Create from a page frame number.
    #[inline]
    pub const fn from_page_frame_number(pfn: u32) -> Self {
        Self(pfn << PGSHIFT)
    }

    /// Add an offset to this address.
    #[inline]
    pub const fn add(self, offset: u32) -> Self {
        Self(self.0 + offset)
    }
}

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysAddr({:#010x})", self.0)
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// A 32-bit virtual memory address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct VirtAddr(u32);

impl VirtAddr {
    /// Create a new virtual address.
    #[inline]
    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    /// Get the raw address value.
    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Check if the address is page-aligned.
    #[inline]
    pub const fn is_aligned(self) -> bool {
        self.0 & PGMASK == 0
    }

    /// Align the address down to the nearest page boundary.
    #[inline]
    pub const fn align_down(self) -> Self {
        Self(self.0 & !PGMASK)
    }

    /// Align the address up to the nearest page boundary.
    #[inline]
    pub const fn align_up(self) -> Self {
        Self(self.0.wrapping_add(PGMASK) & !PGMASK)
    }

    /// Page directory index (bits 31:22).
    #[inline]
    pub const fn pdx(self) -> usize {
        (self.0 >> PDXSHIFT) as usize & (NPDENTRIES - 1)
    }

    /// Page table index (bits 21:12).
    #[inline]
    pub const fn ptx(self) -> usize {
        (self.0 >> PGSHIFT) as usize & (NPTENTRIES - 1)
    }

    /// Linear page number, the index into the user page table view.
    #[inline]
    pub const fn page_number(self) -> u32 {
        self.0 >> PGSHIFT
    }

    /// Address of linear page number `pn`.
    #[inline]
    pub const fn from_page_number(pn: u32) -> Self {
        Self(pn << PGSHIFT)
    }

    /// Get the page offset (lowest 12 bits).
    #[inline]
    pub const fn page_offset(self) -> usize {
        (self.0 & PGMASK) as usize
    }

    /// Add an offset to this address.
    #[inline]
    pub const fn add(self, offset: u32) -> Self {
        Self(self.0.wrapping_add(offset))
    }

    /// Check if this address lies in the user-writable range.
    #[inline]
    pub const fn is_user(self) -> bool {
        self.0 < UTOP
    }

    /// Check if this is a kernel address.
    #[inline]
    pub const fn is_kernel(self) -> bool {
        self.0 >= KERNBASE
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtAddr({:#010x})", self.0)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}
