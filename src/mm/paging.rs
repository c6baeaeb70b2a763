//! Two-Level Page Tables
//!
//! Implements 32-bit paging with 4KB pages.
//!
//! # Page Table Structure
//! - Page directory: 1024 entries, each covers 4MB
//! - Page table: 1024 entries, each covers 4KB
//!
//! # Security Properties
//! - Page flags are strictly typed
//! - User space may only request permissions inside `PteFlags::SYSCALL`
//! - Every mapping holds a reference on its frame, so a frame shared by
//!   several address spaces outlives every one of its mappings

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::ops::{Index, IndexMut};

use bitflags::bitflags;

use super::frame::FrameAllocator;
use super::memlayout::{PhysAddr, VirtAddr, NPDENTRIES, NPTENTRIES, PGSIZE, PTSIZE};
use crate::error::Error;
use crate::trap::FaultCode;

bitflags! {
    /// Page table entry flags.
    ///
    /// The low twelve bits of every entry. Bits 9-11 are ignored by the
    /// MMU and free for the kernel and user library.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct PteFlags: u32 {
        /// Present
        const PRESENT       = 0x001;
        /// Writeable
        const WRITABLE      = 0x002;
        /// User
        const USER          = 0x004;
        /// Write-Through
        const WRITE_THROUGH = 0x008;
        /// Cache-Disable
        const CACHE_DISABLE = 0x010;
        /// Accessed
        const ACCESSED      = 0x020;
        /// Dirty
        const DIRTY         = 0x040;
        /// Page Size
        const HUGE          = 0x080;
        /// Global
        const GLOBAL        = 0x100;

        /// Mapping is shared across fork, never made copy-on-write.
        const SHARE         = 0x400;
        /// Copy-on-write marker. Never set together with WRITABLE.
        const COW           = 0x800;
        /// All software-available bits.
        const AVAIL         = 0xE00;

        /// The only flags user space may pass to the mapping syscalls.
        const SYSCALL = Self::AVAIL.bits() | Self::PRESENT.bits()
            | Self::WRITABLE.bits() | Self::USER.bits();

        /// User read-write page.
        const USER_RW = Self::PRESENT.bits() | Self::WRITABLE.bits() | Self::USER.bits();
        /// User read-only page.
        const USER_RO = Self::PRESENT.bits() | Self::USER.bits();
    }
}

/// A single page table entry: frame address in bits 31:12, flags below.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct PageTableEntry(u32);

impl PageTableEntry {
    /// Address mask for page table entries (bits [31:12]).
    const ADDR_MASK: u32 = 0xFFFF_F000;

    /// Create an invalid (empty) entry.
    #[inline]
    pub const fn invalid() -> Self {
        Self(0)
    }

    /// Create a page entry mapping a physical frame.
    #[inline]
    pub const fn page(phys: PhysAddr, flags: PteFlags) -> Self {
        Self((phys.as_u32() & Self::ADDR_MASK) | (flags.bits() & !Self::ADDR_MASK))
    }

    /// Check if the entry is present.
    #[inline]
    pub const fn is_present(self) -> bool {
        self.0 & PteFlags::PRESENT.bits() != 0
    }

    /// Get the physical address from this entry.
    #[inline]
    pub const fn addr(self) -> PhysAddr {
        PhysAddr::new(self.0 & Self::ADDR_MASK)
    }

    /// Get the flags from this entry.
    #[inline]
    pub const fn flags(self) -> PteFlags {
        PteFlags::from_bits_retain(self.0 & !Self::ADDR_MASK)
    }

    /// Get the raw value, as the user page table view exposes it.
    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Clear the entry (make invalid).
    #[inline]
    pub fn clear(&mut self) {
        self.0 = 0;
    }
}

impl core::fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if self.is_present() {
            write!(f, "PTE(addr={}, flags={:?})", self.addr(), self.flags())
        } else {
            write!(f, "PTE(invalid)")
        }
    }
}

/// One page table: 1024 entries.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; NPTENTRIES],
}

impl PageTable {
    /// Create a new empty page table (all entries invalid).
    pub const fn new() -> Self {
        const INVALID: PageTableEntry = PageTableEntry::invalid();
        Self {
            entries: [INVALID; NPTENTRIES],
        }
    }

    /// Iterate over all present entries with their indices.
    pub fn iter_present(&self) -> impl Iterator<Item = (usize, &PageTableEntry)> {
        self.entries.iter().enumerate().filter(|(_, e)| e.is_present())
    }
}

impl Index<usize> for PageTable {
    type Output = PageTableEntry;

    #[inline]
    fn index(&self, index: usize) -> &Self::Output {
        &self.entries[index]
    }
}

impl IndexMut<usize> for PageTable {
    #[inline]
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        &mut self.entries[index]
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}

/// A page directory slot: the frame backing the table plus its entries.
struct PageDirEntry {
    frame: PhysAddr,
    table: Box<PageTable>,
}

/// A process address space.
///
/// The page directory and every page table occupy one frame each, so
/// building mappings can fail with [`Error::NoMem`].
pub struct AddressSpace {
    root: PhysAddr,
    dir: Vec<Option<PageDirEntry>>,
}

impl AddressSpace {
    /// Allocate an empty address space.
    pub fn new(frames: &mut FrameAllocator) -> Result<Self, Error> {
        let root = frames.alloc().ok_or(Error::NoMem)?;
        frames.incref(root)?;

        let mut dir = Vec::with_capacity(NPDENTRIES);
        dir.resize_with(NPDENTRIES, || None);

        Ok(Self { root, dir })
    }

    /// Physical address of the page directory.
    pub fn root(&self) -> PhysAddr {
        self.root
    }

    /// Page directory entry `pdx` as user space sees it.
    pub fn pde(&self, pdx: usize) -> PageTableEntry {
        match self.dir.get(pdx) {
            Some(Some(pde)) => PageTableEntry::page(pde.frame, PteFlags::USER_RW),
            _ => PageTableEntry::invalid(),
        }
    }

    /// Page table entry for `va`, if its page table exists.
    pub fn pte(&self, va: VirtAddr) -> PageTableEntry {
        match self.dir.get(va.pdx()) {
            Some(Some(pde)) => pde.table[va.ptx()],
            _ => PageTableEntry::invalid(),
        }
    }

    /// Frame and flags mapped at `va`.
    pub fn lookup(&self, va: VirtAddr) -> Option<(PhysAddr, PteFlags)> {
        let pte = self.pte(va);
        pte.is_present().then(|| (pte.addr(), pte.flags()))
    }

    /// Page table covering `va`, allocating it on demand.
    fn table_or_create(
        &mut self,
        frames: &mut FrameAllocator,
        va: VirtAddr,
    ) -> Result<&mut PageTable, Error> {
        let slot = &mut self.dir[va.pdx()];

        if slot.is_none() {
            let frame = frames.alloc().ok_or(Error::NoMem)?;
            frames.incref(frame)?;
            *slot = Some(PageDirEntry {
                frame,
                table: Box::new(PageTable::new()),
            });
        }

        match slot {
            Some(pde) => Ok(&mut *pde.table),
            None => Err(Error::NoMem),
        }
    }

    /// Map frame `pa` at `va` with `perm | PRESENT`.
    ///
    /// Any previous mapping at `va` is removed. Re-inserting the frame that
    /// is already mapped at `va` only changes the permissions. Fails with
    /// [`Error::NoMem`] without touching the entry when `pa` cannot take
    /// another reference.
    pub fn insert(
        &mut self,
        frames: &mut FrameAllocator,
        pa: PhysAddr,
        va: VirtAddr,
        perm: PteFlags,
    ) -> Result<(), Error> {
        let table = self.table_or_create(frames, va)?;
        let entry = &mut table[va.ptx()];

        if !(entry.is_present() && entry.addr() == pa) {
            frames.incref(pa)?;
            if entry.is_present() {
                frames.decref(entry.addr());
            }
        }
        *entry = PageTableEntry::page(pa, perm | PteFlags::PRESENT);

        Ok(())
    }

    /// Map a fresh zeroed frame at `va`.
    ///
    /// The frame goes back to the pool if the mapping cannot be built.
    pub fn alloc_page(
        &mut self,
        frames: &mut FrameAllocator,
        va: VirtAddr,
        perm: PteFlags,
    ) -> Result<PhysAddr, Error> {
        let pa = frames.alloc().ok_or(Error::NoMem)?;

        if let Err(e) = self.insert(frames, pa, va, perm) {
            frames.free(pa);
            return Err(e);
        }

        Ok(pa)
    }

    /// Unmap `va`; silently does nothing if nothing is mapped there.
    pub fn remove(&mut self, frames: &mut FrameAllocator, va: VirtAddr) {
        if let Some(Some(pde)) = self.dir.get_mut(va.pdx()) {
            let entry = &mut pde.table[va.ptx()];
            if entry.is_present() {
                frames.decref(entry.addr());
                entry.clear();
            }
        }
    }

    /// Check that `[va, va + len)` is mapped with at least `perm | PRESENT`
    /// and lies below `ULIM`.
    ///
    /// Returns the first address that fails the check.
    pub fn user_mem_check(&self, va: VirtAddr, len: u32, perm: PteFlags) -> Result<(), VirtAddr> {
        if len == 0 {
            return Ok(());
        }

        let need = perm | PteFlags::PRESENT;
        let end = va.as_u32().checked_add(len).ok_or(va)?;
        let mut page = va.align_down();

        while page.as_u32() < end {
            let first_bad = if page < va { va } else { page };

            if page.as_u32() >= super::memlayout::ULIM {
                return Err(first_bad);
            }

            if !self.pte(page).flags().contains(need) {
                return Err(first_bad);
            }

            match page.as_u32().checked_add(PGSIZE) {
                Some(next) => page = VirtAddr::new(next),
                None => break,
            }
        }

        Ok(())
    }

    /// MMU walk for a user-mode access.
    ///
    /// Returns the physical address or the page-fault error code the
    /// hardware would report.
    pub fn translate(&self, va: VirtAddr, write: bool) -> Result<PhysAddr, FaultCode> {
        let mut code = FaultCode::USER;
        if write {
            code |= FaultCode::WRITE;
        }

        let pte = self.pte(va);
        if !pte.is_present() {
            return Err(code);
        }

        let flags = pte.flags();
        if !flags.contains(PteFlags::USER) || (write && !flags.contains(PteFlags::WRITABLE)) {
            return Err(code | FaultCode::PROTECTION);
        }

        Ok(pte.addr().add(va.page_offset() as u32))
    }

    /// Copy `bytes` into this address space at `va` on behalf of the kernel.
    ///
    /// The caller has already validated the range with `user_mem_check`.
    pub fn copy_out(
        &self,
        frames: &mut FrameAllocator,
        va: VirtAddr,
        bytes: &[u8],
    ) -> Result<(), VirtAddr> {
        let mut done = 0usize;

        while done < bytes.len() {
            let cur = va.add(done as u32);
            let (pa, _) = self.lookup(cur).ok_or(cur)?;
            let off = cur.page_offset();
            let n = (PGSIZE as usize - off).min(bytes.len() - done);

            frames.page_mut(pa)[off..off + n].copy_from_slice(&bytes[done..done + n]);
            done += n;
        }

        Ok(())
    }

    /// Copy `len` bytes out of this address space starting at `va`.
    pub fn copy_in(&self, frames: &FrameAllocator, va: VirtAddr, len: usize) -> Result<Vec<u8>, VirtAddr> {
        let mut out = Vec::with_capacity(len);

        while out.len() < len {
            let cur = va.add(out.len() as u32);
            let (pa, _) = self.lookup(cur).ok_or(cur)?;
            let off = cur.page_offset();
            let n = (PGSIZE as usize - off).min(len - out.len());

            out.extend_from_slice(&frames.page(pa)[off..off + n]);
        }

        Ok(out)
    }

    /// Iterate over every present user mapping.
    pub fn mappings(&self) -> impl Iterator<Item = (VirtAddr, PageTableEntry)> + '_ {
        self.dir.iter().enumerate().flat_map(|(pdx, slot)| {
            slot.iter().flat_map(move |pde| {
                pde.table.iter_present().map(move |(ptx, pte)| {
                    let va = (pdx as u32) * PTSIZE + (ptx as u32) * PGSIZE;
                    (VirtAddr::new(va), *pte)
                })
            })
        })
    }

    /// Tear down every mapping, page table and the page directory.
    pub fn free(mut self, frames: &mut FrameAllocator) {
        for slot in self.dir.iter_mut() {
            if let Some(pde) = slot.take() {
                for (_, pte) in pde.table.iter_present() {
                    frames.decref(pte.addr());
                }
                frames.decref(pde.frame);
            }
        }
        frames.decref(self.root);
    }
}
