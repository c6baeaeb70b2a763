//! System Call Input Validation
//!
//! Every address and permission a system call receives from user space
//! passes through here before it reaches the memory or process tables.
//!
//! # Security Principles
//! - Validate ALL inputs before use
//! - Fail-secure: deny by default
//! - User buffers are copied into the kernel once, after the range check

use alloc::vec::Vec;
use core::fmt;

use crate::error::Error;
use crate::mm::memlayout::UTOP;
use crate::mm::{AddressSpace, FrameAllocator, PteFlags, VirtAddr};

/// A page-aligned user address below `UTOP`.
pub fn user_page(va: u32) -> Result<VirtAddr, Error> {
    let va = VirtAddr::new(va);
    if va.as_u32() >= UTOP || !va.is_aligned() {
        return Err(Error::Inval);
    }
    Ok(va)
}

/// Permissions user space asked for in a mapping call.
///
/// `USER | PRESENT` must be set and nothing outside `PteFlags::SYSCALL`
/// may be.
pub fn user_perm(perm: u32) -> Result<PteFlags, Error> {
    let flags = PteFlags::from_bits(perm).ok_or(Error::Inval)?;

    if !flags.contains(PteFlags::USER | PteFlags::PRESENT) {
        return Err(Error::Inval);
    }
    if !PteFlags::SYSCALL.contains(flags) {
        return Err(Error::Inval);
    }

    Ok(flags)
}

/// A user buffer copied into kernel memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserBuffer {
    bytes: Vec<u8>,
}

impl UserBuffer {
    /// Check that `[va, va + len)` is user-readable in `space`, then copy it.
    ///
    /// Returns the first address that failed the check.
    pub fn copy_in(
        space: &AddressSpace,
        frames: &FrameAllocator,
        va: VirtAddr,
        len: u32,
    ) -> Result<Self, VirtAddr> {
        space.user_mem_check(va, len, PteFlags::USER)?;
        let bytes = space.copy_in(frames, va, len as usize)?;
        Ok(Self { bytes })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl fmt::Display for UserBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &byte in &self.bytes {
            write!(f, "{}", byte as char)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::memlayout::{PGSIZE, ULIM, UTEXT};

    #[test]
    fn test_user_page_bounds() {
        assert_eq!(user_page(UTEXT), Ok(VirtAddr::new(UTEXT)));
        assert_eq!(user_page(UTEXT + 1), Err(Error::Inval));
        assert_eq!(user_page(UTOP), Err(Error::Inval));
        assert_eq!(user_page(UTOP - PGSIZE), Ok(VirtAddr::new(UTOP - PGSIZE)));
    }

    #[test]
    fn test_user_perm_whitelist() {
        let rw = PteFlags::USER_RW.bits();
        assert_eq!(user_perm(rw), Ok(PteFlags::USER_RW));
        assert!(user_perm(rw | PteFlags::COW.bits()).is_ok());

        // U and P are mandatory.
        assert_eq!(user_perm(PteFlags::WRITABLE.bits()), Err(Error::Inval));
        // Cache control is not for user space.
        assert_eq!(user_perm(rw | PteFlags::CACHE_DISABLE.bits()), Err(Error::Inval));
        // Undefined bits.
        assert_eq!(user_perm(rw | 0x1000), Err(Error::Inval));
    }

    #[test]
    fn test_copy_in_rejects_unmapped() {
        let mut frames = FrameAllocator::new(8);
        let mut space = AddressSpace::new(&mut frames).unwrap();
        let va = VirtAddr::new(UTEXT);
        space.alloc_page(&mut frames, va, PteFlags::USER_RO).unwrap();
        space.copy_out(&mut frames, va, b"hello").unwrap();

        let buf = UserBuffer::copy_in(&space, &frames, va, 5).unwrap();
        assert_eq!(buf.as_bytes(), b"hello");
        assert_eq!(format!("{}", buf), "hello");

        // Runs off the end of the only mapped page.
        let tail = va.add(PGSIZE - 2);
        assert_eq!(
            UserBuffer::copy_in(&space, &frames, tail, 4),
            Err(va.add(PGSIZE))
        );
        assert!(UserBuffer::copy_in(&space, &frames, VirtAddr::new(ULIM), 1).is_err());
    }
}
