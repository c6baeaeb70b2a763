//! User Exception Stack
//!
//! Page fault records are pushed onto a one-page stack just below
//! `UXSTACKTOP`. A fault taken while the handler is already running on
//! that stack pushes a new record below the current one, leaving one
//! scratch word in between for the handler's return sequence.

use core::fmt;

use super::frame::UTrapframe;
use crate::mm::memlayout::{PGSIZE, UXSTACKTOP};
use crate::mm::VirtAddr;

/// Size of the scratch word left below a nested fault's stack pointer.
pub const SCRATCH_WORD: u32 = 4;

/// The region `[top - size, top)` that fault records are placed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionStack {
    top: u32,
    size: u32,
}

/// The next record does not fit on the exception stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackOverflow {
    /// Stack pointer at the time of the fault.
    pub esp: u32,
}

impl fmt::Display for StackOverflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "exception stack overflow at esp {:08x}", self.esp)
    }
}

impl ExceptionStack {
    /// The user exception stack every environment gets.
    pub const fn user() -> Self {
        Self {
            top: UXSTACKTOP,
            size: PGSIZE,
        }
    }

    pub const fn top(&self) -> u32 {
        self.top
    }

    pub const fn bottom(&self) -> u32 {
        self.top - self.size
    }

    /// Whether a stack pointer lies on this stack.
    pub const fn contains(&self, esp: u32) -> bool {
        esp >= self.bottom() && esp < self.top
    }

    /// Where to write the record for a fault taken with stack pointer `esp`.
    pub fn place_frame(&self, esp: u32) -> Result<VirtAddr, StackOverflow> {
        let size = UTrapframe::SIZE as u32;

        let frame = if self.contains(esp) {
            esp.checked_sub(SCRATCH_WORD + size)
        } else {
            self.top.checked_sub(size)
        };

        match frame {
            Some(va) if va >= self.bottom() => Ok(VirtAddr::new(va)),
            _ => Err(StackOverflow { esp }),
        }
    }
}
