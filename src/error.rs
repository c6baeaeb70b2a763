//! Kernel error codes and fatal-condition records.

use alloc::string::String;
use core::fmt;

use crate::trap::percpu::CpuId;

/// Error codes handed back to user space as negative integers.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Unspecified or unknown problem
    Unspecified = 1,
    /// Environment doesn't exist or otherwise cannot be used
    BadEnv = 2,
    /// Invalid parameter
    Inval = 3,
    /// Request failed due to memory shortage
    NoMem = 4,
    /// Attempt to create a new environment beyond the maximum allowed
    NoFreeEnv = 5,
    /// Memory fault
    Fault = 6,
}

impl Error {
    /// Negative value placed in the caller's return register.
    #[inline]
    pub const fn code(self) -> i32 {
        -(self as i32)
    }

    /// Decode a negative syscall return value.
    pub const fn from_code(code: i32) -> Option<Self> {
        match code {
            -1 => Some(Self::Unspecified),
            -2 => Some(Self::BadEnv),
            -3 => Some(Self::Inval),
            -4 => Some(Self::NoMem),
            -5 => Some(Self::NoFreeEnv),
            -6 => Some(Self::Fault),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unspecified => write!(f, "unspecified error"),
            Self::BadEnv => write!(f, "bad environment"),
            Self::Inval => write!(f, "invalid parameter"),
            Self::NoMem => write!(f, "out of memory"),
            Self::NoFreeEnv => write!(f, "out of environments"),
            Self::Fault => write!(f, "segmentation fault"),
        }
    }
}

/// A fatal kernel condition. Once one is latched every CPU halts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelPanic {
    /// CPU that detected the condition.
    pub cpu: CpuId,
    /// What went wrong.
    pub message: String,
}

impl fmt::Display for KernelPanic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "kernel panic on CPU {}: {}", self.cpu.index(), self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_negative() {
        assert_eq!(Error::NoMem.code(), -4);
        assert_eq!(Error::from_code(-2), Some(Error::BadEnv));
        assert_eq!(Error::from_code(0), None);
        assert_eq!(Error::from_code(7), None);
    }
}
