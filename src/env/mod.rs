//! Environments (user processes)
//!
//! The kernel only tracks what trap dispatch and fork need: identity,
//! status, the saved register state, the page fault upcall and the
//! address space.
//!
//! # Identity
//! An [`EnvId`] is `generation | index`. Every reuse of a table slot bumps
//! the generation, so a stale id never reaches the slot's new occupant.
//! Id 0 means "the caller" in system calls and never names a real
//! environment.

mod table;

pub use table::{EnvTable, ProgramImage, Segment};

use core::fmt;

use crate::mm::{AddressSpace, VirtAddr};
use crate::trap::{CpuId, TrapFrame};

/// Bits of an id that hold the table index.
pub const LOG2NENV: u32 = 10;
/// Maximum number of environments.
pub const NENV: usize = 1 << LOG2NENV;
/// Generation increment applied on slot reuse.
pub const ENVGENSHIFT: u32 = 12;

/// Environment identifier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EnvId(u32);

impl EnvId {
    /// "The calling environment", as accepted by system calls.
    pub const CURRENT: EnvId = EnvId(0);

    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Table slot this id refers to.
    #[inline]
    pub const fn index(self) -> usize {
        (self.0 as usize) & (NENV - 1)
    }

    pub const fn is_current(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for EnvId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EnvId({:08x})", self.0)
    }
}

impl fmt::Display for EnvId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// Scheduling state of an environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum EnvStatus {
    Free = 0,
    /// Destroyed while running on another CPU; that CPU frees it on its
    /// next trap.
    Dying = 1,
    Runnable = 2,
    Running = 3,
    NotRunnable = 4,
}

impl EnvStatus {
    /// Decode the value passed to `env_set_status`.
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Free),
            1 => Some(Self::Dying),
            2 => Some(Self::Runnable),
            3 => Some(Self::Running),
            4 => Some(Self::NotRunnable),
            _ => None,
        }
    }
}

/// One environment.
pub struct Env {
    pub id: EnvId,
    /// Creator; `EnvId::CURRENT` for environments built by the kernel.
    pub parent_id: EnvId,
    pub status: EnvStatus,
    /// Register state restored when the environment next runs.
    pub tf: TrapFrame,
    /// User entry point for page faults.
    pub pgfault_upcall: Option<VirtAddr>,
    pub space: AddressSpace,
    /// CPU the environment last ran on.
    pub cpunum: Option<CpuId>,
    /// Number of times the environment was scheduled.
    pub runs: u32,
}

impl fmt::Debug for Env {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Env")
            .field("id", &self.id)
            .field("parent_id", &self.parent_id)
            .field("status", &self.status)
            .field("pgfault_upcall", &self.pgfault_upcall)
            .field("cpunum", &self.cpunum)
            .field("runs", &self.runs)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envid_index() {
        let id = EnvId::from_raw((3 << ENVGENSHIFT) | 17);
        assert_eq!(id.index(), 17);
        assert!(!id.is_current());
        assert!(EnvId::CURRENT.is_current());
        assert_eq!(format!("{}", id), "00003011");
    }

    #[test]
    fn test_status_values() {
        assert_eq!(EnvStatus::from_raw(2), Some(EnvStatus::Runnable));
        assert_eq!(EnvStatus::from_raw(4), Some(EnvStatus::NotRunnable));
        assert_eq!(EnvStatus::from_raw(5), None);
        assert_eq!(EnvStatus::Running as u32, 3);
    }
}
