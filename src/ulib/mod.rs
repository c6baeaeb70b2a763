//! User Library
//!
//! What user programs link against: system call wrappers, the page fault
//! handler registration, and copy-on-write `fork`. Every function runs in
//! user mode on a [`Cpu`], on behalf of the environment that CPU is
//! running.

mod fork;
mod pgfault;
mod syscall;

pub use fork::{duppage, fork, pgfault};
pub use pgfault::set_pgfault_handler;
pub use syscall::*;

use alloc::string::String;
use core::fmt;

use crate::error::Error;
use crate::machine::{Cpu, Stopped};
use crate::syscall::numbers::SYS_ENV_DESTROY;

/// Why a user library call did not complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserError {
    /// The kernel refused a system call.
    Kernel(Error),
    /// The CPU stopped running the caller.
    Stopped(Stopped),
    /// The caller panicked and was destroyed.
    Panicked {
        message: String,
        stopped: Option<Stopped>,
    },
}

impl From<Error> for UserError {
    fn from(e: Error) -> Self {
        Self::Kernel(e)
    }
}

impl From<Stopped> for UserError {
    fn from(s: Stopped) -> Self {
        Self::Stopped(s)
    }
}

impl fmt::Display for UserError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Kernel(e) => write!(f, "{}", e),
            Self::Stopped(s) => write!(f, "{}", s),
            Self::Panicked { message, .. } => write!(f, "user panic: {}", message),
        }
    }
}

/// Report `message` and destroy the calling environment.
pub fn panic(cpu: &mut Cpu<'_>, message: String) -> UserError {
    let env = cpu.env().map_or(0, |env| env.as_u32());
    log::error!("[{:08x}] user panic: {}", env, message);

    let stopped = cpu.syscall(SYS_ENV_DESTROY, [0; 5]).err();
    UserError::Panicked { message, stopped }
}
