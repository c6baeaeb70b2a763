//! mpkern - Trap Dispatch and Copy-on-Write Fork for a Multiprocessor Kernel
//!
//! A small i386-style kernel core: per-CPU trap entry under one big kernel
//! lock, page faults reflected to user-level handlers on a dedicated
//! exception stack, and a user library that builds copy-on-write `fork`
//! on top of a handful of system calls.
//!
//! # Security Features
//! - User code can only raise the vectors whose gate allows it
//! - A fault in user mode destroys at most the faulting process
//! - Any unexpected fault in kernel mode halts every CPU
//! - Shared kernel state is only reachable through the lock guard
//!
//! # Architecture
//! - [`Kernel`] owns the vector table, the per-CPU slots and the locked
//!   state, and is entered through [`Kernel::trap`]
//! - The hardware side (gates, MMU walk, CR2) is modelled in software so
//!   the whole trap path runs hosted
//! - [`machine`] executes user programs against a kernel; [`ulib`] is the
//!   library those programs call

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

pub mod config;
pub mod drivers;
pub mod env;
pub mod error;
pub mod kernel;
pub mod logger;
pub mod machine;
pub mod mm;
pub mod sched;
pub mod sync;
pub mod syscall;
pub mod trap;
pub mod ulib;

pub use config::KernelConfig;
pub use env::{EnvId, EnvStatus};
pub use error::{Error, KernelPanic};
pub use kernel::Kernel;
pub use machine::{Cpu, Machine};
pub use trap::{CpuId, TrapFrame, TrapOutcome};

/// Crate version string
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
