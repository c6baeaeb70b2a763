//! System Call Interface
//!
//! Entered through `int 0x30` from user mode with the kernel lock held.
//!
//! # Security Model
//! - Whitelist approach: only explicitly implemented syscalls are allowed
//! - All parameters are validated before use
//! - Invalid inputs return negative error codes, never panic
//!
//! # Register Convention
//! `eax` holds the number, `edx, ecx, ebx, edi, esi` the arguments, and the
//! result comes back in `eax`.

mod handler;
mod validate;

pub use handler::{dispatch, numbers, SyscallContext, SyscallOutcome};
pub use validate::{user_page, user_perm, UserBuffer};
