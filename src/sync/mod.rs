//! Kernel synchronisation primitives.

pub mod lock;

pub use lock::{BigKernelLock, KernelGuard};
