//! Big Kernel Lock
//!
//! One spinlock guards every piece of shared kernel state. A CPU takes it
//! when it enters the kernel from user mode (or wakes from a halt) and
//! drops it when it returns to user mode or halts again.
//!
//! # Security Properties
//! - The state is reachable only through a [`KernelGuard`], which only
//!   [`BigKernelLock::lock`] hands out
//! - A held-by counter is checked on every acquisition and must read 0 or 1
//! - Re-acquiring the lock on the CPU that holds it is a kernel bug and
//!   panics instead of deadlocking silently

use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicUsize, Ordering};

use spin::{Mutex, MutexGuard};

use crate::trap::percpu::CpuId;

/// Holder value meaning "nobody".
const NO_HOLDER: usize = usize::MAX;

/// The big kernel lock and the state it protects.
pub struct BigKernelLock<T> {
    inner: Mutex<T>,
    holder: AtomicUsize,
    held: AtomicUsize,
    max_held: AtomicUsize,
    acquisitions: AtomicUsize,
}

impl<T> BigKernelLock<T> {
    pub const fn new(state: T) -> Self {
        Self {
            inner: Mutex::new(state),
            holder: AtomicUsize::new(NO_HOLDER),
            held: AtomicUsize::new(0),
            max_held: AtomicUsize::new(0),
            acquisitions: AtomicUsize::new(0),
        }
    }

    /// Spin until the lock is free, then take it on behalf of `cpu`.
    ///
    /// # Panics
    /// Panics if `cpu` already holds the lock.
    pub fn lock(&self, cpu: CpuId) -> KernelGuard<'_, T> {
        if self.holder.load(Ordering::Acquire) == cpu.index() {
            panic!("kernel lock re-acquired by its holder, CPU {}", cpu.index());
        }

        let guard = self.inner.lock();
        self.holder.store(cpu.index(), Ordering::Release);

        let held = self.held.fetch_add(1, Ordering::AcqRel) + 1;
        self.max_held.fetch_max(held, Ordering::AcqRel);
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        assert!(held == 1, "kernel lock held by {} CPUs", held);

        KernelGuard {
            lock: self,
            guard,
            cpu,
        }
    }

    /// Raw access for the hardware model (page table walks of a CPU in
    /// user mode). Serialises with kernel entries but is not one.
    pub fn hardware(&self) -> MutexGuard<'_, T> {
        self.inner.lock()
    }

    /// CPU currently holding the lock.
    pub fn holder(&self) -> Option<CpuId> {
        match self.holder.load(Ordering::Acquire) {
            NO_HOLDER => None,
            i => Some(CpuId::new(i as u8)),
        }
    }

    /// Highest number of simultaneous holders ever observed.
    pub fn max_held(&self) -> usize {
        self.max_held.load(Ordering::Acquire)
    }

    /// Number of times the lock was taken.
    pub fn acquisitions(&self) -> usize {
        self.acquisitions.load(Ordering::Relaxed)
    }
}

/// Proof that the holder owns the big kernel lock.
///
/// Dropping the guard releases the lock.
pub struct KernelGuard<'a, T> {
    lock: &'a BigKernelLock<T>,
    guard: MutexGuard<'a, T>,
    cpu: CpuId,
}

impl<T> KernelGuard<'_, T> {
    /// CPU that took the lock.
    pub fn cpu(&self) -> CpuId {
        self.cpu
    }
}

impl<T> Deref for KernelGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for KernelGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for KernelGuard<'_, T> {
    fn drop(&mut self) {
        // Runs before the inner guard is dropped, so the counter is back to
        // zero before another CPU can get in.
        self.lock.holder.store(NO_HOLDER, Ordering::Release);
        self.lock.held.fetch_sub(1, Ordering::AcqRel);
    }
}
