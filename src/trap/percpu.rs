//! Per-CPU State
//!
//! Each CPU owns one [`CpuInfo`] slot, indexed by its [`CpuId`]. A slot is
//! written only by the CPU it describes, except for the status word that
//! the boot CPU reads while bringing the others up.
//!
//! # Security Properties
//! - Every CPU runs on its own kernel stack, recorded in its task state
//! - A task state can be activated exactly once

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};

use spin::{Mutex, Once};

use super::frame::TrapFrame;
use super::GD_KD;
use super::GD_TSS0;
use crate::env::EnvId;
use crate::mm::kstack::KernelStack;
use crate::mm::memlayout::{KSTACKTOP, KSTKGAP, KSTKSIZE};

/// Index of a processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CpuId(u8);

impl CpuId {
    /// The processor that boots the system.
    pub const BOOT: CpuId = CpuId(0);

    pub const fn new(index: u8) -> Self {
        Self(index)
    }

    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Lifecycle of a CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CpuStatus {
    /// Not brought up yet.
    Unused = 0,
    /// Running kernel or user code.
    Started = 1,
    /// Halted waiting for an interrupt, without the kernel lock.
    Halted = 2,
}

impl CpuStatus {
    const fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::Started,
            2 => Self::Halted,
            _ => Self::Unused,
        }
    }
}

/// The task state segment fields the kernel uses: where the processor
/// switches its stack to when an event arrives from ring 3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskState {
    /// Kernel stack pointer loaded on a ring transition.
    pub esp0: u32,
    /// Kernel stack segment loaded on a ring transition.
    pub ss0: u16,
    /// GDT selector of this descriptor.
    pub selector: u16,
    /// Memory backing the stack.
    pub stack: KernelStack,
}

impl TaskState {
    /// Task state of `cpu`. Stacks are laid out downward from `KSTACKTOP`
    /// with an unmapped gap between neighbours.
    pub fn new(cpu: CpuId, stack: KernelStack) -> Self {
        let i = cpu.index() as u32;
        Self {
            esp0: KSTACKTOP - i * (KSTKSIZE + KSTKGAP),
            ss0: GD_KD,
            selector: GD_TSS0 + ((i as u16) << 3),
            stack,
        }
    }
}

/// Raw value meaning "no current environment".
const NO_ENV: u32 = 0;

/// State of one CPU.
pub struct CpuInfo {
    id: CpuId,
    status: AtomicU8,
    /// EFLAGS.IF of this CPU.
    interrupts: AtomicBool,
    /// Last page fault linear address.
    cr2: AtomicU32,
    /// Environment this CPU is running, if any.
    env: AtomicU32,
    ts: Once<TaskState>,
    idt_loaded: AtomicBool,
    /// Most recent frame seen by the trap handler, for diagnostics.
    last_tf: Mutex<Option<TrapFrame>>,
}

impl CpuInfo {
    pub const fn new(id: CpuId) -> Self {
        Self {
            id,
            status: AtomicU8::new(CpuStatus::Unused as u8),
            interrupts: AtomicBool::new(false),
            cr2: AtomicU32::new(0),
            env: AtomicU32::new(NO_ENV),
            ts: Once::new(),
            idt_loaded: AtomicBool::new(false),
            last_tf: Mutex::new(None),
        }
    }

    pub fn id(&self) -> CpuId {
        self.id
    }

    pub fn status(&self) -> CpuStatus {
        CpuStatus::from_raw(self.status.load(Ordering::Acquire))
    }

    pub fn set_status(&self, status: CpuStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    /// Mark the CPU started, returning the previous status.
    pub fn mark_started(&self) -> CpuStatus {
        CpuStatus::from_raw(self.status.swap(CpuStatus::Started as u8, Ordering::AcqRel))
    }

    pub fn interrupts_enabled(&self) -> bool {
        self.interrupts.load(Ordering::Acquire)
    }

    pub fn set_interrupts(&self, enabled: bool) {
        self.interrupts.store(enabled, Ordering::Release);
    }

    pub fn cr2(&self) -> u32 {
        self.cr2.load(Ordering::Acquire)
    }

    pub fn set_cr2(&self, va: u32) {
        self.cr2.store(va, Ordering::Release);
    }

    pub fn curenv(&self) -> Option<EnvId> {
        match self.env.load(Ordering::Acquire) {
            NO_ENV => None,
            raw => Some(EnvId::from_raw(raw)),
        }
    }

    pub fn set_curenv(&self, env: Option<EnvId>) {
        let raw = env.map_or(NO_ENV, EnvId::as_u32);
        self.env.store(raw, Ordering::Release);
    }

    /// Activated task state, if any.
    pub fn task_state(&self) -> Option<&TaskState> {
        self.ts.get()
    }

    /// Activate `ts` for this CPU.
    ///
    /// Returns `None` if a task state was already active; the caller
    /// treats that as fatal.
    pub fn activate(&self, ts: TaskState) -> Option<&TaskState> {
        let mut fresh = false;
        let active = self.ts.call_once(|| {
            fresh = true;
            ts
        });
        fresh.then_some(active)
    }

    /// Point this CPU at the shared vector table.
    pub fn load_idt(&self) {
        self.idt_loaded.store(true, Ordering::Release);
    }

    pub fn idt_loaded(&self) -> bool {
        self.idt_loaded.load(Ordering::Acquire)
    }

    pub fn record(&self, tf: &TrapFrame) {
        *self.last_tf.lock() = Some(*tf);
    }

    pub fn last_trapframe(&self) -> Option<TrapFrame> {
        *self.last_tf.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::KernelStackArena;

    #[test]
    fn test_task_state_layout() {
        let arena = KernelStackArena::new(2);
        let ts0 = TaskState::new(CpuId::new(0), arena.allocate().unwrap());
        let ts1 = TaskState::new(CpuId::new(1), arena.allocate().unwrap());

        assert_eq!(ts0.esp0, KSTACKTOP);
        assert_eq!(ts1.esp0, KSTACKTOP - (KSTKSIZE + KSTKGAP));
        assert_eq!(ts1.selector, GD_TSS0 + 8);
        assert!(!ts0.stack.overlaps(&ts1.stack));
    }

    #[test]
    fn test_second_activation_rejected() {
        let arena = KernelStackArena::new(2);
        let cpu = CpuInfo::new(CpuId::new(3));

        let first = TaskState::new(cpu.id(), arena.allocate().unwrap());
        assert_eq!(cpu.activate(first).copied(), Some(first));

        let second = TaskState::new(cpu.id(), arena.allocate().unwrap());
        assert!(cpu.activate(second).is_none());
        assert_eq!(cpu.task_state(), Some(&first));
    }

    #[test]
    fn test_status_swap() {
        let cpu = CpuInfo::new(CpuId::new(1));
        cpu.set_status(CpuStatus::Halted);
        assert_eq!(cpu.mark_started(), CpuStatus::Halted);
        assert_eq!(cpu.status(), CpuStatus::Started);
    }
}
