//! Trap and Interrupt Handling
//!
//! Every vectored event (processor exception, system call, hardware
//! interrupt) enters the kernel through [`Kernel::trap`](crate::Kernel::trap).
//!
//! # Vectors
//! - 0-19: processor exceptions (9 and 15 reserved)
//! - 32-47: hardware interrupt lines (`IRQ_OFFSET + irq`)
//! - 48: system call
//!
//! # Privilege
//! - Only breakpoint and system call may be raised by user code
//! - Any other exception taken in kernel mode halts the machine
//! - User-mode faults never take down anything but the faulting process

mod dispatch;
mod entry;
pub mod frame;
pub mod idt;
pub mod percpu;
mod pgfault;
pub mod print;
pub mod uxstack;

pub use frame::{Eflags, FaultCode, Privilege, PushRegs, TrapFrame, UTrapframe};
pub use idt::{Gate, GateKind, VectorTable};
pub use percpu::{CpuId, CpuStatus, TaskState};
pub use print::{trapname, TrapFrameDump};
pub use uxstack::ExceptionStack;

use crate::env::EnvId;

/// Divide error
pub const T_DIVIDE: u32 = 0;
/// Debug exception
pub const T_DEBUG: u32 = 1;
/// Non-maskable interrupt
pub const T_NMI: u32 = 2;
/// Breakpoint
pub const T_BRKPT: u32 = 3;
/// Overflow
pub const T_OFLOW: u32 = 4;
/// Bounds check
pub const T_BOUND: u32 = 5;
/// Illegal opcode
pub const T_ILLOP: u32 = 6;
/// Device not available
pub const T_DEVICE: u32 = 7;
/// Double fault
pub const T_DBLFLT: u32 = 8;
/// Invalid task switch segment
pub const T_TSS: u32 = 10;
/// Segment not present
pub const T_SEGNP: u32 = 11;
/// Stack exception
pub const T_STACK: u32 = 12;
/// General protection fault
pub const T_GPFLT: u32 = 13;
/// Page fault
pub const T_PGFLT: u32 = 14;
/// Floating point error
pub const T_FPERR: u32 = 16;
/// Alignment check
pub const T_ALIGN: u32 = 17;
/// Machine check
pub const T_MCHK: u32 = 18;
/// SIMD floating point error
pub const T_SIMDERR: u32 = 19;

/// System call vector.
pub const T_SYSCALL: u32 = 48;

/// Vector of hardware IRQ 0.
pub const IRQ_OFFSET: u32 = 32;
/// Number of hardware interrupt lines.
pub const NIRQS: u32 = 16;

pub const IRQ_TIMER: u32 = 0;
pub const IRQ_KBD: u32 = 1;
pub const IRQ_SERIAL: u32 = 4;
/// Line the interrupt controller raises for noise.
pub const IRQ_SPURIOUS: u32 = 7;
pub const IRQ_IDE: u32 = 14;

/// Kernel text selector.
pub const GD_KT: u16 = 0x08;
/// Kernel data selector.
pub const GD_KD: u16 = 0x10;
/// User text selector.
pub const GD_UT: u16 = 0x18;
/// User data selector.
pub const GD_UD: u16 = 0x20;
/// Task state selector of CPU 0.
pub const GD_TSS0: u16 = 0x28;

/// Where a CPU ends up once the kernel is done with a trap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapOutcome {
    /// Returned to user mode in `env` with the given register state.
    Resumed { env: EnvId, tf: TrapFrame },
    /// A trap taken in kernel mode returned to the interrupted kernel code.
    ReturnToKernel(TrapFrame),
    /// Nothing to run; the CPU halted with interrupts enabled and the
    /// kernel lock released.
    Parked,
    /// The kernel panicked; this CPU is stopped for good.
    Halted,
}

impl TrapOutcome {
    /// Environment the CPU is running after the trap, if any.
    pub fn env(&self) -> Option<EnvId> {
        match self {
            Self::Resumed { env, .. } => Some(*env),
            _ => None,
        }
    }
}
