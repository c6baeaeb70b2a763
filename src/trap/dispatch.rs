//! Trap Dispatch
//!
//! [`Kernel::trap`] is entered with interrupts disabled on every vectored
//! event. An event from user mode (or one that wakes a halted CPU) takes
//! the big kernel lock, saves the trap frame into the current environment
//! and continues on that saved copy, so whatever the handlers change is
//! what the environment resumes with.
//!
//! # Outcomes
//! - Page fault, breakpoint, spurious interrupt, system call: resume the
//!   current environment if it is still running, otherwise reschedule
//! - Timer: acknowledge, then reschedule
//! - Anything else: destroy the environment it came from, or halt the
//!   machine if it came from the kernel
//!
//! Events from kernel mode on a running CPU never take the lock; the only
//! ones the kernel survives are breakpoints and spurious interrupts.

use alloc::format;
use alloc::string::String;

use super::frame::TrapFrame;
use super::percpu::CpuStatus;
use super::{
    trapname, CpuId, TrapOutcome, IRQ_OFFSET, IRQ_SPURIOUS, IRQ_TIMER, T_BRKPT, T_PGFLT, T_SYSCALL,
};
use crate::env::{EnvId, EnvStatus};
use crate::kernel::{Kernel, KernelState};
use crate::kprintln;
use crate::sched;
use crate::sync::KernelGuard;
use crate::syscall::{self, SyscallContext, SyscallOutcome};

const TIMER: u32 = IRQ_OFFSET + IRQ_TIMER;
const SPURIOUS: u32 = IRQ_OFFSET + IRQ_SPURIOUS;

/// What to do once a handler returns.
pub(super) enum Next {
    /// Resume the current environment if it is still running.
    Resume,
    /// Pick another environment.
    Yield,
    /// Halt every CPU.
    Fatal(String),
}

/// The frame being handled: the environment's saved copy for traps from
/// user mode, the stack copy otherwise.
fn frame_mut<'a>(
    state: &'a mut KernelState,
    env: Option<EnvId>,
    local: &'a mut TrapFrame,
) -> &'a mut TrapFrame {
    if let Some(id) = env {
        if let Some(env) = state.envs.get_mut(id) {
            return &mut env.tf;
        }
    }
    local
}

impl Kernel {
    /// Common trap entry.
    pub fn trap(&self, cpu: CpuId, tf: TrapFrame) -> TrapOutcome {
        let info = self.cpu(cpu);

        // The gate cleared IF on the way in.
        if info.interrupts_enabled() {
            return self.fatal(cpu, String::from("trap entered with interrupts enabled"));
        }

        if self.panicked().is_some() {
            return self.halt(cpu);
        }

        let was_halted = info.mark_started() == CpuStatus::Halted;

        if tf.from_user() || was_halted {
            let guard = self.lock().lock(cpu);
            // Another CPU may have panicked while we spun.
            if self.panicked().is_some() {
                drop(guard);
                return self.halt(cpu);
            }
            return self.trap_locked(cpu, tf, guard);
        }

        self.trap_kernel(cpu, tf)
    }

    fn trap_locked(
        &self,
        cpu: CpuId,
        mut tf: TrapFrame,
        mut guard: KernelGuard<'_, KernelState>,
    ) -> TrapOutcome {
        let info = self.cpu(cpu);
        let mut env = None;

        if tf.from_user() {
            let Some(id) = info.curenv() else {
                drop(guard);
                return self.fatal(cpu, String::from("trap from user mode without an environment"));
            };

            match guard.envs.status(id) {
                EnvStatus::Free => {
                    drop(guard);
                    return self.fatal(cpu, format!("current environment {} is gone", id));
                }
                EnvStatus::Dying => {
                    self.destroy_env(cpu, &mut guard, id);
                    return sched::sched_yield(self, cpu, guard);
                }
                _ => {
                    if let Some(saved) = guard.envs.get_mut(id) {
                        saved.tf = tf;
                    }
                    env = Some(id);
                }
            }
        }

        info.record(&tf);

        match self.dispatch(cpu, &mut guard, env, &mut tf) {
            Next::Resume => match info.curenv() {
                Some(id) if guard.envs.status(id) == EnvStatus::Running => {
                    sched::env_run(self, cpu, guard, id)
                }
                _ => sched::sched_yield(self, cpu, guard),
            },
            Next::Yield => sched::sched_yield(self, cpu, guard),
            Next::Fatal(message) => {
                drop(guard);
                self.fatal(cpu, message)
            }
        }
    }

    fn dispatch(
        &self,
        cpu: CpuId,
        state: &mut KernelState,
        env: Option<EnvId>,
        local: &mut TrapFrame,
    ) -> Next {
        let tf = *frame_mut(state, env, local);

        match (tf.trapno, env) {
            (T_PGFLT, _) => self.page_fault_handler(cpu, state, env, &tf),
            (T_BRKPT, _) => {
                self.platform()
                    .monitor
                    .breakpoint(cpu, frame_mut(state, env, local));
                Next::Resume
            }
            (T_SYSCALL, Some(caller)) => self.syscall(cpu, state, caller, &tf),
            (SPURIOUS, _) => {
                kprintln!("Spurious interrupt on irq {}", IRQ_SPURIOUS);
                self.print_trapframe(cpu, &tf);
                Next::Resume
            }
            (TIMER, _) => {
                self.platform().lapic.eoi(cpu);
                Next::Yield
            }
            (_, Some(id)) => {
                self.print_trapframe(cpu, &tf);
                self.destroy_env(cpu, state, id);
                Next::Resume
            }
            (trapno, None) => {
                self.print_trapframe(cpu, &tf);
                Next::Fatal(format!("unhandled trap {} ({}) in kernel", trapno, trapname(trapno)))
            }
        }
    }

    fn syscall(&self, cpu: CpuId, state: &mut KernelState, caller: EnvId, tf: &TrapFrame) -> Next {
        let r = &tf.regs;
        let args = [r.edx, r.ecx, r.ebx, r.edi, r.esi];

        let outcome = {
            let mut ctx = SyscallContext::new(self, cpu, state, caller);
            syscall::dispatch(&mut ctx, r.eax, args)
        };

        match outcome {
            SyscallOutcome::Return(value) => {
                if let Some(env) = state.envs.get_mut(caller) {
                    env.tf.regs.eax = value as u32;
                }
                Next::Resume
            }
            SyscallOutcome::Reschedule => {
                if let Some(env) = state.envs.get_mut(caller) {
                    env.tf.regs.eax = 0;
                }
                Next::Yield
            }
        }
    }

    /// Trap from kernel mode on a CPU that was running: no lock, no shared
    /// state.
    fn trap_kernel(&self, cpu: CpuId, mut tf: TrapFrame) -> TrapOutcome {
        let info = self.cpu(cpu);
        info.record(&tf);

        let outcome = match tf.trapno {
            T_PGFLT => {
                self.print_trapframe(cpu, &tf);
                return self.fatal(
                    cpu,
                    format!("kernel page fault va {:08x} ip {:08x}", info.cr2(), tf.eip),
                );
            }
            T_BRKPT => {
                self.platform().monitor.breakpoint(cpu, &mut tf);
                TrapOutcome::ReturnToKernel(tf)
            }
            SPURIOUS => {
                kprintln!("Spurious interrupt on irq {}", IRQ_SPURIOUS);
                self.print_trapframe(cpu, &tf);
                TrapOutcome::ReturnToKernel(tf)
            }
            trapno => {
                self.print_trapframe(cpu, &tf);
                return self.fatal(
                    cpu,
                    format!("unhandled trap {} ({}) in kernel", trapno, trapname(trapno)),
                );
            }
        };

        info.set_interrupts(tf.eflags().contains(super::Eflags::IF));
        outcome
    }
}
