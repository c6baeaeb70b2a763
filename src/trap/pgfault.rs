//! Page Fault Handler
//!
//! Kernel-mode faults are fatal. A user-mode fault is reflected to the
//! environment's own handler: a [`UTrapframe`] is pushed onto the user
//! exception stack and the environment resumes at its upcall with the
//! stack pointer on that record. Anything that prevents the push destroys
//! the environment instead of faulting again inside the kernel.

use alloc::format;

use super::dispatch::Next;
use super::frame::{TrapFrame, UTrapframe};
use super::uxstack::ExceptionStack;
use crate::env::EnvId;
use crate::kernel::{Kernel, KernelState};
use crate::kprintln;
use crate::mm::PteFlags;
use crate::trap::CpuId;

impl Kernel {
    pub(super) fn page_fault_handler(
        &self,
        cpu: CpuId,
        state: &mut KernelState,
        env: Option<EnvId>,
        tf: &TrapFrame,
    ) -> Next {
        let fault_va = self.cpu(cpu).cr2();

        let Some(id) = env.filter(|_| tf.from_user()) else {
            self.print_trapframe(cpu, tf);
            return Next::Fatal(format!(
                "kernel page fault va {:08x} ip {:08x}",
                fault_va, tf.eip
            ));
        };

        let Some((tf, upcall)) = state.envs.get(id).map(|e| (e.tf, e.pgfault_upcall)) else {
            return Next::Resume;
        };

        let Some(upcall) = upcall else {
            kprintln!("[{}] user fault va {:08x} ip {:08x}", id, fault_va, tf.eip);
            self.print_trapframe(cpu, &tf);
            self.destroy_env(cpu, state, id);
            return Next::Resume;
        };

        let frame = match ExceptionStack::user().place_frame(tf.esp) {
            Ok(frame) => frame,
            Err(overflow) => {
                kprintln!("[{}] {}", id, overflow);
                self.destroy_env(cpu, state, id);
                return Next::Resume;
            }
        };

        let record = UTrapframe::from_trap(&tf, fault_va).to_bytes();
        let KernelState { envs, frames } = &mut *state;
        let Some(env) = envs.get_mut(id) else {
            return Next::Resume;
        };

        let checked = env
            .space
            .user_mem_check(frame, record.len() as u32, PteFlags::USER | PteFlags::WRITABLE)
            .and_then(|()| env.space.copy_out(frames, frame, &record));

        if let Err(bad) = checked {
            kprintln!("[{}] user_mem_check assertion failure for va {:08x}", id, bad.as_u32());
            self.destroy_env(cpu, state, id);
            return Next::Resume;
        }

        env.tf.eip = upcall.as_u32();
        env.tf.esp = frame.as_u32();
        Next::Resume
    }
}
