//! Page fault upcall stub.
//!
//! Runs on the exception stack with `esp` pointing at the record the
//! kernel pushed. After the user handler returns, the stub resumes the
//! trap-time context without entering the kernel: it stores the trap-time
//! `eip` in the word just below the trap-time stack pointer, restores the
//! registers and flags, switches to that stack and returns through the
//! stored word.
//!
//! The store can itself fault, for instance on a copy-on-write stack
//! page. That fault is taken on the exception stack and nests.

use alloc::format;

use super::Cpu;
use crate::mm::VirtAddr;
use crate::trap::UTrapframe;
use crate::ulib::{self, UserError};

impl Cpu<'_> {
    pub(super) fn run_upcall(&mut self) -> Result<(), UserError> {
        let env = self.running()?;
        let record = VirtAddr::new(self.tf().esp);

        let bytes = self.read_bytes(record, UTrapframe::SIZE)?;
        let Some(utf) = UTrapframe::from_bytes(&bytes) else {
            return Err(ulib::panic(self, format!("short fault record at {}", record)));
        };

        let Some(handler) = self.machine().runtime().handler(env) else {
            return Err(ulib::panic(self, format!("no page fault handler for {}", env)));
        };
        handler(self, &utf)?;

        let slot = VirtAddr::new(utf.esp.wrapping_sub(4));
        self.store_u32(slot, utf.eip)?;

        let tf = self.tf_mut();
        tf.regs = utf.regs;
        tf.eflags = utf.eflags;
        tf.esp = utf.esp;
        tf.eip = utf.eip;
        Ok(())
    }
}
