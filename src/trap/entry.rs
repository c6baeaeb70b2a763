//! Gate delivery.
//!
//! What the processor does between an event and the first instruction of
//! the entry stub: pick the gate, enforce its privilege floor, mask
//! interrupts for interrupt gates, and push a uniform trap frame.

use alloc::format;

use super::idt::{pushes_error_code, GateKind};
use super::{FaultCode, TrapFrame, TrapOutcome, IRQ_OFFSET, NIRQS, T_GPFLT, T_PGFLT};
use crate::kernel::Kernel;
use crate::mm::VirtAddr;
use crate::trap::CpuId;

impl Kernel {
    fn deliver(&self, cpu: CpuId, vector: u32, err: u32, mut tf: TrapFrame) -> TrapOutcome {
        let Some(gate) = self.vectors().gate(vector) else {
            return self.fatal(cpu, format!("no gate for vector {}", vector));
        };

        tf.trapno = vector;
        tf.err = if pushes_error_code(vector) { err } else { 0 };

        if gate.kind == GateKind::Interrupt {
            self.cpu(cpu).set_interrupts(false);
        }

        self.trap(cpu, tf)
    }

    /// A processor exception raised by the instruction `tf` describes.
    pub fn exception(&self, cpu: CpuId, vector: u32, err: u32, tf: TrapFrame) -> TrapOutcome {
        self.deliver(cpu, vector, err, tf)
    }

    /// A page fault at `va`; the address is latched in CR2 first.
    pub fn page_fault(
        &self,
        cpu: CpuId,
        va: VirtAddr,
        code: FaultCode,
        tf: TrapFrame,
    ) -> TrapOutcome {
        self.cpu(cpu).set_cr2(va.as_u32());
        self.deliver(cpu, T_PGFLT, code.bits(), tf)
    }

    /// `int vector` executed with the privilege of `tf`.
    ///
    /// A gate the caller may not use turns into a general protection
    /// fault.
    pub fn software_interrupt(&self, cpu: CpuId, vector: u32, tf: TrapFrame) -> TrapOutcome {
        match self.vectors().check_software(vector, tf.privilege()) {
            Ok(_) => self.deliver(cpu, vector, 0, tf),
            Err(err) => self.deliver(cpu, T_GPFLT, err, tf),
        }
    }

    /// Hardware interrupt line `irq` raised while `cpu` was executing `tf`.
    ///
    /// Returns `None` if the CPU has interrupts masked; the line stays
    /// pending.
    pub fn interrupt(&self, cpu: CpuId, irq: u32, tf: TrapFrame) -> Option<TrapOutcome> {
        if irq >= NIRQS || !self.cpu(cpu).interrupts_enabled() {
            return None;
        }

        Some(self.deliver(cpu, IRQ_OFFSET + irq, 0, tf))
    }
}
