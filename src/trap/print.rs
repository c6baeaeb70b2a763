//! Trap frame diagnostics.

use core::fmt;

use super::frame::{FaultCode, TrapFrame};
use super::percpu::CpuId;
use super::{IRQ_OFFSET, NIRQS, T_PGFLT, T_SYSCALL};

const EXCNAMES: [&str; 20] = [
    "Divide error",
    "Debug",
    "Non-Maskable Interrupt",
    "Breakpoint",
    "Overflow",
    "BOUND Range Exceeded",
    "Invalid Opcode",
    "Device Not Available",
    "Double Fault",
    "Coprocessor Segment Overrun",
    "Invalid TSS",
    "Segment Not Present",
    "Stack Fault",
    "General Protection",
    "Page Fault",
    "(unknown trap)",
    "x87 FPU Floating-Point Error",
    "Alignment Check",
    "Machine-Check",
    "SIMD Floating-Point Exception",
];

/// Human readable name of a vector.
pub fn trapname(trapno: u32) -> &'static str {
    match trapno {
        n if (n as usize) < EXCNAMES.len() => EXCNAMES[n as usize],
        T_SYSCALL => "System call",
        n if (IRQ_OFFSET..IRQ_OFFSET + NIRQS).contains(&n) => "Hardware Interrupt",
        _ => "(unknown trap)",
    }
}

/// Full register dump of a trap frame.
pub struct TrapFrameDump<'a> {
    cpu: CpuId,
    tf: &'a TrapFrame,
    cr2: Option<u32>,
}

impl<'a> TrapFrameDump<'a> {
    /// `cr2` is shown for page faults only.
    pub fn new(cpu: CpuId, tf: &'a TrapFrame, cr2: Option<u32>) -> Self {
        Self { cpu, tf, cr2 }
    }
}

impl fmt::Display for TrapFrameDump<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tf = self.tf;
        let r = &tf.regs;

        writeln!(f, "TRAP frame from CPU {}", self.cpu.index())?;
        writeln!(f, "  edi  0x{:08x}", r.edi)?;
        writeln!(f, "  esi  0x{:08x}", r.esi)?;
        writeln!(f, "  ebp  0x{:08x}", r.ebp)?;
        writeln!(f, "  oesp 0x{:08x}", r.oesp)?;
        writeln!(f, "  ebx  0x{:08x}", r.ebx)?;
        writeln!(f, "  edx  0x{:08x}", r.edx)?;
        writeln!(f, "  ecx  0x{:08x}", r.ecx)?;
        writeln!(f, "  eax  0x{:08x}", r.eax)?;
        writeln!(f, "  es   0x----{:04x}", tf.es)?;
        writeln!(f, "  ds   0x----{:04x}", tf.ds)?;
        writeln!(f, "  trap 0x{:08x} {}", tf.trapno, trapname(tf.trapno))?;

        if tf.trapno == T_PGFLT {
            if let Some(cr2) = self.cr2 {
                writeln!(f, "  cr2  0x{:08x}", cr2)?;
            }
            let code = FaultCode::from_bits_retain(tf.err);
            writeln!(
                f,
                "  err  0x{:08x} [{}, {}, {}]",
                tf.err,
                if code.contains(FaultCode::USER) { "user" } else { "kernel" },
                if code.contains(FaultCode::WRITE) { "write" } else { "read" },
                if code.contains(FaultCode::PROTECTION) { "protection" } else { "not-present" },
            )?;
        } else {
            writeln!(f, "  err  0x{:08x}", tf.err)?;
        }

        writeln!(f, "  eip  0x{:08x}", tf.eip)?;
        writeln!(f, "  cs   0x----{:04x}", tf.cs)?;
        writeln!(f, "  flag 0x{:08x}", tf.eflags)?;

        if tf.from_user() {
            writeln!(f, "  esp  0x{:08x}", tf.esp)?;
            writeln!(f, "  ss   0x----{:04x}", tf.ss)?;
        }

        Ok(())
    }
}
