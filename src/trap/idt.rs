//! Interrupt Descriptor Table
//!
//! One gate per vector. The table is built once before any CPU is started
//! and is read-only afterwards, so every CPU shares it without locking.
//!
//! # Security Properties
//! - Only breakpoint and system call gates are reachable from ring 3
//! - A software interrupt through a gate the caller may not use raises a
//!   general protection fault instead of running the handler

use super::{Privilege, GD_KT, IRQ_OFFSET, NIRQS, T_BRKPT, T_SYSCALL};
use crate::mm::memlayout::KERNBASE;

/// Number of vectors the processor supports.
pub const NVECTORS: usize = 256;

/// Address of vector 0's entry stub; the others follow at a fixed stride.
const STUB_BASE: u32 = KERNBASE + 0x0010_5000;
const STUB_STRIDE: u32 = 16;

/// Gate type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateKind {
    /// Clears the interrupt flag on delivery.
    Interrupt,
    /// Leaves the interrupt flag alone.
    Trap,
}

/// One IDT slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gate {
    pub present: bool,
    pub kind: GateKind,
    /// Code segment the handler runs in.
    pub selector: u16,
    /// Entry stub address.
    pub handler: u32,
    /// Least privileged level allowed to raise this vector with `int`.
    pub dpl: Privilege,
}

impl Gate {
    const fn absent() -> Self {
        Self {
            present: false,
            kind: GateKind::Interrupt,
            selector: 0,
            handler: 0,
            dpl: Privilege::Kernel,
        }
    }

    const fn interrupt(vector: u32, dpl: Privilege) -> Self {
        Self {
            present: true,
            kind: GateKind::Interrupt,
            selector: GD_KT,
            handler: STUB_BASE + vector * STUB_STRIDE,
            dpl,
        }
    }
}

/// Vectors whose hardware pushes an error code.
///
/// The entry stubs of every other vector push a zero in its place so the
/// trap frame layout is the same for all of them.
pub const fn pushes_error_code(vector: u32) -> bool {
    matches!(vector, 8 | 10..=14 | 17)
}

/// The interrupt descriptor table.
pub struct VectorTable {
    gates: [Gate; NVECTORS],
}

impl VectorTable {
    /// Build the table: exceptions 0-19 (minus the reserved 9 and 15), the
    /// sixteen hardware interrupt lines and the system call vector.
    pub fn install() -> Self {
        let mut gates = [Gate::absent(); NVECTORS];

        for vector in (0..=19u32).filter(|v| *v != 9 && *v != 15) {
            gates[vector as usize] = Gate::interrupt(vector, Privilege::Kernel);
        }
        gates[T_BRKPT as usize] = Gate::interrupt(T_BRKPT, Privilege::User);

        for vector in IRQ_OFFSET..IRQ_OFFSET + NIRQS {
            gates[vector as usize] = Gate::interrupt(vector, Privilege::Kernel);
        }

        gates[T_SYSCALL as usize] = Gate::interrupt(T_SYSCALL, Privilege::User);

        Self { gates }
    }

    /// Gate of `vector`, if one is installed.
    pub fn gate(&self, vector: u32) -> Option<&Gate> {
        self.gates.get(vector as usize).filter(|g| g.present)
    }

    /// Privilege check for `int vector` executed at privilege `cpl`.
    ///
    /// On failure returns the error code of the general protection fault
    /// the processor raises instead: the IDT selector of the vector.
    pub fn check_software(&self, vector: u32, cpl: Privilege) -> Result<&Gate, u32> {
        let gpf = (vector << 3) | 2;

        match self.gate(vector) {
            Some(gate) if gate.dpl >= cpl => Ok(gate),
            _ => Err(gpf),
        }
    }

    /// Iterate over installed gates with their vectors.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &Gate)> {
        self.gates
            .iter()
            .enumerate()
            .filter(|(_, g)| g.present)
            .map(|(v, g)| (v as u32, g))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trap::{IRQ_TIMER, T_DIVIDE, T_GPFLT, T_PGFLT};

    #[test]
    fn test_user_callable_vectors() {
        let idt = VectorTable::install();
        let user: alloc::vec::Vec<u32> = idt
            .iter()
            .filter(|(_, g)| g.dpl == Privilege::User)
            .map(|(v, _)| v)
            .collect();
        assert_eq!(user, [T_BRKPT, T_SYSCALL]);
    }

    #[test]
    fn test_every_vector_below_floor_faults() {
        let idt = VectorTable::install();
        for (vector, gate) in idt.iter() {
            let res = idt.check_software(vector, Privilege::User);
            if gate.dpl == Privilege::Kernel {
                assert_eq!(res, Err((vector << 3) | 2));
            } else {
                assert!(res.is_ok());
            }
            assert!(idt.check_software(vector, Privilege::Kernel).is_ok());
        }
    }

    #[test]
    fn test_reserved_and_unused_vectors_absent() {
        let idt = VectorTable::install();
        assert!(idt.gate(9).is_none());
        assert!(idt.gate(15).is_none());
        assert!(idt.gate(200).is_none());
        assert!(idt.gate(1000).is_none());
        assert!(idt.gate(T_DIVIDE).is_some());
        assert!(idt.gate(IRQ_OFFSET + IRQ_TIMER).is_some());
        assert_eq!(idt.check_software(9, Privilege::Kernel), Err((9 << 3) | 2));
    }

    #[test]
    fn test_error_code_vectors() {
        assert!(pushes_error_code(T_PGFLT));
        assert!(pushes_error_code(T_GPFLT));
        assert!(!pushes_error_code(T_BRKPT));
        assert!(!pushes_error_code(T_SYSCALL));
    }
}
