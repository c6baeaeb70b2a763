//! Local Interrupt Controller
//!
//! The trap handler only needs one operation from the local APIC:
//! acknowledging the interrupt being serviced. Until that happens the
//! controller does not deliver the next one on that CPU.

use alloc::boxed::Box;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::config::NCPU_MAX;
use crate::trap::CpuId;

/// What trap dispatch needs from an interrupt controller.
pub trait InterruptController: Send + Sync {
    /// Signal end of interrupt on `cpu`.
    fn eoi(&self, cpu: CpuId);
}

/// Local APIC model that counts acknowledgements per CPU.
pub struct Lapic {
    eois: Box<[AtomicUsize]>,
}

impl Lapic {
    pub fn new() -> Self {
        Self {
            eois: (0..NCPU_MAX).map(|_| AtomicUsize::new(0)).collect(),
        }
    }

    /// Interrupts acknowledged on `cpu` so far.
    pub fn eoi_count(&self, cpu: CpuId) -> usize {
        self.eois
            .get(cpu.index())
            .map_or(0, |n| n.load(Ordering::Acquire))
    }
}

impl Default for Lapic {
    fn default() -> Self {
        Self::new()
    }
}

impl InterruptController for Lapic {
    fn eoi(&self, cpu: CpuId) {
        if let Some(n) = self.eois.get(cpu.index()) {
            n.fetch_add(1, Ordering::AcqRel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eoi_counts_per_cpu() {
        let lapic = Lapic::new();
        lapic.eoi(CpuId::new(1));
        lapic.eoi(CpuId::new(1));
        lapic.eoi(CpuId::new(200));
        assert_eq!(lapic.eoi_count(CpuId::new(0)), 0);
        assert_eq!(lapic.eoi_count(CpuId::new(1)), 2);
    }
}
