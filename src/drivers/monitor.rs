//! Kernel monitor hook.
//!
//! A breakpoint trap hands the saved frame to the monitor, which may
//! inspect or modify it before execution continues.

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::trap::{CpuId, TrapFrame, TrapFrameDump};

/// Interactive debugger entry.
pub trait Monitor: Send + Sync {
    /// Called on a breakpoint trap with the frame that will be resumed.
    fn breakpoint(&self, cpu: CpuId, tf: &mut TrapFrame);
}

/// Monitor that prints the frame and continues.
#[derive(Default)]
pub struct NullMonitor {
    hits: AtomicUsize,
}

impl NullMonitor {
    pub const fn new() -> Self {
        Self {
            hits: AtomicUsize::new(0),
        }
    }

    /// Breakpoints seen so far.
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::Acquire)
    }
}

impl Monitor for NullMonitor {
    fn breakpoint(&self, cpu: CpuId, tf: &mut TrapFrame) {
        self.hits.fetch_add(1, Ordering::AcqRel);
        crate::kprint!("{}", TrapFrameDump::new(cpu, tf, None));
    }
}
