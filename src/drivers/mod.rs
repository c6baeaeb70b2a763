//! Device drivers and external collaborators of the trap handler.
//!
//! All drivers follow these principles:
//! - The trap handler talks to them only through the traits below
//! - No panics on invalid input

pub mod console;
pub mod lapic;
pub mod monitor;

use alloc::sync::Arc;

pub use lapic::{InterruptController, Lapic};
pub use monitor::{Monitor, NullMonitor};

/// The devices a kernel instance is wired to.
#[derive(Clone)]
pub struct Platform {
    pub lapic: Arc<dyn InterruptController>,
    pub monitor: Arc<dyn Monitor>,
}

impl Platform {
    pub fn new(lapic: Arc<dyn InterruptController>, monitor: Arc<dyn Monitor>) -> Self {
        Self { lapic, monitor }
    }
}

impl Default for Platform {
    fn default() -> Self {
        Self {
            lapic: Arc::new(Lapic::new()),
            monitor: Arc::new(NullMonitor::new()),
        }
    }
}
