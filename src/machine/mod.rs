//! User-Mode Machine Model
//!
//! Runs user environments on top of a [`Kernel`]. A [`Cpu`] performs the
//! user-mode side of execution for whichever environment the kernel last
//! resumed on it: memory accesses go through the MMU walk and raise page
//! faults, `int` instructions enter the trap path, and the page fault
//! upcall stub runs when the kernel resumes an environment at
//! [`PGFAULT_UPCALL_ENTRY`].
//!
//! The user-level page fault handlers live in [`UserRuntime`], keyed by
//! environment. A child created by fork inherits its parent's entry, the
//! way a library global is inherited with the copied address space. An
//! entry is dropped once its environment is freed.

mod cpu;
mod upcall;

pub use cpu::Cpu;

use alloc::collections::BTreeMap;
use core::fmt;

use spin::Mutex;

use crate::config::KernelConfig;
use crate::drivers::Platform;
use crate::env::{EnvId, EnvStatus, ProgramImage};
use crate::error::{Error, KernelPanic};
use crate::kernel::Kernel;
use crate::mm::memlayout::UTEXT;
use crate::trap::{CpuId, UTrapframe};
use crate::ulib::UserError;

/// User address of the page fault upcall stub.
pub const PGFAULT_UPCALL_ENTRY: u32 = UTEXT - 0x40;

/// A user-level page fault handler, called by the upcall stub with the
/// record the kernel pushed on the exception stack.
pub type PgfaultHandler = fn(&mut Cpu<'_>, &UTrapframe) -> Result<(), UserError>;

/// Why a CPU is no longer running the environment that issued an
/// operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stopped {
    /// The kernel switched the CPU to another environment.
    Switched { to: EnvId },
    /// Nothing left to run; the CPU waits for an interrupt.
    Parked,
    /// The kernel panicked.
    Halted,
}

impl fmt::Display for Stopped {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Switched { to } => write!(f, "switched to {}", to),
            Self::Parked => write!(f, "cpu parked"),
            Self::Halted => write!(f, "kernel halted"),
        }
    }
}

/// Per-environment user library state.
pub struct UserRuntime {
    handlers: Mutex<BTreeMap<EnvId, PgfaultHandler>>,
}

impl UserRuntime {
    pub const fn new() -> Self {
        Self {
            handlers: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn handler(&self, env: EnvId) -> Option<PgfaultHandler> {
        self.handlers.lock().get(&env).copied()
    }

    pub fn set_handler(&self, env: EnvId, handler: PgfaultHandler) {
        self.handlers.lock().insert(env, handler);
    }

    /// Give `child` a copy of `parent`'s state.
    pub fn inherit(&self, parent: EnvId, child: EnvId) {
        let mut handlers = self.handlers.lock();
        if let Some(handler) = handlers.get(&parent).copied() {
            handlers.insert(child, handler);
        }
    }

    /// Drop the state of `env`.
    pub fn forget(&self, env: EnvId) {
        self.handlers.lock().remove(&env);
    }

    /// Drop the state of every environment `kernel` has freed.
    pub fn forget_freed(&self, kernel: &Kernel) {
        self.handlers
            .lock()
            .retain(|&env, _| kernel.env_status(env) != EnvStatus::Free);
    }

    /// Number of environments with a handler registered.
    pub fn len(&self) -> usize {
        self.handlers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.lock().is_empty()
    }
}

impl Default for UserRuntime {
    fn default() -> Self {
        Self::new()
    }
}

/// A kernel plus the user programs running on it.
pub struct Machine {
    kernel: Kernel,
    runtime: UserRuntime,
}

impl Machine {
    pub fn new(config: KernelConfig, platform: Platform) -> Self {
        Self {
            kernel: Kernel::new(config, platform),
            runtime: UserRuntime::new(),
        }
    }

    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    pub fn runtime(&self) -> &UserRuntime {
        &self.runtime
    }

    pub fn create_env(&self, image: &ProgramImage) -> Result<EnvId, Error> {
        self.kernel.create_env(image)
    }

    /// Start `cpu` and let it make its first scheduling decision.
    pub fn boot(&self, cpu: CpuId) -> Result<Cpu<'_>, KernelPanic> {
        self.kernel.start_cpu(cpu)?;
        let outcome = self.kernel.schedule(cpu);
        Ok(Cpu::new(self, cpu, outcome))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::Segment;
    use crate::mm::VirtAddr;

    fn image() -> ProgramImage {
        ProgramImage {
            entry: VirtAddr::new(UTEXT),
            segments: vec![Segment {
                va: VirtAddr::new(UTEXT),
                data: vec![0xAB, 0xCD],
                writable: true,
            }],
        }
    }

    fn ok(_: &mut Cpu<'_>, _: &UTrapframe) -> Result<(), UserError> {
        Ok(())
    }

    #[test]
    fn test_runtime_inherit() {
        let rt = UserRuntime::new();
        let parent = EnvId::from_raw(0x1000);
        let child = EnvId::from_raw(0x1001);

        rt.inherit(parent, child);
        assert!(rt.handler(child).is_none());

        rt.set_handler(parent, ok);
        rt.inherit(parent, child);
        assert!(rt.handler(child).is_some());
        assert_eq!(rt.len(), 2);

        rt.forget(child);
        assert!(rt.handler(child).is_none());
        assert_eq!(rt.len(), 1);
    }

    #[test]
    fn test_runtime_forgets_freed_envs() {
        let m = Machine::new(KernelConfig::new().with_cpus(1).with_frames(32), Platform::default());
        let a = m.create_env(&image()).unwrap();
        let gone = EnvId::from_raw(0x1005);

        m.runtime().set_handler(a, ok);
        m.runtime().set_handler(gone, ok);
        m.runtime().forget_freed(m.kernel());

        assert!(m.runtime().handler(a).is_some());
        assert!(m.runtime().handler(gone).is_none());
        assert_eq!(m.runtime().len(), 1);
    }

    #[test]
    fn test_boot_runs_first_env() {
        let m = Machine::new(KernelConfig::new().with_cpus(2).with_frames(32), Platform::default());
        let a = m.create_env(&image()).unwrap();

        let mut cpu0 = m.boot(CpuId::new(0)).unwrap();
        let cpu1 = m.boot(CpuId::new(1)).unwrap();
        assert_eq!(cpu0.env(), Some(a));
        assert_eq!(cpu1.env(), None);
        assert_eq!(cpu1.running(), Err(Stopped::Parked));

        assert_eq!(cpu0.load_u8(VirtAddr::new(UTEXT + 1)).unwrap(), 0xCD);
        assert_eq!(m.kernel().env_status(a), EnvStatus::Running);
    }
}
