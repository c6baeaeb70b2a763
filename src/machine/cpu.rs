//! One processor executing user code.

use alloc::vec::Vec;

use super::{Machine, Stopped, PGFAULT_UPCALL_ENTRY};
use crate::env::EnvId;
use crate::kernel::Kernel;
use crate::mm::memlayout::{KERNBASE, KSTACKTOP};
use crate::mm::{PageTableEntry, VirtAddr};
use crate::trap::{CpuId, Eflags, FaultCode, TrapFrame, TrapOutcome, IRQ_TIMER, T_SYSCALL};
use crate::ulib::UserError;

/// Where a parked CPU sits in `sched_halt`.
const IDLE_EIP: u32 = KERNBASE + 0x0010_0a40;

/// A CPU as seen from user mode.
///
/// Every operation acts on behalf of the environment the CPU currently
/// runs. Operations that trap report [`Stopped`] if the kernel did not
/// come back to that same environment.
pub struct Cpu<'m> {
    machine: &'m Machine,
    id: CpuId,
    env: Option<EnvId>,
    tf: TrapFrame,
    halted: bool,
}

impl<'m> Cpu<'m> {
    pub(super) fn new(machine: &'m Machine, id: CpuId, outcome: TrapOutcome) -> Self {
        let mut cpu = Self {
            machine,
            id,
            env: None,
            tf: TrapFrame::default(),
            halted: false,
        };
        cpu.enter(outcome);
        cpu
    }

    pub fn id(&self) -> CpuId {
        self.id
    }

    pub fn machine(&self) -> &'m Machine {
        self.machine
    }

    fn kernel(&self) -> &'m Kernel {
        self.machine.kernel()
    }

    /// Environment currently running here.
    pub fn env(&self) -> Option<EnvId> {
        self.env
    }

    /// Live register state of the running environment.
    pub fn tf(&self) -> &TrapFrame {
        &self.tf
    }

    pub(super) fn tf_mut(&mut self) -> &mut TrapFrame {
        &mut self.tf
    }

    /// The running environment, or why there is none.
    pub fn running(&self) -> Result<EnvId, Stopped> {
        match self.env {
            Some(env) if !self.halted => Ok(env),
            _ => Err(self.stopped()),
        }
    }

    fn stopped(&self) -> Stopped {
        match self.env {
            _ if self.halted => Stopped::Halted,
            Some(to) => Stopped::Switched { to },
            None => Stopped::Parked,
        }
    }

    /// Take over whatever the kernel handed back.
    ///
    /// User state of environments freed while in the kernel is dropped.
    fn enter(&mut self, outcome: TrapOutcome) {
        self.machine.runtime().forget_freed(self.kernel());
        match outcome {
            TrapOutcome::Resumed { env, tf } => {
                self.env = Some(env);
                self.tf = tf;
            }
            TrapOutcome::Parked | TrapOutcome::ReturnToKernel(_) => self.env = None,
            TrapOutcome::Halted => {
                self.env = None;
                self.halted = true;
            }
        }
    }

    /// Enter the kernel on behalf of `env` and check it came back.
    fn trap(&mut self, env: EnvId, outcome: TrapOutcome) -> Result<(), Stopped> {
        self.enter(outcome);
        match self.env {
            Some(now) if now == env && !self.halted => Ok(()),
            _ => Err(self.stopped()),
        }
    }

    /// `int 0x30` with `num` in `eax` and the arguments in
    /// `edx, ecx, ebx, edi, esi`. Returns `eax` afterwards.
    pub fn syscall(&mut self, num: u32, args: [u32; 5]) -> Result<i32, Stopped> {
        let env = self.running()?;

        let mut tf = self.tf;
        tf.regs.eax = num;
        tf.regs.edx = args[0];
        tf.regs.ecx = args[1];
        tf.regs.ebx = args[2];
        tf.regs.edi = args[3];
        tf.regs.esi = args[4];

        let outcome = self.kernel().software_interrupt(self.id, T_SYSCALL, tf);
        self.trap(env, outcome)?;
        Ok(self.tf.regs.eax as i32)
    }

    /// `int vector`.
    pub fn int(&mut self, vector: u32) -> Result<(), Stopped> {
        let env = self.running()?;
        let outcome = self.kernel().software_interrupt(self.id, vector, self.tf);
        self.trap(env, outcome)
    }

    /// Raise the timer line. Returns the environment running afterwards.
    ///
    /// A parked CPU is woken from its idle loop.
    pub fn timer(&mut self) -> Option<EnvId> {
        if self.halted {
            return None;
        }

        let tf = match self.env {
            Some(_) => self.tf,
            None => {
                let esp0 = self
                    .kernel()
                    .cpu(self.id)
                    .task_state()
                    .map_or(KSTACKTOP, |ts| ts.esp0);
                TrapFrame::kernel(IDLE_EIP, esp0, Eflags::IF)
            }
        };

        if let Some(outcome) = self.kernel().interrupt(self.id, IRQ_TIMER, tf) {
            self.enter(outcome);
        }
        self.env
    }

    /// Deliver a page fault at `va` the way the MMU reports it, and run
    /// the user-level handler if the kernel reflects it.
    pub fn page_fault(&mut self, va: VirtAddr, code: FaultCode) -> Result<(), UserError> {
        let env = self.running()?;
        let outcome = self.kernel().page_fault(self.id, va, code, self.tf);
        self.trap(env, outcome)?;

        if self.tf.eip == PGFAULT_UPCALL_ENTRY {
            self.run_upcall()?;
        }
        Ok(())
    }

    /// One byte access; faults are handled and the access retried.
    fn access(&mut self, va: VirtAddr, write: Option<u8>) -> Result<u8, UserError> {
        loop {
            let env = self.running()?;
            match self.kernel().mmu_access(env, va, write) {
                Ok(byte) => return Ok(byte),
                Err(code) => self.page_fault(va, code)?,
            }
        }
    }

    pub fn load_u8(&mut self, va: VirtAddr) -> Result<u8, UserError> {
        self.access(va, None)
    }

    pub fn store_u8(&mut self, va: VirtAddr, byte: u8) -> Result<(), UserError> {
        self.access(va, Some(byte)).map(|_| ())
    }

    pub fn load_u32(&mut self, va: VirtAddr) -> Result<u32, UserError> {
        let mut word = [0u8; 4];
        for (i, byte) in word.iter_mut().enumerate() {
            *byte = self.load_u8(va.add(i as u32))?;
        }
        Ok(u32::from_le_bytes(word))
    }

    pub fn store_u32(&mut self, va: VirtAddr, value: u32) -> Result<(), UserError> {
        for (i, byte) in value.to_le_bytes().into_iter().enumerate() {
            self.store_u8(va.add(i as u32), byte)?;
        }
        Ok(())
    }

    pub fn read_bytes(&mut self, va: VirtAddr, len: usize) -> Result<Vec<u8>, UserError> {
        (0..len).map(|i| self.load_u8(va.add(i as u32))).collect()
    }

    pub fn write_bytes(&mut self, va: VirtAddr, bytes: &[u8]) -> Result<(), UserError> {
        for (i, &byte) in bytes.iter().enumerate() {
            self.store_u8(va.add(i as u32), byte)?;
        }
        Ok(())
    }

    /// `uvpd[pdx]` of the running environment.
    pub fn uvpd(&self, pdx: usize) -> PageTableEntry {
        match self.env {
            Some(env) => self.kernel().uvpd(env, pdx),
            None => PageTableEntry::invalid(),
        }
    }

    /// `uvpt[pn]` of the running environment.
    pub fn uvpt(&self, pn: u32) -> PageTableEntry {
        match self.env {
            Some(env) => self.kernel().uvpt(env, VirtAddr::from_page_number(pn)),
            None => PageTableEntry::invalid(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelConfig;
    use crate::drivers::Platform;
    use crate::env::{EnvStatus, ProgramImage, Segment};
    use crate::mm::memlayout::{PGSIZE, USTACKTOP, UTEXT};
    use crate::mm::PteFlags;
    use crate::syscall::numbers::{SYS_GETENVID, SYS_YIELD};
    use crate::trap::{CpuStatus, T_BRKPT};

    fn machine(ncpu: usize) -> Machine {
        Machine::new(KernelConfig::new().with_cpus(ncpu).with_frames(64), Platform::default())
    }

    fn image() -> ProgramImage {
        ProgramImage {
            entry: VirtAddr::new(UTEXT),
            segments: vec![Segment {
                va: VirtAddr::new(UTEXT),
                data: vec![1, 2, 3, 4],
                writable: true,
            }],
        }
    }

    #[test]
    fn test_word_access_little_endian() {
        let m = machine(1);
        m.create_env(&image()).unwrap();
        let mut cpu = m.boot(CpuId::BOOT).unwrap();

        let va = VirtAddr::new(UTEXT);
        assert_eq!(cpu.load_u32(va).unwrap(), 0x0403_0201);
        cpu.store_u32(va, 0xDEAD_BEEF).unwrap();
        assert_eq!(cpu.read_bytes(va, 4).unwrap(), vec![0xEF, 0xBE, 0xAD, 0xDE]);

        // The stack page is ordinary user memory.
        let top = VirtAddr::new(USTACKTOP - 4);
        cpu.store_u32(top, 7).unwrap();
        assert_eq!(cpu.load_u32(top).unwrap(), 7);
    }

    #[test]
    fn test_unhandled_fault_destroys_env() {
        let m = machine(1);
        let a = m.create_env(&image()).unwrap();
        let mut cpu = m.boot(CpuId::BOOT).unwrap();

        let err = cpu.load_u8(VirtAddr::new(UTEXT + 16 * PGSIZE)).unwrap_err();
        assert_eq!(err, UserError::Stopped(Stopped::Parked));
        assert_eq!(m.kernel().env_status(a), EnvStatus::Free);
        assert_eq!(cpu.env(), None);
        assert!(m.kernel().panicked().is_none());
    }

    #[test]
    fn test_syscall_roundtrip() {
        let m = machine(1);
        let a = m.create_env(&image()).unwrap();
        let mut cpu = m.boot(CpuId::BOOT).unwrap();

        assert_eq!(cpu.syscall(SYS_GETENVID, [0; 5]).unwrap(), a.as_u32() as i32);
        // Alone in the system, yield comes straight back.
        assert_eq!(cpu.syscall(SYS_YIELD, [0; 5]).unwrap(), 0);
        assert_eq!(cpu.env(), Some(a));
    }

    #[test]
    fn test_breakpoint_and_kernel_vector() {
        let m = machine(1);
        let a = m.create_env(&image()).unwrap();
        let mut cpu = m.boot(CpuId::BOOT).unwrap();

        cpu.int(T_BRKPT).unwrap();
        assert_eq!(cpu.env(), Some(a));

        // Vector 14 is kernel-only: general protection fault, env destroyed.
        assert_eq!(cpu.int(14), Err(Stopped::Parked));
        assert_eq!(m.kernel().env_status(a), EnvStatus::Free);
    }

    #[test]
    fn test_timer_round_robin_and_wakeup() {
        let m = machine(1);
        let mut cpu = m.boot(CpuId::BOOT).unwrap();
        assert_eq!(cpu.env(), None);
        assert_eq!(m.kernel().cpu(CpuId::BOOT).status(), CpuStatus::Halted);

        let a = m.create_env(&image()).unwrap();
        let b = m.create_env(&image()).unwrap();
        assert_eq!(cpu.timer(), Some(a));
        assert_eq!(cpu.timer(), Some(b));
        assert_eq!(cpu.timer(), Some(a));
    }

    #[test]
    fn test_uvpt_view() {
        let m = machine(1);
        m.create_env(&image()).unwrap();
        let cpu = m.boot(CpuId::BOOT).unwrap();

        let text = VirtAddr::new(UTEXT);
        assert!(cpu.uvpd(text.pdx()).is_present());
        assert!(cpu.uvpt(text.page_number()).flags().contains(PteFlags::USER_RW));
        assert!(!cpu.uvpt(text.page_number() + 1).is_present());
        assert!(!cpu.uvpd(1).is_present());
    }
}
