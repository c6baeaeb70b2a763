//! User-level page fault handler registration.

use super::syscall::{sys_env_set_pgfault_upcall, sys_page_alloc};
use super::UserError;
use crate::env::EnvId;
use crate::machine::{Cpu, PgfaultHandler, PGFAULT_UPCALL_ENTRY};
use crate::mm::memlayout::{PGSIZE, UXSTACKTOP};
use crate::mm::{PteFlags, VirtAddr};

/// Make `handler` the page fault handler of the calling environment.
///
/// The first call also maps the exception stack and registers the upcall
/// stub with the kernel; later calls only swap the handler.
pub fn set_pgfault_handler(cpu: &mut Cpu<'_>, handler: PgfaultHandler) -> Result<(), UserError> {
    let env = cpu.running()?;
    let runtime = cpu.machine().runtime();

    if runtime.handler(env).is_none() {
        let stack = VirtAddr::new(UXSTACKTOP - PGSIZE);
        sys_page_alloc(cpu, EnvId::CURRENT, stack, PteFlags::USER_RW)?;
        sys_env_set_pgfault_upcall(cpu, EnvId::CURRENT, PGFAULT_UPCALL_ENTRY)?;
    }

    runtime.set_handler(env, handler);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelConfig;
    use crate::drivers::Platform;
    use crate::env::{ProgramImage, Segment};
    use crate::machine::{Machine, Stopped};
    use crate::mm::memlayout::UTEXT;
    use crate::trap::{CpuId, FaultCode, UTrapframe};

    fn machine() -> Machine {
        Machine::new(KernelConfig::new().with_cpus(1).with_frames(32), Platform::default())
    }

    fn image() -> ProgramImage {
        ProgramImage {
            entry: VirtAddr::new(UTEXT),
            segments: vec![Segment {
                va: VirtAddr::new(UTEXT),
                data: vec![0; 8],
                writable: true,
            }],
        }
    }

    /// Maps the faulting page on demand.
    fn demand_zero(cpu: &mut Cpu<'_>, utf: &UTrapframe) -> Result<(), UserError> {
        let page = VirtAddr::new(utf.fault_va).align_down();
        sys_page_alloc(cpu, EnvId::CURRENT, page, PteFlags::USER_RW)
    }

    fn refuse(_: &mut Cpu<'_>, _: &UTrapframe) -> Result<(), UserError> {
        Err(UserError::Stopped(Stopped::Parked))
    }

    #[test]
    fn test_first_registration_maps_exception_stack() {
        let m = machine();
        let a = m.create_env(&image()).unwrap();
        let mut cpu = m.boot(CpuId::BOOT).unwrap();

        set_pgfault_handler(&mut cpu, refuse).unwrap();
        let stack = VirtAddr::new(UXSTACKTOP - PGSIZE);
        let (pa, flags) = m.kernel().lookup(a, stack).unwrap();
        assert!(flags.contains(PteFlags::USER_RW));
        assert_eq!(m.kernel().env_upcall(a), Some(VirtAddr::new(PGFAULT_UPCALL_ENTRY)));

        // Swapping the handler keeps the stack.
        let free = m.kernel().free_frames();
        set_pgfault_handler(&mut cpu, demand_zero).unwrap();
        assert_eq!(m.kernel().lookup(a, stack).unwrap().0, pa);
        assert_eq!(m.kernel().free_frames(), free);
    }

    #[test]
    fn test_handler_repairs_and_access_retries() {
        let m = machine();
        let a = m.create_env(&image()).unwrap();
        let mut cpu = m.boot(CpuId::BOOT).unwrap();
        set_pgfault_handler(&mut cpu, demand_zero).unwrap();

        let eip = cpu.tf().eip;
        let esp = cpu.tf().esp;
        let va = VirtAddr::new(UTEXT + 0x10_0000);
        cpu.store_u8(va, 0x42).unwrap();
        assert_eq!(cpu.load_u8(va).unwrap(), 0x42);

        // Back where the fault happened.
        assert_eq!(cpu.env(), Some(a));
        assert_eq!(cpu.tf().eip, eip);
        assert_eq!(cpu.tf().esp, esp);

        // The stub returned through the word below the trap-time stack.
        assert_eq!(cpu.load_u32(VirtAddr::new(esp - 4)).unwrap(), eip);
    }

    #[test]
    fn test_handler_error_propagates() {
        let m = machine();
        m.create_env(&image()).unwrap();
        let mut cpu = m.boot(CpuId::BOOT).unwrap();
        set_pgfault_handler(&mut cpu, refuse).unwrap();

        let err = cpu
            .page_fault(VirtAddr::new(0x1000), FaultCode::USER)
            .unwrap_err();
        assert_eq!(err, UserError::Stopped(Stopped::Parked));
    }
}
