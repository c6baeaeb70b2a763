//! System Call Handler
//!
//! Dispatches system calls and implements individual syscall handlers.
//!
//! # Security Considerations
//! - All syscall numbers are validated against the whitelist
//! - Unknown syscalls return `-Inval`
//! - Environment ids are resolved with `envid2env`, so a caller can only
//!   act on itself and its immediate children

use crate::env::{EnvId, EnvStatus};
use crate::error::Error;
use crate::kernel::{Kernel, KernelState};
use crate::kprint;
use crate::kprintln;
use crate::mm::{PteFlags, VirtAddr};
use crate::trap::CpuId;

use super::validate::{self, UserBuffer};

/// System call numbers
pub mod numbers {
    pub const SYS_CPUTS: u32 = 0;
    pub const SYS_GETENVID: u32 = 2;
    pub const SYS_ENV_DESTROY: u32 = 3;
    pub const SYS_PAGE_ALLOC: u32 = 4;
    pub const SYS_PAGE_MAP: u32 = 5;
    pub const SYS_PAGE_UNMAP: u32 = 6;
    pub const SYS_EXOFORK: u32 = 7;
    pub const SYS_ENV_SET_STATUS: u32 = 8;
    pub const SYS_ENV_SET_PGFAULT_UPCALL: u32 = 9;
    pub const SYS_YIELD: u32 = 10;
}

use numbers::*;

/// What the trap path does after a system call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallOutcome {
    /// Store the value in the caller's `eax` and resume it.
    Return(i32),
    /// Give up the CPU.
    Reschedule,
}

/// Everything a handler may touch. Only built with the kernel lock held.
pub struct SyscallContext<'a> {
    kernel: &'a Kernel,
    cpu: CpuId,
    state: &'a mut KernelState,
    caller: EnvId,
}

impl<'a> SyscallContext<'a> {
    pub(crate) fn new(
        kernel: &'a Kernel,
        cpu: CpuId,
        state: &'a mut KernelState,
        caller: EnvId,
    ) -> Self {
        Self {
            kernel,
            cpu,
            state,
            caller,
        }
    }

    pub fn caller(&self) -> EnvId {
        self.caller
    }

    fn resolve(&self, raw: u32, checkperm: bool) -> Result<EnvId, Error> {
        self.state
            .envs
            .envid2env(EnvId::from_raw(raw), self.caller, checkperm)
    }
}

/// Dispatch a system call
///
/// # Arguments
/// * `num` - System call number (from `eax`)
/// * `args` - `edx, ecx, ebx, edi, esi`
///
/// # Security
/// - Unknown syscall numbers are rejected with `-Inval`
/// - Each handler validates its own arguments
pub fn dispatch(ctx: &mut SyscallContext<'_>, num: u32, args: [u32; 5]) -> SyscallOutcome {
    let [a1, a2, a3, a4, a5] = args;

    let result = match num {
        SYS_CPUTS => sys_cputs(ctx, a1, a2),
        SYS_GETENVID => Ok(ctx.caller.as_u32() as i32),
        SYS_ENV_DESTROY => sys_env_destroy(ctx, a1),
        SYS_PAGE_ALLOC => sys_page_alloc(ctx, a1, a2, a3),
        SYS_PAGE_MAP => sys_page_map(ctx, a1, a2, a3, a4, a5),
        SYS_PAGE_UNMAP => sys_page_unmap(ctx, a1, a2),
        SYS_EXOFORK => sys_exofork(ctx),
        SYS_ENV_SET_STATUS => sys_env_set_status(ctx, a1, a2),
        SYS_ENV_SET_PGFAULT_UPCALL => sys_env_set_pgfault_upcall(ctx, a1, a2),
        SYS_YIELD => return SyscallOutcome::Reschedule,
        _ => {
            log::warn!("[{}] unknown syscall {}", ctx.caller, num);
            Err(Error::Inval)
        }
    };

    SyscallOutcome::Return(result.unwrap_or_else(Error::code))
}

/// Print a user string on the console.
///
/// A caller that passes memory it cannot read is destroyed.
fn sys_cputs(ctx: &mut SyscallContext<'_>, va: u32, len: u32) -> Result<i32, Error> {
    let KernelState { envs, frames } = &*ctx.state;
    let env = envs.get(ctx.caller).ok_or(Error::BadEnv)?;

    match UserBuffer::copy_in(&env.space, frames, VirtAddr::new(va), len) {
        Ok(buf) => {
            kprint!("{}", buf);
            Ok(0)
        }
        Err(bad) => {
            kprintln!(
                "[{}] user_mem_check assertion failure for va {:08x}",
                ctx.caller,
                bad.as_u32()
            );
            ctx.kernel.destroy_env(ctx.cpu, ctx.state, ctx.caller);
            Err(Error::Fault)
        }
    }
}

fn sys_env_destroy(ctx: &mut SyscallContext<'_>, envid: u32) -> Result<i32, Error> {
    let id = ctx.resolve(envid, true)?;

    if id == ctx.caller {
        kprintln!("[{}] exiting gracefully", id);
    } else {
        kprintln!("[{}] destroying {}", ctx.caller, id);
    }

    ctx.kernel.destroy_env(ctx.cpu, ctx.state, id);
    Ok(0)
}

/// Map a fresh zeroed page at `va` in `envid`.
fn sys_page_alloc(
    ctx: &mut SyscallContext<'_>,
    envid: u32,
    va: u32,
    perm: u32,
) -> Result<i32, Error> {
    let id = ctx.resolve(envid, true)?;
    let va = validate::user_page(va)?;
    let perm = validate::user_perm(perm)?;

    let KernelState { envs, frames } = &mut *ctx.state;
    let env = envs.get_mut(id).ok_or(Error::BadEnv)?;
    env.space.alloc_page(frames, va, perm)?;

    Ok(0)
}

/// Map the page at `srcva` in `src` at `dstva` in `dst`.
///
/// A read-only source page cannot be mapped writable.
fn sys_page_map(
    ctx: &mut SyscallContext<'_>,
    src: u32,
    srcva: u32,
    dst: u32,
    dstva: u32,
    perm: u32,
) -> Result<i32, Error> {
    let src = ctx.resolve(src, true)?;
    let dst = ctx.resolve(dst, true)?;
    let srcva = validate::user_page(srcva)?;
    let dstva = validate::user_page(dstva)?;
    let perm = validate::user_perm(perm)?;

    let KernelState { envs, frames } = &mut *ctx.state;

    let (pa, flags) = envs
        .get(src)
        .ok_or(Error::BadEnv)?
        .space
        .lookup(srcva)
        .ok_or(Error::Inval)?;

    if perm.contains(PteFlags::WRITABLE) && !flags.contains(PteFlags::WRITABLE) {
        return Err(Error::Inval);
    }

    let dst = envs.get_mut(dst).ok_or(Error::BadEnv)?;
    dst.space.insert(frames, pa, dstva, perm)?;

    Ok(0)
}

fn sys_page_unmap(ctx: &mut SyscallContext<'_>, envid: u32, va: u32) -> Result<i32, Error> {
    let id = ctx.resolve(envid, true)?;
    let va = validate::user_page(va)?;

    let KernelState { envs, frames } = &mut *ctx.state;
    let env = envs.get_mut(id).ok_or(Error::BadEnv)?;
    env.space.remove(frames, va);

    Ok(0)
}

/// Allocate an inert child: empty address space, the caller's registers,
/// and 0 in `eax` so it sees `exofork` return 0 once it runs.
fn sys_exofork(ctx: &mut SyscallContext<'_>) -> Result<i32, Error> {
    let KernelState { envs, frames } = &mut *ctx.state;

    let tf = envs.get(ctx.caller).ok_or(Error::BadEnv)?.tf;
    let id = envs.alloc(frames, ctx.caller)?;

    let child = envs.get_mut(id).ok_or(Error::BadEnv)?;
    child.status = EnvStatus::NotRunnable;
    child.tf = tf;
    child.tf.regs.eax = 0;

    Ok(id.as_u32() as i32)
}

fn sys_env_set_status(ctx: &mut SyscallContext<'_>, envid: u32, status: u32) -> Result<i32, Error> {
    let status = match EnvStatus::from_raw(status) {
        Some(s @ (EnvStatus::Runnable | EnvStatus::NotRunnable)) => s,
        _ => return Err(Error::Inval),
    };

    let id = ctx.resolve(envid, true)?;
    let cpu = ctx.cpu;
    let env = ctx.state.envs.get_mut(id).ok_or(Error::BadEnv)?;

    // Another CPU owns it until its next trap.
    if matches!(env.status, EnvStatus::Running | EnvStatus::Dying) && env.cpunum != Some(cpu) {
        return Err(Error::BadEnv);
    }

    env.status = status;
    Ok(0)
}

/// Register `entry` as the page fault upcall of `envid`; 0 clears it.
fn sys_env_set_pgfault_upcall(
    ctx: &mut SyscallContext<'_>,
    envid: u32,
    entry: u32,
) -> Result<i32, Error> {
    let id = ctx.resolve(envid, true)?;
    let env = ctx.state.envs.get_mut(id).ok_or(Error::BadEnv)?;

    env.pgfault_upcall = (entry != 0).then(|| VirtAddr::new(entry));
    log::debug!("[{}] pgfault upcall of {} set to {:08x}", ctx.caller, id, entry);

    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelConfig;
    use crate::drivers::Platform;
    use crate::env::{ProgramImage, Segment};
    use crate::mm::memlayout::{PGSIZE, UTEXT, UTOP};

    const CPU: CpuId = CpuId::BOOT;

    fn kernel() -> Kernel {
        Kernel::new(KernelConfig::new().with_cpus(1).with_frames(64), Platform::default())
    }

    fn image(text: &[u8]) -> ProgramImage {
        ProgramImage {
            entry: VirtAddr::new(UTEXT),
            segments: vec![Segment {
                va: VirtAddr::new(UTEXT),
                data: text.to_vec(),
                writable: false,
            }],
        }
    }

    fn call(k: &Kernel, caller: EnvId, num: u32, args: [u32; 5]) -> SyscallOutcome {
        let mut guard = k.lock().lock(CPU);
        let mut ctx = SyscallContext::new(k, CPU, &mut guard, caller);
        dispatch(&mut ctx, num, args)
    }

    fn ret(k: &Kernel, caller: EnvId, num: u32, args: [u32; 5]) -> i32 {
        match call(k, caller, num, args) {
            SyscallOutcome::Return(v) => v,
            SyscallOutcome::Reschedule => panic!("unexpected reschedule"),
        }
    }

    #[test]
    fn test_unknown_syscall() {
        let k = kernel();
        let a = k.create_env(&image(b"x")).unwrap();
        assert_eq!(ret(&k, a, 1, [0; 5]), Error::Inval.code());
        assert_eq!(ret(&k, a, 99, [0; 5]), Error::Inval.code());
        assert_eq!(call(&k, a, SYS_YIELD, [0; 5]), SyscallOutcome::Reschedule);
    }

    #[test]
    fn test_getenvid_and_cputs() {
        let k = kernel();
        let a = k.create_env(&image(b"hi there")).unwrap();
        assert_eq!(ret(&k, a, SYS_GETENVID, [0; 5]), a.as_u32() as i32);
        assert_eq!(ret(&k, a, SYS_CPUTS, [UTEXT, 8, 0, 0, 0]), 0);
    }

    #[test]
    fn test_cputs_bad_pointer_destroys_caller() {
        let k = kernel();
        let a = k.create_env(&image(b"x")).unwrap();
        assert_eq!(ret(&k, a, SYS_CPUTS, [0x1000, 4, 0, 0, 0]), Error::Fault.code());
        assert_eq!(k.env_status(a), EnvStatus::Free);
    }

    #[test]
    fn test_page_alloc_checks_arguments() {
        let k = kernel();
        let a = k.create_env(&image(b"x")).unwrap();
        let rw = PteFlags::USER_RW.bits();
        let va = UTEXT + 4 * PGSIZE;

        assert_eq!(ret(&k, a, SYS_PAGE_ALLOC, [0, va + 1, rw, 0, 0]), Error::Inval.code());
        assert_eq!(ret(&k, a, SYS_PAGE_ALLOC, [0, UTOP, rw, 0, 0]), Error::Inval.code());
        assert_eq!(
            ret(&k, a, SYS_PAGE_ALLOC, [0, va, PteFlags::WRITABLE.bits(), 0, 0]),
            Error::Inval.code()
        );
        assert_eq!(ret(&k, a, SYS_PAGE_ALLOC, [0x7777, va, rw, 0, 0]), Error::BadEnv.code());

        assert_eq!(ret(&k, a, SYS_PAGE_ALLOC, [0, va, rw, 0, 0]), 0);
        let (_, flags) = k.lookup(a, VirtAddr::new(va)).unwrap();
        assert!(flags.contains(PteFlags::USER_RW));
    }

    #[test]
    fn test_page_map_refuses_upgrade() {
        let k = kernel();
        let a = k.create_env(&image(b"x")).unwrap();
        let rw = PteFlags::USER_RW.bits();
        let ro = PteFlags::USER_RO.bits();
        let dst = UTEXT + 8 * PGSIZE;

        // Text is read-only.
        assert_eq!(ret(&k, a, SYS_PAGE_MAP, [0, UTEXT, 0, dst, rw]), Error::Inval.code());
        assert_eq!(ret(&k, a, SYS_PAGE_MAP, [0, UTEXT, 0, dst, ro]), 0);

        let (pa, _) = k.lookup(a, VirtAddr::new(UTEXT)).unwrap();
        assert_eq!(k.lookup(a, VirtAddr::new(dst)).unwrap().0, pa);
        assert_eq!(k.frame_refs(pa), 2);

        assert_eq!(ret(&k, a, SYS_PAGE_UNMAP, [0, dst, 0, 0, 0]), 0);
        assert_eq!(k.frame_refs(pa), 1);

        // Nothing mapped at the source.
        assert_eq!(ret(&k, a, SYS_PAGE_MAP, [0, dst, 0, UTEXT, ro]), Error::Inval.code());
    }

    #[test]
    fn test_page_map_past_reference_cap() {
        use crate::mm::frame::MAX_REFS;

        // Room for the page tables behind 64K aliases.
        let k = Kernel::new(
            KernelConfig::new().with_cpus(1).with_frames(128),
            Platform::default(),
        );
        let a = k.create_env(&image(b"x")).unwrap();
        let ro = PteFlags::USER_RO.bits();
        let (pa, _) = k.lookup(a, VirtAddr::new(UTEXT)).unwrap();
        let alias = |i: u32| 0x1000_0000 + i * PGSIZE;

        for i in 0..u32::from(MAX_REFS) - 1 {
            assert_eq!(ret(&k, a, SYS_PAGE_MAP, [0, UTEXT, 0, alias(i), ro]), 0);
        }
        assert_eq!(k.frame_refs(pa), MAX_REFS);

        let over = alias(u32::from(MAX_REFS));
        assert_eq!(ret(&k, a, SYS_PAGE_MAP, [0, UTEXT, 0, over, ro]), Error::NoMem.code());
        assert_eq!(k.lookup(a, VirtAddr::new(over)), None);
        assert_eq!(k.frame_refs(pa), MAX_REFS);
        assert!(k.panicked().is_none());
        assert_eq!(k.env_status(a), EnvStatus::Runnable);

        // Dropping one alias makes room again.
        assert_eq!(ret(&k, a, SYS_PAGE_UNMAP, [0, alias(0), 0, 0, 0]), 0);
        assert_eq!(ret(&k, a, SYS_PAGE_MAP, [0, UTEXT, 0, over, ro]), 0);
    }

    #[test]
    fn test_exofork_child_is_inert_copy() {
        let k = kernel();
        let a = k.create_env(&image(b"x")).unwrap();
        {
            let mut guard = k.lock().lock(CPU);
            let env = guard.envs.get_mut(a).unwrap();
            env.tf.regs.ebx = 0xB0B;
            env.tf.regs.eax = SYS_EXOFORK;
        }

        let child = EnvId::from_raw(ret(&k, a, SYS_EXOFORK, [0; 5]) as u32);
        assert_eq!(k.env_status(child), EnvStatus::NotRunnable);
        assert_eq!(k.env_parent(child), Some(a));

        let tf = k.env_frame(child).unwrap();
        assert_eq!(tf.regs.eax, 0);
        assert_eq!(tf.regs.ebx, 0xB0B);
        assert_eq!(k.lookup(child, VirtAddr::new(UTEXT)), None);

        // The parent may act on its child, not the other way round.
        assert_eq!(ret(&k, a, SYS_ENV_SET_STATUS, [child.as_u32(), 2, 0, 0, 0]), 0);
        assert_eq!(k.env_status(child), EnvStatus::Runnable);
        assert_eq!(
            ret(&k, child, SYS_ENV_SET_STATUS, [a.as_u32(), 4, 0, 0, 0]),
            Error::BadEnv.code()
        );
    }

    #[test]
    fn test_set_status_whitelist() {
        let k = kernel();
        let a = k.create_env(&image(b"x")).unwrap();
        for bad in [0, 1, 3, 5] {
            assert_eq!(ret(&k, a, SYS_ENV_SET_STATUS, [0, bad, 0, 0, 0]), Error::Inval.code());
        }
        assert_eq!(ret(&k, a, SYS_ENV_SET_STATUS, [0, 4, 0, 0, 0]), 0);
        assert_eq!(k.env_status(a), EnvStatus::NotRunnable);
    }

    #[test]
    fn test_set_pgfault_upcall() {
        let k = kernel();
        let a = k.create_env(&image(b"x")).unwrap();
        assert_eq!(ret(&k, a, SYS_ENV_SET_PGFAULT_UPCALL, [0, UTEXT + 0x40, 0, 0, 0]), 0);
        assert_eq!(k.env_upcall(a), Some(VirtAddr::new(UTEXT + 0x40)));
        assert_eq!(ret(&k, a, SYS_ENV_SET_PGFAULT_UPCALL, [0, 0, 0, 0, 0]), 0);
        assert_eq!(k.env_upcall(a), None);
    }

    #[test]
    fn test_env_destroy_of_stranger_rejected() {
        let k = kernel();
        let a = k.create_env(&image(b"x")).unwrap();
        let b = k.create_env(&image(b"x")).unwrap();
        assert_eq!(ret(&k, a, SYS_ENV_DESTROY, [b.as_u32(), 0, 0, 0, 0]), Error::BadEnv.code());
        assert_eq!(ret(&k, a, SYS_ENV_DESTROY, [0, 0, 0, 0, 0]), 0);
        assert_eq!(k.env_status(a), EnvStatus::Free);
        assert_eq!(k.env_status(b), EnvStatus::Runnable);
    }
}
