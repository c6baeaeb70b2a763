//! System call wrappers.
//!
//! Negative return values come back as [`UserError::Kernel`].

use super::UserError;
use crate::env::{EnvId, EnvStatus};
use crate::error::Error;
use crate::machine::{Cpu, Stopped};
use crate::mm::{PteFlags, VirtAddr};
use crate::syscall::numbers::*;

fn syscall(cpu: &mut Cpu<'_>, num: u32, args: [u32; 5]) -> Result<u32, UserError> {
    let ret = cpu.syscall(num, args)?;
    if ret < 0 {
        return Err(Error::from_code(ret).unwrap_or(Error::Unspecified).into());
    }
    Ok(ret as u32)
}

pub fn sys_cputs(cpu: &mut Cpu<'_>, va: VirtAddr, len: u32) -> Result<(), UserError> {
    syscall(cpu, SYS_CPUTS, [va.as_u32(), len, 0, 0, 0]).map(|_| ())
}

pub fn sys_getenvid(cpu: &mut Cpu<'_>) -> Result<EnvId, UserError> {
    syscall(cpu, SYS_GETENVID, [0; 5]).map(EnvId::from_raw)
}

pub fn sys_env_destroy(cpu: &mut Cpu<'_>, env: EnvId) -> Result<(), UserError> {
    syscall(cpu, SYS_ENV_DESTROY, [env.as_u32(), 0, 0, 0, 0]).map(|_| ())
}

pub fn sys_page_alloc(
    cpu: &mut Cpu<'_>,
    env: EnvId,
    va: VirtAddr,
    perm: PteFlags,
) -> Result<(), UserError> {
    let args = [env.as_u32(), va.as_u32(), perm.bits(), 0, 0];
    syscall(cpu, SYS_PAGE_ALLOC, args).map(|_| ())
}

pub fn sys_page_map(
    cpu: &mut Cpu<'_>,
    src: EnvId,
    srcva: VirtAddr,
    dst: EnvId,
    dstva: VirtAddr,
    perm: PteFlags,
) -> Result<(), UserError> {
    let args = [
        src.as_u32(),
        srcva.as_u32(),
        dst.as_u32(),
        dstva.as_u32(),
        perm.bits(),
    ];
    syscall(cpu, SYS_PAGE_MAP, args).map(|_| ())
}

pub fn sys_page_unmap(cpu: &mut Cpu<'_>, env: EnvId, va: VirtAddr) -> Result<(), UserError> {
    syscall(cpu, SYS_PAGE_UNMAP, [env.as_u32(), va.as_u32(), 0, 0, 0]).map(|_| ())
}

/// Create an inert child. Returns its id; the child itself sees 0.
pub fn sys_exofork(cpu: &mut Cpu<'_>) -> Result<EnvId, UserError> {
    syscall(cpu, SYS_EXOFORK, [0; 5]).map(EnvId::from_raw)
}

pub fn sys_env_set_status(
    cpu: &mut Cpu<'_>,
    env: EnvId,
    status: EnvStatus,
) -> Result<(), UserError> {
    syscall(cpu, SYS_ENV_SET_STATUS, [env.as_u32(), status as u32, 0, 0, 0]).map(|_| ())
}

pub fn sys_env_set_pgfault_upcall(
    cpu: &mut Cpu<'_>,
    env: EnvId,
    entry: u32,
) -> Result<(), UserError> {
    syscall(cpu, SYS_ENV_SET_PGFAULT_UPCALL, [env.as_u32(), entry, 0, 0, 0]).map(|_| ())
}

/// Give up the CPU. It may come back running another environment.
pub fn sys_yield(cpu: &mut Cpu<'_>) -> Result<(), UserError> {
    match cpu.syscall(SYS_YIELD, [0; 5]) {
        Ok(_) | Err(Stopped::Switched { .. }) => Ok(()),
        Err(stopped) => Err(stopped.into()),
    }
}
