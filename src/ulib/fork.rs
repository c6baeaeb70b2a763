//! Copy-on-Write Fork
//!
//! The parent creates an inert child with `exofork`, shares every user
//! page with it, and marks each writable page copy-on-write in both
//! address spaces. The first write to such a page in either process
//! faults into [`pgfault`], which gives the writer a private copy.
//!
//! Pages carrying `PteFlags::SHARE` stay shared and writable in both. The
//! exception stack is never shared: the child gets a fresh page.

use alloc::format;

use super::syscall::{
    sys_env_set_pgfault_upcall, sys_env_set_status, sys_exofork, sys_page_alloc, sys_page_map,
    sys_page_unmap,
};
use super::{panic, set_pgfault_handler, UserError};
use crate::env::{EnvId, EnvStatus};
use crate::machine::{Cpu, PGFAULT_UPCALL_ENTRY};
use crate::mm::memlayout::{NPTENTRIES, PFTEMP, PGSIZE, PTSIZE, UTOP, UXSTACKTOP};
use crate::mm::{PteFlags, VirtAddr};
use crate::trap::{FaultCode, UTrapframe};

/// Copy-on-write page fault handler.
///
/// Only write faults on pages marked `COW` are repaired; anything else is
/// a bug in the caller and panics it.
pub fn pgfault(cpu: &mut Cpu<'_>, utf: &UTrapframe) -> Result<(), UserError> {
    let addr = VirtAddr::new(utf.fault_va);

    if !utf.code().contains(FaultCode::WRITE) {
        let message = format!("pgfault: not a write at {:08x}, eip {:08x}", addr.as_u32(), utf.eip);
        return Err(panic(cpu, message));
    }

    let pte = cpu.uvpt(addr.page_number());
    if !cpu.uvpd(addr.pdx()).is_present()
        || !pte.is_present()
        || !pte.flags().contains(PteFlags::COW)
    {
        let message = format!("pgfault: {:08x} is not copy-on-write", addr.as_u32());
        return Err(panic(cpu, message));
    }

    match copy_page(cpu, addr.align_down()) {
        Err(UserError::Kernel(e)) => Err(panic(cpu, format!("pgfault: {}", e))),
        other => other,
    }
}

/// Replace the mapping at `page` with a private writable copy.
fn copy_page(cpu: &mut Cpu<'_>, page: VirtAddr) -> Result<(), UserError> {
    let scratch = VirtAddr::new(PFTEMP);

    sys_page_alloc(cpu, EnvId::CURRENT, scratch, PteFlags::USER_RW)?;
    let bytes = cpu.read_bytes(page, PGSIZE as usize)?;
    cpu.write_bytes(scratch, &bytes)?;
    sys_page_map(cpu, EnvId::CURRENT, scratch, EnvId::CURRENT, page, PteFlags::USER_RW)?;
    sys_page_unmap(cpu, EnvId::CURRENT, scratch)
}

/// Map page `pn` of the caller into `child`.
///
/// Writable and copy-on-write pages become copy-on-write in both; the
/// caller's own mapping is re-marked even if it already was, so a later
/// fork of this process sees the right permissions.
pub fn duppage(cpu: &mut Cpu<'_>, child: EnvId, pn: u32) -> Result<(), UserError> {
    let va = VirtAddr::from_page_number(pn);
    let perm = cpu.uvpt(pn).flags() & PteFlags::SYSCALL;

    if perm.contains(PteFlags::SHARE) {
        sys_page_map(cpu, EnvId::CURRENT, va, child, va, perm)
    } else if perm.intersects(PteFlags::WRITABLE | PteFlags::COW) {
        let cow = (perm - PteFlags::WRITABLE) | PteFlags::COW;
        sys_page_map(cpu, EnvId::CURRENT, va, child, va, cow)?;
        sys_page_map(cpu, EnvId::CURRENT, va, EnvId::CURRENT, va, cow)
    } else {
        sys_page_map(cpu, EnvId::CURRENT, va, child, va, perm)
    }
}

/// Duplicate the calling environment.
///
/// Returns the child's id. The child resumes where the parent called
/// `fork`, with 0 in `eax`. On error the child, if it was created, stays
/// inert and never runs.
pub fn fork(cpu: &mut Cpu<'_>) -> Result<EnvId, UserError> {
    set_pgfault_handler(cpu, pgfault)?;

    let parent = cpu.running()?;
    let child = sys_exofork(cpu)?;
    cpu.machine().runtime().inherit(parent, child);

    let uxstack = VirtAddr::new(UXSTACKTOP - PGSIZE);

    for pdx in 0..VirtAddr::new(UTOP).pdx() {
        if !cpu.uvpd(pdx).is_present() {
            continue;
        }

        for ptx in 0..NPTENTRIES {
            let va = VirtAddr::new(pdx as u32 * PTSIZE + ptx as u32 * PGSIZE);
            if va == uxstack {
                continue;
            }

            let pte = cpu.uvpt(va.page_number());
            if pte.is_present() && pte.flags().contains(PteFlags::USER) {
                duppage(cpu, child, va.page_number())?;
            }
        }
    }

    sys_page_alloc(cpu, child, uxstack, PteFlags::USER_RW)?;
    sys_env_set_pgfault_upcall(cpu, child, PGFAULT_UPCALL_ENTRY)?;
    sys_env_set_status(cpu, child, EnvStatus::Runnable)?;

    log::debug!("[{}] forked {}", parent, child);
    Ok(child)
}
