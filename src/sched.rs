//! Scheduler
//!
//! Round-robin over the environment table. Every entry point consumes the
//! kernel lock guard: the lock is released exactly when the CPU leaves
//! the kernel, either into user mode or into a halt.

use crate::env::{EnvId, EnvStatus};
use crate::kernel::{Kernel, KernelState};
use crate::sync::KernelGuard;
use crate::trap::{CpuId, CpuStatus, TrapOutcome};

/// Pick the next environment for `cpu` and run it, or halt the CPU.
pub fn sched_yield(
    kernel: &Kernel,
    cpu: CpuId,
    guard: KernelGuard<'_, KernelState>,
) -> TrapOutcome {
    let cur = kernel.cpu(cpu).curenv();

    if let Some(next) = guard.envs.next_runnable(cur) {
        return env_run(kernel, cpu, guard, next);
    }

    if let Some(cur) = cur {
        let still_ours = guard
            .envs
            .get(cur)
            .is_some_and(|env| env.status == EnvStatus::Running && env.cpunum == Some(cpu));
        if still_ours {
            return env_run(kernel, cpu, guard, cur);
        }
    }

    sched_halt(kernel, cpu, guard)
}

/// Switch `cpu` to `id` and return to user mode in it.
pub fn env_run(
    kernel: &Kernel,
    cpu: CpuId,
    mut guard: KernelGuard<'_, KernelState>,
    id: EnvId,
) -> TrapOutcome {
    let info = kernel.cpu(cpu);

    if let Some(prev) = info.curenv().filter(|prev| *prev != id) {
        if let Some(env) = guard.envs.get_mut(prev) {
            if env.status == EnvStatus::Running {
                env.status = EnvStatus::Runnable;
            }
        }
    }

    let Some(env) = guard.envs.get_mut(id) else {
        drop(guard);
        return kernel.fatal(cpu, alloc::format!("env_run of dead environment {}", id));
    };

    env.status = EnvStatus::Running;
    env.cpunum = Some(cpu);
    env.runs += 1;
    let tf = env.tf;

    info.set_curenv(Some(id));
    drop(guard);

    // iret reloads EFLAGS from the frame.
    info.set_interrupts(tf.eflags().contains(crate::trap::Eflags::IF));
    TrapOutcome::Resumed { env: id, tf }
}

/// Nothing to run: release the lock and wait for an interrupt.
pub fn sched_halt(
    kernel: &Kernel,
    cpu: CpuId,
    guard: KernelGuard<'_, KernelState>,
) -> TrapOutcome {
    if !guard.envs.any_active() {
        log::warn!("No runnable environments in the system!");
    }

    let info = kernel.cpu(cpu);
    info.set_curenv(None);
    info.set_status(CpuStatus::Halted);
    drop(guard);

    info.set_interrupts(true);
    TrapOutcome::Parked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelConfig;
    use crate::drivers::Platform;
    use crate::env::ProgramImage;
    use crate::mm::memlayout::UTEXT;
    use crate::mm::VirtAddr;

    fn image() -> ProgramImage {
        ProgramImage {
            entry: VirtAddr::new(UTEXT),
            segments: vec![],
        }
    }

    #[test]
    fn test_two_cpus_never_share_an_env() {
        let k = Kernel::new(KernelConfig::new().with_cpus(2).with_frames(64), Platform::default());
        let a = k.create_env(&image()).unwrap();
        let b = k.create_env(&image()).unwrap();

        let first = k.schedule(CpuId::new(0)).env();
        let second = k.schedule(CpuId::new(1)).env();
        assert_eq!(first, Some(a));
        assert_eq!(second, Some(b));

        // Both are taken; nothing is left for another CPU.
        let guard = k.lock().lock(CpuId::new(1));
        assert_eq!(guard.envs.next_runnable(Some(b)), None);
    }

    #[test]
    fn test_yield_rotates_and_demotes() {
        let k = Kernel::new(KernelConfig::new().with_cpus(1).with_frames(64), Platform::default());
        let a = k.create_env(&image()).unwrap();
        let b = k.create_env(&image()).unwrap();
        let cpu = CpuId::BOOT;

        assert_eq!(k.schedule(cpu).env(), Some(a));
        let guard = k.lock().lock(cpu);
        assert_eq!(sched_yield(&k, cpu, guard).env(), Some(b));
        assert_eq!(k.env_status(a), EnvStatus::Runnable);
        assert_eq!(k.env_status(b), EnvStatus::Running);
    }

    #[test]
    fn test_sole_running_env_keeps_cpu() {
        let k = Kernel::new(KernelConfig::new().with_cpus(1).with_frames(64), Platform::default());
        let a = k.create_env(&image()).unwrap();
        let cpu = CpuId::BOOT;

        assert_eq!(k.schedule(cpu).env(), Some(a));
        let guard = k.lock().lock(cpu);
        assert_eq!(sched_yield(&k, cpu, guard).env(), Some(a));
        assert_eq!(k.cpu(cpu).curenv(), Some(a));
    }
}
