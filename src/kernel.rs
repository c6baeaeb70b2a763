//! Kernel Instance
//!
//! Ties together the read-only vector table, the per-CPU slots and the
//! state behind the big kernel lock.
//!
//! # Lifecycle
//! 1. [`Kernel::new`] builds the vector table before any CPU runs
//! 2. [`Kernel::start_cpu`] activates each CPU's task state and IDT
//! 3. [`Kernel::schedule`] takes the lock and picks the first environment
//! 4. From then on every CPU enters the kernel only through the trap path
//!
//! # Security Properties
//! - Shared state is only reachable with the big kernel lock held
//! - The first fatal condition is latched; every CPU that traps after it
//!   halts without touching shared state

use alloc::boxed::Box;
use alloc::string::String;

use spin::Once;

use crate::config::KernelConfig;
use crate::drivers::Platform;
use crate::env::{EnvId, EnvStatus, EnvTable, ProgramImage};
use crate::error::{Error, KernelPanic};
use crate::kprint;
use crate::kprintln;
use crate::logger;
use crate::mm::{
    FrameAllocator, KernelStackArena, PageTableEntry, PhysAddr, PteFlags, VirtAddr,
};
use crate::sched;
use crate::sync::BigKernelLock;
use crate::trap::percpu::CpuInfo;
use crate::trap::{
    CpuId, CpuStatus, FaultCode, TaskState, TrapFrame, TrapFrameDump, TrapOutcome, VectorTable,
};

/// Everything the big kernel lock protects.
pub struct KernelState {
    pub envs: EnvTable,
    pub frames: FrameAllocator,
}

impl KernelState {
    pub fn new(nframes: usize) -> Self {
        Self {
            envs: EnvTable::new(),
            frames: FrameAllocator::new(nframes),
        }
    }
}

/// One kernel image shared by all CPUs.
pub struct Kernel {
    config: KernelConfig,
    vectors: VectorTable,
    cpus: Box<[CpuInfo]>,
    kstacks: KernelStackArena,
    lock: BigKernelLock<KernelState>,
    panicked: Once<KernelPanic>,
    platform: Platform,
}

impl Kernel {
    pub fn new(config: KernelConfig, platform: Platform) -> Self {
        logger::init(config.log_level);

        let cpus = (0..config.ncpu)
            .map(|i| CpuInfo::new(CpuId::new(i as u8)))
            .collect();

        let kernel = Self {
            vectors: VectorTable::install(),
            cpus,
            kstacks: KernelStackArena::new(config.ncpu),
            lock: BigKernelLock::new(KernelState::new(config.nframes)),
            panicked: Once::new(),
            platform,
            config,
        };

        log::info!(
            "kernel: {} CPUs, {} frames",
            kernel.config.ncpu,
            kernel.config.nframes
        );
        kernel
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn vectors(&self) -> &VectorTable {
        &self.vectors
    }

    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    /// Number of CPUs this kernel drives.
    pub fn ncpu(&self) -> usize {
        self.cpus.len()
    }

    /// Per-CPU slot of `cpu`.
    ///
    /// # Panics
    /// Panics if `cpu` is not one of this kernel's CPUs.
    pub fn cpu(&self, cpu: CpuId) -> &CpuInfo {
        &self.cpus[cpu.index()]
    }

    pub(crate) fn lock(&self) -> &BigKernelLock<KernelState> {
        &self.lock
    }

    /// Give `cpu` its own kernel stack and task state, and load the IDT.
    ///
    /// Activating the same CPU twice is fatal.
    pub fn start_cpu(&self, cpu: CpuId) -> Result<&TaskState, KernelPanic> {
        let info = self.cpu(cpu);
        if info.task_state().is_some() {
            return Err(self.latch(cpu, String::from("per-CPU context activated twice")));
        }

        let stack = self
            .kstacks
            .allocate()
            .ok_or_else(|| self.latch(cpu, String::from("out of kernel stacks")))?;

        let ts = info
            .activate(TaskState::new(cpu, stack))
            .ok_or_else(|| self.latch(cpu, String::from("per-CPU context activated twice")))?;

        info.load_idt();
        info.set_status(CpuStatus::Started);
        log::info!("CPU {} started, esp0 {:08x}", cpu.index(), ts.esp0);

        Ok(ts)
    }

    /// First scheduling decision of a freshly started CPU.
    pub fn schedule(&self, cpu: CpuId) -> TrapOutcome {
        if self.panicked.is_completed() {
            return self.halt(cpu);
        }
        let guard = self.lock.lock(cpu);
        sched::sched_yield(self, cpu, guard)
    }

    /// Build a runnable environment from a program image.
    ///
    /// Runs on the boot CPU, which must not hold the kernel lock.
    pub fn create_env(&self, image: &ProgramImage) -> Result<EnvId, Error> {
        let mut guard = self.lock.lock(CpuId::BOOT);
        let state = &mut *guard;

        let id = state.envs.alloc(&mut state.frames, EnvId::CURRENT)?;
        if let Err(e) = state.envs.load(&mut state.frames, id, image) {
            state.envs.free(&mut state.frames, id);
            return Err(e);
        }

        Ok(id)
    }

    /// The fatal condition that stopped the kernel, if any.
    pub fn panicked(&self) -> Option<&KernelPanic> {
        self.panicked.get()
    }

    /// Record a fatal condition and halt `cpu`.
    fn latch(&self, cpu: CpuId, message: String) -> KernelPanic {
        kprintln!("kernel panic on CPU {}: {}", cpu.index(), message);

        let record = KernelPanic { cpu, message };
        self.panicked.call_once(|| record.clone());
        self.cpu(cpu).set_status(CpuStatus::Halted);
        record
    }

    pub(crate) fn fatal(&self, cpu: CpuId, message: String) -> TrapOutcome {
        self.latch(cpu, message);
        TrapOutcome::Halted
    }

    /// Stop `cpu` for good after another CPU panicked.
    pub(crate) fn halt(&self, cpu: CpuId) -> TrapOutcome {
        self.cpu(cpu).set_status(CpuStatus::Halted);
        TrapOutcome::Halted
    }

    /// Destroy `id` on behalf of `cpu`.
    ///
    /// An environment running on another CPU is only marked `Dying`; that
    /// CPU frees it on its next trap. If `id` was `cpu`'s own environment
    /// the CPU is left without one and must reschedule.
    pub(crate) fn destroy_env(&self, cpu: CpuId, state: &mut KernelState, id: EnvId) {
        let Some(env) = state.envs.get_mut(id) else {
            return;
        };

        if env.status == EnvStatus::Running && env.cpunum != Some(cpu) {
            env.status = EnvStatus::Dying;
            return;
        }

        state.envs.free(&mut state.frames, id);

        let info = self.cpu(cpu);
        if info.curenv() == Some(id) {
            info.set_curenv(None);
        }
    }

    pub(crate) fn print_trapframe(&self, cpu: CpuId, tf: &TrapFrame) {
        let cr2 = self.cpu(cpu).cr2();
        kprint!("{}", TrapFrameDump::new(cpu, tf, Some(cr2)));
    }

    /// One byte access by a CPU running `env` in user mode, as the MMU
    /// performs it. Returns the byte read (or written), or the page fault
    /// error code.
    pub(crate) fn mmu_access(
        &self,
        env: EnvId,
        va: VirtAddr,
        write: Option<u8>,
    ) -> Result<u8, FaultCode> {
        let mut hw = self.lock.hardware();
        let KernelState { envs, frames } = &mut *hw;

        let env = envs.get(env).ok_or(FaultCode::USER)?;
        let pa = env.space.translate(va, write.is_some())?;

        let page = frames.page_mut(pa.align_down());
        let off = va.page_offset();
        if let Some(byte) = write {
            page[off] = byte;
        }

        Ok(page[off])
    }

    /// Page directory entry `pdx` of `env`, as the environment reads it
    /// through its read-only window onto its own page tables.
    pub(crate) fn uvpd(&self, env: EnvId, pdx: usize) -> PageTableEntry {
        self.lock
            .hardware()
            .envs
            .get(env)
            .map_or(PageTableEntry::invalid(), |env| env.space.pde(pdx))
    }

    /// Page table entry for `va` in `env`, through the same window.
    pub(crate) fn uvpt(&self, env: EnvId, va: VirtAddr) -> PageTableEntry {
        self.lock
            .hardware()
            .envs
            .get(env)
            .map_or(PageTableEntry::invalid(), |env| env.space.pte(va))
    }

    // Inspection helpers. They take the lock the way the hardware does and
    // must not be called by a CPU that holds it.

    pub fn env_status(&self, id: EnvId) -> EnvStatus {
        self.lock.hardware().envs.status(id)
    }

    pub fn env_frame(&self, id: EnvId) -> Option<TrapFrame> {
        self.lock.hardware().envs.get(id).map(|env| env.tf)
    }

    pub fn env_upcall(&self, id: EnvId) -> Option<VirtAddr> {
        self.lock.hardware().envs.get(id).and_then(|env| env.pgfault_upcall)
    }

    pub fn env_parent(&self, id: EnvId) -> Option<EnvId> {
        self.lock.hardware().envs.get(id).map(|env| env.parent_id)
    }

    /// Frame and permissions mapped at `va` in `id`.
    pub fn lookup(&self, id: EnvId, va: VirtAddr) -> Option<(PhysAddr, PteFlags)> {
        self.lock
            .hardware()
            .envs
            .get(id)
            .and_then(|env| env.space.lookup(va))
    }

    pub fn frame_refs(&self, pa: PhysAddr) -> u16 {
        self.lock.hardware().frames.refs(pa)
    }

    pub fn free_frames(&self) -> usize {
        self.lock.hardware().frames.free_frames()
    }

    /// Highest number of CPUs ever seen holding the kernel lock at once.
    pub fn max_lock_holders(&self) -> usize {
        self.lock.max_held()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::Segment;
    use crate::mm::memlayout::{KSTACKTOP, KSTKGAP, KSTKSIZE, UTEXT};

    fn kernel(ncpu: usize) -> Kernel {
        Kernel::new(
            KernelConfig::new().with_cpus(ncpu).with_frames(256),
            Platform::default(),
        )
    }

    fn image() -> ProgramImage {
        ProgramImage {
            entry: VirtAddr::new(UTEXT),
            segments: vec![Segment {
                va: VirtAddr::new(UTEXT),
                data: vec![0x90; 32],
                writable: true,
            }],
        }
    }

    #[test]
    fn test_each_cpu_gets_its_own_stack() {
        let k = kernel(3);
        let tops: Vec<u32> = (0..3)
            .map(|i| k.start_cpu(CpuId::new(i)).unwrap().esp0)
            .collect();
        assert_eq!(tops[0], KSTACKTOP);
        assert_eq!(tops[2], KSTACKTOP - 2 * (KSTKSIZE + KSTKGAP));

        let stacks: Vec<_> = (0..3)
            .map(|i| k.cpu(CpuId::new(i)).task_state().unwrap().stack)
            .collect();
        assert!(!stacks[0].overlaps(&stacks[1]));
        assert!(!stacks[1].overlaps(&stacks[2]));
        assert!(k.cpu(CpuId::new(1)).idt_loaded());
    }

    #[test]
    fn test_double_activation_is_fatal() {
        let k = kernel(2);
        k.start_cpu(CpuId::new(1)).unwrap();
        let err = k.start_cpu(CpuId::new(1)).unwrap_err();
        assert_eq!(err.cpu, CpuId::new(1));
        assert_eq!(k.panicked(), Some(&err));
        // Everybody else stops at the next scheduling point.
        assert_eq!(k.schedule(CpuId::new(0)), TrapOutcome::Halted);
    }

    #[test]
    fn test_first_schedule_runs_created_env() {
        let k = kernel(1);
        let id = k.create_env(&image()).unwrap();
        k.start_cpu(CpuId::BOOT).unwrap();

        match k.schedule(CpuId::BOOT) {
            TrapOutcome::Resumed { env, tf } => {
                assert_eq!(env, id);
                assert_eq!(tf.eip, UTEXT);
                assert!(tf.from_user());
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(k.env_status(id), EnvStatus::Running);
        assert!(k.cpu(CpuId::BOOT).interrupts_enabled());
        assert_eq!(k.lock().holder(), None);
    }

    #[test]
    fn test_nothing_to_run_parks() {
        let k = kernel(1);
        k.start_cpu(CpuId::BOOT).unwrap();
        assert_eq!(k.schedule(CpuId::BOOT), TrapOutcome::Parked);
        assert_eq!(k.cpu(CpuId::BOOT).status(), CpuStatus::Halted);
        assert!(k.cpu(CpuId::BOOT).interrupts_enabled());
    }

    #[test]
    fn test_failed_create_releases_frames() {
        let k = Kernel::new(
            KernelConfig::new().with_cpus(1).with_frames(3),
            Platform::default(),
        );
        // Directory, one table, one text page; nothing left for the stack
        // table.
        assert_eq!(k.create_env(&image()), Err(Error::NoMem));
        assert_eq!(k.free_frames(), 3);
    }
}
