//! Boot-time kernel configuration.

use log::LevelFilter;

/// Maximum number of CPUs the kernel can drive.
pub const NCPU_MAX: usize = 8;

/// Tunables fixed at boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelConfig {
    /// Number of CPUs brought up (1..=NCPU_MAX).
    pub ncpu: usize,
    /// Physical frames managed by the frame allocator.
    pub nframes: usize,
    /// Maximum level forwarded to the kernel console.
    pub log_level: LevelFilter,
}

impl KernelConfig {
    pub const fn new() -> Self {
        Self {
            ncpu: NCPU_MAX,
            nframes: 2048,
            log_level: LevelFilter::Info,
        }
    }

    /// Number of CPUs, clamped to `1..=NCPU_MAX`.
    pub const fn with_cpus(mut self, ncpu: usize) -> Self {
        self.ncpu = if ncpu == 0 {
            1
        } else if ncpu > NCPU_MAX {
            NCPU_MAX
        } else {
            ncpu
        };
        self
    }

    pub const fn with_frames(mut self, nframes: usize) -> Self {
        self.nframes = nframes;
        self
    }

    pub const fn with_log_level(mut self, level: LevelFilter) -> Self {
        self.log_level = level;
        self
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self::new()
    }
}
