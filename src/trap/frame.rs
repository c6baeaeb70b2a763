//! Saved register state.
//!
//! `TrapFrame` is what the entry stubs push on every vectored event;
//! `UTrapframe` is what the page fault handler writes onto the user
//! exception stack for the process's own handler.

use bitflags::bitflags;

use super::{GD_KT, GD_UD, GD_UT};

bitflags! {
    /// Page fault error code pushed by the hardware.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct FaultCode: u32 {
        /// Protection violation (clear: page not present).
        const PROTECTION = 0x1;
        /// The access was a write.
        const WRITE      = 0x2;
        /// The access came from user mode.
        const USER       = 0x4;
    }
}

bitflags! {
    /// EFLAGS bits the kernel cares about.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct Eflags: u32 {
        /// Carry
        const CF = 0x0001;
        /// Zero
        const ZF = 0x0040;
        /// Trap flag (single step)
        const TF = 0x0100;
        /// Interrupts enabled
        const IF = 0x0200;
        /// Direction
        const DF = 0x0400;
        /// I/O privilege level
        const IOPL_MASK = 0x3000;
    }
}

/// Privilege of the code that was running when the event arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Privilege {
    /// Ring 0
    Kernel = 0,
    /// Ring 3
    User = 3,
}

impl Privilege {
    /// Requested privilege level of a segment selector.
    #[inline]
    pub const fn of_selector(sel: u16) -> Self {
        if sel & 3 == 3 {
            Self::User
        } else {
            Self::Kernel
        }
    }
}

/// General purpose registers in `pusha` order.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PushRegs {
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    /// Useless, pushed by `pusha`
    pub oesp: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
}

impl PushRegs {
    /// Size in bytes.
    pub const SIZE: usize = 32;

    fn write_to(&self, out: &mut [u8]) {
        let words = [
            self.edi, self.esi, self.ebp, self.oesp, self.ebx, self.edx, self.ecx, self.eax,
        ];
        for (chunk, word) in out.chunks_exact_mut(4).zip(words) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
    }

    fn read_from(bytes: &[u8]) -> Self {
        let w = |i: usize| word_at(bytes, i * 4);
        Self {
            edi: w(0),
            esi: w(1),
            ebp: w(2),
            oesp: w(3),
            ebx: w(4),
            edx: w(5),
            ecx: w(6),
            eax: w(7),
        }
    }
}

/// Snapshot of a CPU at the moment it vectored into the kernel.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrapFrame {
    pub regs: PushRegs,
    pub es: u16,
    pub ds: u16,
    pub trapno: u32,
    /// Error code; zero for vectors that do not report one.
    pub err: u32,
    pub eip: u32,
    pub cs: u16,
    pub eflags: u32,
    /// Only meaningful when crossing from user mode.
    pub esp: u32,
    pub ss: u16,
}

impl TrapFrame {
    /// Initial frame of a user environment.
    pub const fn user(entry: u32, stack_top: u32) -> Self {
        let ud = GD_UD | 3;
        Self {
            regs: PushRegs {
                edi: 0,
                esi: 0,
                ebp: 0,
                oesp: 0,
                ebx: 0,
                edx: 0,
                ecx: 0,
                eax: 0,
            },
            es: ud,
            ds: ud,
            trapno: 0,
            err: 0,
            eip: entry,
            cs: GD_UT | 3,
            eflags: Eflags::IF.bits(),
            esp: stack_top,
            ss: ud,
        }
    }

    /// Frame of a CPU interrupted while running kernel code.
    pub const fn kernel(eip: u32, esp: u32, eflags: Eflags) -> Self {
        let mut tf = Self::user(eip, esp);
        tf.cs = GD_KT;
        tf.es = super::GD_KD;
        tf.ds = super::GD_KD;
        tf.ss = super::GD_KD;
        tf.eflags = eflags.bits();
        tf
    }

    /// Privilege level the event arrived from.
    #[inline]
    pub const fn privilege(&self) -> Privilege {
        Privilege::of_selector(self.cs)
    }

    #[inline]
    pub const fn from_user(&self) -> bool {
        matches!(self.privilege(), Privilege::User)
    }

    #[inline]
    pub const fn eflags(&self) -> Eflags {
        Eflags::from_bits_retain(self.eflags)
    }
}

/// Page fault record pushed onto the user exception stack.
///
/// Layout, lowest address first: fault address, error code, the eight
/// general purpose registers, trap-time `eip`, `eflags` and `esp`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UTrapframe {
    pub fault_va: u32,
    pub err: u32,
    pub regs: PushRegs,
    pub eip: u32,
    pub eflags: u32,
    pub esp: u32,
}

impl UTrapframe {
    /// Size in bytes on the exception stack.
    pub const SIZE: usize = 8 + PushRegs::SIZE + 12;

    /// Build the record for a fault described by `tf`.
    pub const fn from_trap(tf: &TrapFrame, fault_va: u32) -> Self {
        Self {
            fault_va,
            err: tf.err,
            regs: tf.regs,
            eip: tf.eip,
            eflags: tf.eflags,
            esp: tf.esp,
        }
    }

    /// Error code decoded as page fault bits.
    pub const fn code(&self) -> FaultCode {
        FaultCode::from_bits_retain(self.err)
    }

    /// Little-endian image written to user memory.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..4].copy_from_slice(&self.fault_va.to_le_bytes());
        out[4..8].copy_from_slice(&self.err.to_le_bytes());
        self.regs.write_to(&mut out[8..8 + PushRegs::SIZE]);
        let tail = 8 + PushRegs::SIZE;
        out[tail..tail + 4].copy_from_slice(&self.eip.to_le_bytes());
        out[tail + 4..tail + 8].copy_from_slice(&self.eflags.to_le_bytes());
        out[tail + 8..tail + 12].copy_from_slice(&self.esp.to_le_bytes());
        out
    }

    /// Parse the image read back from user memory.
    ///
    /// Returns `None` if fewer than `SIZE` bytes are supplied.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::SIZE {
            return None;
        }
        let tail = 8 + PushRegs::SIZE;
        Some(Self {
            fault_va: word_at(bytes, 0),
            err: word_at(bytes, 4),
            regs: PushRegs::read_from(&bytes[8..tail]),
            eip: word_at(bytes, tail),
            eflags: word_at(bytes, tail + 4),
            esp: word_at(bytes, tail + 8),
        })
    }
}

fn word_at(bytes: &[u8], off: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[off..off + 4]);
    u32::from_le_bytes(word)
}
