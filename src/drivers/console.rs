//! Kernel Console
//!
//! Every line the kernel prints lands in a bounded in-memory buffer that
//! the embedder drains and forwards to whatever output it has.
//!
//! # Security Considerations
//! - The buffer is bounded; the oldest output is dropped first
//! - Uses spinlock for thread-safe access

use alloc::string::String;
use core::fmt::{self, Write};

use spin::Mutex;

/// Bytes kept before old output is discarded.
pub const CONSOLE_CAPACITY: usize = 64 * 1024;

/// Bounded console buffer.
pub struct Console {
    buf: String,
    capacity: usize,
    dropped: usize,
}

impl Console {
    pub const fn new(capacity: usize) -> Self {
        Self {
            buf: String::new(),
            capacity,
            dropped: 0,
        }
    }

    /// Append a string, discarding the oldest bytes past the capacity.
    pub fn write_str(&mut self, s: &str) {
        self.buf.push_str(s);

        if self.buf.len() > self.capacity {
            let mut cut = self.buf.len() - self.capacity;
            while !self.buf.is_char_boundary(cut) {
                cut += 1;
            }
            self.buf.drain(..cut);
            self.dropped += cut;
        }
    }

    /// Take everything written so far.
    pub fn drain(&mut self) -> String {
        core::mem::take(&mut self.buf)
    }

    /// Bytes discarded because the buffer was full.
    pub fn dropped(&self) -> usize {
        self.dropped
    }
}

impl Write for Console {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        Console::write_str(self, s);
        Ok(())
    }
}

/// Global console instance protected by spinlock
pub static CONSOLE: Mutex<Console> = Mutex::new(Console::new(CONSOLE_CAPACITY));

/// Take all pending console output.
pub fn drain() -> String {
    CONSOLE.lock().drain()
}

/// Print macro for kernel output
#[macro_export]
macro_rules! kprint {
    ($($arg:tt)*) => {{
        use core::fmt::Write;
        let mut console = $crate::drivers::console::CONSOLE.lock();
        let _ = write!(console, $($arg)*);
    }};
}

/// Println macro for kernel output
#[macro_export]
macro_rules! kprintln {
    () => {
        $crate::kprint!("\n")
    };
    ($($arg:tt)*) => {{
        $crate::kprint!($($arg)*);
        $crate::kprint!("\n");
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounded_buffer_drops_oldest() {
        let mut console = Console::new(8);
        console.write_str("abcdef");
        console.write_str("ghij");
        assert_eq!(console.drain(), "cdefghij");
        assert_eq!(console.dropped(), 2);
        assert_eq!(console.drain(), "");
    }

    #[test]
    fn test_cut_respects_char_boundaries() {
        let mut console = Console::new(3);
        console.write_str("aé");
        console.write_str("bc");
        // "aébc" is 5 bytes; dropping 2 would split 'é'
        assert_eq!(console.drain(), "bc");
    }

    #[test]
    fn test_formatting() {
        let mut console = Console::new(64);
        let _ = write!(console, "[{:08x}] new env {:08x}", 0, 0x1000);
        assert_eq!(console.drain(), "[00000000] new env 00001000");
    }
}
