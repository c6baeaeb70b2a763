//! Kernel logger.
//!
//! Forwards `log` records to the kernel console as `[LEVEL] message`
//! lines. Installing it more than once is harmless; the level can be
//! changed at any time.

use log::{Level, LevelFilter, Log, Metadata, Record};

use crate::kprintln;

struct KernelLogger;

static LOGGER: KernelLogger = KernelLogger;

/// Fixed-width level name.
const fn level_name(level: Level) -> &'static str {
    match level {
        Level::Error => "ERROR",
        Level::Warn => "WARN ",
        Level::Info => "INFO ",
        Level::Debug => "DEBUG",
        Level::Trace => "TRACE",
    }
}

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record<'_>) {
        if self.enabled(record.metadata()) {
            kprintln!("[{}] {}", level_name(record.level()), record.args());
        }
    }

    fn flush(&self) {}
}

/// Install the kernel logger and set the maximum level.
pub fn init(level: LevelFilter) {
    // Fails only if a logger is already installed.
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(level);
}
