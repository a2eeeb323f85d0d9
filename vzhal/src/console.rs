//! Console logging.
//!
//! Log records are rendered as `[LEVEL] message` lines on a [`Console`]. The
//! error level is shown as `CRITICAL`, matching the way hypervisor failures are
//! reported on the serial line.
use alloc::boxed::Box;
use core::fmt::Write;
use log::{Level, LevelFilter, Log, Metadata, Record, SetLoggerError};

/// A character sink, usually the platform UART.
pub trait Console: Sync {
    /// Write `s` as-is.
    fn write_str(&self, s: &str);
}

struct Writer<'a>(&'a dyn Console);

impl Write for Writer<'_> {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        self.0.write_str(s);
        Ok(())
    }
}

/// Prefix printed in front of a record of `level`.
pub const fn prefix(level: Level) -> &'static str {
    match level {
        Level::Error => "[CRITICAL]",
        Level::Warn => "[WARNING]",
        Level::Info => "[INFO]",
        Level::Debug => "[DEBUG]",
        Level::Trace => "[TRACE]",
    }
}

/// [`log::Log`] implementation writing to a [`Console`].
pub struct ConsoleLogger {
    console: &'static dyn Console,
    level: LevelFilter,
}

impl ConsoleLogger {
    /// Create a logger that emits records up to `level`.
    pub const fn new(console: &'static dyn Console, level: LevelFilter) -> Self {
        Self { console, level }
    }
}

impl Log for ConsoleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let _ = writeln!(
                Writer(self.console),
                "{} {}",
                prefix(record.level()),
                record.args()
            );
        }
    }

    fn flush(&self) {}
}

/// Install a [`ConsoleLogger`] as the global logger.
///
/// Fails if a logger is already installed.
pub fn init(console: &'static dyn Console, level: LevelFilter) -> Result<(), SetLoggerError> {
    log::set_logger(Box::leak(Box::new(ConsoleLogger::new(console, level))))?;
    log::set_max_level(level);
    Ok(())
}
