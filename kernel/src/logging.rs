// =============================================================================
// Helios — Kernel Logger
// =============================================================================
//
// Wires the `log` crate facade to the COM1 serial port, similar in spirit
// to Linux's printk(). Subsystems log with `log::info!` and friends; the
// backend formats each record into a single serialized line:
//
//   [ INFO] kernel::memory::pmm: managing 0x200000..0x8200000 (128 MiB)
//
// The serial port's spinlock makes each record atomic — no interleaving
// between a syscall path and an interrupt handler. Formatting itself is
// `format_args!`-based and allocation-free, so logging works from the very
// first instruction of kmain through to interrupt context.
//
// =============================================================================

use core::fmt::Write;

use log::{Level, LevelFilter, Metadata, Record};

use crate::arch::serial::SERIAL;

struct SerialLogger;

static LOGGER: SerialLogger = SerialLogger;

impl log::Log for SerialLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let level = match record.level() {
            Level::Error => "ERROR",
            Level::Warn => " WARN",
            Level::Info => " INFO",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        };

        let mut serial = SERIAL.lock();
        // Serial output cannot fail; the Result exists only to satisfy
        // core::fmt::Write.
        let _ = writeln!(serial, "[{}] {}: {}", level, record.target(), record.args());
    }

    fn flush(&self) {}
}

/// Installs the serial logger as the global `log` backend.
///
/// Must be called exactly once, before any other subsystem logs.
pub fn init(level: LevelFilter) {
    crate::arch::serial::init();
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}
