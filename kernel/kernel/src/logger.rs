//! `log` facade over the serial port.

use crate::serial::{COM1, SerialPort};
use core::fmt::Write;
use kernel_sync::{Mutex, RawSpin, SpinMutex};
use log::{LevelFilter, Log, Metadata, Record};

/// The sink; `None` until [`init`] runs, so early log macros are no-ops.
static SERIAL: SpinMutex<Option<SerialPort>> =
    Mutex::from_raw(RawSpin::named("console"), None);

struct SerialLogger {
    max_level: LevelFilter,
}

impl Log for SerialLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.max_level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        // Interrupt handlers log too; hold the port with IRQs off.
        let mut port = SERIAL.lock_irq();
        if let Some(port) = port.as_mut() {
            let _ = writeln!(port, "[{}] {}: {}", record.level(), record.target(), record.args());
        }
    }

    fn flush(&self) {}
}

static LOGGER: SerialLogger = SerialLogger {
    max_level: LevelFilter::Trace,
};

/// Bring up COM1 and route the `log` macros to it. Call once, first
/// thing in `kmain`.
pub fn init(max_level: LevelFilter) {
    let port = unsafe { SerialPort::init(COM1) };
    *SERIAL.lock() = Some(port);
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(max_level);
    }
}
