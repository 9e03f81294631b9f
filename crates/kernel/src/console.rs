//! Defines the early debug console that logs to the serial port.

use core::{
    fmt::Write,
    sync::atomic::{AtomicBool, Ordering},
};

use log::LevelFilter;
use spin::{Mutex, Once};

use crate::serial::SerialWriter;

pub struct Console {
    has_output: AtomicBool,
    serial: Mutex<Option<SerialWriter>>,
}

static DEFAULT: Once<Console> = Once::new();

impl Console {
    pub fn init() -> &'static Self {
        let console = Self::default();
        console.install();
        console
    }

    pub fn default() -> &'static Self {
        DEFAULT.call_once(|| Console {
            has_output: AtomicBool::new(false),
            serial: Mutex::new(None),
        })
    }

    /// Registers the console as the global logger.
    ///
    /// A second call leaves the first registration in place.
    pub fn install(&'static self) {
        if log::set_logger(self).is_err() {
            return;
        }

        #[cfg(debug_assertions)]
        log::set_max_level(LevelFilter::Trace);

        #[cfg(all(not(debug_assertions), feature = "detailed-logging"))]
        log::set_max_level(LevelFilter::Debug);

        #[cfg(all(not(debug_assertions), not(feature = "detailed-logging")))]
        log::set_max_level(LevelFilter::Info);
    }

    pub fn has_output(&self) -> bool {
        self.has_output.load(Ordering::SeqCst)
    }

    pub fn attach_serial(&self, serial: SerialWriter) {
        *self.serial.lock() = Some(serial);
        self.has_output.store(true, Ordering::SeqCst);
    }
}

impl log::Log for Console {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        self.has_output()
    }

    fn log(&self, record: &log::Record) {
        if let Some(serial) = &mut *self.serial.lock() {
            // Nowhere to report a failed write.
            let _ = write_log_entry_to(serial, record);
        }
    }

    fn flush(&self) {}
}

fn write_log_entry_to(
    writer: &mut impl core::fmt::Write,
    record: &log::Record,
) -> core::fmt::Result {
    #[cfg(any(debug_assertions, feature = "detailed-logging"))]
    return writeln!(
        writer,
        "[{} {}:{} {}] {}",
        record.level(),
        record.file().unwrap_or("unknown"),
        record.line().unwrap_or(0),
        record.target(),
        record.args()
    );
    #[cfg(not(any(debug_assertions, feature = "detailed-logging")))]
    return writeln!(writer, "[{:5}] {}", record.level(), record.args());
}
