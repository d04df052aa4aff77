use crate::qemu_trace;
use kernel_sync::InstallOnce;
use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

static LOGGER: InstallOnce<QemuLogger> = InstallOnce::new();

pub struct QemuLogger {
    max_level: LevelFilter,
}

impl QemuLogger {
    #[must_use]
    pub const fn new(max_level: LevelFilter) -> Self {
        Self { max_level }
    }

    /// Install as the global `log` backend. Call once during early init.
    ///
    /// # Errors
    /// If a logger was already installed.
    pub fn init(self) -> Result<(), SetLoggerError> {
        let max_level = self.max_level;
        let logger: &'static Self = match LOGGER.install(self) {
            Ok(logger) => logger,
            // Already ours; let `log` report the duplicate.
            Err(_) => match LOGGER.get() {
                Some(logger) => logger,
                None => return Ok(()),
            },
        };
        log::set_logger(logger)?;
        log::set_max_level(max_level);
        Ok(())
    }
}

impl Log for QemuLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.max_level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        // Format: "[LEVEL] target: message\n"
        qemu_trace!(
            "[{}] {}: {}\n",
            record.level(),
            record.target(),
            record.args()
        );
    }

    fn flush(&self) {}
}
