/*
 * Kernel Logger
 *
 * Routes the `log` crate facade to the console sink with a level prefix.
 * Interrupt handlers log too, so the path from `log::info!` to the sink
 * takes no sleeping locks.
 */

use log::{Level, LevelFilter, Log, Metadata, Record};

use crate::kprintln;

struct KernelLogger;

static LOGGER: KernelLogger = KernelLogger;

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let prefix = match record.level() {
            Level::Error => "E",
            Level::Warn => "W",
            Level::Info => "I",
            Level::Debug => "D",
            Level::Trace => "T",
        };
        kprintln!("[{}] {}: {}", prefix, record.target(), record.args());
    }

    fn flush(&self) {}
}

/// Install the logger at `level`. Safe to call more than once; only the
/// first installation wins, later calls just adjust the level.
pub fn init(level: LevelFilter) {
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(level);
}
