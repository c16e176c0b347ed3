use std::io::Write;

use console::{style, Color};
use log::{Level, LevelFilter, Log, Metadata, Record};

/// Log to stderr, level tag coloured.
pub struct ConsoleLogger {
    level: LevelFilter,
}

impl ConsoleLogger {
    pub fn register(verbosity: usize) {
        let level = match verbosity {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        let logger = Box::new(Self { level });
        if log::set_boxed_logger(logger).is_ok() {
            log::set_max_level(level);
        }
    }
}

impl Log for ConsoleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let color = match record.level() {
            Level::Error => Color::Red,
            Level::Warn  => Color::Yellow,
            Level::Info  => Color::Green,
            Level::Debug => Color::Cyan,
            Level::Trace => Color::White,
        };

        let stderr = std::io::stderr();
        let mut stderr = stderr.lock();
        let _ = writeln!(stderr, "{:>5} {}: {}",
            style(record.level()).fg(color),
            record.target(),
            record.args(),
        );
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}
