use std::sync::{Mutex, OnceLock};

use log::{Level, LevelFilter, Log, Metadata, Record};

use crate::sync::lock_unpoisoned;

type Capture = Box<dyn Fn(Level, &str) + Send + Sync + 'static>;

fn level_label(level: Level) -> &'static str {
    match level {
        Level::Error => "error",
        Level::Warn => "warn",
        Level::Info => "info",
        Level::Debug => "debug",
        Level::Trace => "trace",
    }
}

fn capture_cell() -> &'static Mutex<Option<Capture>> {
    static CAPTURE: OnceLock<Mutex<Option<Capture>>> = OnceLock::new();
    CAPTURE.get_or_init(|| Mutex::new(None))
}

struct StderrLogger;

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let message = record.args().to_string();
        let guard = lock_unpoisoned(capture_cell());
        match guard.as_ref() {
            Some(capture) => capture(record.level(), &message),
            None => eprintln!("[{}] {}", level_label(record.level()), message),
        }
    }

    fn flush(&self) {}
}

static LOGGER: StderrLogger = StderrLogger;

/// Installs the stderr logger as the process-wide `log` backend and sets the
/// maximum level. Returns false when another backend was installed first; the
/// level is applied either way.
pub fn init(level: LevelFilter) -> bool {
    let installed = log::set_logger(&LOGGER).is_ok();
    log::set_max_level(level);
    installed
}

/// Routes records to `capture` instead of stderr.
pub fn set_capture(capture: impl Fn(Level, &str) + Send + Sync + 'static) {
    let mut guard = lock_unpoisoned(capture_cell());
    *guard = Some(Box::new(capture));
}

pub fn clear_capture() {
    let mut guard = lock_unpoisoned(capture_cell());
    *guard = None;
}
