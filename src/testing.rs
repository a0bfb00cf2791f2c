//! A process-wide logger, that records warnings and errors for assertions.
extern crate std;
use std::{format, string::String, sync::Mutex, sync::Once, vec::Vec};

static RECORDS: Mutex<Vec<(log::Level, String)>> = Mutex::new(Vec::new());

struct Capture;
impl log::Log for Capture {
    fn enabled(&self, _metadata: &log::Metadata<'_>) -> bool {
        true
    }

    fn log(&self, record: &log::Record<'_>) {
        let message = format!("{}", record.args());
        RECORDS.lock().unwrap().push((record.level(), message));
    }

    fn flush(&self) {}
}

/// Install the capturing logger. Repeated calls are fine.
pub(crate) fn capture_logs() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        log::set_logger(&Capture).unwrap();
        log::set_max_level(log::LevelFilter::Warn);
    });
}

/// Whether a record at `level` containing `text` was logged by any test.
pub(crate) fn logged(level: log::Level, text: &str) -> bool {
    RECORDS
        .lock()
        .unwrap()
        .iter()
        .any(|(l, message)| *l == level && message.contains(text))
}
