//! The diagnostic callback boundary to the host.
//!
//! The host provides a single print function taking a message, an error flag
//! and an optional typed scalar. Inside the crate this is the [`Diagnostics`]
//! trait. Diagnostics are best-effort: nothing in this crate depends on a
//! callback succeeding. The [`Module`](crate::Module) reports errors after
//! releasing its lock, so a callback may query the module again.
use core::fmt::{self, Write as _};

/// A typed scalar attached to a diagnostic message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scalar {
    /// A plain value, e.g. a requested size.
    Value(u32),
    /// A number of items or bytes.
    Count(u32),
    /// An address inside the module memory.
    Address(u32),
}
impl Scalar {
    /// The tag of this scalar on the host boundary (`0` means "no scalar").
    pub const fn kind(&self) -> u32 {
        match self {
            Scalar::Value(_) => 1,
            Scalar::Count(_) => 2,
            Scalar::Address(_) => 3,
        }
    }

    /// The raw value of this scalar.
    pub const fn get(&self) -> u32 {
        match *self {
            Scalar::Value(v) | Scalar::Count(v) | Scalar::Address(v) => v,
        }
    }
}
impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Scalar::Value(v) => write!(f, "value={v}"),
            Scalar::Count(v) => write!(f, "count={v}"),
            Scalar::Address(v) => write!(f, "address={v:#x}"),
        }
    }
}

/// A sink for diagnostic messages, usually provided by the host.
pub trait Diagnostics {
    /// Print a message. `error` marks it as an error report.
    fn print(&self, message: &str, error: bool, scalar: Option<Scalar>);
}
impl<D: Diagnostics + ?Sized> Diagnostics for &D {
    fn print(&self, message: &str, error: bool, scalar: Option<Scalar>) {
        (**self).print(message, error, scalar)
    }
}

/// Diagnostics that are discarded.
#[derive(Debug, Clone, Copy, Default)]
pub struct Silent;
impl Diagnostics for Silent {
    fn print(&self, _message: &str, _error: bool, _scalar: Option<Scalar>) {}
}

/// Diagnostics forwarded to the [`log`] facade.
///
/// Do not combine this with a [`DiagnosticsLogger`] wrapping the same
/// messages, as every message would be printed in a loop.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogDiagnostics;
impl Diagnostics for LogDiagnostics {
    fn print(&self, message: &str, error: bool, scalar: Option<Scalar>) {
        match (error, scalar) {
            (true, Some(scalar)) => log::error!("{message} ({scalar})"),
            (true, None) => log::error!("{message}"),
            (false, Some(scalar)) => log::info!("{message} ({scalar})"),
            (false, None) => log::info!("{message}"),
        }
    }
}

/// The diagnostics callback imported from the host.
#[cfg(target_arch = "wasm32")]
#[derive(Debug, Clone, Copy, Default)]
pub struct Host;
#[cfg(target_arch = "wasm32")]
#[link(wasm_import_module = "env")]
extern "C" {
    fn host_print(ptr: *const u8, len: u32, error: u32, kind: u32, value: u32);
}
#[cfg(target_arch = "wasm32")]
impl Diagnostics for Host {
    fn print(&self, message: &str, error: bool, scalar: Option<Scalar>) {
        let (kind, value) = scalar.map_or((0, 0), |s| (s.kind(), s.get()));
        // SAFETY: the host only reads `len` bytes at `ptr`, which is a live
        // string slice for the duration of the call.
        unsafe {
            host_print(
                message.as_ptr(),
                message.len() as u32,
                u32::from(error),
                kind,
                value,
            )
        }
    }
}

/// A fixed-size message buffer, which silently truncates.
///
/// The module has no allocator for its own bookkeeping, so formatted
/// messages are built on the stack.
pub(crate) struct MessageBuffer {
    bytes: [u8; MessageBuffer::CAPACITY],
    len: usize,
}
impl MessageBuffer {
    const CAPACITY: usize = 256;

    pub(crate) const fn new() -> Self {
        Self {
            bytes: [0; Self::CAPACITY],
            len: 0,
        }
    }

    /// Format `args` into a fresh buffer.
    pub(crate) fn format(args: fmt::Arguments<'_>) -> Self {
        let mut buffer = Self::new();
        // truncation is not an error, so this cannot fail
        let _ = buffer.write_fmt(args);
        buffer
    }

    pub(crate) fn as_str(&self) -> &str {
        // only whole characters are ever copied in
        core::str::from_utf8(&self.bytes[..self.len]).unwrap_or_default()
    }
}
impl fmt::Write for MessageBuffer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let mut n = s.len().min(Self::CAPACITY - self.len);
        while !s.is_char_boundary(n) {
            n -= 1;
        }
        self.bytes[self.len..self.len + n].copy_from_slice(&s.as_bytes()[..n]);
        self.len += n;
        Ok(())
    }
}

/// A [`log::Log`] implementation printing through [`Diagnostics`].
///
/// Records at [`log::Level::Warn`] and above are flagged as errors.
///
/// Records are printed where they are emitted. For records of this crate that
/// is while a [`Module`](crate::Module) is locked, so the diagnostics behind
/// a logger must not call into that module. Errors returned by a module are
/// already reported through its own diagnostics.
pub struct DiagnosticsLogger<D> {
    diagnostics: D,
    level: log::LevelFilter,
}
impl<D> DiagnosticsLogger<D> {
    /// Create a logger passing records up to `level` to `diagnostics`.
    pub const fn new(diagnostics: D, level: log::LevelFilter) -> Self {
        Self { diagnostics, level }
    }
}
impl<D: Diagnostics + Send + Sync> log::Log for DiagnosticsLogger<D> {
    fn enabled(&self, metadata: &log::Metadata<'_>) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &log::Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let message = MessageBuffer::format(format_args!(
            "[{}] {}",
            record.target(),
            record.args()
        ));
        let error = record.level() <= log::Level::Warn;
        self.diagnostics.print(message.as_str(), error, None);
    }

    fn flush(&self) {}
}

#[cfg(test)]
mod tests {
    extern crate std;
    use super::{Diagnostics, DiagnosticsLogger, MessageBuffer, Scalar};
    use log::Log as _;
    use std::{string::String, sync::Mutex, vec::Vec};

    #[derive(Default)]
    struct Recorder(Mutex<Vec<(String, bool, Option<Scalar>)>>);
    impl Diagnostics for Recorder {
        fn print(&self, message: &str, error: bool, scalar: Option<Scalar>) {
            self.0
                .lock()
                .unwrap()
                .push((String::from(message), error, scalar));
        }
    }

    #[test]
    fn scalar_boundary_encoding() {
        assert_eq!(Scalar::Value(7).kind(), 1);
        assert_eq!(Scalar::Count(7).kind(), 2);
        assert_eq!(Scalar::Address(0x40).kind(), 3);
        assert_eq!(Scalar::Address(0x40).get(), 0x40);
    }

    #[test]
    fn message_buffer_truncates_on_char_boundary() {
        let long: String = core::iter::repeat('é').take(200).collect(); // 400 bytes
        let buffer = MessageBuffer::format(format_args!("{long}"));
        assert_eq!(buffer.as_str().len(), 256);
        assert!(buffer.as_str().chars().all(|c| c == 'é'));

        let buffer = MessageBuffer::format(format_args!("a{long}"));
        assert_eq!(buffer.as_str().len(), 255);
    }

    #[test]
    fn logger_forwards_enabled_records() {
        let logger = DiagnosticsLogger::new(Recorder::default(), log::LevelFilter::Warn);
        logger.log(
            &log::Record::builder()
                .level(log::Level::Warn)
                .target("heap")
                .args(format_args!("out of memory"))
                .build(),
        );
        logger.log(
            &log::Record::builder()
                .level(log::Level::Trace)
                .target("heap")
                .args(format_args!("noise"))
                .build(),
        );

        let printed = logger.diagnostics.0.lock().unwrap();
        assert_eq!(printed.len(), 1);
        assert_eq!(printed[0], (String::from("[heap] out of memory"), true, None));
    }
}
