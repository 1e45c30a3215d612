//! Forwards the crate's `log` records to a host-provided [`Logger`].
//!
//! Native Rust hosts can ignore this module and install any `log`
//! implementation (or a `tracing` bridge) themselves. Embedders without a
//! Rust logging stack, such as a door controller firmware shell or a mobile
//! app through the `ffi` feature, call [`set_logger`] once at startup.

use std::sync::{Arc, OnceLock};

/// Receives log lines emitted by `cardkit`.
///
/// ```rust
/// use cardkit_core::logger::{LogLevel, Logger};
///
/// struct StderrLogger;
///
/// impl Logger for StderrLogger {
///     fn log(&self, level: LogLevel, message: String) {
///         eprintln!("[{level:?}] {message}");
///     }
/// }
/// ```
///
/// Messages never contain card secrets, wrapped keys or tags.
#[cfg_attr(feature = "ffi", uniffi::export(with_foreign))]
pub trait Logger: Sync + Send {
    /// Logs a message at the specified level.
    fn log(&self, level: LogLevel, message: String);
}

/// Severity of a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "ffi", derive(uniffi::Enum))]
pub enum LogLevel {
    /// Very detailed tracing.
    Trace,
    /// Debugging information.
    Debug,
    /// Normal operation, e.g. a card issued or a sync completed.
    Info,
    /// Something failed but the system keeps going, e.g. a rotation failure.
    Warn,
    /// An operation failed.
    Error,
}

impl From<log::Level> for LogLevel {
    fn from(level: log::Level) -> Self {
        match level {
            log::Level::Error => Self::Error,
            log::Level::Warn => Self::Warn,
            log::Level::Info => Self::Info,
            log::Level::Debug => Self::Debug,
            log::Level::Trace => Self::Trace,
        }
    }
}

struct ForeignLogger;

impl ForeignLogger {
    /// Debug and trace output of dependencies (reqwest, hyper) is dropped;
    /// only `cardkit` modules may log at those levels.
    fn accepts(record: &log::Record) -> bool {
        let from_cardkit = record
            .module_path()
            .is_some_and(|module_path| module_path.starts_with("cardkit"))
            || record.target().starts_with("cardkit");
        from_cardkit || record.level() <= log::Level::Info
    }
}

impl log::Log for ForeignLogger {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        if !Self::accepts(record) {
            return;
        }

        if let Some(logger) = LOGGER_INSTANCE.get() {
            logger.log(record.level().into(), format!("{}", record.args()));
        } else {
            eprintln!("Logger not set: {}", record.args());
        }
    }

    fn flush(&self) {}
}

static LOGGER_INSTANCE: OnceLock<Arc<dyn Logger>> = OnceLock::new();

/// Installs `logger` as the destination of all `cardkit` log records.
///
/// Only the first call takes effect; later calls print a notice and return.
#[cfg_attr(feature = "ffi", uniffi::export)]
pub fn set_logger(logger: Arc<dyn Logger>) {
    if LOGGER_INSTANCE.set(logger).is_err() {
        println!("Logger already set");
    }

    if let Err(e) = init_logger() {
        eprintln!("Failed to set logger: {e}");
    }
}

fn init_logger() -> Result<(), log::SetLoggerError> {
    static LOGGER: ForeignLogger = ForeignLogger;
    log::set_logger(&LOGGER)?;
    log::set_max_level(log::LevelFilter::Trace);
    Ok(())
}
