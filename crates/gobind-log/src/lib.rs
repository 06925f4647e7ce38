//! A small, zero-dependency logging crate for `gobind`.
//!
//! Messages carry the module path of the call site, go to stderr with an
//! optional ANSI colour, and are filtered by a process-wide level. The levels
//! follow the native runtime's message levels, so `critical!` sits between
//! `error!` and `warn!`: it reports a failed precondition the caller can
//! recover from.
//!
//! # Example
//!
//! ```
//! use gobind_log::{critical, debug, info, warn, Level};
//!
//! gobind_log::set_level(Level::Debug);
//!
//! let type_name = "GObject";
//! info!("registered type {}", type_name);
//! debug!("vtable slots: {:?}", vec!["notify", "constructed"]);
//! warn!("no wrapper factory for {}", type_name);
//! critical!("assertion 'handle != NULL' failed");
//! ```
//!
//! # Capturing
//!
//! Tests can collect the records emitted on the current thread with
//! [`capture`]; captured records are not printed.
//!
//! ```
//! use gobind_log::{capture, warn, Level};
//!
//! let ((), records) = capture(|| warn!("dropped message"));
//! assert_eq!(records.len(), 1);
//! assert_eq!(records[0].level, Level::Warn);
//! assert_eq!(records[0].message, "dropped message");
//! ```

use std::cell::RefCell;
use std::fmt::Arguments;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// Environment variable read by [`init_from_env`].
pub const LOG_ENV: &str = "GOBIND_LOG";

/// Log levels, from most severe (`Error`) to least severe (`Trace`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Level {
    /// Failures the process cannot continue from
    Error = 0,
    /// Failed preconditions; the operation is skipped and control returns
    Critical = 1,
    /// Suspicious situations
    Warn = 2,
    /// Informational messages
    Info = 3,
    /// Diagnostic detail
    Debug = 4,
    /// Everything, including reference counting traces
    Trace = 5,
}

impl Level {
    const fn color_code(self) -> &'static str {
        match self {
            Level::Error => "\x1b[31m",
            Level::Critical => "\x1b[1;31m",
            Level::Warn => "\x1b[33m",
            Level::Info => "\x1b[32m",
            Level::Debug => "\x1b[36m",
            Level::Trace => "\x1b[35m",
        }
    }

    /// Returns the upper-case name of this level.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Level::Error => "ERROR",
            Level::Critical => "CRITICAL",
            Level::Warn => "WARN",
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        }
    }

    const fn from_u8(raw: u8) -> Level {
        match raw {
            0 => Level::Error,
            1 => Level::Critical,
            2 => Level::Warn,
            3 => Level::Info,
            4 => Level::Debug,
            _ => Level::Trace,
        }
    }

    /// Parses a level name, ignoring case.
    ///
    /// # Example
    ///
    /// ```
    /// use gobind_log::Level;
    ///
    /// assert_eq!(Level::from_str("critical"), Ok(Level::Critical));
    /// assert_eq!(Level::from_str("WARNING"), Ok(Level::Warn));
    /// assert!(Level::from_str("loud").is_err());
    /// ```
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self, String> {
        match s.trim().to_uppercase().as_str() {
            "ERROR" => Ok(Level::Error),
            "CRITICAL" => Ok(Level::Critical),
            "WARN" | "WARNING" => Ok(Level::Warn),
            "INFO" => Ok(Level::Info),
            "DEBUG" => Ok(Level::Debug),
            "TRACE" => Ok(Level::Trace),
            _ => Err(format!("Invalid log level: {s}")),
        }
    }
}

/// One emitted log message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Severity.
    pub level: Level,
    /// Module path of the call site.
    pub target: String,
    /// Formatted message.
    pub message: String,
}

/// The global logger.
///
/// Level and colour are atomics, so the logger can be reconfigured from any
/// thread while other threads log.
pub struct Logger {
    level: AtomicU8,
    color: AtomicBool,
}

impl Logger {
    const fn new(level: Level) -> Self {
        Logger {
            level: AtomicU8::new(level as u8),
            color: AtomicBool::new(true),
        }
    }

    /// Sets the minimum level that is printed.
    pub fn set_level(&self, level: Level) {
        self.level.store(level as u8, Ordering::SeqCst);
    }

    /// Returns the minimum level that is printed.
    pub fn level(&self) -> Level {
        Level::from_u8(self.level.load(Ordering::Relaxed))
    }

    /// Enables or disables ANSI colour.
    pub fn set_color(&self, enabled: bool) {
        self.color.store(enabled, Ordering::Relaxed);
    }

    /// Returns true if a message at `level` would be printed.
    pub fn enabled(&self, level: Level) -> bool {
        level as u8 <= self.level.load(Ordering::Relaxed)
    }
}

static LOGGER: OnceLock<Logger> = OnceLock::new();

thread_local! {
    static CAPTURE: RefCell<Option<Vec<Record>>> = const { RefCell::new(None) };
}

/// Returns the global logger, creating it at `Level::Warn` on first use.
pub fn get_logger() -> &'static Logger {
    LOGGER.get_or_init(|| Logger::new(Level::Warn))
}

/// Sets the minimum level of the global logger.
pub fn set_level(level: Level) {
    get_logger().set_level(level);
}

/// Sets the minimum level of the global logger from a level name.
pub fn set_level_from_str(s: &str) -> Result<(), String> {
    set_level(Level::from_str(s)?);
    Ok(())
}

/// Enables or disables ANSI colour on the global logger.
pub fn set_color(enabled: bool) {
    get_logger().set_color(enabled);
}

/// Applies `GOBIND_LOG` to the global logger, if it is set.
///
/// Returns the level that was applied.
pub fn init_from_env() -> Result<Option<Level>, String> {
    match std::env::var(LOG_ENV) {
        Ok(value) => {
            let level = Level::from_str(&value)?;
            set_level(level);
            Ok(Some(level))
        }
        Err(_) => Ok(None),
    }
}

/// Runs `f` and returns every record logged on this thread while it ran.
///
/// Capturing ignores the level filter. Nested captures each see only their
/// own records.
pub fn capture<R>(f: impl FnOnce() -> R) -> (R, Vec<Record>) {
    struct Restore(Option<Vec<Record>>);

    impl Drop for Restore {
        fn drop(&mut self) {
            let previous = self.0.take();
            CAPTURE.with(|c| *c.borrow_mut() = previous);
        }
    }

    let restore = Restore(CAPTURE.with(|c| c.borrow_mut().replace(Vec::new())));
    let result = f();
    let records = CAPTURE
        .with(|c| c.borrow_mut().take())
        .unwrap_or_default();
    drop(restore);
    (result, records)
}

/// Returns true if a message at `level` would be printed or captured.
#[doc(hidden)]
pub fn __enabled(level: Level) -> bool {
    get_logger().enabled(level) || CAPTURE.with(|c| c.borrow().is_some())
}

#[doc(hidden)]
pub fn __log_with_target(level: Level, target: &str, args: Arguments) {
    static RESET: &str = "\x1b[0m";

    let captured = CAPTURE.with(|c| match c.borrow_mut().as_mut() {
        Some(records) => {
            records.push(Record {
                level,
                target: target.to_owned(),
                message: args.to_string(),
            });
            true
        }
        None => false,
    });
    if captured {
        return;
    }

    let logger = get_logger();
    if !logger.enabled(level) {
        return;
    }

    let level_str = level.as_str();
    if logger.color.load(Ordering::Relaxed) {
        let color = level.color_code();
        eprintln!("{color}[{level_str}]{RESET} {target}: {args}");
    } else {
        eprintln!("[{level_str}] {target}: {args}");
    }
}

/// Logs a message at the given level.
///
/// ```
/// use gobind_log::{log, Level};
///
/// log!(level: Level::Info, "handler {} connected", 7);
/// ```
#[macro_export]
macro_rules! log {
    (level: $level:expr, $($arg:tt)*) => {
        {
            if $crate::__enabled($level) {
                $crate::__log_with_target(
                    $level,
                    module_path!(),
                    format_args!($($arg)*)
                );
            }
        }
    };
}

/// Logs a message at the Error level.
#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {
        $crate::log!(level: $crate::Level::Error, $($arg)*)
    };
}

/// Logs a message at the Critical level.
///
/// ```
/// use gobind_log::critical;
///
/// # let domain = "g-io-error-quark";
/// critical!("unhandled error in signal handler: domain {}", domain);
/// ```
#[macro_export]
macro_rules! critical {
    ($($arg:tt)*) => {
        $crate::log!(level: $crate::Level::Critical, $($arg)*)
    };
}

/// Logs a message at the Warn level.
#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => {
        $crate::log!(level: $crate::Level::Warn, $($arg)*)
    };
}

/// Logs a message at the Info level.
#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {
        $crate::log!(level: $crate::Level::Info, $($arg)*)
    };
}

/// Logs a message at the Debug level.
#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => {
        $crate::log!(level: $crate::Level::Debug, $($arg)*)
    };
}

/// Logs a message at the Trace level.
#[macro_export]
macro_rules! trace {
    ($($arg:tt)*) => {
        $crate::log!(level: $crate::Level::Trace, $($arg)*)
    };
}
