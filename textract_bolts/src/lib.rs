/*!
Welcome to `textract_bolts`, the small set of building blocks shared by the textract crates:
the [`Error`] type, simple loggers for the [`log`] facade, `/proc/self/maps` walking and a
bounded worker pool.
*/
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(
    clippy::unreadable_literal,
    clippy::missing_errors_doc,
    clippy::cast_possible_truncation,
    clippy::missing_panics_doc,
    clippy::missing_docs_in_private_items,
    clippy::module_name_repetitions
)]
#![cfg_attr(not(test), warn(
    missing_debug_implementations,
    missing_docs,
    //trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications,
    //unused_results
))]

pub mod os;
pub mod tasks;

use std::{
    fmt::{self, Display},
    io,
    num::ParseIntError,
    sync::Once,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use log::{LevelFilter, Metadata, Record};

/// Main error struct for textract
#[derive(Debug)]
pub enum Error {
    /// File related error
    File(io::Error),
    /// The embedded store failed
    Store(String),
    /// Key not in map
    KeyNotFound(String),
    /// You're holding it wrong
    IllegalState(String),
    /// The argument passed to this method or function is not valid
    IllegalArgument(String),
    /// The performed action is not supported on the current platform
    Unsupported(String),
    /// Shutting down, not really an error.
    ShuttingDown,
    /// Something else happened
    Unknown(String),
}

impl Error {
    /// File related error
    #[must_use]
    pub fn file(arg: io::Error) -> Self {
        Error::File(arg)
    }
    /// The embedded store failed
    #[must_use]
    pub fn store<S>(arg: S) -> Self
    where
        S: Into<String>,
    {
        Error::Store(arg.into())
    }
    /// Key not in map
    #[must_use]
    pub fn key_not_found<S>(arg: S) -> Self
    where
        S: Into<String>,
    {
        Error::KeyNotFound(arg.into())
    }
    /// You're holding it wrong
    #[must_use]
    pub fn illegal_state<S>(arg: S) -> Self
    where
        S: Into<String>,
    {
        Error::IllegalState(arg.into())
    }
    /// The argument passed to this method or function is not valid
    #[must_use]
    pub fn illegal_argument<S>(arg: S) -> Self
    where
        S: Into<String>,
    {
        Error::IllegalArgument(arg.into())
    }
    /// The performed action is not supported on the current platform
    #[must_use]
    pub fn unsupported<S>(arg: S) -> Self
    where
        S: Into<String>,
    {
        Error::Unsupported(arg.into())
    }
    /// Shutting down, not really an error.
    #[must_use]
    pub fn shutting_down() -> Self {
        Error::ShuttingDown
    }
    /// Something else happened
    #[must_use]
    pub fn unknown<S>(arg: S) -> Self
    where
        S: Into<String>,
    {
        Error::Unknown(arg.into())
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::File(err) => write!(f, "File IO failed: {:?}", &err),
            Self::Store(s) => write!(f, "Store error: {0}", &s),
            Self::KeyNotFound(s) => write!(f, "Key `{0}` not found", &s),
            Self::IllegalState(s) => write!(f, "Illegal state: {0}", &s),
            Self::IllegalArgument(s) => write!(f, "Illegal argument: {0}", &s),
            Self::Unsupported(s) => write!(
                f,
                "The operation is not supported on the current platform: {0}",
                &s
            ),
            Self::ShuttingDown => write!(f, "Shutting down!"),
            Self::Unknown(s) => write!(f, "Unknown error: {0}", &s),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::File(err) => Some(err),
            _ => None,
        }
    }
}

/// Create a textract Error from io Error
impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::file(err)
    }
}

impl From<ParseIntError> for Error {
    fn from(err: ParseIntError) -> Self {
        Self::illegal_argument(format!("Failed to parse Int: {err:?}"))
    }
}

impl From<regex::Error> for Error {
    fn from(err: regex::Error) -> Self {
        Self::illegal_argument(format!("Invalid regular expression: {err}"))
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::illegal_argument(format!("Invalid options file: {err}"))
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Self::store(format!("{err}"))
    }
}

/// Current time
#[must_use]
#[inline]
pub fn current_time() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
}

/// The tag every log line of this project carries
pub const LOG_TAG: &str = "TextExtractTool";

/// Stderr logger
pub static TEXTRACT_STDERR_LOGGER: SimpleStderrLogger = SimpleStderrLogger::new();

/// A simple logger struct that logs to stderr when used with [`log::set_logger`].
#[derive(Debug)]
pub struct SimpleStderrLogger {}

impl Default for SimpleStderrLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl SimpleStderrLogger {
    /// Create a new [`log::Log`] logger that will write log to stderr
    #[must_use]
    pub const fn new() -> Self {
        Self {}
    }

    /// register stderr logger
    pub fn set_logger() -> Result<(), Error> {
        log::set_logger(&TEXTRACT_STDERR_LOGGER)
            .map_err(|_| Error::unknown("Failed to register logger"))
    }
}

impl log::Log for SimpleStderrLogger {
    #[inline]
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        eprintln!(
            "[{:?}] {} {}: {}",
            current_time(),
            LOG_TAG,
            record.level(),
            record.args()
        );
    }

    fn flush(&self) {}
}

/// Logcat logger
#[cfg(target_os = "android")]
pub static TEXTRACT_LOGCAT_LOGGER: LogcatLogger = LogcatLogger::new();

#[cfg(target_os = "android")]
#[link(name = "log")]
extern "C" {
    fn __android_log_write(
        prio: libc::c_int,
        tag: *const libc::c_char,
        text: *const libc::c_char,
    ) -> libc::c_int;
}

/// A logger that writes to the android log buffer, tagged with [`LOG_TAG`].
#[cfg(target_os = "android")]
#[derive(Debug)]
pub struct LogcatLogger {}

#[cfg(target_os = "android")]
impl LogcatLogger {
    /// Create a new [`log::Log`] logger that will write to logcat
    #[must_use]
    pub const fn new() -> Self {
        Self {}
    }

    /// register logcat logger
    pub fn set_logger() -> Result<(), Error> {
        log::set_logger(&TEXTRACT_LOGCAT_LOGGER)
            .map_err(|_| Error::unknown("Failed to register logger"))
    }
}

#[cfg(target_os = "android")]
impl log::Log for LogcatLogger {
    #[inline]
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        // android/log.h priorities
        let prio = match record.level() {
            log::Level::Error => 6,
            log::Level::Warn => 5,
            log::Level::Info => 4,
            log::Level::Debug => 3,
            log::Level::Trace => 2,
        };
        let text = format!("{}", record.args()).replace('\0', "\\0");
        let (Ok(tag), Ok(text)) = (
            std::ffi::CString::new(LOG_TAG),
            std::ffi::CString::new(text),
        ) else {
            return;
        };
        unsafe {
            __android_log_write(prio, tag.as_ptr(), text.as_ptr());
        }
    }

    fn flush(&self) {}
}

/// Parse a `RUST_LOG` style level. Unknown values fall back to [`LevelFilter::Info`].
#[must_use]
pub fn level_from_str(value: &str) -> LevelFilter {
    match value.trim().to_ascii_lowercase().as_str() {
        "off" => LevelFilter::Off,
        "error" => LevelFilter::Error,
        "warn" => LevelFilter::Warn,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        _ => LevelFilter::Info,
    }
}

static LOGGING: Once = Once::new();

/// Register the platform logger (logcat on android, stderr elsewhere) exactly once and read
/// the max level from `RUST_LOG`.
///
/// If another logger was installed by the host already, that one is kept.
pub fn init_logging() {
    LOGGING.call_once(|| {
        let level = std::env::var("RUST_LOG").map_or(LevelFilter::Info, |v| level_from_str(&v));

        #[cfg(target_os = "android")]
        let registered = LogcatLogger::set_logger();
        #[cfg(not(target_os = "android"))]
        let registered = SimpleStderrLogger::set_logger();

        if registered.is_ok() {
            log::set_max_level(level);
        }
    });
}
