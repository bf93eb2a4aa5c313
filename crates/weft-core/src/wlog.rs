//! Leveled diagnostics on stderr
//!
//! Every line is prefixed `weft[<level>]` and written under the stderr
//! lock so concurrent workers never interleave within a line. Level and
//! flush behavior come from the environment on first use:
//!
//! - `WEFT_LOG_LEVEL` — `off`, `error`, `warn`, `info` (default),
//!   `debug` or `trace` (numeric 0-5 also accepted)
//! - `WEFT_FLUSH_EPRINT` — flush after every line, for diagnosing crashes
//!
//! ```ignore
//! winfo!("scheduler {} started", name);
//! werror!("epoll_ctl failed (errno {})", errno);
//! ```

use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl LogLevel {
    /// Accepts the level name or its numeric value; `None` on anything else.
    pub fn parse(s: &str) -> Option<LogLevel> {
        let level = match s.trim().to_ascii_lowercase().as_str() {
            "off" | "0" => LogLevel::Off,
            "error" | "1" => LogLevel::Error,
            "warn" | "2" => LogLevel::Warn,
            "info" | "3" => LogLevel::Info,
            "debug" | "4" => LogLevel::Debug,
            "trace" | "5" => LogLevel::Trace,
            _ => return None,
        };
        Some(level)
    }

    fn tag(self) -> &'static str {
        match self {
            LogLevel::Off => "off",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

impl From<u8> for LogLevel {
    fn from(v: u8) -> Self {
        match v {
            0 => LogLevel::Off,
            1 => LogLevel::Error,
            2 => LogLevel::Warn,
            3 => LogLevel::Info,
            4 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }
}

static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);
static FLUSH_ENABLED: AtomicBool = AtomicBool::new(false);
static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Seed level and flush mode from the environment. Runs automatically on
/// the first log call; calling it earlier makes initialization
/// deterministic.
pub fn init() {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }
    FLUSH_ENABLED.store(
        crate::env::env_get_bool("WEFT_FLUSH_EPRINT", false),
        Ordering::Relaxed,
    );
    if let Some(level) = std::env::var("WEFT_LOG_LEVEL")
        .ok()
        .as_deref()
        .and_then(LogLevel::parse)
    {
        LOG_LEVEL.store(level as u8, Ordering::Relaxed);
    }
}

#[inline]
pub fn log_level() -> LogLevel {
    if !INITIALIZED.load(Ordering::Relaxed) {
        init();
    }
    LogLevel::from(LOG_LEVEL.load(Ordering::Relaxed))
}

pub fn set_log_level(level: LogLevel) {
    LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

#[inline]
pub fn flush_enabled() -> bool {
    if !INITIALIZED.load(Ordering::Relaxed) {
        init();
    }
    FLUSH_ENABLED.load(Ordering::Relaxed)
}

pub fn set_flush_enabled(enabled: bool) {
    FLUSH_ENABLED.store(enabled, Ordering::Relaxed);
}

#[inline]
pub fn level_enabled(level: LogLevel) -> bool {
    level <= log_level()
}

#[doc(hidden)]
pub fn _wprintln_impl(args: std::fmt::Arguments<'_>) {
    let mut out = std::io::stderr().lock();
    let _ = writeln!(out, "{}", args);
    if flush_enabled() {
        let _ = out.flush();
    }
}

#[doc(hidden)]
pub fn _wlog_impl(level: LogLevel, args: std::fmt::Arguments<'_>) {
    if !level_enabled(level) {
        return;
    }
    let mut out = std::io::stderr().lock();
    let _ = writeln!(out, "weft[{}] {}", level.tag(), args);
    if flush_enabled() {
        let _ = out.flush();
    }
}

/// Unconditional line to stderr, lock-held and optionally flushed.
#[macro_export]
macro_rules! wprintln {
    () => {{
        $crate::wlog::_wprintln_impl(format_args!(""));
    }};
    ($($arg:tt)*) => {{
        $crate::wlog::_wprintln_impl(format_args!($($arg)*));
    }};
}

/// Error level log (always shown unless logging is off)
#[macro_export]
macro_rules! werror {
    ($($arg:tt)*) => {{
        $crate::wlog::_wlog_impl(
            $crate::wlog::LogLevel::Error,
            format_args!($($arg)*)
        );
    }};
}

/// Warning level log
#[macro_export]
macro_rules! wwarn {
    ($($arg:tt)*) => {{
        $crate::wlog::_wlog_impl(
            $crate::wlog::LogLevel::Warn,
            format_args!($($arg)*)
        );
    }};
}

/// Info level log
#[macro_export]
macro_rules! winfo {
    ($($arg:tt)*) => {{
        $crate::wlog::_wlog_impl(
            $crate::wlog::LogLevel::Info,
            format_args!($($arg)*)
        );
    }};
}

/// Debug level log
#[macro_export]
macro_rules! wdebug {
    ($($arg:tt)*) => {{
        $crate::wlog::_wlog_impl(
            $crate::wlog::LogLevel::Debug,
            format_args!($($arg)*)
        );
    }};
}

/// Trace level log
#[macro_export]
macro_rules! wtrace {
    ($($arg:tt)*) => {{
        $crate::wlog::_wlog_impl(
            $crate::wlog::LogLevel::Trace,
            format_args!($($arg)*)
        );
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ordering() {
        set_log_level(LogLevel::Warn);
        assert!(level_enabled(LogLevel::Error));
        assert!(level_enabled(LogLevel::Warn));
        assert!(!level_enabled(LogLevel::Info));
        set_log_level(LogLevel::Info);
    }

    #[test]
    fn test_parse_accepts_names_and_digits() {
        assert_eq!(LogLevel::parse("trace"), Some(LogLevel::Trace));
        assert_eq!(LogLevel::parse(" WARN "), Some(LogLevel::Warn));
        assert_eq!(LogLevel::parse("0"), Some(LogLevel::Off));
        assert_eq!(LogLevel::parse("verbose"), None);
    }

    #[test]
    fn test_from_u8_saturates_to_trace() {
        assert_eq!(LogLevel::from(3), LogLevel::Info);
        assert_eq!(LogLevel::from(99), LogLevel::Trace);
    }
}
