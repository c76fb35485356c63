use chrono::Local;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// Log severity, quietest first. `Event` sits just above `Error` so pool
/// lifecycle transitions (fallback, dissolve, shutdown) stay visible even
/// at otherwise quiet levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    None,
    Event,
    Error,
    Warn,
    Info,
    Debug,
}

const LEVELS: [LogLevel; 6] = [
    LogLevel::None,
    LogLevel::Event,
    LogLevel::Error,
    LogLevel::Warn,
    LogLevel::Info,
    LogLevel::Debug,
];

impl LogLevel {
    /// Parse a level name, defaulting to `Info` on anything unrecognized.
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "none" => LogLevel::None,
            "event" => LogLevel::Event,
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "debug" => LogLevel::Debug,
            _ => LogLevel::Info,
        }
    }

    fn from_u8(v: u8) -> Self {
        *LEVELS.get(v as usize).unwrap_or(&LogLevel::Info)
    }

    fn label(self) -> &'static str {
        match self {
            LogLevel::None => "",
            LogLevel::Event => "EVENT",
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
        }
    }

    fn color(self) -> &'static str {
        match self {
            LogLevel::None => "",
            LogLevel::Event => "\x1b[35m",
            LogLevel::Error => "\x1b[31m",
            LogLevel::Warn => "\x1b[33m",
            LogLevel::Info => "\x1b[32m",
            LogLevel::Debug => "\x1b[36m",
        }
    }
}

struct LoggerInner {
    level: AtomicU8,
    colored: bool,
}

/// Shared, runtime-adjustable logger. Clones write to the same sink at the
/// same level; the `log_*!` macros are the crate's logging call surface.
#[derive(Clone)]
pub struct Logger {
    inner: Arc<LoggerInner>,
}

impl Logger {
    pub fn new(level: LogLevel, colored: bool) -> Self {
        Self {
            inner: Arc::new(LoggerInner {
                level: AtomicU8::new(level as u8),
                colored,
            }),
        }
    }

    /// A logger that drops everything.
    pub fn disabled() -> Self {
        Self::new(LogLevel::None, false)
    }

    pub fn set_level(&self, level: LogLevel) {
        self.inner.level.store(level as u8, Ordering::Relaxed);
    }

    pub fn level(&self) -> LogLevel {
        LogLevel::from_u8(self.inner.level.load(Ordering::Relaxed))
    }

    fn enabled(&self, level: LogLevel) -> bool {
        level != LogLevel::None && level <= self.level()
    }

    /// Single sink entry point; prefer the macros over calling this
    /// directly.
    pub fn log(&self, level: LogLevel, msg: fmt::Arguments<'_>) {
        if !self.enabled(level) {
            return;
        }
        let stamp = Local::now().format("%Y-%m-%dT%H:%M:%S%.3f");
        if self.inner.colored {
            eprintln!("{stamp}  {}{}\x1b[0m  {msg}", level.color(), level.label());
        } else {
            eprintln!("{stamp}  {}  {msg}", level.label());
        }
    }
}

/// Formatted logging at a fixed level
#[macro_export]
macro_rules! log_debug {
    ($logger:expr, $($arg:tt)*) => {
        $logger.log($crate::LogLevel::Debug, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_info {
    ($logger:expr, $($arg:tt)*) => {
        $logger.log($crate::LogLevel::Info, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_warn {
    ($logger:expr, $($arg:tt)*) => {
        $logger.log($crate::LogLevel::Warn, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_error {
    ($logger:expr, $($arg:tt)*) => {
        $logger.log($crate::LogLevel::Error, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_event {
    ($logger:expr, $($arg:tt)*) => {
        $logger.log($crate::LogLevel::Event, format_args!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_parse_and_order() {
        assert_eq!(LogLevel::parse("debug"), LogLevel::Debug);
        assert_eq!(LogLevel::parse("EVENT"), LogLevel::Event);
        assert_eq!(LogLevel::parse("bogus"), LogLevel::Info);
        assert!(LogLevel::Event < LogLevel::Debug);
        assert!(LogLevel::None < LogLevel::Event);
    }

    #[test]
    fn runtime_level_change() {
        let logger = Logger::new(LogLevel::Info, false);
        assert!(!logger.enabled(LogLevel::Debug));
        logger.set_level(LogLevel::Debug);
        assert!(logger.enabled(LogLevel::Debug));
        assert_eq!(logger.level(), LogLevel::Debug);
    }

    #[test]
    fn disabled_logger_drops_everything() {
        let logger = Logger::disabled();
        assert!(!logger.enabled(LogLevel::Event));
        assert!(!logger.enabled(LogLevel::Error));
        // None itself is never a writable level.
        assert!(!logger.enabled(LogLevel::None));
    }
}
