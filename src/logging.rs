// SPDX-License-Identifier: MPL-2.0
//! Injected logging sink.
//!
//! The engine never installs a global logger. A [`Logger`] handle is built
//! once per session from whatever [`LogSink`] the caller registered and is
//! cloned into every stage and background loop. With no sink installed all
//! logging calls are no-ops.

use std::fmt;
use std::sync::Arc;

/// Severity of a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

/// Receiver for engine log lines. Implementations must be cheap; they are
/// called from real-time-ish threads (never from the audio callback).
pub trait LogSink: Send + Sync {
    fn log(&self, level: LogLevel, message: &str);
}

/// Cheap cloneable handle over an optional sink.
#[derive(Clone, Default)]
pub struct Logger {
    sink: Option<Arc<dyn LogSink>>,
}

impl Logger {
    /// A logger that discards everything.
    #[must_use]
    pub fn none() -> Self {
        Self { sink: None }
    }

    #[must_use]
    pub fn new(sink: Arc<dyn LogSink>) -> Self {
        Self { sink: Some(sink) }
    }

    pub fn log(&self, level: LogLevel, message: &str) {
        if let Some(sink) = &self.sink {
            sink.log(level, message);
        }
    }

    pub fn debug(&self, message: &str) {
        self.log(LogLevel::Debug, message);
    }

    pub fn info(&self, message: &str) {
        self.log(LogLevel::Info, message);
    }

    pub fn warn(&self, message: &str) {
        self.log(LogLevel::Warn, message);
    }

    pub fn error(&self, message: &str) {
        self.log(LogLevel::Error, message);
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger")
            .field("sink", &self.sink.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Collector {
        lines: Mutex<Vec<(LogLevel, String)>>,
    }

    impl LogSink for Collector {
        fn log(&self, level: LogLevel, message: &str) {
            self.lines.lock().unwrap().push((level, message.to_string()));
        }
    }

    #[test]
    fn logger_forwards_to_sink() {
        let collector = Arc::new(Collector {
            lines: Mutex::new(Vec::new()),
        });
        let logger = Logger::new(Arc::clone(&collector) as Arc<dyn LogSink>);

        logger.info("opened stream");
        logger.warn("late frame");

        let lines = collector.lines.lock().unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], (LogLevel::Info, "opened stream".to_string()));
        assert_eq!(lines[1], (LogLevel::Warn, "late frame".to_string()));
    }

    #[test]
    fn none_logger_is_silent() {
        // Must not panic.
        let logger = Logger::none();
        logger.error("nobody listens");
    }

    #[test]
    fn levels_are_ordered() {
        assert!(LogLevel::Debug < LogLevel::Info);
        assert!(LogLevel::Info < LogLevel::Warn);
        assert!(LogLevel::Warn < LogLevel::Error);
    }
}
