//! Task logging.
//!
//! Two layers live here. Engine diagnostics go through `tracing` like any
//! other library. Per-task records (success, retry, error, ...) are
//! [`LogRecord`]s put on a single shared queue by every executor through a
//! [`TaskLogger`], and written to the task log file by the [`LogSink`]
//! consumer. Executors running in worker processes forward their records to
//! the parent over the frame pipe, so the file only ever has one writer.

mod logger;
mod sink;

pub use logger::TaskLogger;
pub use sink::{log_file_path, LogSink};

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing_subscriber::EnvFilter;

/// Severity of a task log record.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Very verbose output.
    Trace,
    /// Debug output.
    Debug,
    /// Normal progress.
    #[default]
    Info,
    /// A task completed.
    Success,
    /// A task will be retried.
    Warning,
    /// A task failed for good, or a stage stopped.
    Error,
}

impl LogLevel {
    /// Returns the upper-case name used in the log file.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Trace => "TRACE",
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Success => "SUCCESS",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One line of the task log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    /// When the record was produced.
    pub timestamp: DateTime<Local>,
    /// Severity.
    pub level: LogLevel,
    /// Rendered message.
    pub message: String,
}

impl LogRecord {
    /// Creates a record stamped now.
    #[must_use]
    pub fn now(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Local::now(),
            level,
            message: message.into(),
        }
    }

    /// Formats the record as a log file line, without the newline.
    #[must_use]
    pub fn to_line(&self) -> String {
        format!(
            "{} {} {}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S"),
            self.level,
            self.message
        )
    }

    /// Re-emits the record through `tracing`.
    pub fn mirror(&self) {
        match self.level {
            LogLevel::Trace => tracing::trace!(target: "taskgraph::task", "{}", self.message),
            LogLevel::Debug => tracing::debug!(target: "taskgraph::task", "{}", self.message),
            LogLevel::Info | LogLevel::Success => {
                tracing::info!(target: "taskgraph::task", level = %self.level, "{}", self.message);
            }
            LogLevel::Warning => tracing::warn!(target: "taskgraph::task", "{}", self.message),
            LogLevel::Error => tracing::error!(target: "taskgraph::task", "{}", self.message),
        }
    }
}

/// Installs a stderr `tracing` subscriber filtered by `RUST_LOG`, falling
/// back to `default_filter`.
///
/// Stdout is left alone: worker processes use it for frames.
pub fn init_tracing(default_filter: &str) {
    let filter = match std::env::var("RUST_LOG") {
        Ok(v) if !v.trim().is_empty() => EnvFilter::from_default_env(),
        _ => EnvFilter::try_new(default_filter).unwrap_or_else(|_| EnvFilter::new("info")),
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_level_order() {
        assert!(LogLevel::Debug < LogLevel::Info);
        assert!(LogLevel::Success > LogLevel::Info);
        assert!(LogLevel::Error > LogLevel::Warning);
    }

    #[test]
    fn test_level_serde() {
        let level: LogLevel = serde_json::from_str("\"warning\"").unwrap();
        assert_eq!(level, LogLevel::Warning);
        assert_eq!(serde_json::to_string(&LogLevel::Success).unwrap(), "\"success\"");
    }

    #[test]
    fn test_record_line() {
        let record = LogRecord {
            timestamp: Local.with_ymd_and_hms(2024, 3, 9, 8, 5, 1).unwrap(),
            level: LogLevel::Success,
            message: "done".to_string(),
        };
        assert_eq!(record.to_line(), "2024-03-09 08:05:01 SUCCESS done");
    }
}
