//! Run-level configuration.
//!
//! A [`GraphConfig`] can be built in code with the `with_*` methods or loaded
//! from TOML:
//!
//! ```toml
//! log_dir = "logs"
//! log_level = "debug"
//! fallback_dir = "fallback"
//! queue_capacity = 256
//!
//! [reporter]
//! base_url = "http://127.0.0.1:5000"
//! interval_secs = 2.0
//! ```

use crate::errors::TaskGraphError;
use crate::logging::LogLevel;
use crate::worker::WorkerLauncher;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration shared by every stage of one graph run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphConfig {
    /// Directory receiving the task log file.
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// Minimum level written by the log sink.
    #[serde(default)]
    pub log_level: LogLevel,
    /// Mirror every log record to `tracing`.
    #[serde(default)]
    pub log_to_console: bool,
    /// Directory for realtime error dumps and failure reports. `None`
    /// disables every fallback file.
    #[serde(default)]
    pub fallback_dir: Option<PathBuf>,
    /// Capacity of each stage input queue. `None` means unbounded.
    #[serde(default)]
    pub queue_capacity: Option<usize>,
    /// How long a worker process may linger after it should have exited.
    #[serde(default = "default_grace_period_ms")]
    pub join_grace_period_ms: u64,
    /// Live progress reporting endpoint.
    #[serde(default)]
    pub reporter: Option<ReporterConfig>,
    /// Executable launched for dedicated-process stages and process pools.
    #[serde(default)]
    pub worker: WorkerLauncher,
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_grace_period_ms() -> u64 {
    5000
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            log_dir: default_log_dir(),
            log_level: LogLevel::default(),
            log_to_console: false,
            fallback_dir: None,
            queue_capacity: None,
            join_grace_period_ms: default_grace_period_ms(),
            reporter: None,
            worker: WorkerLauncher::default(),
        }
    }
}

impl GraphConfig {
    /// Creates a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a configuration from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, TaskGraphError> {
        toml::from_str(text).map_err(|e| TaskGraphError::Config(e.to_string()))
    }

    /// Loads a configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, TaskGraphError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    /// Sets the log directory.
    #[must_use]
    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = dir.into();
        self
    }

    /// Sets the minimum log level.
    #[must_use]
    pub fn with_log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }

    /// Mirrors log records to `tracing`.
    #[must_use]
    pub fn with_log_to_console(mut self, enabled: bool) -> Self {
        self.log_to_console = enabled;
        self
    }

    /// Enables fallback files under `dir`.
    #[must_use]
    pub fn with_fallback_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.fallback_dir = Some(dir.into());
        self
    }

    /// Bounds every stage input queue.
    #[must_use]
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = Some(capacity.max(1));
        self
    }

    /// Sets the worker join grace period.
    #[must_use]
    pub fn with_join_grace_period(mut self, grace: Duration) -> Self {
        self.join_grace_period_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Enables the live reporter.
    #[must_use]
    pub fn with_reporter(mut self, reporter: ReporterConfig) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Sets the worker executable.
    #[must_use]
    pub fn with_worker(mut self, worker: WorkerLauncher) -> Self {
        self.worker = worker;
        self
    }

    /// Returns the join grace period.
    #[must_use]
    pub fn join_grace_period(&self) -> Duration {
        Duration::from_millis(self.join_grace_period_ms)
    }
}

/// Where and how often to publish progress snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReporterConfig {
    /// Base URL of the reporting server, e.g. `http://127.0.0.1:5000`.
    pub base_url: String,
    /// Seconds between pushes when the server does not dictate one.
    #[serde(default = "default_interval")]
    pub interval_secs: f64,
    /// Per-request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: f64,
}

fn default_interval() -> f64 {
    5.0
}

fn default_timeout() -> f64 {
    2.0
}

impl ReporterConfig {
    /// Creates a reporter configuration for `base_url`.
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            interval_secs: default_interval(),
            timeout_secs: default_timeout(),
        }
    }

    /// Sets the push interval.
    #[must_use]
    pub fn with_interval(mut self, seconds: f64) -> Self {
        self.interval_secs = seconds;
        self
    }

    /// Gets the interval as a Duration.
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_secs_f64(self.interval_secs.max(0.0))
    }

    /// Gets the timeout as a Duration.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_secs.max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GraphConfig::default();
        assert_eq!(config.log_dir, PathBuf::from("logs"));
        assert_eq!(config.log_level, LogLevel::Info);
        assert!(config.fallback_dir.is_none());
        assert!(config.queue_capacity.is_none());
        assert_eq!(config.join_grace_period(), Duration::from_secs(5));
    }

    #[test]
    fn test_from_toml() {
        let config = GraphConfig::from_toml_str(
            r#"
            log_dir = "/tmp/tg-logs"
            log_level = "debug"
            queue_capacity = 8

            [reporter]
            base_url = "http://localhost:5000"
            "#,
        )
        .unwrap();

        assert_eq!(config.log_dir, PathBuf::from("/tmp/tg-logs"));
        assert_eq!(config.log_level, LogLevel::Debug);
        assert_eq!(config.queue_capacity, Some(8));
        let reporter = config.reporter.unwrap();
        assert_eq!(reporter.base_url, "http://localhost:5000");
        assert!((reporter.interval_secs - 5.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_bad_toml_is_config_error() {
        let err = GraphConfig::from_toml_str("queue_capacity = \"many\"").unwrap_err();
        assert!(matches!(err, TaskGraphError::Config(_)));
    }

    #[test]
    fn test_builder() {
        let config = GraphConfig::new()
            .with_queue_capacity(0)
            .with_join_grace_period(Duration::from_millis(250))
            .with_fallback_dir("fb");
        assert_eq!(config.queue_capacity, Some(1));
        assert_eq!(config.join_grace_period_ms, 250);
        assert_eq!(config.fallback_dir, Some(PathBuf::from("fb")));
    }
}
