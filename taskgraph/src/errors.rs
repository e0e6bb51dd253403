//! Error types for the taskgraph engine.
//!
//! User-function failures are not represented here: they are contained inside
//! the owning stage as [`TaskError`](crate::task::TaskError) values and only
//! surface through the result tables. The types in this module describe the
//! failures that stop a whole graph run: topology problems detected before
//! anything starts, and infrastructure failures (queues, worker processes,
//! the log sink) detected while it runs.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// The main error type for graph operations.
#[derive(Debug, Error)]
pub enum TaskGraphError {
    /// The graph topology is invalid.
    #[error("{0}")]
    Topology(#[from] TopologyError),

    /// A cycle was detected in the graph.
    #[error("{0}")]
    CycleDetected(#[from] CycleDetectedError),

    /// A queue backing an edge, the fail queue or the log sink failed.
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// A worker process could not be launched or spoke an unexpected protocol.
    #[error("{0}")]
    Worker(#[from] WorkerError),

    /// A generic infrastructure error.
    #[error("Infrastructure error: {0}")]
    Infrastructure(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration could not be parsed.
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TaskGraphError {
    /// Returns true for errors detected before the run started.
    #[must_use]
    pub fn is_topology(&self) -> bool {
        matches!(self, Self::Topology(_) | Self::CycleDetected(_))
    }
}

/// Diagnostic metadata attached to topology errors.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ErrorInfo {
    /// Error code (e.g., "TOPOLOGY-001-CYCLE").
    pub code: String,
    /// Short summary of the error.
    pub summary: String,
    /// Hint for fixing the error.
    pub fix_hint: Option<String>,
    /// Additional context key-value pairs.
    #[serde(default)]
    pub context: HashMap<String, String>,
}

impl ErrorInfo {
    /// Creates a new error info.
    #[must_use]
    pub fn new(code: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            summary: summary.into(),
            fix_hint: None,
            context: HashMap::new(),
        }
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }

    /// Adds a single context entry.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Error raised when the graph topology is rejected at start.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct TopologyError {
    /// The error message.
    pub message: String,
    /// The stages involved in the error.
    pub stages: Vec<String>,
    /// Optional diagnostic info.
    pub error_info: Option<ErrorInfo>,
}

impl TopologyError {
    /// Creates a new topology error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stages: Vec::new(),
            error_info: None,
        }
    }

    /// Sets the stages involved.
    #[must_use]
    pub fn with_stages(mut self, stages: Vec<String>) -> Self {
        self.stages = stages;
        self
    }

    /// Sets the diagnostic info.
    #[must_use]
    pub fn with_error_info(mut self, info: ErrorInfo) -> Self {
        self.error_info = Some(info);
        self
    }

    /// A seed or lookup referenced a stage tag that is not part of the graph.
    #[must_use]
    pub fn unknown_stage(tag: &str) -> Self {
        Self::new(format!("Unknown stage '{tag}'"))
            .with_stages(vec![tag.to_string()])
            .with_error_info(
                ErrorInfo::new("TOPOLOGY-002-UNKNOWN", format!("Stage '{tag}' is not reachable from the root"))
                    .with_fix_hint("Seed stages by the tag returned from Stage::tag()."),
            )
    }

    /// Two distinct stages share the same tag.
    #[must_use]
    pub fn duplicate_tag(tag: &str) -> Self {
        Self::new(format!("Duplicate stage tag '{tag}'"))
            .with_stages(vec![tag.to_string()])
            .with_error_info(
                ErrorInfo::new("TOPOLOGY-003-DUPLICATE", format!("More than one stage is tagged '{tag}'"))
                    .with_fix_hint("Give every stage a unique name."),
            )
    }
}

/// Error raised when a cycle is detected in the stage graph.
#[derive(Debug, Clone, Error)]
#[error("Cycle detected in graph: {}", cycle_path.join(" -> "))]
pub struct CycleDetectedError {
    /// The path of stage tags forming the cycle.
    pub cycle_path: Vec<String>,
    /// Diagnostic info.
    pub error_info: ErrorInfo,
}

impl CycleDetectedError {
    /// Creates a new cycle detected error.
    #[must_use]
    pub fn new(cycle_path: Vec<String>) -> Self {
        let info = ErrorInfo::new(
            "TOPOLOGY-001-CYCLE",
            format!("Graph contains a cycle: {}", cycle_path.join(" -> ")),
        )
        .with_fix_hint("Remove one of the edges in the cycle to break it.");

        Self {
            cycle_path,
            error_info: info,
        }
    }
}

/// Errors raised by queue backends.
#[derive(Debug, Clone, Error)]
pub enum QueueError {
    /// The queue was closed while an operation was pending.
    #[error("queue closed")]
    Closed,

    /// A non-blocking put found the queue at capacity.
    #[error("queue full (capacity {capacity})")]
    Full {
        /// The configured capacity.
        capacity: usize,
    },

    /// The pipe behind a cross-process queue failed.
    #[error("pipe io failed: {0}")]
    Io(String),

    /// A frame could not be encoded for a pipe.
    #[error("frame encode failed: {0}")]
    Encode(String),

    /// A frame read from a pipe could not be decoded.
    #[error("frame decode failed: {0}")]
    Decode(String),
}

impl From<std::io::Error> for QueueError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Errors raised while launching or talking to worker processes.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The worker executable could not be spawned.
    #[error("failed to launch worker '{program}': {source}")]
    Spawn {
        /// The program that was launched.
        program: String,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// A worker was asked to run a function its registry does not know.
    #[error("function '{0}' is not registered in the worker")]
    UnknownFunction(String),

    /// The worker process sent or expected an unexpected frame.
    #[error("worker protocol error: {0}")]
    Protocol(String),

    /// The worker role environment variable holds an unknown value.
    #[error("unknown worker role '{0}'")]
    UnknownRole(String),
}
