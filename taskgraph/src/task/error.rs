//! The error type returned by user stage functions.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Well-known error kinds.
pub mod kinds {
    /// Connecting timed out.
    pub const CONNECT_TIMEOUT: &str = "ConnectTimeout";
    /// The peer violated the protocol.
    pub const PROTOCOL_ERROR: &str = "ProtocolError";
    /// Reading the response failed.
    pub const READ_ERROR: &str = "ReadError";
    /// The connection could not be established.
    pub const CONNECT_ERROR: &str = "ConnectError";
    /// No pooled connection became available in time.
    pub const POOL_TIMEOUT: &str = "PoolTimeout";
    /// Reading the response timed out.
    pub const READ_TIMEOUT: &str = "ReadTimeout";

    /// A task expected in a stage table was found in neither table.
    pub const TASK_DISAPPEARED: &str = "TaskDisappeared";
    /// A task or result could not cross a process boundary.
    pub const SERIALIZATION_ERROR: &str = "SerializationError";
    /// The worker process running the task exited.
    pub const WORKER_CRASHED: &str = "WorkerCrashed";
    /// The user function panicked.
    pub const PANIC: &str = "Panic";
    /// The function body is only available inside a worker process.
    pub const UNRESOLVED_FUNCTION: &str = "UnresolvedFunction";
    /// Generic IO failure without a network-style mapping.
    pub const IO_ERROR: &str = "IoError";

    /// The kinds retried by default: transient network failures.
    pub const DEFAULT_RETRYABLE: [&str; 6] = [
        CONNECT_TIMEOUT,
        PROTOCOL_ERROR,
        READ_ERROR,
        CONNECT_ERROR,
        POOL_TIMEOUT,
        READ_TIMEOUT,
    ];
}

/// A failure raised by a user function, classified by kind.
///
/// The display form `"<Kind>: <message>"` is the `error_info` string carried
/// by fail records.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Error)]
#[error("{kind}: {message}")]
pub struct TaskError {
    /// The error kind, matched against retry classifiers.
    pub kind: String,
    /// Human readable message.
    pub message: String,
}

impl TaskError {
    /// Creates a new task error.
    #[must_use]
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Synthetic error for a task that vanished from the stage tables.
    #[must_use]
    pub fn disappeared(task_info: &str) -> Self {
        Self::new(kinds::TASK_DISAPPEARED, format!("{task_info} not found."))
    }

    /// A task or result could not be encoded or decoded.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::new(kinds::SERIALIZATION_ERROR, message)
    }

    /// The worker process running the task went away.
    #[must_use]
    pub fn worker_crashed(message: impl Into<String>) -> Self {
        Self::new(kinds::WORKER_CRASHED, message)
    }

    /// The user function panicked.
    #[must_use]
    pub fn panic(message: impl Into<String>) -> Self {
        Self::new(kinds::PANIC, message)
    }

    /// Returns true if this error has the given kind.
    #[must_use]
    pub fn is_kind(&self, kind: &str) -> bool {
        self.kind == kind
    }

    /// Returns the `"<Kind>: <message>"` form.
    #[must_use]
    pub fn info(&self) -> String {
        self.to_string()
    }
}

impl From<std::io::Error> for TaskError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;

        let kind = match err.kind() {
            ErrorKind::TimedOut => kinds::READ_TIMEOUT,
            ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected => kinds::CONNECT_ERROR,
            ErrorKind::UnexpectedEof | ErrorKind::BrokenPipe => kinds::READ_ERROR,
            _ => kinds::IO_ERROR,
        };
        Self::new(kind, err.to_string())
    }
}

impl From<serde_json::Error> for TaskError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err.to_string())
    }
}
