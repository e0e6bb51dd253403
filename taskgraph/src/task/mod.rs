//! Task items and the values that travel with them.
//!
//! Tasks are opaque `serde_json::Value`s. Because JSON values cannot be used
//! as hash keys directly, every table in the engine is keyed by a
//! [`TaskKey`], the canonical compact serialisation of the value.

mod error;
mod record;

pub use error::{kinds, TaskError};
pub use record::FailRecord;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Default width used when rendering tasks and results into log lines.
pub const DEFAULT_MAX_INFO: usize = 50;

/// Canonical, hashable identity of a task value.
///
/// Object keys are emitted in sorted order (`serde_json` maps are ordered),
/// so structurally equal values always produce the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskKey(String);

impl TaskKey {
    /// Computes the key of a task value.
    #[must_use]
    pub fn of(value: &Value) -> Self {
        Self(value.to_string())
    }

    /// Wraps an already canonical string, e.g. one read from a fail record.
    #[must_use]
    pub fn from_canonical(canonical: impl Into<String>) -> Self {
        Self(canonical.into())
    }

    /// Returns the canonical string form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parses the canonical form back into a value.
    #[must_use]
    pub fn to_value(&self) -> Option<Value> {
        serde_json::from_str(&self.0).ok()
    }
}

impl From<&Value> for TaskKey {
    fn from(value: &Value) -> Self {
        Self::of(value)
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Envelope for everything placed on a queue.
///
/// `Terminate` is the termination marker: a producer puts exactly one after
/// its last real item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Message<T> {
    /// A real item.
    Item(T),
    /// The producer will send nothing more.
    Terminate,
}

impl<T> Message<T> {
    /// Returns true for the termination marker.
    #[must_use]
    pub const fn is_terminate(&self) -> bool {
        matches!(self, Self::Terminate)
    }

    /// Returns the carried item, if any.
    pub fn into_item(self) -> Option<T> {
        match self {
            Self::Item(item) => Some(item),
            Self::Terminate => None,
        }
    }
}

/// Renders a value for a log line.
///
/// Backslashes and newlines are escaped. Text reaching `max_info` characters
/// keeps its first two thirds and last third around an ellipsis; a
/// `max_info` of zero disables truncation.
#[must_use]
pub fn format_info(value: &Value, max_info: usize) -> String {
    let raw = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    let text = raw.replace('\\', "\\\\").replace('\n', "\\n");
    let len = text.chars().count();
    if max_info == 0 || len < max_info {
        return text;
    }

    let head: String = text.chars().take(max_info * 2 / 3).collect();
    let tail: String = text.chars().skip(len - max_info / 3).collect();
    format!("{head}...{tail}")
}

/// Renders a task as an argument list, e.g. `(42)`.
#[must_use]
pub fn task_info(task: &Value, max_info: usize) -> String {
    format!("({})", format_info(task, max_info))
}
