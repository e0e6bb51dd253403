//! Fail-queue records.

use super::{TaskError, TaskKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};

/// Record pushed onto the global fail queue for every terminal failure.
///
/// This is also the wire format used when the record crosses a process
/// boundary and the line format of the realtime error JSONL file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailRecord {
    /// Tag of the stage that gave up on the task.
    pub stage_tag: String,
    /// Canonical form of the task.
    pub task: String,
    /// `"<ErrorKind>: <message>"`.
    pub error_info: String,
    /// Seconds since the Unix epoch.
    pub timestamp: f64,
}

impl FailRecord {
    /// Creates a record stamped with the current time.
    #[must_use]
    pub fn new(stage_tag: impl Into<String>, task: &TaskKey, error: &TaskError) -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);

        Self {
            stage_tag: stage_tag.into(),
            task: task.as_str().to_string(),
            error_info: error.info(),
            timestamp: now,
        }
    }

    /// Returns the error kind part of `error_info`.
    #[must_use]
    pub fn error_kind(&self) -> &str {
        self.error_info
            .split_once(": ")
            .map_or(self.error_info.as_str(), |(kind, _)| kind)
    }

    /// Returns the key of the failed task.
    #[must_use]
    pub fn task_key(&self) -> TaskKey {
        TaskKey::from_canonical(self.task.clone())
    }

    /// Parses the task back into a value.
    #[must_use]
    pub fn task_value(&self) -> Option<Value> {
        self.task_key().to_value()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_fields() {
        let key = TaskKey::of(&json!({"id": 7}));
        let err = TaskError::new("ReadTimeout", "slow: upstream");
        let record = FailRecord::new("fetch[get]", &key, &err);

        assert_eq!(record.stage_tag, "fetch[get]");
        assert_eq!(record.error_info, "ReadTimeout: slow: upstream");
        assert_eq!(record.error_kind(), "ReadTimeout");
        assert_eq!(record.task_value(), Some(json!({"id": 7})));
        assert!(record.timestamp > 0.0);
    }

    #[test]
    fn test_record_wire_format() {
        let record = FailRecord {
            stage_tag: "a[f]".to_string(),
            task: "1".to_string(),
            error_info: "E: m".to_string(),
            timestamp: 1.5,
        };
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(
            value,
            json!({"stage_tag": "a[f]", "task": "1", "error_info": "E: m", "timestamp": 1.5})
        );
    }
}
