//! Frames exchanged with worker processes, one JSON document per line.

use crate::errors::QueueError;
use crate::logging::{LogLevel, LogRecord};
use crate::stage::{StageKind, StageSettings};
use crate::task::{FailRecord, Message, TaskError};
use crate::worker::WorkerLauncher;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Everything a stage worker needs to rebuild its executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerInit {
    /// Stage name.
    pub stage_name: String,
    /// Registered function name.
    pub function: String,
    /// Standard or splitter.
    pub kind: StageKind,
    /// Stage policy.
    pub settings: StageSettings,
    /// Termination markers to wait for on the input.
    pub expected_markers: usize,
    /// Whether results are forwarded downstream.
    pub has_output: bool,
    /// Minimum task log level.
    pub log_level: LogLevel,
    /// Executable for process pools started by the worker.
    #[serde(default)]
    pub launcher: WorkerLauncher,
}

impl WorkerInit {
    /// Returns the stage tag.
    #[must_use]
    pub fn tag(&self) -> String {
        format!("{}[{}]", self.stage_name, self.function)
    }
}

/// Parent to stage worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "frame", content = "body", rename_all = "snake_case")]
pub enum ParentFrame {
    /// First frame on stdin.
    Init(WorkerInit),
    /// An input item or termination marker.
    Input(Message<Value>),
}

/// Stage worker to parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "frame", content = "body", rename_all = "snake_case")]
pub enum WorkerFrame {
    /// Init was accepted.
    Ready,
    /// Message for the stage's output edge.
    Output(Message<Value>),
    /// Table update: a task succeeded.
    Success {
        /// Input task.
        task: Value,
        /// Result.
        result: Value,
    },
    /// Table update: a task failed for good.
    Failure {
        /// Input task.
        task: Value,
        /// Final error.
        error: TaskError,
    },
    /// Table update: a task was retried.
    Retry {
        /// Input task.
        task: Value,
        /// Retry count after this retry.
        attempt: u32,
    },
    /// Counter update: a duplicate was skipped.
    Duplicate {
        /// The duplicate task.
        task: Value,
    },
    /// Counter update: a splitter emitted items.
    Split {
        /// Items emitted.
        count: u64,
    },
    /// Record for the fail queue.
    Fail(Message<FailRecord>),
    /// Record for the log sink.
    Log(Message<LogRecord>),
    /// The executor failed; the worker is about to exit.
    Fatal {
        /// Error text.
        message: String,
    },
    /// The executor finalised.
    Finished,
}

/// Parent to pool worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolRequest {
    /// Correlation id.
    pub id: u64,
    /// Task to run.
    pub task: Value,
}

/// Result of one pool request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolOutcome {
    /// The function returned.
    Ok(Value),
    /// The function failed.
    Err(TaskError),
}

impl From<Result<Value, TaskError>> for PoolOutcome {
    fn from(result: Result<Value, TaskError>) -> Self {
        match result {
            Ok(value) => Self::Ok(value),
            Err(error) => Self::Err(error),
        }
    }
}

impl From<PoolOutcome> for Result<Value, TaskError> {
    fn from(outcome: PoolOutcome) -> Self {
        match outcome {
            PoolOutcome::Ok(value) => Ok(value),
            PoolOutcome::Err(error) => Err(error),
        }
    }
}

/// Pool worker to parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolResponse {
    /// Correlation id of the request.
    pub id: u64,
    /// What the function produced.
    pub outcome: PoolOutcome,
}

/// Serialises a frame as one line, newline included.
pub fn encode_line<F: Serialize>(frame: &F) -> Result<String, QueueError> {
    let mut line = serde_json::to_string(frame).map_err(|e| QueueError::Encode(e.to_string()))?;
    line.push('\n');
    Ok(line)
}

/// Decodes an input frame on a stage worker's stdin.
pub fn decode_input(line: &str) -> Result<Message<Value>, QueueError> {
    match serde_json::from_str::<ParentFrame>(line) {
        Ok(ParentFrame::Input(message)) => Ok(message),
        Ok(ParentFrame::Init(_)) => Err(QueueError::Decode("unexpected second init frame".to_string())),
        Err(e) => Err(QueueError::Decode(e.to_string())),
    }
}

/// Wraps an output edge message.
#[must_use]
pub fn wrap_output(message: Message<Value>) -> WorkerFrame {
    WorkerFrame::Output(message)
}

/// Wraps a fail queue message.
#[must_use]
pub fn wrap_fail(message: Message<FailRecord>) -> WorkerFrame {
    WorkerFrame::Fail(message)
}

/// Wraps a log sink message.
#[must_use]
pub fn wrap_log(message: Message<LogRecord>) -> WorkerFrame {
    WorkerFrame::Log(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_frame_layout() {
        let ready = serde_json::to_string(&WorkerFrame::Ready).unwrap();
        assert_eq!(ready, r#"{"frame":"ready"}"#);

        let output = serde_json::to_value(WorkerFrame::Output(Message::Item(json!(3)))).unwrap();
        assert_eq!(
            output,
            json!({"frame": "output", "body": {"kind": "item", "value": 3}})
        );

        let split = serde_json::to_value(WorkerFrame::Split { count: 2 }).unwrap();
        assert_eq!(split, json!({"frame": "split", "body": {"count": 2}}));
    }

    #[test]
    fn test_decode_input() {
        let line = encode_line(&ParentFrame::Input(Message::Item(json!("a")))).unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(decode_input(line.trim_end()).unwrap(), Message::Item(json!("a")));

        let marker = r#"{"frame":"input","body":{"kind":"terminate"}}"#;
        assert!(decode_input(marker).unwrap().is_terminate());

        assert!(matches!(decode_input("hello"), Err(QueueError::Decode(_))));
    }

    #[test]
    fn test_pool_outcome_conversions() {
        let ok: PoolOutcome = Ok(json!(1)).into();
        assert_eq!(ok, PoolOutcome::Ok(json!(1)));

        let back: Result<Value, TaskError> = PoolOutcome::Err(TaskError::new("E", "m")).into();
        assert_eq!(back.unwrap_err().kind, "E");

        let response = PoolResponse { id: 9, outcome: ok };
        let text = serde_json::to_string(&response).unwrap();
        assert_eq!(text, r#"{"id":9,"outcome":{"ok":1}}"#);
    }
}
