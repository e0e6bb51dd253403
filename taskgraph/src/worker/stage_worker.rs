//! Child side of a dedicated-process stage.
//!
//! The worker reads an init frame, rebuilds the stage from the registry and
//! runs an ordinary [`StageExecutor`] whose queues are pipe ends: input frames
//! come from stdin, outputs, fail records, log records and table updates go
//! to stdout.

use super::protocol::{
    decode_input, wrap_fail, wrap_log, wrap_output, ParentFrame, WorkerFrame, WorkerInit,
};
use crate::errors::WorkerError;
use crate::executor::{StageExecutor, StageObserver};
use crate::logging::TaskLogger;
use crate::queue::{FrameWriter, PipeQueue, PipeSender, SharedQueue, SharedSender};
use crate::stage::{FunctionRegistry, Stage};
use crate::task::{FailRecord, TaskError};
use serde_json::Value;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tracing::{debug, error, warn};

/// Mirrors executor events to the parent as frames.
struct FrameObserver {
    writer: Arc<FrameWriter>,
}

impl FrameObserver {
    fn send(&self, frame: &WorkerFrame) {
        if let Err(e) = self.writer.write(frame) {
            warn!(error = %e, "Failed to send table update");
        }
    }
}

impl StageObserver for FrameObserver {
    fn on_success(&self, task: &Value, result: &Value) {
        self.send(&WorkerFrame::Success {
            task: task.clone(),
            result: result.clone(),
        });
    }

    fn on_failure(&self, task: &Value, error: &TaskError) {
        self.send(&WorkerFrame::Failure {
            task: task.clone(),
            error: error.clone(),
        });
    }

    fn on_retry(&self, task: &Value, attempt: u32) {
        self.send(&WorkerFrame::Retry {
            task: task.clone(),
            attempt,
        });
    }

    fn on_duplicate(&self, task: &Value) {
        self.send(&WorkerFrame::Duplicate { task: task.clone() });
    }

    fn on_split(&self, count: u64) {
        self.send(&WorkerFrame::Split { count });
    }
}

/// Reads frames until the init frame.
pub(crate) async fn read_init<R>(lines: &mut Lines<R>) -> Result<WorkerInit, WorkerError>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                return Err(WorkerError::Protocol(
                    "stdin closed before the init frame".to_string(),
                ))
            }
            Err(e) => {
                return Err(WorkerError::Protocol(format!(
                    "reading the init frame failed: {e}"
                )))
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        return match serde_json::from_str::<ParentFrame>(&line) {
            Ok(ParentFrame::Init(init)) => Ok(init),
            Ok(ParentFrame::Input(_)) => Err(WorkerError::Protocol(
                "input frame received before the init frame".to_string(),
            )),
            Err(e) => Err(WorkerError::Protocol(format!("undecodable init frame: {e}"))),
        };
    }
}

fn fatal(writer: &FrameWriter, message: String) {
    error!(%message, "Stage worker failed");
    if let Err(e) = writer.write(&WorkerFrame::Fatal { message }) {
        error!(error = %e, "Could not report the failure to the parent");
    }
}

/// Runs the stage worker on this process's stdin and stdout.
pub(crate) async fn serve_stage(registry: &FunctionRegistry) -> ExitCode {
    let writer = Arc::new(FrameWriter::stdout());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    let init = match read_init(&mut lines).await {
        Ok(init) => init,
        Err(e) => {
            fatal(&writer, e.to_string());
            return ExitCode::from(2);
        }
    };
    let function = match registry.resolve(&init.function) {
        Ok(function) => function,
        Err(e) => {
            fatal(&writer, e.to_string());
            return ExitCode::from(2);
        }
    };
    debug!(stage = %init.tag(), markers = init.expected_markers, "Stage worker initialised");

    let stage = Stage::from_parts(
        init.stage_name.clone(),
        function,
        init.kind,
        init.settings.clone(),
    );
    let input: SharedQueue<Value> = Arc::new(PipeQueue::spawn(
        lines,
        decode_input,
        init.expected_markers,
    ));
    let output: Option<SharedSender<Value>> = if init.has_output {
        Some(Arc::new(PipeSender::new(writer.clone(), wrap_output)))
    } else {
        None
    };
    let fail_queue: SharedSender<FailRecord> = Arc::new(PipeSender::new(writer.clone(), wrap_fail));
    let logger = TaskLogger::new(Arc::new(PipeSender::new(writer.clone(), wrap_log)), init.log_level);

    if let Err(e) = writer.write(&WorkerFrame::Ready) {
        error!(error = %e, "Could not reach the parent");
        return ExitCode::FAILURE;
    }

    let executor = StageExecutor::new(stage, input, output, fail_queue, logger, init.expected_markers)
        .with_observer(Arc::new(FrameObserver {
            writer: writer.clone(),
        }))
        .with_launcher(init.launcher.clone());

    match executor.run().await {
        Ok(counts) => {
            debug!(stage = %init.tag(), ?counts, "Stage worker finished");
            if let Err(e) = writer.write(&WorkerFrame::Finished) {
                error!(error = %e, "Could not report completion to the parent");
                return ExitCode::FAILURE;
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            fatal(&writer, e.to_string());
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::LogLevel;
    use crate::stage::{StageKind, StageSettings};
    use crate::worker::protocol::encode_line;
    use crate::worker::WorkerLauncher;

    fn init() -> WorkerInit {
        WorkerInit {
            stage_name: "Stage 1".to_string(),
            function: "double".to_string(),
            kind: StageKind::Standard,
            settings: StageSettings::default(),
            expected_markers: 1,
            has_output: true,
            log_level: LogLevel::Info,
            launcher: WorkerLauncher::default(),
        }
    }

    #[tokio::test]
    async fn test_read_init_skips_blank_lines() {
        let text = format!("\n{}", encode_line(&ParentFrame::Init(init())).unwrap());
        let mut lines = BufReader::new(text.as_bytes()).lines();
        let parsed = read_init(&mut lines).await.unwrap();
        assert_eq!(parsed, init());
        assert_eq!(parsed.tag(), "Stage 1[double]");
    }

    #[tokio::test]
    async fn test_read_init_rejects_input_first() {
        let text = r#"{"frame":"input","body":{"kind":"terminate"}}"#;
        let mut lines = BufReader::new(text.as_bytes()).lines();
        assert!(matches!(
            read_init(&mut lines).await,
            Err(WorkerError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_read_init_on_closed_stdin() {
        let mut lines = BufReader::new(&b""[..]).lines();
        let err = read_init(&mut lines).await.unwrap_err();
        assert!(err.to_string().contains("before the init frame"));
    }

    #[test]
    fn test_observer_writes_frames() {
        let buffer = Arc::new(parking_lot::Mutex::new(Vec::<u8>::new()));

        struct Shared(Arc<parking_lot::Mutex<Vec<u8>>>);
        impl std::io::Write for Shared {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.0.lock().extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let observer = FrameObserver {
            writer: Arc::new(FrameWriter::new(Shared(buffer.clone()))),
        };
        observer.on_retry(&serde_json::json!(7), 2);
        observer.on_split(3);

        let text = String::from_utf8(buffer.lock().clone()).unwrap();
        let frames: Vec<WorkerFrame> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(
            frames,
            vec![
                WorkerFrame::Retry {
                    task: serde_json::json!(7),
                    attempt: 2
                },
                WorkerFrame::Split { count: 3 },
            ]
        );
    }
}
