//! The single consumer writing the task log file.

use super::LogRecord;
use crate::errors::TaskGraphError;
use crate::queue::{MemoryQueue, QueueSender, SharedSender, TaskQueue};
use crate::task::Message;
use chrono::{Local, NaiveDate};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing_appender::non_blocking::{NonBlocking, NonBlockingBuilder, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};

/// Returns the log file path for `date` under `dir`.
#[must_use]
pub fn log_file_path(dir: &Path, date: NaiveDate) -> PathBuf {
    dir.join(log_file_name(date))
}

fn log_file_name(date: NaiveDate) -> String {
    format!("task_logger({}).log", date.format("%Y-%m-%d"))
}

/// Background consumer draining the log queue into the log file.
///
/// Records are written in the order they were received. The sink stops on
/// its own termination marker, see [`LogSink::shutdown`].
pub struct LogSink {
    queue: Arc<MemoryQueue<LogRecord>>,
    handle: JoinHandle<Result<u64, TaskGraphError>>,
    path: PathBuf,
}

impl LogSink {
    /// Opens today's log file under `dir` (appending) and starts the consumer.
    pub async fn start(dir: &Path, mirror: bool) -> Result<Self, TaskGraphError> {
        tokio::fs::create_dir_all(dir).await?;
        let date = Local::now().date_naive();
        let appender = RollingFileAppender::builder()
            .rotation(Rotation::NEVER)
            .filename_prefix(log_file_name(date))
            .build(dir)
            .map_err(|e| TaskGraphError::Infrastructure(format!("cannot open the task log: {e}")))?;
        let (writer, guard) = NonBlockingBuilder::default().lossy(false).finish(appender);

        let queue = Arc::new(MemoryQueue::unbounded());
        let handle = tokio::spawn(consume(queue.clone(), writer, guard, mirror));

        Ok(Self {
            queue,
            handle,
            path: log_file_path(dir, date),
        })
    }

    /// Returns a producer handle for the log queue.
    #[must_use]
    pub fn sender(&self) -> SharedSender<LogRecord> {
        self.queue.clone()
    }

    /// Returns the log file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sends the termination marker and waits for the file to be flushed.
    ///
    /// Returns the number of records written.
    pub async fn shutdown(self) -> Result<u64, TaskGraphError> {
        self.queue.put(Message::Terminate).await?;
        self.handle
            .await
            .map_err(|e| TaskGraphError::Infrastructure(format!("log sink task failed: {e}")))?
    }
}

async fn consume(
    queue: Arc<MemoryQueue<LogRecord>>,
    mut out: NonBlocking,
    guard: WorkerGuard,
    mirror: bool,
) -> Result<u64, TaskGraphError> {
    let mut written = 0u64;
    let drained = async {
        while let Message::Item(record) = queue.get().await? {
            if mirror {
                record.mirror();
            }
            let mut line = record.to_line();
            line.push('\n');
            out.write_all(line.as_bytes())?;
            written += 1;
        }
        Ok::<(), TaskGraphError>(())
    }
    .await;
    queue.close();

    // The guard flushes the appender thread on drop.
    drop(out);
    tokio::task::spawn_blocking(move || drop(guard))
        .await
        .map_err(|e| TaskGraphError::Infrastructure(format!("log flush failed: {e}")))?;
    drained.map(|()| written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::LogLevel;

    #[tokio::test]
    async fn test_sink_writes_records_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let sink = LogSink::start(dir.path(), false).await.unwrap();
        let sender = sink.sender();

        sender
            .put(Message::Item(LogRecord::now(LogLevel::Info, "first")))
            .await
            .unwrap();
        sender
            .put(Message::Item(LogRecord::now(LogLevel::Error, "second")))
            .await
            .unwrap();

        let path = sink.path().to_path_buf();
        assert_eq!(sink.shutdown().await.unwrap(), 2);

        let text = std::fs::read_to_string(path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with(" INFO first"));
        assert!(lines[1].ends_with(" ERROR second"));

        // Late records are refused instead of silently lost.
        assert!(sender
            .try_put(Message::Item(LogRecord::now(LogLevel::Info, "late")))
            .is_err());
    }

    #[tokio::test]
    async fn test_sink_appends_across_runs() {
        let dir = tempfile::tempdir().unwrap();
        for message in ["run one", "run two"] {
            let sink = LogSink::start(dir.path(), false).await.unwrap();
            sink.sender()
                .put(Message::Item(LogRecord::now(LogLevel::Info, message)))
                .await
                .unwrap();
            sink.shutdown().await.unwrap();
        }

        let path = log_file_path(dir.path(), Local::now().date_naive());
        let text = std::fs::read_to_string(path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("run one"));
        assert!(lines[1].ends_with("run two"));
    }

    #[test]
    fn test_log_file_name() {
        let date = NaiveDate::from_ymd_opt(2024, 1, 31).unwrap();
        let path = log_file_path(Path::new("logs"), date);
        assert_eq!(path, PathBuf::from("logs/task_logger(2024-01-31).log"));
    }
}
