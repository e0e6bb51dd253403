//! Producer handle for task log records.

use super::{LogLevel, LogRecord};
use crate::queue::SharedSender;
use crate::task::{Message, TaskError};
use std::fmt::Display;
use std::time::Duration;

/// Cheap-clone handle used by executors to produce task log records.
///
/// Records below the configured level are dropped here, before they reach
/// the queue. Producing never blocks and never fails the caller.
#[derive(Clone)]
pub struct TaskLogger {
    sink: SharedSender<LogRecord>,
    level: LogLevel,
}

impl TaskLogger {
    /// Creates a logger writing to `sink`.
    #[must_use]
    pub fn new(sink: SharedSender<LogRecord>, level: LogLevel) -> Self {
        Self { sink, level }
    }

    /// Returns the minimum level.
    #[must_use]
    pub fn level(&self) -> LogLevel {
        self.level
    }

    /// Produces a record at `level`.
    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        if level < self.level {
            return;
        }
        if let Err(e) = self.sink.try_put(Message::Item(LogRecord::now(level, message))) {
            tracing::debug!(error = %e, "Dropping task log record");
        }
    }

    /// Passes on a record produced elsewhere, such as in a worker process.
    pub fn forward(&self, record: LogRecord) {
        if record.level < self.level {
            return;
        }
        if let Err(e) = self.sink.try_put(Message::Item(record)) {
            tracing::debug!(error = %e, "Dropping forwarded log record");
        }
    }

    /// Logs at debug level.
    pub fn debug(&self, message: impl Into<String>) {
        self.log(LogLevel::Debug, message);
    }

    /// Logs at info level.
    pub fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message);
    }

    /// Logs at warning level.
    pub fn warning(&self, message: impl Into<String>) {
        self.log(LogLevel::Warning, message);
    }

    /// Logs at error level.
    pub fn error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, message);
    }

    /// A stage executor started.
    pub fn start_stage(
        &self,
        stage_name: &str,
        func_name: &str,
        execution_mode: impl Display,
        worker_limit: Option<usize>,
    ) {
        let mut text = format!("The {stage_name} in '{func_name}' start tasks by {execution_mode}");
        match worker_limit {
            Some(limit) => text.push_str(&format!("({limit} workers).")),
            None => text.push('.'),
        }
        self.info(text);
    }

    /// A stage executor finalised.
    #[allow(clippy::too_many_arguments)]
    pub fn end_stage(
        &self,
        stage_name: &str,
        func_name: &str,
        execution_mode: impl Display,
        elapsed: Duration,
        succeeded: u64,
        failed: u64,
        duplicated: u64,
    ) {
        self.info(format!(
            "The {stage_name} in '{func_name}' end tasks by {execution_mode}. Use {:.2} second. \
             {succeeded} tasks successed, {failed} tasks failed, {duplicated} tasks duplicated.",
            elapsed.as_secs_f64()
        ));
    }

    /// A stage stopped without finalising normally.
    pub fn stage_stopped(&self, stage_tag: &str, reason: &str) {
        self.error(format!("The stage {stage_tag} stopped: {reason}."));
    }

    /// A graph run started; `structure` is the boxed tree drawing.
    pub fn start_tree(&self, structure: &[String]) {
        self.info("Starting TaskTree stages. Tree structure:");
        for line in structure {
            self.info(line.clone());
        }
    }

    /// A graph run ended.
    pub fn end_tree(&self, elapsed: Duration) {
        self.info(format!("TaskTree end. Use {:.2} second.", elapsed.as_secs_f64()));
    }

    /// A task completed.
    pub fn task_success(
        &self,
        func_name: &str,
        task_info: &str,
        execution_mode: impl Display,
        result_info: &str,
        elapsed: Duration,
    ) {
        self.log(
            LogLevel::Success,
            format!(
                "In '{func_name}', Task {task_info} completed by {execution_mode}. \
                 Result is {result_info}. Used {:.2} seconds.",
                elapsed.as_secs_f64()
            ),
        );
    }

    /// A task failed and goes back on the input queue.
    pub fn task_retry(&self, func_name: &str, task_info: &str, retry_times: u32) {
        self.warning(format!(
            "In '{func_name}', Task {task_info} failed {retry_times} times and will retry."
        ));
    }

    /// A task failed for good.
    pub fn task_error(&self, func_name: &str, task_info: &str, error: &TaskError) {
        self.error(format!(
            "In '{func_name}', Task {task_info} failed and can't retry: ({}){}.",
            error.kind, error.message
        ));
    }

    /// A task was seen before in this run.
    pub fn task_duplicate(&self, func_name: &str, task_info: &str) {
        self.log(
            LogLevel::Success,
            format!("In '{func_name}', Task {task_info} has been duplicated."),
        );
    }

    /// A splitter task produced `split_count` items.
    pub fn splitter_success(
        &self,
        func_name: &str,
        task_info: &str,
        split_count: usize,
        elapsed: Duration,
    ) {
        self.log(
            LogLevel::Success,
            format!(
                "In '{func_name}', Task {task_info} has split into {split_count} parts. \
                 Used {:.2} seconds.",
                elapsed.as_secs_f64()
            ),
        );
    }
}

impl std::fmt::Debug for TaskLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskLogger")
            .field("level", &self.level)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{MemoryQueue, TaskQueue};
    use std::sync::Arc;

    fn logger(level: LogLevel) -> (TaskLogger, Arc<MemoryQueue<LogRecord>>) {
        let queue = Arc::new(MemoryQueue::unbounded());
        (TaskLogger::new(queue.clone(), level), queue)
    }

    async fn next_record(queue: &MemoryQueue<LogRecord>) -> LogRecord {
        match queue.get().await.unwrap() {
            Message::Item(record) => record,
            Message::Terminate => panic!("unexpected marker"),
        }
    }

    #[tokio::test]
    async fn test_level_filter() {
        let (logger, queue) = logger(LogLevel::Success);
        logger.info("dropped");
        logger.task_duplicate("f", "(1)");
        logger.error("kept");

        assert_eq!(queue.len(), 2);
        assert_eq!(next_record(&queue).await.level, LogLevel::Success);
        assert_eq!(next_record(&queue).await.message, "kept");
    }

    #[tokio::test]
    async fn test_message_vocabulary() {
        let (logger, queue) = logger(LogLevel::Trace);
        logger.start_stage("Stage 1", "double", "threads", Some(4));
        logger.start_stage("Stage 2", "double", "sequential", None);
        logger.task_retry("double", "(7)", 2);
        logger.task_error("double", "(7)", &TaskError::new("ReadTimeout", "slow"));

        assert_eq!(
            next_record(&queue).await.message,
            "The Stage 1 in 'double' start tasks by threads(4 workers)."
        );
        assert_eq!(
            next_record(&queue).await.message,
            "The Stage 2 in 'double' start tasks by sequential."
        );
        assert_eq!(
            next_record(&queue).await.message,
            "In 'double', Task (7) failed 2 times and will retry."
        );
        let error = next_record(&queue).await;
        assert_eq!(error.level, LogLevel::Error);
        assert_eq!(
            error.message,
            "In 'double', Task (7) failed and can't retry: (ReadTimeout)slow."
        );
    }
}
