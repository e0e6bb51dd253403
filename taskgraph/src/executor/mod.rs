//! The stage executor: one control loop for every execution mode.
//!
//! An executor drains its stage's input queue until it has seen one
//! termination marker per upstream producer, dispatches each new task, and
//! routes completions to the output edge, the stage tables and the fail
//! queue. Only the [`Dispatcher`] differs between execution modes.
//!
//! Retries go back onto the input queue with `put_back`. A retry that lands
//! behind the last marker is picked up by a further wave: once the input is
//! exhausted and nothing is in flight, a fresh marker is re-injected at the
//! tail and the loop drains again.

mod dispatch;
mod pool;

pub use dispatch::{call_local, Dispatcher};
pub use pool::ProcessPool;

use crate::errors::{QueueError, TaskGraphError};
use crate::logging::TaskLogger;
use crate::progress::ProgressReporter;
use crate::queue::{SharedQueue, SharedSender};
use crate::stage::{
    split_result, ExecutionMode, RetryDecision, Stage, StageCounts, StageKind, StageSettings,
    StageState,
};
use crate::task::{format_info, task_info, FailRecord, Message, TaskError, TaskKey};
use crate::worker::WorkerLauncher;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Receives the table updates an executor makes.
///
/// All methods default to no-ops.
pub trait StageObserver: Send + Sync {
    /// A task succeeded. For splitters `result` is the array of items.
    fn on_success(&self, _task: &Value, _result: &Value) {}

    /// A task failed and will not be retried.
    fn on_failure(&self, _task: &Value, _error: &TaskError) {}

    /// A task was scheduled for retry number `attempt`.
    fn on_retry(&self, _task: &Value, _attempt: u32) {}

    /// A duplicate task was skipped.
    fn on_duplicate(&self, _task: &Value) {}

    /// A splitter emitted `count` items for one task.
    fn on_split(&self, _count: u64) {}
}

/// Observer that ignores every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpObserver;

impl StageObserver for NoOpObserver {}

struct Completion {
    key: TaskKey,
    task: Value,
    elapsed: Duration,
    outcome: Result<Value, TaskError>,
}

type InFlight = FuturesUnordered<BoxFuture<'static, Completion>>;

/// Runs one stage against its queues.
pub struct StageExecutor {
    stage: Stage,
    input: SharedQueue<Value>,
    output: Option<SharedSender<Value>>,
    fail_queue: SharedSender<FailRecord>,
    logger: TaskLogger,
    expected_markers: usize,
    observer: Arc<dyn StageObserver>,
    launcher: WorkerLauncher,
}

impl StageExecutor {
    /// Creates an executor.
    ///
    /// `output` is `None` for leaf stages. `expected_markers` is the number of
    /// producers feeding `input`.
    #[must_use]
    pub fn new(
        stage: Stage,
        input: SharedQueue<Value>,
        output: Option<SharedSender<Value>>,
        fail_queue: SharedSender<FailRecord>,
        logger: TaskLogger,
        expected_markers: usize,
    ) -> Self {
        Self {
            stage,
            input,
            output,
            fail_queue,
            logger,
            expected_markers,
            observer: Arc::new(NoOpObserver),
            launcher: WorkerLauncher::default(),
        }
    }

    /// Sets the observer notified of table updates.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn StageObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Sets the executable used for process pools.
    #[must_use]
    pub fn with_launcher(mut self, launcher: WorkerLauncher) -> Self {
        self.launcher = launcher;
        self
    }

    /// Drains the input until every producer has finished, then terminates
    /// the output.
    ///
    /// The output always receives its termination marker, even when the loop
    /// fails, so downstream stages never wait on a dead producer.
    pub async fn run(self) -> Result<StageCounts, TaskGraphError> {
        let settings = self.stage.settings();
        let function = self.stage.function().clone();
        let mode = settings.execution_mode;
        let limit = settings.concurrency();
        let dispatcher = Dispatcher::new(&function, &settings, &self.launcher);
        let state = self.stage.state();

        let mut runner = Runner {
            tag: self.stage.tag(),
            func_name: function.name().to_string(),
            kind: self.stage.kind(),
            progress: ProgressReporter::new(&self.stage.tag(), settings.show_progress),
            settings,
            state: state.clone(),
            input: self.input,
            output: self.output,
            fail_queue: self.fail_queue,
            logger: self.logger,
            observer: self.observer,
            tracked: HashMap::new(),
            retry_delays: HashMap::new(),
        };

        state.mark_running();
        let shown_limit = (mode != ExecutionMode::Sequential).then_some(limit);
        runner
            .logger
            .start_stage(self.stage.name(), &runner.func_name, mode, shown_limit);

        let drained = runner.drain(&dispatcher, limit, self.expected_markers).await;
        dispatcher.shutdown().await;

        let terminated = match &runner.output {
            Some(output) => output.put(Message::Terminate).await,
            None => Ok(()),
        };
        runner.progress.finish();

        let result = drained.and(terminated);
        state.mark_stopped(result.as_ref().err().map(ToString::to_string));

        let counts = state.counts();
        runner.logger.end_stage(
            self.stage.name(),
            &runner.func_name,
            mode,
            state.elapsed(),
            counts.processed,
            counts.failed,
            counts.duplicates,
        );

        result.map(|()| counts).map_err(TaskGraphError::from)
    }
}

impl std::fmt::Debug for StageExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageExecutor")
            .field("stage", &self.stage.tag())
            .field("expected_markers", &self.expected_markers)
            .field("has_output", &self.output.is_some())
            .finish_non_exhaustive()
    }
}

struct Runner {
    tag: String,
    func_name: String,
    kind: StageKind,
    settings: StageSettings,
    state: Arc<StageState>,
    progress: ProgressReporter,
    input: SharedQueue<Value>,
    output: Option<SharedSender<Value>>,
    fail_queue: SharedSender<FailRecord>,
    logger: TaskLogger,
    observer: Arc<dyn StageObserver>,
    /// In flight or awaiting a retry, with the number of duplicate copies
    /// to emit when the task settles.
    tracked: HashMap<TaskKey, u32>,
    /// Retries sitting on the input queue, with the delay to apply.
    retry_delays: HashMap<TaskKey, Duration>,
}

impl Runner {
    async fn drain(
        &mut self,
        dispatcher: &Dispatcher,
        limit: usize,
        expected_markers: usize,
    ) -> Result<(), QueueError> {
        let mut in_flight = InFlight::new();
        let mut expected = expected_markers;
        let mut markers_seen = 0usize;
        let mut draining = expected > 0;
        let input = self.input.clone();

        loop {
            if !draining && in_flight.is_empty() {
                if input.is_empty() {
                    break;
                }
                debug!(stage = %self.tag, pending = input.len(), "Starting retry wave");
                input.put_back(Message::Terminate)?;
                expected = 1;
                markers_seen = 0;
                draining = true;
            }

            tokio::select! {
                biased;
                Some(done) = in_flight.next(), if !in_flight.is_empty() => {
                    self.complete(done).await?;
                }
                message = input.get(), if draining && in_flight.len() < limit => {
                    match message? {
                        Message::Terminate => {
                            markers_seen += 1;
                            if markers_seen >= expected {
                                draining = false;
                            }
                        }
                        Message::Item(task) => self.accept(task, dispatcher, &mut in_flight).await?,
                    }
                }
                else => break,
            }
        }
        Ok(())
    }

    fn launch(dispatcher: &Dispatcher, in_flight: &mut InFlight, key: TaskKey, task: Value, delay: Duration) {
        let unit = dispatcher.dispatch(task.clone(), delay);
        in_flight.push(
            async move {
                let started = Instant::now();
                let outcome = unit.await;
                Completion {
                    key,
                    task,
                    elapsed: started.elapsed().saturating_sub(delay),
                    outcome,
                }
            }
            .boxed(),
        );
    }

    async fn accept(
        &mut self,
        task: Value,
        dispatcher: &Dispatcher,
        in_flight: &mut InFlight,
    ) -> Result<(), QueueError> {
        let key = TaskKey::of(&task);

        if let Some(delay) = self.retry_delays.remove(&key) {
            Self::launch(dispatcher, in_flight, key, task, delay);
            return Ok(());
        }

        self.progress.add_total(1);
        self.state.remember(&key, &task);

        if let Some(result) = self.state.success(&key) {
            self.duplicate(&task);
            match self.kind {
                StageKind::Splitter => {
                    for item in split_result(result) {
                        self.emit(item).await?;
                    }
                }
                StageKind::Standard => self.emit(result).await?,
            }
        } else if self.state.error(&key).is_some() {
            self.duplicate(&task);
        } else if let Some(copies) = self.tracked.get_mut(&key) {
            *copies += 1;
            self.duplicate(&task);
        } else {
            self.tracked.insert(key.clone(), 0);
            Self::launch(dispatcher, in_flight, key, task, Duration::ZERO);
        }
        Ok(())
    }

    fn duplicate(&self, task: &Value) {
        self.state.record_duplicate();
        self.logger
            .task_duplicate(&self.func_name, &task_info(task, self.settings.max_info));
        self.observer.on_duplicate(task);
        self.progress.update(1);
    }

    async fn complete(&mut self, done: Completion) -> Result<(), QueueError> {
        let Completion {
            key,
            task,
            elapsed,
            outcome,
        } = done;
        let max_info = self.settings.max_info;

        match outcome {
            Ok(result) => {
                let copies = self.tracked.remove(&key).unwrap_or(0);
                match self.kind {
                    StageKind::Standard => {
                        self.logger.task_success(
                            &self.func_name,
                            &task_info(&task, max_info),
                            self.settings.execution_mode,
                            &format_info(&result, max_info),
                            elapsed,
                        );
                        self.state.record_success(&key, &task, result.clone());
                        self.observer.on_success(&task, &result);
                        for _ in 0..=copies {
                            self.emit(result.clone()).await?;
                        }
                    }
                    StageKind::Splitter => {
                        let items = split_result(result);
                        let count = items.len() as u64;
                        let stored = Value::Array(items.clone());
                        self.state.record_success(&key, &task, stored.clone());
                        self.state.add_split_outputs(count);
                        self.observer.on_success(&task, &stored);
                        self.observer.on_split(count);
                        self.logger.splitter_success(
                            &self.func_name,
                            &task_info(&task, max_info),
                            items.len(),
                            elapsed,
                        );
                        for _ in 0..=copies {
                            for item in &items {
                                self.emit(item.clone()).await?;
                            }
                        }
                    }
                }
                self.progress.update(1);
            }
            Err(error) => {
                let decision = self
                    .settings
                    .retry
                    .decide(&error, self.state.retry_count(&key));
                match decision {
                    RetryDecision::Retry(delay) => {
                        let attempt = self.state.record_retry(&key);
                        self.retry_delays.insert(key, delay);
                        self.logger
                            .task_retry(&self.func_name, &task_info(&task, max_info), attempt);
                        self.observer.on_retry(&task, attempt);
                        self.progress.add_total(1);
                        self.progress.update(1);
                        self.input.put_back(Message::Item(task))?;
                    }
                    RetryDecision::GiveUp | RetryDecision::NotRetryable => {
                        self.tracked.remove(&key);
                        self.logger
                            .task_error(&self.func_name, &task_info(&task, max_info), &error);
                        let record = FailRecord::new(self.tag.clone(), &key, &error);
                        self.state.record_failure(&key, &task, error.clone());
                        self.observer.on_failure(&task, &error);
                        self.fail_queue.put(Message::Item(record)).await?;
                        self.progress.update(1);
                    }
                }
            }
        }
        Ok(())
    }

    async fn emit(&self, value: Value) -> Result<(), QueueError> {
        if let Some(output) = &self.output {
            output.put(Message::Item(value)).await?;
            self.state.add_emitted(1);
        }
        Ok(())
    }
}
