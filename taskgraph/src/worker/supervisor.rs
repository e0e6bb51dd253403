//! Parent side of a dedicated-process stage.
//!
//! The supervisor launches the worker executable, relays the stage's input
//! queue to the worker's stdin, and applies everything the worker reports on
//! stdout: outputs go to the real output edge, table updates to the stage's
//! [`StageState`], fail records to the fail queue and log records to the log
//! sink. If the worker dies without terminating its outputs, the supervisor
//! records the stage as stopped and terminates them on its behalf.

use super::protocol::{encode_line, ParentFrame, WorkerFrame, WorkerInit};
use super::{WorkerLauncher, WorkerRole};
use crate::errors::{QueueError, TaskGraphError, WorkerError};
use crate::graph::StopHandle;
use crate::logging::TaskLogger;
use crate::queue::{SharedQueue, SharedSender};
use crate::stage::{Stage, StageCounts, StageState};
use crate::task::{FailRecord, Message, TaskKey};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

const DEFAULT_GRACE: Duration = Duration::from_secs(5);

/// Runs one stage in a worker process.
pub struct StageSupervisor {
    stage: Stage,
    input: SharedQueue<Value>,
    output: Option<SharedSender<Value>>,
    fail_queue: SharedSender<FailRecord>,
    logger: TaskLogger,
    expected_markers: usize,
    launcher: WorkerLauncher,
    grace: Duration,
    stop: StopHandle,
}

/// What the worker reported before its stdout closed.
#[derive(Debug, Default)]
struct WorkerReport {
    outputs_terminated: bool,
    finished: bool,
    fatal: Option<String>,
    killed: bool,
}

impl StageSupervisor {
    /// Creates a supervisor with the same queue wiring as an inline executor.
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
            launcher: WorkerLauncher::default(),
            grace: DEFAULT_GRACE,
            stop: StopHandle::new(),
        }
    }

    /// Sets the worker executable.
    #[must_use]
    pub fn with_launcher(mut self, launcher: WorkerLauncher) -> Self {
        self.launcher = launcher;
        self
    }

    /// Sets how long a worker may live after its outputs finished or a stop
    /// was requested.
    #[must_use]
    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Sets the stop handle to watch.
    #[must_use]
    pub fn with_stop(mut self, stop: StopHandle) -> Self {
        self.stop = stop;
        self
    }

    fn init_frame(&self) -> WorkerInit {
        WorkerInit {
            stage_name: self.stage.name().to_string(),
            function: self.stage.function().name().to_string(),
            kind: self.stage.kind(),
            settings: self.stage.settings(),
            expected_markers: self.expected_markers,
            has_output: self.output.is_some(),
            log_level: self.logger.level(),
            launcher: self.launcher.clone(),
        }
    }

    /// Runs the worker to completion.
    ///
    /// A worker crash is not an error: the stage is recorded as stopped and
    /// the run continues. Failing to launch the worker, or a failing queue,
    /// is returned as an error once the input has been drained and the
    /// outputs terminated.
    pub async fn run(self) -> Result<StageCounts, TaskGraphError> {
        let state = self.stage.state();
        let tag = self.stage.tag();
        state.mark_running();

        let mut child = match self.spawn_worker() {
            Ok(child) => child,
            Err(e) => {
                let reason = e.to_string();
                error!(stage = %tag, error = %reason, "Could not launch stage worker");
                self.logger.stage_stopped(&tag, &reason);
                let discarded = discard_input(&self.input, self.expected_markers).await;
                let terminated = self.terminate_output().await;
                state.mark_stopped(Some(reason));
                discarded?;
                terminated?;
                return Err(e.into());
            }
        };

        let (stdin, stdout) = match (child.stdin.take(), child.stdout.take()) {
            (Some(stdin), Some(stdout)) => (stdin, stdout),
            _ => {
                let _ = child.kill().await;
                let e = WorkerError::Protocol("worker pipes are not available".to_string());
                self.logger.stage_stopped(&tag, &e.to_string());
                let discarded = discard_input(&self.input, self.expected_markers).await;
                let terminated = self.terminate_output().await;
                state.mark_stopped(Some(e.to_string()));
                discarded?;
                terminated?;
                return Err(e.into());
            }
        };

        let relay = tokio::spawn(relay_input(
            self.input.clone(),
            stdin,
            self.init_frame(),
            self.expected_markers,
            tag.clone(),
        ));

        let mut lines = BufReader::new(stdout).lines();
        let mut report = WorkerReport::default();
        let mut deadline: Option<Instant> = None;

        let pumped: Result<(), QueueError> = async {
            loop {
                let at = deadline;
                let expired = async move {
                    match at {
                        Some(instant) => tokio::time::sleep_until(instant).await,
                        None => std::future::pending::<()>().await,
                    }
                };

                tokio::select! {
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => {
                            self.apply_line(&line, &state, &mut report).await?;
                            if (report.outputs_terminated || report.finished) && deadline.is_none() {
                                deadline = Some(Instant::now() + self.grace);
                            }
                        }
                        Ok(None) => return Ok(()),
                        Err(e) => {
                            warn!(stage = %tag, error = %e, "Reading from stage worker failed");
                            return Ok(());
                        }
                    },
                    () = self.stop.stopped(), if deadline.is_none() => {
                        debug!(stage = %tag, "Stop requested, worker has a grace period");
                        deadline = Some(Instant::now() + self.grace);
                    }
                    () = expired => {
                        warn!(stage = %tag, grace = ?self.grace, "Stage worker outlived its grace period, killing it");
                        let _ = child.kill().await;
                        report.killed = true;
                        return Ok(());
                    }
                }
            }
        }
        .await;

        if pumped.is_err() && !report.killed {
            let _ = child.kill().await;
        }
        let status = match tokio::time::timeout(self.grace, child.wait()).await {
            Ok(Ok(status)) => status.to_string(),
            Ok(Err(e)) => format!("unknown exit status ({e})"),
            Err(_) => {
                let _ = child.kill().await;
                "killed after closing its output".to_string()
            }
        };
        debug!(stage = %tag, %status, "Stage worker exited");

        let mut result = pumped;
        if !report.outputs_terminated {
            let terminated = self.terminate_output().await;
            result = result.and(terminated);
        }

        let reason = if report.finished {
            None
        } else if let Some(fatal) = report.fatal.clone() {
            Some(fatal)
        } else if report.killed {
            Some(format!("worker killed after {:?} grace period", self.grace))
        } else {
            Some(format!("worker exited before finishing: {status}"))
        };
        if let Some(reason) = &reason {
            self.logger.stage_stopped(&tag, reason);
        }
        state.mark_stopped(reason);

        let relayed = relay
            .await
            .map_err(|e| TaskGraphError::Infrastructure(format!("input relay for {tag} failed: {e}")))?;
        result.and(relayed)?;
        Ok(state.counts())
    }

    fn spawn_worker(&self) -> Result<Child, WorkerError> {
        let child = self.launcher.spawn(WorkerRole::Stage, &[])?;
        info!(stage = %self.stage.tag(), pid = child.id(), "Stage worker launched");
        Ok(child)
    }

    async fn terminate_output(&self) -> Result<(), QueueError> {
        match &self.output {
            Some(output) => output.put(Message::Terminate).await,
            None => Ok(()),
        }
    }

    async fn apply_line(
        &self,
        line: &str,
        state: &Arc<StageState>,
        report: &mut WorkerReport,
    ) -> Result<(), QueueError> {
        if line.trim().is_empty() {
            return Ok(());
        }
        let Ok(frame) = serde_json::from_str::<WorkerFrame>(line) else {
            info!(stage = %self.stage.tag(), output = %line, "Stage worker printed a non-frame line");
            return Ok(());
        };

        match frame {
            WorkerFrame::Ready => debug!(stage = %self.stage.tag(), "Stage worker ready"),
            WorkerFrame::Output(Message::Item(item)) => {
                if let Some(output) = &self.output {
                    output.put(Message::Item(item)).await?;
                    state.add_emitted(1);
                }
            }
            WorkerFrame::Output(Message::Terminate) => {
                if !report.outputs_terminated {
                    self.terminate_output().await?;
                    report.outputs_terminated = true;
                }
            }
            WorkerFrame::Success { task, result } => {
                state.record_success(&TaskKey::of(&task), &task, result);
            }
            WorkerFrame::Failure { task, error } => {
                state.record_failure(&TaskKey::of(&task), &task, error);
            }
            WorkerFrame::Retry { task, attempt } => {
                let key = TaskKey::of(&task);
                state.remember(&key, &task);
                state.set_retry_count(&key, attempt);
            }
            WorkerFrame::Duplicate { task } => {
                state.remember(&TaskKey::of(&task), &task);
                state.record_duplicate();
            }
            WorkerFrame::Split { count } => state.add_split_outputs(count),
            WorkerFrame::Fail(Message::Item(record)) => {
                self.fail_queue.put(Message::Item(record)).await?;
            }
            WorkerFrame::Log(Message::Item(record)) => self.logger.forward(record),
            WorkerFrame::Fail(Message::Terminate) | WorkerFrame::Log(Message::Terminate) => {
                debug!(stage = %self.stage.tag(), "Ignoring marker for a shared queue");
            }
            WorkerFrame::Fatal { message } => {
                error!(stage = %self.stage.tag(), %message, "Stage worker reported a fatal error");
                report.fatal = Some(message);
            }
            WorkerFrame::Finished => report.finished = true,
        }
        Ok(())
    }
}

impl std::fmt::Debug for StageSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageSupervisor")
            .field("stage", &self.stage.tag())
            .field("expected_markers", &self.expected_markers)
            .field("launcher", &self.launcher)
            .field("grace", &self.grace)
            .finish_non_exhaustive()
    }
}

/// Reads the input queue until every producer finished, discarding items.
async fn discard_input(input: &SharedQueue<Value>, expected_markers: usize) -> Result<(), QueueError> {
    let mut markers = 0;
    while markers < expected_markers {
        if input.get().await?.is_terminate() {
            markers += 1;
        }
    }
    Ok(())
}

async fn write_frame(stdin: &mut ChildStdin, frame: &ParentFrame) -> Result<(), QueueError> {
    let line = encode_line(frame)?;
    stdin.write_all(line.as_bytes()).await?;
    stdin.flush().await?;
    Ok(())
}

/// Writes the init frame, then every input message, to the worker.
///
/// The input is always read until every producer finished. Once the worker's
/// stdin breaks, messages are discarded so upstream stages never block on a
/// dead worker.
async fn relay_input(
    input: SharedQueue<Value>,
    stdin: ChildStdin,
    init: WorkerInit,
    expected_markers: usize,
    tag: String,
) -> Result<(), QueueError> {
    let mut pipe = Some(stdin);
    if let Some(stdin) = pipe.as_mut() {
        if let Err(e) = write_frame(stdin, &ParentFrame::Init(init)).await {
            warn!(stage = %tag, error = %e, "Could not send the init frame");
            pipe = None;
        }
    }

    let mut markers = 0;
    let mut discarded = 0u64;
    while markers < expected_markers {
        let message = input.get().await?;
        if message.is_terminate() {
            markers += 1;
        }
        match pipe.as_mut() {
            Some(stdin) => {
                if let Err(e) = write_frame(stdin, &ParentFrame::Input(message)).await {
                    warn!(stage = %tag, error = %e, "Stage worker stopped reading its input");
                    pipe = None;
                }
            }
            None => discarded += 1,
        }
    }

    if discarded > 0 {
        warn!(stage = %tag, discarded, "Discarded input for a stopped stage worker");
    }
    Ok(())
}
