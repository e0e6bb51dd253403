//! Pool of worker processes serving one function.
//!
//! Workers are spawned lazily, up to the pool size, and reused. Each worker
//! handles one request at a time. A worker whose pipe breaks is killed and
//! dropped; the next request that finds no idle worker spawns a fresh one.

use crate::errors::WorkerError;
use crate::task::TaskError;
use crate::worker::protocol::{encode_line, PoolRequest, PoolResponse};
use crate::worker::{WorkerLauncher, WorkerRole, FUNCTION_ENV};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

struct PoolWorker {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
}

impl PoolWorker {
    /// Sends one request and waits for its response.
    ///
    /// The outer error means the worker is unusable; the inner result is the
    /// function's outcome.
    async fn call(&mut self, id: u64, task: Value) -> Result<Result<Value, TaskError>, TaskError> {
        let line = match encode_line(&PoolRequest { id, task }) {
            Ok(line) => line,
            Err(e) => return Ok(Err(TaskError::serialization(e.to_string()))),
        };

        let written = async {
            self.stdin.write_all(line.as_bytes()).await?;
            self.stdin.flush().await
        }
        .await;
        if let Err(e) = written {
            return Err(TaskError::worker_crashed(format!("sending task {id} failed: {e}")));
        }

        loop {
            match self.stdout.next_line().await {
                Ok(Some(line)) => match serde_json::from_str::<PoolResponse>(&line) {
                    Ok(response) if response.id == id => return Ok(response.outcome.into()),
                    Ok(response) => warn!(expected = id, got = response.id, "Dropping stale pool response"),
                    Err(e) => {
                        let carries_id = serde_json::from_str::<Value>(&line)
                            .ok()
                            .and_then(|v| v.get("id").and_then(Value::as_u64))
                            == Some(id);
                        if carries_id {
                            return Ok(Err(TaskError::serialization(format!(
                                "undecodable response for task {id}: {e}"
                            ))));
                        }
                        debug!(line = %line, "Ignoring non-frame worker output");
                    }
                },
                Ok(None) => {
                    return Err(TaskError::worker_crashed(format!(
                        "worker exited while running task {id}"
                    )))
                }
                Err(e) => {
                    return Err(TaskError::worker_crashed(format!(
                        "reading response for task {id} failed: {e}"
                    )))
                }
            }
        }
    }

    async fn close(mut self) {
        drop(self.stdin);
        match tokio::time::timeout(CLOSE_TIMEOUT, self.child.wait()).await {
            Ok(Ok(status)) => debug!(%status, "Pool worker exited"),
            Ok(Err(e)) => warn!(error = %e, "Waiting for pool worker failed"),
            Err(_) => {
                warn!("Pool worker did not exit, killing it");
                let _ = self.child.kill().await;
            }
        }
    }
}

/// Fixed-size pool of worker processes running one registered function.
pub struct ProcessPool {
    function: String,
    launcher: WorkerLauncher,
    size: usize,
    slots: Semaphore,
    idle: Mutex<Vec<PoolWorker>>,
    next_id: AtomicU64,
    spawned: AtomicUsize,
}

impl ProcessPool {
    /// Creates a pool of at most `size` workers for `function`.
    #[must_use]
    pub fn new(function: impl Into<String>, launcher: WorkerLauncher, size: usize) -> Self {
        let size = size.max(1);
        Self {
            function: function.into(),
            launcher,
            size,
            slots: Semaphore::new(size),
            idle: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            spawned: AtomicUsize::new(0),
        }
    }

    /// Returns the pool size.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Returns how many worker processes were started so far.
    #[must_use]
    pub fn spawned(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }

    fn spawn_worker(&self) -> Result<PoolWorker, WorkerError> {
        let mut child = self
            .launcher
            .spawn(WorkerRole::Pool, &[(FUNCTION_ENV, self.function.as_str())])?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| WorkerError::Protocol("pool worker stdin missing".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| WorkerError::Protocol("pool worker stdout missing".to_string()))?;
        self.spawned.fetch_add(1, Ordering::SeqCst);

        Ok(PoolWorker {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
        })
    }

    /// Runs `task` on an idle worker, spawning one if needed.
    pub async fn run(&self, task: Value) -> Result<Value, TaskError> {
        let _permit = self
            .slots
            .acquire()
            .await
            .map_err(|_| TaskError::worker_crashed("process pool is shut down"))?;

        let idle = self.idle.lock().pop();
        let mut worker = match idle {
            Some(worker) => worker,
            None => self
                .spawn_worker()
                .map_err(|e| TaskError::worker_crashed(e.to_string()))?,
        };

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        match worker.call(id, task).await {
            Ok(outcome) => {
                self.idle.lock().push(worker);
                outcome
            }
            Err(err) => {
                warn!(function = %self.function, error = %err, "Pool worker lost");
                let _ = worker.child.kill().await;
                Err(err)
            }
        }
    }

    /// Closes every idle worker and refuses further work.
    pub async fn shutdown(&self) {
        self.slots.close();
        let workers = std::mem::take(&mut *self.idle.lock());
        for worker in workers {
            worker.close().await;
        }
    }
}

impl std::fmt::Debug for ProcessPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessPool")
            .field("function", &self.function)
            .field("size", &self.size)
            .field("spawned", &self.spawned())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::kinds;
    use serde_json::json;

    #[tokio::test]
    async fn test_spawn_failure_is_worker_crash() {
        let pool = ProcessPool::new(
            "double",
            WorkerLauncher::program("/definitely/not/a/taskgraph/worker"),
            2,
        );
        let err = pool.run(json!(1)).await.unwrap_err();
        assert!(err.is_kind(kinds::WORKER_CRASHED));
        assert_eq!(pool.spawned(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_refuses_work() {
        let pool = ProcessPool::new("double", WorkerLauncher::default(), 1);
        pool.shutdown().await;
        let err = pool.run(json!(1)).await.unwrap_err();
        assert!(err.is_kind(kinds::WORKER_CRASHED));
    }
}
