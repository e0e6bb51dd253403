//! Dispatchers: how one unit of work actually runs.

use super::pool::ProcessPool;
use crate::stage::{ExecutionMode, FunctionBody, StageFunction, StageSettings};
use crate::task::{kinds, TaskError};
use crate::worker::WorkerLauncher;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

/// Extracts the text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "panic with a non-string payload".to_string()
    }
}

fn join_error(err: &tokio::task::JoinError) -> TaskError {
    TaskError::panic(format!("task was cancelled: {err}"))
}

/// Runs a function body in this process.
///
/// Blocking bodies go to the blocking thread pool. Async bodies are awaited
/// in place when `cooperative`, otherwise spawned on the runtime. A panic in
/// either becomes a `Panic` error.
pub async fn call_local(
    function: &StageFunction,
    task: Value,
    cooperative: bool,
) -> Result<Value, TaskError> {
    match function.body() {
        FunctionBody::Blocking(body) => {
            let body = body.clone();
            match tokio::task::spawn_blocking(move || body(task)).await {
                Ok(outcome) => outcome,
                Err(err) if err.is_panic() => Err(TaskError::panic(panic_message(&*err.into_panic()))),
                Err(err) => Err(join_error(&err)),
            }
        }
        FunctionBody::Async(body) => {
            let future = match std::panic::catch_unwind(AssertUnwindSafe(|| body(task))) {
                Ok(future) => future,
                Err(payload) => return Err(TaskError::panic(panic_message(&*payload))),
            };
            if cooperative {
                AssertUnwindSafe(future)
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|payload| Err(TaskError::panic(panic_message(&*payload))))
            } else {
                match tokio::spawn(future).await {
                    Ok(outcome) => outcome,
                    Err(err) if err.is_panic() => {
                        Err(TaskError::panic(panic_message(&*err.into_panic())))
                    }
                    Err(err) => Err(join_error(&err)),
                }
            }
        }
        FunctionBody::Named => Err(TaskError::new(
            kinds::UNRESOLVED_FUNCTION,
            format!(
                "function '{}' has no body in this process; run the stage in a worker process",
                function.name()
            ),
        )),
    }
}

/// Runs units of work for one stage.
#[derive(Clone)]
pub enum Dispatcher {
    /// In this process, under the given mode.
    Local {
        /// Function to call.
        function: StageFunction,
        /// Sequential, threads or async.
        mode: ExecutionMode,
    },
    /// In a pool of worker processes.
    Pool(Arc<ProcessPool>),
}

impl Dispatcher {
    /// Builds the dispatcher for a stage's settings.
    #[must_use]
    pub fn new(function: &StageFunction, settings: &StageSettings, launcher: &WorkerLauncher) -> Self {
        match settings.execution_mode {
            ExecutionMode::Processes => Self::Pool(Arc::new(ProcessPool::new(
                function.name(),
                launcher.clone(),
                settings.concurrency(),
            ))),
            mode => Self::Local {
                function: function.clone(),
                mode,
            },
        }
    }

    /// Returns a unit that sleeps `delay`, then runs `task`.
    #[must_use]
    pub fn dispatch(&self, task: Value, delay: Duration) -> BoxFuture<'static, Result<Value, TaskError>> {
        let this = self.clone();
        async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            match this {
                Self::Local { function, mode } => {
                    let cooperative = mode != ExecutionMode::Threads;
                    call_local(&function, task, cooperative).await
                }
                Self::Pool(pool) => pool.run(task).await,
            }
        }
        .boxed()
    }

    /// Releases worker processes, if any.
    pub async fn shutdown(&self) {
        if let Self::Pool(pool) = self {
            pool.shutdown().await;
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local { function, mode } => f
                .debug_struct("Local")
                .field("function", function)
                .field("mode", mode)
                .finish(),
            Self::Pool(pool) => f.debug_tuple("Pool").field(pool).finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_blocking_call() {
        let f = StageFunction::blocking("inc", |v| Ok(json!(v.as_i64().unwrap_or(0) + 1)));
        assert_eq!(call_local(&f, json!(1), false).await.unwrap(), json!(2));
    }

    #[tokio::test]
    async fn test_blocking_panic_becomes_error() {
        let f = StageFunction::blocking("boom", |_| panic!("kaboom"));
        let err = call_local(&f, json!(1), false).await.unwrap_err();
        assert!(err.is_kind(kinds::PANIC));
        assert!(err.message.contains("kaboom"));
    }

    #[tokio::test]
    async fn test_async_panic_becomes_error_cooperative() {
        let f = StageFunction::from_async("boom", |v: Value| async move {
            if v.as_i64().unwrap_or(0) > 0 {
                panic!("async kaboom");
            }
            Ok(v)
        });
        let err = call_local(&f, json!(1), true).await.unwrap_err();
        assert!(err.is_kind(kinds::PANIC));
        assert_eq!(err.message, "async kaboom");
    }

    #[tokio::test]
    async fn test_named_body_is_unresolved_inline() {
        let f = StageFunction::named("remote_only");
        let err = call_local(&f, json!(1), true).await.unwrap_err();
        assert!(err.is_kind(kinds::UNRESOLVED_FUNCTION));
    }

    #[tokio::test]
    async fn test_dispatch_waits_for_delay() {
        let f = StageFunction::blocking("echo", Ok);
        let dispatcher = Dispatcher::new(&f, &StageSettings::default(), &WorkerLauncher::default());

        let started = std::time::Instant::now();
        let out = dispatcher
            .dispatch(json!("x"), Duration::from_millis(30))
            .await
            .unwrap();
        assert_eq!(out, json!("x"));
        assert!(started.elapsed() >= Duration::from_millis(30));
    }
}
