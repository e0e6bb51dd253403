//! Worker processes for dedicated-process stages and process pools.
//!
//! Closures cannot cross a process boundary, so workers are the same
//! executable re-launched with [`ROLE_ENV`] set. The executable must call
//! [`run_worker_if_requested`] first thing in `main`; it returns `None` in
//! the ordinary (driver) case and the worker's exit code otherwise.
//!
//! ```rust,ignore
//! fn main() -> ExitCode {
//!     let registry = FunctionRegistry::new().with(StageFunction::blocking("double", double));
//!     if let Some(code) = run_worker_if_requested(&registry) {
//!         return code;
//!     }
//!     // build and start the graph
//! }
//! ```

mod launcher;
pub mod protocol;
mod stage_worker;
mod supervisor;

pub use launcher::{WorkerLauncher, WorkerRole, FUNCTION_ENV, ROLE_ENV};
pub use supervisor::StageSupervisor;

use crate::executor::call_local;
use crate::logging::init_tracing;
use crate::queue::FrameWriter;
use crate::stage::FunctionRegistry;
use crate::task::TaskError;
use protocol::{PoolOutcome, PoolRequest, PoolResponse};
use serde_json::Value;
use std::process::ExitCode;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error, warn};

/// Runs this process as a worker when [`ROLE_ENV`] is set.
///
/// Installs a stderr `tracing` subscriber and a tokio runtime, serves the
/// requested role until stdin closes, and returns the exit code.
pub fn run_worker_if_requested(registry: &FunctionRegistry) -> Option<ExitCode> {
    let role = std::env::var(ROLE_ENV).ok()?;
    init_tracing("warn");

    let role = match role.parse::<WorkerRole>() {
        Ok(role) => role,
        Err(e) => {
            error!(error = %e, "Refusing to start worker");
            return Some(ExitCode::from(2));
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "Failed to build the worker runtime");
            return Some(ExitCode::FAILURE);
        }
    };

    let code = runtime.block_on(async {
        match role {
            WorkerRole::Stage => stage_worker::serve_stage(registry).await,
            WorkerRole::Pool => serve_pool(registry).await,
        }
    });
    Some(code)
}

fn request_id(line: &str) -> Option<u64> {
    serde_json::from_str::<Value>(line)
        .ok()?
        .get("id")
        .and_then(Value::as_u64)
}

/// Answers pool requests one at a time until stdin closes.
async fn serve_pool(registry: &FunctionRegistry) -> ExitCode {
    let name = match std::env::var(FUNCTION_ENV) {
        Ok(name) => name,
        Err(_) => {
            error!("{FUNCTION_ENV} is not set");
            return ExitCode::from(2);
        }
    };
    let function = match registry.resolve(&name) {
        Ok(function) => function,
        Err(e) => {
            error!(error = %e, "Pool worker cannot start");
            return ExitCode::from(2);
        }
    };

    let writer = FrameWriter::stdout();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    debug!(function = %name, "Pool worker ready");

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => return ExitCode::SUCCESS,
            Err(e) => {
                error!(error = %e, "Pool worker lost its input");
                return ExitCode::FAILURE;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<PoolRequest>(&line) {
            Ok(request) => PoolResponse {
                id: request.id,
                outcome: call_local(&function, request.task, true).await.into(),
            },
            Err(e) => match request_id(&line) {
                Some(id) => PoolResponse {
                    id,
                    outcome: PoolOutcome::Err(TaskError::serialization(e.to_string())),
                },
                None => {
                    warn!(error = %e, "Ignoring undecodable pool request");
                    continue;
                }
            },
        };

        if let Err(e) = writer.write(&response) {
            error!(error = %e, "Pool worker lost its output");
            return ExitCode::FAILURE;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_id() {
        assert_eq!(request_id(r#"{"id": 4, "task": 1}"#), Some(4));
        assert_eq!(request_id(r#"{"id": 5}"#), Some(5));
        assert_eq!(request_id("not json"), None);
    }
}
