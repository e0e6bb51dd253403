//! Locating and spawning the worker executable.

use crate::errors::WorkerError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::str::FromStr;
use tokio::process::{Child, Command};
use tracing::info;

/// Environment variable selecting the worker role.
pub const ROLE_ENV: &str = "TASKGRAPH_WORKER_ROLE";

/// Environment variable naming the function a pool worker runs.
pub const FUNCTION_ENV: &str = "TASKGRAPH_WORKER_FUNCTION";

/// What a worker process does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerRole {
    /// Runs one stage executor.
    Stage,
    /// Serves one function for a process pool.
    Pool,
}

impl WorkerRole {
    /// Returns the environment value for this role.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stage => "stage",
            Self::Pool => "pool",
        }
    }
}

impl fmt::Display for WorkerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkerRole {
    type Err = WorkerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "stage" => Ok(Self::Stage),
            "pool" => Ok(Self::Pool),
            other => Err(WorkerError::UnknownRole(other.to_string())),
        }
    }
}

/// The executable started for worker processes.
///
/// It must call [`run_worker_if_requested`](super::run_worker_if_requested)
/// first thing in `main` with a registry holding every function used by
/// process stages and process pools. Defaults to the current executable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerLauncher {
    /// Program path; `None` means the current executable.
    #[serde(default)]
    pub program: Option<PathBuf>,
    /// Extra arguments.
    #[serde(default)]
    pub args: Vec<String>,
}

impl WorkerLauncher {
    /// Launches the current executable.
    #[must_use]
    pub fn current_exe() -> Self {
        Self::default()
    }

    /// Launches `program`.
    #[must_use]
    pub fn program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: Some(program.into()),
            args: Vec::new(),
        }
    }

    /// Adds an argument.
    #[must_use]
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Returns the program that will be launched.
    pub fn resolve_program(&self) -> Result<PathBuf, WorkerError> {
        match &self.program {
            Some(program) => Ok(program.clone()),
            None => std::env::current_exe().map_err(|source| WorkerError::Spawn {
                program: "<current executable>".to_string(),
                source,
            }),
        }
    }

    /// Spawns a worker with piped stdin/stdout and inherited stderr.
    ///
    /// The child is killed if its handle is dropped.
    pub fn spawn(&self, role: WorkerRole, env: &[(&str, &str)]) -> Result<Child, WorkerError> {
        let program = self.resolve_program()?;

        let mut command = Command::new(&program);
        command
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .env(ROLE_ENV, role.as_str())
            .kill_on_drop(true);
        for (key, value) in env {
            command.env(key, value);
        }

        let child = command.spawn().map_err(|source| WorkerError::Spawn {
            program: program.display().to_string(),
            source,
        })?;

        info!(
            pid = child.id(),
            program = %program.display(),
            role = %role,
            "Spawned worker process"
        );
        Ok(child)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_round_trip() {
        assert_eq!("stage".parse::<WorkerRole>().unwrap(), WorkerRole::Stage);
        assert_eq!(WorkerRole::Pool.to_string(), "pool");
        assert!(matches!(
            "driver".parse::<WorkerRole>(),
            Err(WorkerError::UnknownRole(role)) if role == "driver"
        ));
    }

    #[test]
    fn test_default_is_current_exe() {
        let launcher = WorkerLauncher::default();
        assert!(launcher.program.is_none());
        assert!(launcher.resolve_program().is_ok());
    }

    #[tokio::test]
    async fn test_spawn_missing_program_fails() {
        let launcher = WorkerLauncher::program("/definitely/not/a/taskgraph/worker");
        let err = launcher.spawn(WorkerRole::Pool, &[]).unwrap_err();
        assert!(matches!(err, WorkerError::Spawn { .. }));
        assert!(err.to_string().contains("/definitely/not/a/taskgraph/worker"));
    }
}
