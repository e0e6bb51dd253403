//! # Taskgraph
//!
//! A concurrent task-graph execution engine.
//!
//! Stages wrap a user function and are wired into a directed acyclic graph.
//! Tasks flow along the edges as JSON values; every stage drains its own input
//! queue with its own executor and forwards results downstream. Taskgraph
//! provides:
//!
//! - **Execution modes**: sequential, blocking thread pool, cooperative async
//!   futures, or a pool of worker processes
//! - **Process isolation**: any stage can run in a dedicated worker process
//! - **Retries**: per-stage classifier, budget and backoff
//! - **Splitters and fan-out**: one task becomes many, one result feeds many
//! - **Result tables**: final results per initial task, failures by stage and
//!   by kind, realtime error dumps for partial re-runs
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use taskgraph::prelude::*;
//!
//! let add_one = Stage::new("A", StageFunction::blocking("add_one", |x| Ok(json!(x.as_i64().unwrap_or(0) + 1))))
//!     .with_execution_mode(ExecutionMode::Threads)
//!     .with_worker_limit(4);
//! let double = Stage::new("B", StageFunction::blocking("double", |x| Ok(json!(x.as_i64().unwrap_or(0) * 2))));
//! add_one.set_next(&[double]);
//!
//! let mut graph = TaskGraph::new(add_one);
//! graph.start_tree(vec![json!(1), json!(2), json!(3)]).await?;
//! for (task, terminals) in graph.final_results().iter() {
//!     println!("{task}: {terminals:?}");
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod config;
pub mod errors;
pub mod executor;
pub mod graph;
pub mod logging;
pub mod progress;
pub mod queue;
pub mod stage;
pub mod task;
pub mod testing;
pub mod worker;

#[cfg(feature = "reporter")]
pub mod reporter;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{GraphConfig, ReporterConfig};
    pub use crate::errors::{
        CycleDetectedError, QueueError, TaskGraphError, TopologyError, WorkerError,
    };
    pub use crate::graph::{
        load_errors_by_kind, load_errors_by_stage, FinalResults, MethodReport, RunSummary, Seeds,
        StageSnapshot, StopHandle, TaskChain, TaskGraph, Terminal,
    };
    pub use crate::logging::{init_tracing, LogLevel};
    pub use crate::stage::{
        BackoffStrategy, ExecutionMode, FunctionRegistry, RetryPolicy, Stage, StageCounts,
        StageFunction, StageMode, StageStatus,
    };
    pub use crate::task::{kinds, FailRecord, TaskError, TaskKey};
    pub use crate::worker::{run_worker_if_requested, WorkerLauncher};
    pub use serde_json::{json, Value};
}
