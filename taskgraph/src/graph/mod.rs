//! The graph runtime.
//!
//! A [`TaskGraph`] owns the root stage of a wired graph. [`TaskGraph::start`]
//! validates the topology, gives every stage an input queue shared by its
//! producers, runs one executor per stage (inline or under a worker-process
//! supervisor), seeds the requested stages and returns once every stage has
//! finalised. The result tables stay readable afterwards.
//!
//! # Example
//!
//! ```rust,ignore
//! use taskgraph::prelude::*;
//!
//! let a = Stage::new("A", StageFunction::blocking("add_one", |x| Ok(json!(x.as_i64().unwrap_or(0) + 1))));
//! let b = Stage::new("B", StageFunction::blocking("double", |x| Ok(json!(x.as_i64().unwrap_or(0) * 2))));
//! a.set_next(&[b]);
//!
//! let mut graph = TaskGraph::new(a);
//! graph.start_tree(vec![json!(1), json!(2)]).await?;
//! println!("{:?}", graph.final_results().values(&json!(1)));
//! ```

mod fallback;
mod methods;
mod results;
mod runtime;
mod snapshot;
mod stop;
mod topology;

pub use fallback::{load_errors_by_kind, load_errors_by_stage};
pub use methods::{MethodReport, MethodTiming, ALL_MODES};
pub use results::{FinalResults, Terminal};
pub use snapshot::{snapshot_all, StageSnapshot};
pub use stop::StopHandle;
pub use topology::{collect_stages, find_cycle, structure_lines};

use crate::config::GraphConfig;
use crate::errors::{TaskGraphError, TopologyError};
use crate::stage::{ExecutionMode, Stage, StageCounts, StageMode, StageState};
use crate::task::{FailRecord, TaskError};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Initial tasks keyed by stage tag.
pub type Seeds = HashMap<String, Vec<Value>>;

/// Summary of one finished run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    /// Unique id of the run.
    pub run_id: Uuid,
    /// Wall time from validation to teardown.
    pub duration: Duration,
    /// Final counters per stage tag.
    pub counts: BTreeMap<String, StageCounts>,
}

#[derive(Debug, Default)]
struct LastRun {
    results: FinalResults,
    failed_initial: Vec<Value>,
    fail_records: Vec<FailRecord>,
    realtime_path: Option<PathBuf>,
}

/// A wired stage graph and the tables of its last run.
pub struct TaskGraph {
    root: Stage,
    config: GraphConfig,
    stop: StopHandle,
    stages: Vec<Stage>,
    last: LastRun,
}

impl TaskGraph {
    /// Creates a runtime for the graph below `root` with default settings.
    #[must_use]
    pub fn new(root: Stage) -> Self {
        Self::with_config(root, GraphConfig::default())
    }

    /// Creates a runtime with `config`.
    #[must_use]
    pub fn with_config(root: Stage, config: GraphConfig) -> Self {
        let stages = collect_stages(&root);
        Self {
            root,
            config,
            stop: StopHandle::new(),
            stages,
            last: LastRun::default(),
        }
    }

    /// Returns the root stage.
    #[must_use]
    pub fn root(&self) -> &Stage {
        &self.root
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    /// Returns a handle that stops the current or next run.
    #[must_use]
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Applies the same stage and execution modes to every stage.
    pub fn set_graph_mode(&self, stage_mode: StageMode, execution_mode: ExecutionMode) {
        for stage in collect_stages(&self.root) {
            stage.set_stage_mode(stage_mode);
            stage.set_execution_mode(execution_mode);
        }
    }

    /// Runs the graph with `seeds` and waits until every stage finalised.
    ///
    /// The root is always seeded, with nothing when `seeds` has no entry for
    /// it. Seeds on other stages are accepted for partial re-runs. Task
    /// failures never fail the run; topology problems and lost queues do.
    pub async fn start(&mut self, seeds: Seeds) -> Result<RunSummary, TaskGraphError> {
        self.stop.reset();
        self.stages = collect_stages(&self.root);
        self.last = LastRun::default();

        let report = runtime::run(&self.root, &self.config, &self.stop, seeds).await?;
        self.last = LastRun {
            results: report.walked.results,
            failed_initial: report.walked.failed_initial,
            fail_records: report.fail_records,
            realtime_path: report.realtime_path,
        };

        Ok(RunSummary {
            run_id: Uuid::new_v4(),
            duration: report.duration,
            counts: report.counts,
        })
    }

    /// Runs the graph with `tasks` seeded on the root.
    pub async fn start_tree(&mut self, tasks: Vec<Value>) -> Result<RunSummary, TaskGraphError> {
        let seeds = Seeds::from([(self.root.tag(), tasks)]);
        self.start(seeds).await
    }

    /// Terminal outcomes per initial task.
    #[must_use]
    pub fn final_results(&self) -> &FinalResults {
        &self.last.results
    }

    /// Initial tasks with at least one path ending in an error.
    #[must_use]
    pub fn failed_initial_tasks(&self) -> &[Value] {
        &self.last.failed_initial
    }

    /// Every fail record of the last run, in arrival order.
    #[must_use]
    pub fn fail_records(&self) -> &[FailRecord] {
        &self.last.fail_records
    }

    /// Path of the realtime error file, when fallback files are enabled.
    #[must_use]
    pub fn realtime_errors_path(&self) -> Option<&Path> {
        self.last.realtime_path.as_deref()
    }

    /// Failed tasks per stage tag.
    #[must_use]
    pub fn errors_by_stage(&self) -> BTreeMap<String, Vec<(Value, TaskError)>> {
        results::errors_by_stage(&self.stages)
    }

    /// Failed tasks grouped by `(error_info, stage_tag)`.
    #[must_use]
    pub fn errors_by_kind(&self) -> BTreeMap<(String, String), Vec<Value>> {
        results::errors_by_kind(&self.stages)
    }

    /// Fail records grouped by `(error_kind, stage_tag)`, oldest first.
    #[must_use]
    pub fn fail_timeline(&self) -> BTreeMap<(String, String), Vec<(Value, f64)>> {
        results::fail_timeline(&self.last.fail_records)
    }

    /// Returns the tables of the stage tagged `tag`.
    #[must_use]
    pub fn stage_state(&self, tag: &str) -> Option<Arc<StageState>> {
        self.stages
            .iter()
            .find(|s| s.tag() == tag)
            .map(Stage::state)
    }

    /// Stages in breadth-first order.
    #[must_use]
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// The boxed tree drawing of the graph.
    #[must_use]
    pub fn structure_lines(&self) -> Vec<String> {
        structure_lines(&self.root)
    }

    /// Current progress of every stage.
    #[must_use]
    pub fn status(&self) -> Vec<StageSnapshot> {
        snapshot_all(&self.stages)
    }
}

impl std::fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGraph")
            .field("root", &self.root.tag())
            .field("stages", &self.stages.len())
            .finish_non_exhaustive()
    }
}

/// A linear graph with stages named `Stage 1` to `Stage n`.
pub struct TaskChain;

impl TaskChain {
    /// Wires `stages` in order and returns the runtime.
    ///
    /// Each stage is renamed by position. Fails when `stages` is empty.
    pub fn new(stages: Vec<Stage>) -> Result<TaskGraph, TaskGraphError> {
        Self::with_config(stages, GraphConfig::default())
    }

    /// Like [`TaskChain::new`] with `config`.
    pub fn with_config(stages: Vec<Stage>, config: GraphConfig) -> Result<TaskGraph, TaskGraphError> {
        let renamed: Vec<Stage> = stages
            .iter()
            .enumerate()
            .map(|(i, stage)| stage.renamed(format!("Stage {}", i + 1)))
            .collect();
        for pair in renamed.windows(2) {
            pair[0].set_next(&[pair[1].clone()]);
        }
        let root = renamed
            .into_iter()
            .next()
            .ok_or_else(|| TopologyError::new("A task chain needs at least one stage"))?;
        Ok(TaskGraph::with_config(root, config))
    }
}
