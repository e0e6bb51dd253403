//! Running the same tasks under every mode combination and comparing them.

use super::{FinalResults, TaskGraph};
use crate::errors::TaskGraphError;
use crate::stage::{ExecutionMode, StageMode};
use crate::task::TaskKey;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::time::Instant;
use tracing::info;

/// Every stage mode paired with every execution mode.
pub const ALL_MODES: [(StageMode, ExecutionMode); 8] = [
    (StageMode::Inline, ExecutionMode::Sequential),
    (StageMode::Inline, ExecutionMode::Threads),
    (StageMode::Inline, ExecutionMode::Processes),
    (StageMode::Inline, ExecutionMode::Async),
    (StageMode::Process, ExecutionMode::Sequential),
    (StageMode::Process, ExecutionMode::Threads),
    (StageMode::Process, ExecutionMode::Processes),
    (StageMode::Process, ExecutionMode::Async),
];

/// Wall time of one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MethodTiming {
    /// Stage mode applied to every stage.
    pub stage_mode: StageMode,
    /// Execution mode applied to every stage.
    pub execution_mode: ExecutionMode,
    /// Seconds from seeding to teardown.
    pub elapsed_secs: f64,
}

/// Timings and merged result tables of a mode comparison.
///
/// Tables are merged run after run; an entry from a later run replaces the
/// same entry from an earlier one.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MethodReport {
    /// One row per mode pair, in run order.
    pub timings: Vec<MethodTiming>,
    /// Terminal outcomes per initial task.
    pub final_results: FinalResults,
    /// Failed tasks keyed by stage tag, then by error info.
    pub errors: BTreeMap<String, BTreeMap<String, Vec<Value>>>,
    /// Fail records keyed by stage tag, then by error kind.
    pub fails: BTreeMap<String, BTreeMap<String, Vec<(Value, f64)>>>,
    /// Initial tasks that failed in any run, first occurrence kept.
    pub failed_tasks: Vec<Value>,
    #[serde(skip)]
    failed_keys: HashSet<TaskKey>,
}

impl MethodReport {
    /// Returns the wall time measured for a mode pair.
    #[must_use]
    pub fn elapsed(&self, stage_mode: StageMode, execution_mode: ExecutionMode) -> Option<f64> {
        self.timings
            .iter()
            .find(|t| t.stage_mode == stage_mode && t.execution_mode == execution_mode)
            .map(|t| t.elapsed_secs)
    }

    fn absorb(&mut self, graph: &TaskGraph) {
        for (task, terminals) in graph.final_results().iter() {
            self.final_results.insert(task.clone(), terminals.to_vec());
        }
        for ((info, stage), tasks) in graph.errors_by_kind() {
            self.errors.entry(stage).or_default().insert(info, tasks);
        }
        for ((kind, stage), timeline) in graph.fail_timeline() {
            self.fails.entry(stage).or_default().insert(kind, timeline);
        }
        for task in graph.failed_initial_tasks() {
            if self.failed_keys.insert(TaskKey::of(task)) {
                self.failed_tasks.push(task.clone());
            }
        }
    }
}

impl TaskGraph {
    /// Runs `tasks` once for every pair in [`ALL_MODES`].
    ///
    /// Stages keep the modes of the last pair afterwards. Dedicated-process
    /// and process-pool runs need a worker launcher in the configuration.
    pub async fn test_methods(&mut self, tasks: Vec<Value>) -> Result<MethodReport, TaskGraphError> {
        self.test_modes(tasks, &ALL_MODES).await
    }

    /// Runs `tasks` once per mode pair in `modes`, timing each run and
    /// merging its tables into the report.
    pub async fn test_modes(
        &mut self,
        tasks: Vec<Value>,
        modes: &[(StageMode, ExecutionMode)],
    ) -> Result<MethodReport, TaskGraphError> {
        let mut report = MethodReport::default();
        for &(stage_mode, execution_mode) in modes {
            self.set_graph_mode(stage_mode, execution_mode);
            let started = Instant::now();
            self.start_tree(tasks.clone()).await?;
            let elapsed_secs = started.elapsed().as_secs_f64();
            info!(%stage_mode, %execution_mode, elapsed_secs, "Timed graph run");

            report.timings.push(MethodTiming {
                stage_mode,
                execution_mode,
                elapsed_secs,
            });
            report.absorb(self);
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GraphConfig;
    use crate::graph::TaskChain;
    use crate::stage::{Stage, StageFunction};
    use crate::task::TaskError;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const INLINE_MODES: [(StageMode, ExecutionMode); 3] = [
        (StageMode::Inline, ExecutionMode::Sequential),
        (StageMode::Inline, ExecutionMode::Threads),
        (StageMode::Inline, ExecutionMode::Async),
    ];

    fn chain(dir: &std::path::Path) -> TaskGraph {
        let add_one = StageFunction::blocking("add_one", |v: Value| Ok(json!(v.as_i64().unwrap_or(0) + 1)));
        let halve = StageFunction::blocking("halve", |v: Value| match v.as_i64() {
            Some(n) if n % 2 == 0 => Ok(json!(n / 2)),
            _ => Err(TaskError::new("ValueError", format!("{v} is odd"))),
        });
        TaskChain::with_config(
            vec![Stage::new("A", add_one), Stage::new("B", halve)],
            GraphConfig::new().with_log_dir(dir.join("logs")),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_modes_time_and_merge_every_run() {
        let dir = tempfile::tempdir().unwrap();
        let mut graph = chain(dir.path());

        let report = graph
            .test_modes(vec![json!(1), json!(2), json!(3)], &INLINE_MODES)
            .await
            .unwrap();

        assert_eq!(report.timings.len(), 3);
        for (stage_mode, execution_mode) in INLINE_MODES {
            assert!(report.elapsed(stage_mode, execution_mode).is_some());
        }
        assert_eq!(report.elapsed(StageMode::Process, ExecutionMode::Sequential), None);

        assert_eq!(report.final_results.len(), 3);
        assert_eq!(
            report.final_results.values(&json!(3)),
            vec![(json!(2), "Stage 2[halve]".to_string())]
        );
        assert_eq!(report.failed_tasks, vec![json!(2)]);
        assert_eq!(
            report.errors["Stage 2[halve]"].values().cloned().collect::<Vec<_>>(),
            vec![vec![json!(3)]]
        );
        let timeline = &report.fails["Stage 2[halve]"]["ValueError"];
        assert_eq!(timeline.len(), 1);
        assert_eq!(timeline[0].0, json!(3));

        for stage in graph.stages() {
            assert_eq!(stage.settings().execution_mode, ExecutionMode::Async);
        }
    }

    #[tokio::test]
    async fn test_report_serializes_to_json() {
        let dir = tempfile::tempdir().unwrap();
        let mut graph = chain(dir.path());

        let report = graph
            .test_modes(vec![json!(1)], &INLINE_MODES[..1])
            .await
            .unwrap();
        let value = serde_json::to_value(&report).unwrap();

        assert_eq!(value["timings"][0]["stage_mode"], json!(report.timings[0].stage_mode));
        assert_eq!(value["final_results"][0]["task"], json!(1));
        assert_eq!(value["final_results"][0]["terminals"][0]["stage"], json!("Stage 2[halve]"));
        assert_eq!(value["failed_tasks"], json!([]));
        assert!(value.get("failed_keys").is_none());
    }
}
