//! Stages: graph nodes wrapping a user function and its policy.
//!
//! A [`Stage`] is a cheap-clone handle. Forward edges are strong, reverse
//! edges (`prev_stages`) are weak, so dropping the root drops an acyclic
//! graph.

mod function;
mod retry;
mod state;

pub use function::{FunctionBody, FunctionRegistry, StageFunction, TaskFuture};
pub use retry::{BackoffStrategy, JitterStrategy, RetryDecision, RetryPolicy};
pub use state::{StageCounts, StageState, StageStatus};

use crate::task::DEFAULT_MAX_INFO;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

/// How a stage runs its user function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// One task at a time.
    #[default]
    Sequential,
    /// Up to `worker_limit` tasks on the blocking thread pool.
    Threads,
    /// Up to `worker_limit` worker processes.
    Processes,
    /// Up to `worker_limit` futures polled cooperatively.
    Async,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Sequential => "sequential",
            Self::Threads => "threads",
            Self::Processes => "processes",
            Self::Async => "async",
        };
        f.write_str(text)
    }
}

/// Where a stage's executor lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageMode {
    /// In the process running the graph.
    #[default]
    Inline,
    /// In a dedicated worker process.
    Process,
}

impl fmt::Display for StageMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inline => f.write_str("inline"),
            Self::Process => f.write_str("process"),
        }
    }
}

/// Whether results are forwarded whole or split into items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// One result per task.
    #[default]
    Standard,
    /// Each result is a sequence; every element goes downstream on its own.
    Splitter,
}

/// Policy knobs of one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSettings {
    /// Dispatcher.
    #[serde(default)]
    pub execution_mode: ExecutionMode,
    /// Maximum tasks in flight for the parallel modes.
    #[serde(default = "default_worker_limit")]
    pub worker_limit: usize,
    /// Inline or dedicated process.
    #[serde(default)]
    pub stage_mode: StageMode,
    /// Retry classifier and budget.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Width of task and result text in log lines.
    #[serde(default = "default_max_info")]
    pub max_info: usize,
    /// Draw a terminal progress bar for this stage.
    #[serde(default)]
    pub show_progress: bool,
}

fn default_worker_limit() -> usize {
    50
}

fn default_max_info() -> usize {
    DEFAULT_MAX_INFO
}

impl Default for StageSettings {
    fn default() -> Self {
        Self {
            execution_mode: ExecutionMode::default(),
            worker_limit: default_worker_limit(),
            stage_mode: StageMode::default(),
            retry: RetryPolicy::default(),
            max_info: default_max_info(),
            show_progress: false,
        }
    }
}

impl StageSettings {
    /// Maximum tasks in flight under the configured mode.
    #[must_use]
    pub fn concurrency(&self) -> usize {
        match self.execution_mode {
            ExecutionMode::Sequential => 1,
            _ => self.worker_limit.max(1),
        }
    }
}

/// Splits a splitter result into downstream items.
///
/// An array yields its elements; any other value, a string included, is a
/// single item.
#[must_use]
pub fn split_result(result: Value) -> Vec<Value> {
    match result {
        Value::Array(items) => items,
        other => vec![other],
    }
}

struct StageInner {
    name: String,
    function: StageFunction,
    kind: StageKind,
    settings: RwLock<StageSettings>,
    next: RwLock<Vec<Stage>>,
    prev: RwLock<Vec<Weak<StageInner>>>,
    state: Arc<StageState>,
}

/// A node of the task graph.
#[derive(Clone)]
pub struct Stage {
    inner: Arc<StageInner>,
}

impl Stage {
    /// Creates a standard stage.
    pub fn new(name: impl Into<String>, function: StageFunction) -> Self {
        Self::with_kind(name.into(), function, StageKind::Standard)
    }

    /// Creates a splitter stage. Splitters always run sequentially.
    pub fn splitter(name: impl Into<String>, function: StageFunction) -> Self {
        Self::with_kind(name.into(), function, StageKind::Splitter)
    }

    /// Creates a splitter that forwards the elements of each array task.
    pub fn identity_splitter(name: impl Into<String>) -> Self {
        Self::splitter(name, StageFunction::identity())
    }

    fn with_kind(name: String, function: StageFunction, kind: StageKind) -> Self {
        let mut settings = StageSettings::default();
        if kind == StageKind::Splitter {
            settings.worker_limit = 1;
        }
        Self {
            inner: Arc::new(StageInner {
                name,
                function,
                kind,
                settings: RwLock::new(settings),
                next: RwLock::new(Vec::new()),
                prev: RwLock::new(Vec::new()),
                state: Arc::new(StageState::new()),
            }),
        }
    }

    /// Rebuilds a stage from its parts, e.g. inside a worker process.
    pub(crate) fn from_parts(
        name: String,
        function: StageFunction,
        kind: StageKind,
        settings: StageSettings,
    ) -> Self {
        let stage = Self::with_kind(name, function, kind);
        *stage.inner.settings.write() = settings;
        stage
    }

    /// Returns an unwired copy named `name`, with fresh tables.
    #[must_use]
    pub fn renamed(&self, name: impl Into<String>) -> Self {
        Self::from_parts(name.into(), self.function().clone(), self.kind(), self.settings())
    }

    /// Sets the dispatcher. Ignored for splitters.
    #[must_use]
    pub fn with_execution_mode(self, mode: ExecutionMode) -> Self {
        self.set_execution_mode(mode);
        self
    }

    /// Sets the maximum tasks in flight. Ignored for splitters.
    #[must_use]
    pub fn with_worker_limit(self, limit: usize) -> Self {
        if !self.is_splitter() {
            self.inner.settings.write().worker_limit = limit.max(1);
        }
        self
    }

    /// Sets the retry budget.
    #[must_use]
    pub fn with_max_retries(self, max_retries: u32) -> Self {
        self.inner.settings.write().retry.max_retries = max_retries;
        self
    }

    /// Sets where the executor runs.
    #[must_use]
    pub fn with_stage_mode(self, mode: StageMode) -> Self {
        self.set_stage_mode(mode);
        self
    }

    /// Delays retries by a backoff computed from `base_delay`.
    #[must_use]
    pub fn with_retry_backoff(self, base_delay: Duration, strategy: BackoffStrategy) -> Self {
        {
            let mut settings = self.inner.settings.write();
            settings.retry = settings.retry.clone().with_backoff(base_delay, strategy);
        }
        self
    }

    /// Replaces the whole retry policy.
    #[must_use]
    pub fn with_retry_policy(self, policy: RetryPolicy) -> Self {
        self.inner.settings.write().retry = policy;
        self
    }

    /// Sets the width of task text in log lines.
    #[must_use]
    pub fn with_max_info(self, max_info: usize) -> Self {
        self.inner.settings.write().max_info = max_info;
        self
    }

    /// Shows a progress bar while the stage runs.
    #[must_use]
    pub fn with_show_progress(self, show: bool) -> Self {
        self.inner.settings.write().show_progress = show;
        self
    }

    /// Sets the dispatcher in place. Ignored for splitters.
    pub fn set_execution_mode(&self, mode: ExecutionMode) {
        if !self.is_splitter() {
            self.inner.settings.write().execution_mode = mode;
        }
    }

    /// Sets where the executor runs, in place.
    pub fn set_stage_mode(&self, mode: StageMode) {
        self.inner.settings.write().stage_mode = mode;
    }

    /// Extends the retry classifier.
    pub fn add_retry_exceptions<I, S>(&self, kinds: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inner.settings.write().retry.add_kinds(kinds);
    }

    /// Wires the outgoing edges, replacing previous ones. Reverse pointers
    /// of old and new downstream stages are updated.
    pub fn set_next(&self, next: &[Self]) {
        let old = std::mem::replace(&mut *self.inner.next.write(), next.to_vec());
        for stage in &old {
            stage
                .inner
                .prev
                .write()
                .retain(|p| p.upgrade().map_or(false, |p| !Arc::ptr_eq(&p, &self.inner)));
        }
        for stage in next {
            stage.inner.prev.write().push(Arc::downgrade(&self.inner));
        }
    }

    /// Returns the downstream stages.
    #[must_use]
    pub fn next_stages(&self) -> Vec<Self> {
        self.inner.next.read().clone()
    }

    /// Returns the upstream stages still alive.
    #[must_use]
    pub fn prev_stages(&self) -> Vec<Self> {
        self.inner
            .prev
            .read()
            .iter()
            .filter_map(Weak::upgrade)
            .map(|inner| Self { inner })
            .collect()
    }

    /// Returns the stage name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Returns `"<name>[<function name>]"`, the stage's identity in seeds,
    /// results and fail records.
    #[must_use]
    pub fn tag(&self) -> String {
        format!("{}[{}]", self.inner.name, self.inner.function.name())
    }

    /// Returns the user function.
    #[must_use]
    pub fn function(&self) -> &StageFunction {
        &self.inner.function
    }

    /// Returns the stage kind.
    #[must_use]
    pub fn kind(&self) -> StageKind {
        self.inner.kind
    }

    /// Returns true for splitters.
    #[must_use]
    pub fn is_splitter(&self) -> bool {
        self.inner.kind == StageKind::Splitter
    }

    /// Returns a copy of the settings.
    #[must_use]
    pub fn settings(&self) -> StageSettings {
        self.inner.settings.read().clone()
    }

    /// Returns the stage's tables and counters.
    #[must_use]
    pub fn state(&self) -> Arc<StageState> {
        self.inner.state.clone()
    }

    /// Returns true if both handles point at the same stage.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Identity usable as a map key for the lifetime of the stage.
    #[must_use]
    pub fn id(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }
}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("tag", &self.tag())
            .field("kind", &self.inner.kind)
            .field("next", &self.inner.next.read().iter().map(Self::tag).collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn stage(name: &str) -> Stage {
        Stage::new(name, StageFunction::identity())
    }

    #[test]
    fn test_tag() {
        let s = Stage::new("fetch", StageFunction::named("get_page"));
        assert_eq!(s.tag(), "fetch[get_page]");
    }

    #[test]
    fn test_set_next_maintains_reverse_pointers() {
        let a = stage("a");
        let b = stage("b");
        let c = stage("c");

        a.set_next(&[b.clone(), c.clone()]);
        assert_eq!(a.next_stages().len(), 2);
        assert!(b.prev_stages()[0].ptr_eq(&a));
        assert!(c.prev_stages()[0].ptr_eq(&a));

        a.set_next(&[c.clone()]);
        assert!(b.prev_stages().is_empty());
        assert_eq!(c.prev_stages().len(), 1);
    }

    #[test]
    fn test_splitter_is_always_sequential() {
        let s = Stage::identity_splitter("split")
            .with_execution_mode(ExecutionMode::Threads)
            .with_worker_limit(8);
        let settings = s.settings();
        assert_eq!(settings.execution_mode, ExecutionMode::Sequential);
        assert_eq!(settings.concurrency(), 1);
        assert!(s.is_splitter());
    }

    #[test]
    fn test_builder_settings() {
        let s = stage("a")
            .with_execution_mode(ExecutionMode::Threads)
            .with_worker_limit(4)
            .with_max_retries(1)
            .with_stage_mode(StageMode::Process);
        s.add_retry_exceptions(["ValueError"]);

        let settings = s.settings();
        assert_eq!(settings.concurrency(), 4);
        assert_eq!(settings.retry.max_retries, 1);
        assert_eq!(settings.stage_mode, StageMode::Process);
        assert!(settings.retry.retryable_kinds.contains("ValueError"));
    }

    #[test]
    fn test_split_result() {
        assert_eq!(split_result(json!([1, 2])), vec![json!(1), json!(2)]);
        assert_eq!(split_result(json!("abc")), vec![json!("abc")]);
        assert!(split_result(json!([])).is_empty());
    }

    #[test]
    fn test_settings_serde_defaults() {
        let settings: StageSettings = serde_json::from_str(r#"{"execution_mode":"async"}"#).unwrap();
        assert_eq!(settings.execution_mode, ExecutionMode::Async);
        assert_eq!(settings.worker_limit, 50);
        assert_eq!(settings.max_info, DEFAULT_MAX_INFO);
    }
}
