//! Per-stage result tables and counters.

use crate::task::{TaskError, TaskKey};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Lifecycle of a stage within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StageStatus {
    /// The executor has not started.
    #[default]
    NotStarted,
    /// The executor is draining its input.
    Running,
    /// The executor finalised or its worker process went away.
    Stopped,
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::NotStarted => "not-started",
            Self::Running => "running",
            Self::Stopped => "stopped",
        };
        f.write_str(text)
    }
}

/// Point-in-time copy of a stage's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StageCounts {
    /// Tasks recorded in `success`.
    pub processed: u64,
    /// Tasks recorded in `errors`.
    pub failed: u64,
    /// Tasks skipped as duplicates.
    pub duplicates: u64,
    /// Retries scheduled.
    pub retried: u64,
    /// Items emitted by splitting.
    pub split_output_count: u64,
    /// Items put on the output edge, duplicate copies included.
    pub emitted: u64,
    /// Tasks placed on the input by the driver.
    pub seeded: u64,
}

impl StageCounts {
    /// Tasks that reached a final outcome, duplicates included.
    #[must_use]
    pub fn handled(&self) -> u64 {
        self.processed + self.failed + self.duplicates
    }
}

/// Tables and counters owned by one stage's executor.
///
/// The tables are keyed by [`TaskKey`]; `tasks` is the side table mapping
/// each key back to the value it was computed from. Everything is reset
/// when a run starts and stays readable after it ends.
#[derive(Default)]
pub struct StageState {
    tasks: DashMap<TaskKey, Value>,
    success: DashMap<TaskKey, Value>,
    errors: DashMap<TaskKey, TaskError>,
    retry_counts: DashMap<TaskKey, u32>,

    processed: AtomicU64,
    failed: AtomicU64,
    duplicates: AtomicU64,
    retried: AtomicU64,
    split_output_count: AtomicU64,
    emitted: AtomicU64,
    seeded: AtomicU64,

    status: RwLock<StageStatus>,
    stop_reason: RwLock<Option<String>>,
    started_at: RwLock<Option<Instant>>,
    finished_at: RwLock<Option<Instant>>,
}

impl StageState {
    /// Creates empty state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Clears every table and counter.
    pub fn reset(&self) {
        self.tasks.clear();
        self.success.clear();
        self.errors.clear();
        self.retry_counts.clear();
        for counter in [
            &self.processed,
            &self.failed,
            &self.duplicates,
            &self.retried,
            &self.split_output_count,
            &self.emitted,
            &self.seeded,
        ] {
            counter.store(0, Ordering::SeqCst);
        }
        *self.status.write() = StageStatus::NotStarted;
        *self.stop_reason.write() = None;
        *self.started_at.write() = None;
        *self.finished_at.write() = None;
    }

    /// Marks the stage running.
    pub fn mark_running(&self) {
        *self.started_at.write() = Some(Instant::now());
        *self.status.write() = StageStatus::Running;
    }

    /// Marks the stage stopped, with a reason when it did not finalise
    /// normally.
    pub fn mark_stopped(&self, reason: Option<String>) {
        *self.finished_at.write() = Some(Instant::now());
        if reason.is_some() {
            *self.stop_reason.write() = reason;
        }
        *self.status.write() = StageStatus::Stopped;
    }

    /// Remembers the value behind a key.
    pub fn remember(&self, key: &TaskKey, task: &Value) {
        if !self.tasks.contains_key(key) {
            self.tasks.insert(key.clone(), task.clone());
        }
    }

    /// Records a result.
    pub fn record_success(&self, key: &TaskKey, task: &Value, result: Value) {
        self.remember(key, task);
        self.success.insert(key.clone(), result);
        self.processed.fetch_add(1, Ordering::SeqCst);
    }

    /// Records a terminal failure.
    pub fn record_failure(&self, key: &TaskKey, task: &Value, error: TaskError) {
        self.remember(key, task);
        self.errors.insert(key.clone(), error);
        self.failed.fetch_add(1, Ordering::SeqCst);
    }

    /// Records one more retry and returns the new count.
    pub fn record_retry(&self, key: &TaskKey) -> u32 {
        let mut entry = self.retry_counts.entry(key.clone()).or_insert(0);
        *entry += 1;
        self.retried.fetch_add(1, Ordering::SeqCst);
        *entry
    }

    /// Overwrites the retry count, used when mirroring a worker process.
    pub fn set_retry_count(&self, key: &TaskKey, count: u32) {
        let previous = self.retry_counts.insert(key.clone(), count).unwrap_or(0);
        if count > previous {
            self.retried
                .fetch_add(u64::from(count - previous), Ordering::SeqCst);
        }
    }

    /// Counts a duplicate.
    pub fn record_duplicate(&self) {
        self.duplicates.fetch_add(1, Ordering::SeqCst);
    }

    /// Counts items emitted by splitting.
    pub fn add_split_outputs(&self, count: u64) {
        self.split_output_count.fetch_add(count, Ordering::SeqCst);
    }

    /// Counts items put on the output edge.
    pub fn add_emitted(&self, count: u64) {
        self.emitted.fetch_add(count, Ordering::SeqCst);
    }

    /// Counts tasks placed on the input by the driver.
    pub fn add_seeded(&self, count: u64) {
        self.seeded.fetch_add(count, Ordering::SeqCst);
    }

    /// Returns the result recorded for a task.
    #[must_use]
    pub fn success(&self, key: &TaskKey) -> Option<Value> {
        self.success.get(key).map(|r| r.value().clone())
    }

    /// Returns the terminal error recorded for a task.
    #[must_use]
    pub fn error(&self, key: &TaskKey) -> Option<TaskError> {
        self.errors.get(key).map(|r| r.value().clone())
    }

    /// Returns true if the task reached a final outcome.
    #[must_use]
    pub fn is_settled(&self, key: &TaskKey) -> bool {
        self.success.contains_key(key) || self.errors.contains_key(key)
    }

    /// Returns how often a task was retried.
    #[must_use]
    pub fn retry_count(&self, key: &TaskKey) -> u32 {
        self.retry_counts.get(key).map_or(0, |r| *r.value())
    }

    /// Returns the value behind a key.
    #[must_use]
    pub fn task(&self, key: &TaskKey) -> Option<Value> {
        self.tasks
            .get(key)
            .map(|r| r.value().clone())
            .or_else(|| key.to_value())
    }

    /// Returns every (task, result) pair, ordered by key.
    #[must_use]
    pub fn successes(&self) -> Vec<(Value, Value)> {
        let mut entries: Vec<(TaskKey, Value)> = self
            .success
            .iter()
            .map(|r| (r.key().clone(), r.value().clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
            .into_iter()
            .filter_map(|(key, result)| self.task(&key).map(|task| (task, result)))
            .collect()
    }

    /// Returns every (task, error) pair, ordered by key.
    #[must_use]
    pub fn failures(&self) -> Vec<(Value, TaskError)> {
        let mut entries: Vec<(TaskKey, TaskError)> = self
            .errors
            .iter()
            .map(|r| (r.key().clone(), r.value().clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
            .into_iter()
            .filter_map(|(key, error)| self.task(&key).map(|task| (task, error)))
            .collect()
    }

    /// Returns a copy of the counters.
    #[must_use]
    pub fn counts(&self) -> StageCounts {
        StageCounts {
            processed: self.processed.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            duplicates: self.duplicates.load(Ordering::SeqCst),
            retried: self.retried.load(Ordering::SeqCst),
            split_output_count: self.split_output_count.load(Ordering::SeqCst),
            emitted: self.emitted.load(Ordering::SeqCst),
            seeded: self.seeded.load(Ordering::SeqCst),
        }
    }

    /// Returns the current status.
    #[must_use]
    pub fn status(&self) -> StageStatus {
        *self.status.read()
    }

    /// Returns why the stage stopped abnormally.
    #[must_use]
    pub fn stop_reason(&self) -> Option<String> {
        self.stop_reason.read().clone()
    }

    /// Returns the time spent running, up to now if still running.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        let Some(started) = *self.started_at.read() else {
            return Duration::ZERO;
        };
        match *self.finished_at.read() {
            Some(finished) => finished.saturating_duration_since(started),
            None => started.elapsed(),
        }
    }
}

impl fmt::Debug for StageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageState")
            .field("status", &self.status())
            .field("counts", &self.counts())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_and_reset() {
        let state = StageState::new();
        let task = json!(1);
        let key = TaskKey::of(&task);

        state.record_success(&key, &task, json!(2));
        state.record_duplicate();
        assert_eq!(state.success(&key), Some(json!(2)));
        assert!(state.is_settled(&key));
        assert_eq!(state.counts().processed, 1);
        assert_eq!(state.counts().handled(), 2);

        state.reset();
        assert!(state.success(&key).is_none());
        assert_eq!(state.counts(), StageCounts::default());
        assert_eq!(state.status(), StageStatus::NotStarted);
    }

    #[test]
    fn test_retry_counts() {
        let state = StageState::new();
        let key = TaskKey::of(&json!(7));
        assert_eq!(state.record_retry(&key), 1);
        assert_eq!(state.record_retry(&key), 2);
        assert_eq!(state.retry_count(&key), 2);
        assert_eq!(state.counts().retried, 2);

        let other = TaskKey::of(&json!(8));
        state.set_retry_count(&other, 3);
        assert_eq!(state.retry_count(&other), 3);
        assert_eq!(state.counts().retried, 5);
    }

    #[test]
    fn test_failures_listing() {
        let state = StageState::new();
        let task = json!({"id": 3});
        let key = TaskKey::of(&task);
        state.record_failure(&key, &task, TaskError::new("ValueError", "bad"));

        let failures = state.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, task);
        assert_eq!(failures[0].1.kind, "ValueError");
    }

    #[test]
    fn test_status_lifecycle() {
        let state = StageState::new();
        state.mark_running();
        assert_eq!(state.status(), StageStatus::Running);
        state.mark_stopped(Some("worker exited".to_string()));
        assert_eq!(state.status(), StageStatus::Stopped);
        assert_eq!(state.stop_reason().as_deref(), Some("worker exited"));
        assert_eq!(StageStatus::NotStarted.to_string(), "not-started");
    }
}
