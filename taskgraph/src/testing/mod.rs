//! Helpers for testing graphs and executors.
//!
//! This module provides:
//! - Stage functions with scripted failures
//! - A call counter that wraps any blocking function
//! - An observer that records executor events

use crate::executor::StageObserver;
use crate::queue::MemoryQueue;
use crate::stage::StageFunction;
use crate::task::{Message, TaskError, TaskKey};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Fails the first `failures` calls for each task with `kind`, then returns
/// the task unchanged.
pub fn flaky(name: impl Into<String>, failures: u32, kind: impl Into<String>) -> StageFunction {
    let kind = kind.into();
    let calls: Arc<DashMap<TaskKey, u32>> = Arc::new(DashMap::new());
    StageFunction::blocking(name, move |task| {
        let mut seen = calls.entry(TaskKey::of(&task)).or_insert(0);
        *seen += 1;
        if *seen <= failures {
            Err(TaskError::new(kind.clone(), format!("scripted failure #{}", *seen)))
        } else {
            Ok(task)
        }
    })
}

/// Always fails with `kind`.
pub fn always_fail(name: impl Into<String>, kind: impl Into<String>) -> StageFunction {
    let kind = kind.into();
    StageFunction::blocking(name, move |task| {
        Err(TaskError::new(kind.clone(), format!("{task} always fails")))
    })
}

/// Counts calls made through the functions it wraps.
#[derive(Debug, Clone, Default)]
pub struct CallCounter {
    calls: Arc<AtomicU64>,
}

impl CallCounter {
    /// Creates a counter at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps a blocking function so every call is counted.
    pub fn counting<F>(&self, name: impl Into<String>, func: F) -> StageFunction
    where
        F: Fn(Value) -> Result<Value, TaskError> + Send + Sync + 'static,
    {
        let calls = self.calls.clone();
        StageFunction::blocking(name, move |task| {
            calls.fetch_add(1, Ordering::SeqCst);
            func(task)
        })
    }

    /// Returns the number of calls so far.
    #[must_use]
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

/// An executor event captured by [`RecordingObserver`].
#[derive(Debug, Clone, PartialEq)]
pub enum ObservedEvent {
    /// A task succeeded.
    Success(Value, Value),
    /// A task failed for good.
    Failure(Value, TaskError),
    /// A task was scheduled for retry.
    Retry(Value, u32),
    /// A duplicate was skipped.
    Duplicate(Value),
    /// A splitter emitted items.
    Split(u64),
}

/// Observer that keeps every event in order.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<ObservedEvent>>,
}

impl RecordingObserver {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the events recorded so far.
    #[must_use]
    pub fn events(&self) -> Vec<ObservedEvent> {
        self.events.lock().clone()
    }
}

impl StageObserver for RecordingObserver {
    fn on_success(&self, task: &Value, result: &Value) {
        self.events
            .lock()
            .push(ObservedEvent::Success(task.clone(), result.clone()));
    }

    fn on_failure(&self, task: &Value, error: &TaskError) {
        self.events
            .lock()
            .push(ObservedEvent::Failure(task.clone(), error.clone()));
    }

    fn on_retry(&self, task: &Value, attempt: u32) {
        self.events.lock().push(ObservedEvent::Retry(task.clone(), attempt));
    }

    fn on_duplicate(&self, task: &Value) {
        self.events.lock().push(ObservedEvent::Duplicate(task.clone()));
    }

    fn on_split(&self, count: u64) {
        self.events.lock().push(ObservedEvent::Split(count));
    }
}

/// Drains a queue and returns its items, dropping termination markers.
pub async fn drain_items<T: Send + 'static>(queue: &MemoryQueue<T>) -> Vec<T> {
    queue
        .drain()
        .await
        .into_iter()
        .filter_map(Message::into_item)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::call_local;
    use serde_json::json;

    #[tokio::test]
    async fn test_flaky_fails_per_task() {
        let f = flaky("flaky", 1, "ReadTimeout");
        assert!(call_local(&f, json!(1), true).await.is_err());
        assert!(call_local(&f, json!(2), true).await.is_err());
        assert_eq!(call_local(&f, json!(1), true).await.unwrap(), json!(1));
    }

    #[tokio::test]
    async fn test_call_counter() {
        let counter = CallCounter::new();
        let f = counter.counting("inc", |v| Ok(json!(v.as_i64().unwrap_or(0) + 1)));
        call_local(&f, json!(1), true).await.unwrap();
        call_local(&f, json!(2), true).await.unwrap();
        assert_eq!(counter.calls(), 2);
    }

    #[tokio::test]
    async fn test_always_fail() {
        let f = always_fail("nope", "ValueError");
        let err = call_local(&f, json!("x"), true).await.unwrap_err();
        assert_eq!(err.kind, "ValueError");
    }
}
