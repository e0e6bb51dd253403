//! Aggregated tables built after a run.

use super::topology::successors;
use crate::stage::{split_result, Stage};
use crate::task::{task_info, FailRecord, TaskError, TaskKey, DEFAULT_MAX_INFO};
use serde::{Serialize, Serializer};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

/// Where one path of an initial task ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Terminal {
    /// The leaf result, or the error that stopped the path.
    pub outcome: Result<Value, TaskError>,
    /// Tag of the stage the path ended at.
    pub stage: String,
}

impl Terminal {
    /// Returns the value when the path reached a leaf.
    #[must_use]
    pub fn value(&self) -> Option<&Value> {
        self.outcome.as_ref().ok()
    }

    /// Returns true when the path ended in an error.
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.outcome.is_err()
    }
}

/// Terminal outcomes per initial task, in seeding order.
#[derive(Debug, Clone, Default)]
pub struct FinalResults {
    entries: Vec<(Value, Vec<Terminal>)>,
    index: HashMap<TaskKey, usize>,
}

#[derive(Serialize)]
struct ResultEntry<'a> {
    task: &'a Value,
    terminals: &'a [Terminal],
}

// Serialised as a list of `{task, terminals}` since tasks are not map keys.
impl Serialize for FinalResults {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.iter().map(|(task, terminals)| ResultEntry { task, terminals }))
    }
}

impl FinalResults {
    /// Returns the terminals recorded for `task`.
    #[must_use]
    pub fn get(&self, task: &Value) -> Option<&[Terminal]> {
        self.index
            .get(&TaskKey::of(task))
            .map(|&i| self.entries[i].1.as_slice())
    }

    /// Returns the successful leaf values for `task`, with their stage tags.
    #[must_use]
    pub fn values(&self, task: &Value) -> Vec<(Value, String)> {
        self.get(task)
            .unwrap_or_default()
            .iter()
            .filter_map(|t| t.value().map(|v| (v.clone(), t.stage.clone())))
            .collect()
    }

    /// Iterates over `(initial task, terminals)`.
    pub fn iter(&self) -> impl Iterator<Item = (&Value, &[Terminal])> {
        self.entries.iter().map(|(task, terms)| (task, terms.as_slice()))
    }

    /// Number of initial tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true when nothing was seeded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Records the terminals of `task`. A task seeded again replaces its
    /// earlier entry, keeping its original position.
    pub(super) fn insert(&mut self, task: Value, terminals: Vec<Terminal>) {
        let key = TaskKey::of(&task);
        match self.index.get(&key) {
            Some(&i) => self.entries[i].1 = terminals,
            None => {
                self.index.insert(key, self.entries.len());
                self.entries.push((task, terminals));
            }
        }
    }
}

/// What walking the seeds through the tables produced.
#[derive(Debug, Default)]
pub(crate) struct FinalWalk {
    pub results: FinalResults,
    pub failed_initial: Vec<Value>,
    /// Fail records for tasks found in neither table.
    pub disappeared: Vec<FailRecord>,
}

fn walk(stage: &Stage, task: &Value, out: &mut Vec<Terminal>, ok: &mut bool, lost: &mut Vec<FailRecord>) {
    let state = stage.state();
    let key = TaskKey::of(task);
    let tag = stage.tag();

    let result = match (state.success(&key), state.error(&key)) {
        (Some(result), _) => result,
        (None, Some(error)) => {
            *ok = false;
            out.push(Terminal {
                outcome: Err(error),
                stage: tag,
            });
            return;
        }
        (None, None) => {
            let error = TaskError::disappeared(&task_info(task, DEFAULT_MAX_INFO));
            state.record_failure(&key, task, error.clone());
            lost.push(FailRecord::new(tag.clone(), &key, &error));
            *ok = false;
            out.push(Terminal {
                outcome: Err(error),
                stage: tag,
            });
            return;
        }
    };

    let next = successors(stage);
    if stage.is_splitter() {
        let items = split_result(result.clone());
        if next.is_empty() || items.is_empty() {
            out.push(Terminal {
                outcome: Ok(result),
                stage: tag,
            });
            return;
        }
        for item in &items {
            for stage in &next {
                walk(stage, item, out, ok, lost);
            }
        }
        return;
    }

    if next.is_empty() {
        out.push(Terminal {
            outcome: Ok(result),
            stage: tag,
        });
        return;
    }
    for stage in &next {
        walk(stage, &result, out, ok, lost);
    }
}

/// Follows every seeded task through the recorded successes.
///
/// A task missing from both tables where it should have been processed gets a
/// synthetic `TaskDisappeared` error in that stage's table.
pub(crate) fn build_final_results(seeded: &[(Stage, Vec<Value>)]) -> FinalWalk {
    let mut walked = FinalWalk::default();
    for (stage, tasks) in seeded {
        for task in tasks {
            let mut terminals = Vec::new();
            let mut ok = true;
            walk(stage, task, &mut terminals, &mut ok, &mut walked.disappeared);
            let failed = !ok && !walked.failed_initial.contains(task);
            walked.results.insert(task.clone(), terminals);
            if failed {
                walked.failed_initial.push(task.clone());
            }
        }
    }
    walked
}

/// Failed tasks per stage tag.
#[must_use]
pub fn errors_by_stage(stages: &[Stage]) -> BTreeMap<String, Vec<(Value, TaskError)>> {
    stages
        .iter()
        .map(|stage| (stage.tag(), stage.state().failures()))
        .filter(|(_, failures)| !failures.is_empty())
        .collect()
}

/// Failed tasks grouped by `(error_info, stage_tag)`.
#[must_use]
pub fn errors_by_kind(stages: &[Stage]) -> BTreeMap<(String, String), Vec<Value>> {
    let mut grouped: BTreeMap<(String, String), Vec<Value>> = BTreeMap::new();
    for stage in stages {
        let tag = stage.tag();
        for (task, error) in stage.state().failures() {
            grouped.entry((error.info(), tag.clone())).or_default().push(task);
        }
    }
    grouped
}

/// Fail records grouped by `(error_kind, stage_tag)`, oldest first.
#[must_use]
pub fn fail_timeline(records: &[FailRecord]) -> BTreeMap<(String, String), Vec<(Value, f64)>> {
    let mut sorted: Vec<&FailRecord> = records.iter().collect();
    sorted.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));

    let mut timeline: BTreeMap<(String, String), Vec<(Value, f64)>> = BTreeMap::new();
    for record in sorted {
        let task = record
            .task_value()
            .unwrap_or_else(|| Value::String(record.task.clone()));
        timeline
            .entry((record.error_kind().to_string(), record.stage_tag.clone()))
            .or_default()
            .push((task, record.timestamp));
    }
    timeline
}
