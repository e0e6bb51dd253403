//! Failure dumps for inspection and partial re-runs.
//!
//! Files live under `<fallback_dir>/<YYYY-MM-DD>/`:
//!
//! - `realtime_errors(<HH-MM-SS-mmm>).jsonl`: a metadata line, then one
//!   [`FailRecord`] per line, written as failures happen.
//! - `<HH-MM-SS-mmm>__<root name>.json`: structure, failed tasks by stage and
//!   failed initial tasks, written when the run ends.
//! - `unconsumed(<HH-MM-SS-mmm>).jsonl`: tasks still queued at shutdown.

use super::Seeds;
use crate::errors::TaskGraphError;
use crate::task::FailRecord;
use chrono::Local;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};

/// Returns today's directory under `base`.
#[must_use]
pub fn dated_dir(base: &Path) -> PathBuf {
    base.join(Local::now().format("%Y-%m-%d").to_string())
}

/// Returns the current local time as `HH-MM-SS-mmm`.
#[must_use]
pub fn time_stamp() -> String {
    Local::now().format("%H-%M-%S-%3f").to_string()
}

async fn write_jsonl_line<T: Serialize>(out: &mut BufWriter<File>, value: &T) -> Result<(), TaskGraphError> {
    let mut line = serde_json::to_string(value)?;
    line.push('\n');
    out.write_all(line.as_bytes()).await?;
    Ok(())
}

/// Appends fail records to the realtime JSONL file.
pub struct RealtimeErrors {
    out: BufWriter<File>,
    path: PathBuf,
    written: u64,
}

impl RealtimeErrors {
    /// Creates the file and writes the metadata line.
    pub async fn create(base: &Path, structure: &[String]) -> Result<Self, TaskGraphError> {
        let dir = dated_dir(base);
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(format!("realtime_errors({}).jsonl", time_stamp()));
        let mut out = BufWriter::new(File::create(&path).await?);

        let header = json!({
            "timestamp": Local::now().to_rfc3339(),
            "structure": structure,
        });
        write_jsonl_line(&mut out, &header).await?;
        out.flush().await?;

        Ok(Self {
            out,
            path,
            written: 0,
        })
    }

    /// Appends one record and flushes it.
    pub async fn append(&mut self, record: &FailRecord) -> Result<(), TaskGraphError> {
        write_jsonl_line(&mut self.out, record).await?;
        self.out.flush().await?;
        self.written += 1;
        Ok(())
    }

    /// Returns the file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the number of records written.
    #[must_use]
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Flushes and closes the file.
    pub async fn finish(mut self) -> Result<PathBuf, TaskGraphError> {
        self.out.shutdown().await?;
        Ok(self.path)
    }
}

impl std::fmt::Debug for RealtimeErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeErrors")
            .field("path", &self.path)
            .field("written", &self.written)
            .finish_non_exhaustive()
    }
}

/// Replaces characters that cannot appear in a file name component.
fn file_safe(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect()
}

/// Writes the end-of-run failure summary and returns its path.
pub async fn save_failures(
    base: &Path,
    root_name: &str,
    structure: &[String],
    fail_tasks: &BTreeMap<String, Vec<Value>>,
    fail_init_tasks: &[Value],
) -> Result<PathBuf, TaskGraphError> {
    let dir = dated_dir(base);
    tokio::fs::create_dir_all(&dir).await?;
    let path = dir.join(format!("{}__{}.json", time_stamp(), file_safe(root_name)));

    let data = json!({
        "metadata": {
            "timestamp": Local::now().to_rfc3339(),
            "structure": structure,
        },
        "fail tasks": fail_tasks,
        "fail init tasks": fail_init_tasks,
    });
    tokio::fs::write(&path, serde_json::to_vec_pretty(&data)?).await?;
    Ok(path)
}

/// Writes tasks left on input queues, one `{"stage", "task"}` object per
/// line. Writes nothing and returns `None` when there are none.
pub async fn save_unconsumed(
    base: &Path,
    leftovers: &[(String, Value)],
) -> Result<Option<PathBuf>, TaskGraphError> {
    if leftovers.is_empty() {
        return Ok(None);
    }
    let dir = dated_dir(base);
    tokio::fs::create_dir_all(&dir).await?;
    let path = dir.join(format!("unconsumed({}).jsonl", time_stamp()));

    let mut out = BufWriter::new(File::create(&path).await?);
    for (stage, task) in leftovers {
        write_jsonl_line(&mut out, &json!({"stage": stage, "task": task})).await?;
    }
    out.shutdown().await?;
    Ok(Some(path))
}

fn read_records(path: &Path) -> Result<Vec<FailRecord>, TaskGraphError> {
    let text = std::fs::read_to_string(path)?;
    Ok(text
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| serde_json::from_str::<FailRecord>(line).ok())
        .collect())
}

/// Reads a realtime JSONL file back into seeds keyed by stage tag.
///
/// Non-record lines are skipped. The result can be passed straight to
/// [`TaskGraph::start`](super::TaskGraph::start) for a partial re-run.
pub fn load_errors_by_stage(path: impl AsRef<Path>) -> Result<Seeds, TaskGraphError> {
    let mut seeds: Seeds = HashMap::new();
    for record in read_records(path.as_ref())? {
        if let Some(task) = record.task_value() {
            seeds.entry(record.stage_tag).or_default().push(task);
        }
    }
    Ok(seeds)
}

/// Reads a realtime JSONL file grouped by `(error_info, stage_tag)`.
pub fn load_errors_by_kind(
    path: impl AsRef<Path>,
) -> Result<BTreeMap<(String, String), Vec<Value>>, TaskGraphError> {
    let mut grouped: BTreeMap<(String, String), Vec<Value>> = BTreeMap::new();
    for record in read_records(path.as_ref())? {
        if let Some(task) = record.task_value() {
            grouped
                .entry((record.error_info, record.stage_tag))
                .or_default()
                .push(task);
        }
    }
    Ok(grouped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{TaskError, TaskKey};
    use pretty_assertions::assert_eq;

    fn record(tag: &str, task: Value, kind: &str) -> FailRecord {
        FailRecord::new(tag, &TaskKey::of(&task), &TaskError::new(kind, "boom"))
    }

    #[test]
    fn test_file_safe_names() {
        assert_eq!(file_safe("fetch pages"), "fetch pages");
        assert_eq!(file_safe("a/b\\c:d"), "a_b_c_d");
    }

    #[tokio::test]
    async fn test_failures_saved_for_root_with_separators() {
        let dir = tempfile::tempdir().unwrap();
        let failures = BTreeMap::from([("in/out[f]".to_string(), vec![json!(1)])]);

        let path = save_failures(dir.path(), "in/out", &["in/out[f]".to_string()], &failures, &[json!(1)])
            .await
            .unwrap();

        assert_eq!(path.parent(), Some(dated_dir(dir.path()).as_path()));
        assert!(path.file_name().unwrap().to_string_lossy().ends_with("__in_out.json"));
        let saved: Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(saved["fail init tasks"], json!([1]));
    }

    #[tokio::test]
    async fn test_realtime_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut realtime = RealtimeErrors::create(dir.path(), &["+--+".to_string()])
            .await
            .unwrap();
        realtime.append(&record("A[f]", json!(1), "ReadTimeout")).await.unwrap();
        realtime.append(&record("A[f]", json!(2), "ValueError")).await.unwrap();
        realtime.append(&record("B[g]", json!("x"), "ValueError")).await.unwrap();
        assert_eq!(realtime.written(), 3);
        let path = realtime.finish().await.unwrap();

        let file_name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(file_name.starts_with("realtime_errors("));
        assert!(path.parent().unwrap().starts_with(dir.path()));

        let by_stage = load_errors_by_stage(&path).unwrap();
        assert_eq!(by_stage["A[f]"], vec![json!(1), json!(2)]);
        assert_eq!(by_stage["B[g]"], vec![json!("x")]);

        let by_kind = load_errors_by_kind(&path).unwrap();
        assert_eq!(
            by_kind[&("ValueError: boom".to_string(), "A[f]".to_string())],
            vec![json!(2)]
        );
        assert_eq!(by_kind.len(), 3);
    }

    #[tokio::test]
    async fn test_save_failures_layout() {
        let dir = tempfile::tempdir().unwrap();
        let mut fail_tasks = BTreeMap::new();
        fail_tasks.insert("A[f]".to_string(), vec![json!(7)]);

        let path = save_failures(dir.path(), "Stage 1", &["line".to_string()], &fail_tasks, &[json!(7)])
            .await
            .unwrap();

        assert!(path.to_string_lossy().ends_with("__Stage 1.json"));
        let data: Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(data["fail tasks"]["A[f]"], json!([7]));
        assert_eq!(data["fail init tasks"], json!([7]));
        assert_eq!(data["metadata"]["structure"], json!(["line"]));
    }

    #[tokio::test]
    async fn test_unconsumed_only_when_needed() {
        let dir = tempfile::tempdir().unwrap();
        assert!(save_unconsumed(dir.path(), &[]).await.unwrap().is_none());

        let path = save_unconsumed(dir.path(), &[("B[g]".to_string(), json!(3))])
            .await
            .unwrap()
            .unwrap();
        let text = std::fs::read_to_string(path).unwrap();
        assert_eq!(text.trim(), r#"{"stage":"B[g]","task":3}"#);
    }
}
