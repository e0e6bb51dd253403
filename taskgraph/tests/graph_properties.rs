//! Whole-graph properties: markers, broadcast, partial re-runs, modes and
//! stopping.

use pretty_assertions::assert_eq;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use taskgraph::executor::StageExecutor;
use taskgraph::logging::{log_file_path, LogLevel, LogRecord, TaskLogger};
use taskgraph::queue::{MemoryQueue, QueueSender, SharedSender};
use taskgraph::task::Message;
use taskgraph::testing::{drain_items, CallCounter};
use taskgraph::prelude::*;

fn config(dir: &Path) -> GraphConfig {
    GraphConfig::new().with_log_dir(dir.join("logs"))
}

fn int_fn(name: &str, f: fn(i64) -> i64) -> StageFunction {
    StageFunction::blocking(name, move |v| Ok(json!(f(v.as_i64().unwrap_or_default()))))
}

fn sorted(mut values: Vec<Value>) -> Vec<Value> {
    values.sort_by_key(Value::to_string);
    values
}

#[tokio::test]
async fn test_markers_match_producers() {
    let stage = Stage::new("M", int_fn("same", |x| x));
    let input = Arc::new(MemoryQueue::<Value>::unbounded());
    let output = Arc::new(MemoryQueue::<Value>::unbounded());
    let fails = Arc::new(MemoryQueue::<FailRecord>::unbounded());
    let logs = Arc::new(MemoryQueue::<LogRecord>::unbounded());

    // two producers, each sending a task and its marker
    for task in [json!(1), json!(2)] {
        input.put(Message::Item(task)).await.unwrap();
        input.put(Message::Terminate).await.unwrap();
    }

    let executor = StageExecutor::new(
        stage.clone(),
        input.clone(),
        Some(output.clone() as SharedSender<Value>),
        fails,
        TaskLogger::new(logs, LogLevel::Info),
        2,
    );
    executor.run().await.unwrap();

    assert_eq!(input.markers_received(), 2);
    assert_eq!(output.markers_received(), 1);
    assert_eq!(sorted(drain_items(&output).await), vec![json!(1), json!(2)]);
}

#[tokio::test]
async fn test_broadcast_delivers_the_same_multiset() {
    let dir = tempfile::tempdir().unwrap();
    let a = Stage::new("A", int_fn("mod_three", |x| x % 3));
    let b = Stage::new("B", int_fn("left", |x| x));
    let c = Stage::new("C", int_fn("right", |x| x));
    a.set_next(&[b, c]);
    let mut graph = TaskGraph::with_config(a, config(dir.path()));

    let tasks: Vec<Value> = (0..30).map(|i| json!(i)).collect();
    let summary = graph.start_tree(tasks).await.unwrap();

    // A emits every result; duplicates are skipped downstream, not upstream
    assert_eq!(summary.counts["A[mod_three]"].emitted, 30);
    for tag in ["B[left]", "C[right]"] {
        let counts = summary.counts[tag];
        assert_eq!(counts.processed, 3);
        assert_eq!(counts.duplicates, 27);
        assert_eq!(counts.handled(), 30);
    }

    let left: Vec<Value> = graph.stage_state("B[left]").unwrap().successes().into_iter().map(|(t, _)| t).collect();
    let right: Vec<Value> = graph.stage_state("C[right]").unwrap().successes().into_iter().map(|(t, _)| t).collect();
    assert_eq!(sorted(left), sorted(right));
}

#[tokio::test]
async fn test_diamond_waits_for_both_branches() {
    let dir = tempfile::tempdir().unwrap();
    let a = Stage::new("A", int_fn("same", |x| x));
    let b = Stage::new("B", int_fn("plus_one", |x| x + 1));
    let c = Stage::new("C", int_fn("plus_two", |x| x + 2));
    let d = Stage::new("D", int_fn("times_ten", |x| x * 10));
    a.set_next(&[b.clone(), c.clone()]);
    b.set_next(&[d.clone()]);
    c.set_next(&[d]);
    let mut graph = TaskGraph::with_config(a, config(dir.path()));

    graph.start_tree(vec![json!(1)]).await.unwrap();

    let mut values: Vec<Value> = graph.final_results().values(&json!(1)).into_iter().map(|(v, _)| v).collect();
    values.sort_by_key(|v| v.as_i64());
    assert_eq!(values, vec![json!(20), json!(30)]);
}

#[tokio::test]
async fn test_partial_rerun_from_realtime_errors() {
    let dir = tempfile::tempdir().unwrap();
    let fixed = Arc::new(AtomicBool::new(false));
    let flag = fixed.clone();
    let picky = StageFunction::blocking("picky", move |v| {
        let n = v.as_i64().unwrap_or_default();
        if n % 2 == 1 && !flag.load(Ordering::SeqCst) {
            return Err(TaskError::new("ValueError", format!("{n} is odd")));
        }
        Ok(json!(n * 10))
    });

    let config = config(dir.path()).with_fallback_dir(dir.path().join("fallback"));
    let mut graph = TaskChain::with_config(
        vec![Stage::new("A", int_fn("add_one", |x| x + 1)), Stage::new("B", picky)],
        config,
    )
    .unwrap();

    graph.start_tree((1..=4).map(|i| json!(i)).collect()).await.unwrap();
    assert_eq!(sorted(graph.failed_initial_tasks().to_vec()), vec![json!(2), json!(4)]);
    let by_kind = graph.errors_by_kind();
    assert_eq!(by_kind.len(), 2);

    let realtime = graph.realtime_errors_path().unwrap().to_path_buf();
    let seeds = load_errors_by_stage(&realtime).unwrap();
    assert_eq!(sorted(seeds["Stage 2[picky]"].clone()), vec![json!(3), json!(5)]);
    let grouped = load_errors_by_kind(&realtime).unwrap();
    assert_eq!(grouped.len(), 2);

    fixed.store(true, Ordering::SeqCst);
    graph.start(seeds).await.unwrap();
    assert!(graph.failed_initial_tasks().is_empty());
    assert_eq!(
        graph.final_results().values(&json!(3)),
        vec![(json!(30), "Stage 2[picky]".to_string())]
    );

    // the failed initial tasks alone are enough for a clean re-run too
    graph.start_tree(vec![json!(2), json!(4)]).await.unwrap();
    assert!(graph.failed_initial_tasks().is_empty());
}

#[tokio::test]
async fn test_single_thread_pool_matches_sequential() {
    let dir = tempfile::tempdir().unwrap();
    let tasks: Vec<Value> = (1..=20).map(|i| json!(i)).collect();

    let mut outcomes = Vec::new();
    for mode in [ExecutionMode::Sequential, ExecutionMode::Threads] {
        let mut graph = TaskChain::with_config(
            vec![
                Stage::new("A", int_fn("square", |x| x * x)).with_worker_limit(1),
                Stage::new("B", int_fn("add_one", |x| x + 1)).with_worker_limit(1),
            ],
            config(dir.path()),
        )
        .unwrap();
        graph.set_graph_mode(StageMode::Inline, mode);
        graph.start_tree(tasks.clone()).await.unwrap();

        let mut results: Vec<(Value, Vec<(Value, String)>)> = graph
            .final_results()
            .iter()
            .map(|(task, _)| (task.clone(), graph.final_results().values(task)))
            .collect();
        results.sort_by_key(|(task, _)| task.as_i64());
        outcomes.push(results);
    }
    assert_eq!(outcomes[0], outcomes[1]);
}

#[tokio::test]
async fn test_repeat_runs_are_equal() {
    let dir = tempfile::tempdir().unwrap();
    let counter = CallCounter::new();
    let mut graph = TaskChain::with_config(
        vec![
            Stage::new("A", counter.counting("half", |v| {
                let n = v.as_i64().unwrap_or_default();
                if n % 4 == 0 {
                    Err(TaskError::new("ValueError", "multiple of four"))
                } else {
                    Ok(json!(n / 2))
                }
            }))
            .with_execution_mode(ExecutionMode::Async)
            .with_worker_limit(8),
        ],
        config(dir.path()),
    )
    .unwrap();

    let tasks: Vec<Value> = (1..=12).map(|i| json!(i)).collect();
    graph.start_tree(tasks.clone()).await.unwrap();
    let first_kinds = graph.errors_by_kind();
    let first: Vec<_> = tasks.iter().map(|t| graph.final_results().values(t)).collect();

    graph.start_tree(tasks.clone()).await.unwrap();
    let second: Vec<_> = tasks.iter().map(|t| graph.final_results().values(t)).collect();

    assert_eq!(first, second);
    assert_eq!(first_kinds.len(), graph.errors_by_kind().len());
    assert_eq!(counter.calls(), 24);
}

#[tokio::test]
async fn test_stop_ends_seeding() {
    let dir = tempfile::tempdir().unwrap();
    let slow = StageFunction::from_async("slow", |v| async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(v)
    });
    let stage = Stage::new("A", slow);
    let mut graph = TaskGraph::with_config(stage, config(dir.path()).with_queue_capacity(1));

    let stop = graph.stop_handle();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        stop.stop("enough");
    });

    let tasks: Vec<Value> = (0..200).map(|i| json!(i)).collect();
    let summary = graph.start_tree(tasks).await.unwrap();

    let counts = summary.counts["A[slow]"];
    assert!(counts.seeded < 200, "seeded {}", counts.seeded);
    assert_eq!(counts.processed, counts.seeded);
    assert_eq!(graph.final_results().len() as u64, counts.seeded);
}

#[tokio::test]
async fn test_cycle_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let a = Stage::new("A", int_fn("f", |x| x));
    let b = Stage::new("B", int_fn("g", |x| x));
    a.set_next(&[b.clone()]);
    b.set_next(&[a.clone()]);
    let mut graph = TaskGraph::with_config(a.clone(), config(dir.path()));

    let err = graph.start_tree(vec![json!(1)]).await.unwrap_err();
    assert!(matches!(err, TaskGraphError::CycleDetected(_)));
    assert!(err.to_string().contains("A[f] -> B[g] -> A[f]"));

    b.set_next(&[]);
}

#[tokio::test]
async fn test_log_file_records_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let mut graph = TaskGraph::with_config(Stage::new("A", int_fn("f", |x| x)), config(dir.path()));
    graph.start_tree(vec![json!(1)]).await.unwrap();

    let path = log_file_path(&dir.path().join("logs"), chrono::Local::now().date_naive());
    let text = std::fs::read_to_string(path).unwrap();
    assert!(text.contains("Starting TaskTree stages"));
    assert!(text.contains("TaskTree end"));
}

#[cfg(feature = "reporter")]
#[tokio::test]
async fn test_reporter_receives_structure_and_status() {
    let dir = tempfile::tempdir().unwrap();
    let mut server = mockito::Server::new_async().await;
    let structure = server
        .mock("POST", "/api/push_structure")
        .expect(1)
        .create_async()
        .await;
    let _interval = server
        .mock("GET", "/api/get_interval")
        .with_body(r#"{"interval": 1}"#)
        .create_async()
        .await;
    let status = server
        .mock("POST", "/api/push_status")
        .match_body(mockito::Matcher::Regex("A\\[f\\]".to_string()))
        .expect_at_least(1)
        .create_async()
        .await;
    let _errors = server.mock("POST", "/api/push_errors").create_async().await;

    let config = config(dir.path()).with_reporter(ReporterConfig::new(server.url()));
    let mut graph = TaskGraph::with_config(Stage::new("A", int_fn("f", |x| x)), config);
    graph.start_tree(vec![json!(1), json!(2)]).await.unwrap();

    structure.assert_async().await;
    status.assert_async().await;
}
