//! One run of the graph, from seeding to teardown.

use super::fallback::{save_failures, save_unconsumed, RealtimeErrors};
use super::results::{build_final_results, FinalWalk};
use super::topology::{in_degrees, successors, structure_lines, validate};
use super::{Seeds, StopHandle};
use crate::config::GraphConfig;
use crate::errors::{QueueError, TaskGraphError};
use crate::executor::StageExecutor;
use crate::logging::{LogSink, TaskLogger};
use crate::queue::{BroadcastCoupler, MemoryQueue, QueueSender, SharedQueue, SharedSender, TaskQueue};
use crate::stage::{Stage, StageCounts, StageMode};
use crate::task::{FailRecord, Message};
use crate::worker::StageSupervisor;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// What a finished run left behind.
#[derive(Debug)]
pub(super) struct RunReport {
    pub walked: FinalWalk,
    pub fail_records: Vec<FailRecord>,
    pub counts: BTreeMap<String, StageCounts>,
    pub duration: Duration,
    pub realtime_path: Option<PathBuf>,
}

type StageHandle = JoinHandle<Result<StageCounts, TaskGraphError>>;
type CouplerHandle = JoinHandle<Result<u64, QueueError>>;

fn join_error(what: &str, e: &tokio::task::JoinError) -> TaskGraphError {
    TaskGraphError::Infrastructure(format!("{what} task join error: {e}"))
}

/// Keeps the first error seen.
#[derive(Debug, Default)]
struct FirstError(Option<TaskGraphError>);

impl FirstError {
    fn record(&mut self, error: TaskGraphError) {
        if self.0.is_none() {
            self.0 = Some(error);
        } else {
            debug!(error = %error, "Suppressing a later run error");
        }
    }

    fn into_result<T>(self, value: T) -> Result<T, TaskGraphError> {
        match self.0 {
            Some(error) => Err(error),
            None => Ok(value),
        }
    }
}

/// Drains the fail queue until its marker, mirroring records to the shared
/// list and the realtime file.
async fn collect_failures(
    queue: Arc<MemoryQueue<FailRecord>>,
    records: Arc<Mutex<Vec<FailRecord>>>,
    mut realtime: Option<RealtimeErrors>,
) -> Result<Option<PathBuf>, TaskGraphError> {
    while let Message::Item(record) = queue.get().await? {
        if let Some(file) = realtime.as_mut() {
            if let Err(e) = file.append(&record).await {
                warn!(path = %file.path().display(), error = %e, "Failed to append realtime error");
            }
        }
        records.lock().push(record);
    }
    match realtime {
        Some(file) => Ok(Some(file.finish().await?)),
        None => Ok(None),
    }
}

/// Wires queues and executors for every stage, seeds, waits for quiescence
/// and assembles the result tables.
pub(super) async fn run(
    root: &Stage,
    config: &GraphConfig,
    stop: &StopHandle,
    seeds: Seeds,
) -> Result<RunReport, TaskGraphError> {
    let started = Instant::now();
    let stages = validate(root, seeds.keys())?;
    for stage in &stages {
        stage.state().reset();
    }

    let structure = structure_lines(root);
    let realtime = match &config.fallback_dir {
        Some(dir) => Some(RealtimeErrors::create(dir, &structure).await?),
        None => None,
    };
    let sink = LogSink::start(&config.log_dir, config.log_to_console).await?;
    let logger = TaskLogger::new(sink.sender(), config.log_level);
    logger.start_tree(&structure);
    info!(root = %root.tag(), stages = stages.len(), "Starting task graph");

    let records = Arc::new(Mutex::new(Vec::new()));
    let fail_queue = Arc::new(MemoryQueue::<FailRecord>::unbounded());
    let fail_consumer = tokio::spawn(collect_failures(
        fail_queue.clone(),
        records.clone(),
        realtime,
    ));
    let fail_sender: SharedSender<FailRecord> = fail_queue.clone();

    // The root is always seeded, possibly with nothing.
    let root_tag = root.tag();
    let seeded_tags: HashSet<String> = seeds
        .keys()
        .cloned()
        .chain(std::iter::once(root_tag.clone()))
        .collect();

    let degrees = in_degrees(&stages);
    let inputs: HashMap<usize, Arc<MemoryQueue<Value>>> = stages
        .iter()
        .map(|s| (s.id(), Arc::new(MemoryQueue::new(config.queue_capacity))))
        .collect();

    let mut couplers: Vec<(String, CouplerHandle)> = Vec::new();
    let mut handles: Vec<(String, StageHandle)> = Vec::new();

    for stage in &stages {
        let tag = stage.tag();
        let input = inputs[&stage.id()].clone();
        let expected = degrees.get(&stage.id()).copied().unwrap_or(0)
            + usize::from(seeded_tags.contains(&tag));

        let next = successors(stage);
        let output: Option<SharedSender<Value>> = match next.as_slice() {
            [] => None,
            [only] => Some(inputs[&only.id()].clone() as SharedSender<Value>),
            many => {
                let source: Arc<MemoryQueue<Value>> = Arc::new(MemoryQueue::new(config.queue_capacity));
                let targets: Vec<SharedSender<Value>> = many
                    .iter()
                    .map(|s| inputs[&s.id()].clone() as SharedSender<Value>)
                    .collect();
                let coupler = BroadcastCoupler::spawn(tag.clone(), source.clone() as SharedQueue<Value>, targets);
                couplers.push((tag.clone(), coupler));
                Some(source as SharedSender<Value>)
            }
        };

        let handle = match stage.settings().stage_mode {
            StageMode::Inline => {
                let executor = StageExecutor::new(
                    stage.clone(),
                    input,
                    output,
                    fail_sender.clone(),
                    logger.clone(),
                    expected,
                )
                .with_launcher(config.worker.clone());
                tokio::spawn(executor.run())
            }
            StageMode::Process => {
                let supervisor = StageSupervisor::new(
                    stage.clone(),
                    input,
                    output,
                    fail_sender.clone(),
                    logger.clone(),
                    expected,
                )
                .with_launcher(config.worker.clone())
                .with_grace_period(config.join_grace_period())
                .with_stop(stop.clone());
                tokio::spawn(supervisor.run())
            }
        };
        handles.push((tag, handle));
    }

    #[cfg(feature = "reporter")]
    let reporter = config.reporter.as_ref().and_then(|rc| {
        crate::reporter::Reporter::spawn(rc, stages.clone(), records.clone(), structure.clone())
    });

    let mut first_error = FirstError::default();

    // Seed the root first, then interior stages in breadth-first order.
    let mut seeds = seeds;
    let mut seeded: Vec<(Stage, Vec<Value>)> = Vec::new();
    for stage in stages.iter().filter(|s| seeded_tags.contains(&s.tag())) {
        let tasks = seeds.remove(&stage.tag()).unwrap_or_default();
        let input = &inputs[&stage.id()];
        let mut placed = Vec::with_capacity(tasks.len());
        for task in tasks {
            if stop.is_stopped() {
                debug!(stage = %stage.tag(), "Stop requested, seeding no more");
                break;
            }
            if let Err(e) = input.put(Message::Item(task.clone())).await {
                first_error.record(e.into());
                break;
            }
            stage.state().add_seeded(1);
            placed.push(task);
        }
        if let Err(e) = input.put(Message::Terminate).await {
            first_error.record(e.into());
        }
        seeded.push((stage.clone(), placed));
    }

    let mut counts = BTreeMap::new();
    for (tag, handle) in handles {
        match handle.await {
            Ok(Ok(stage_counts)) => {
                counts.insert(tag, stage_counts);
            }
            Ok(Err(e)) => {
                warn!(stage = %tag, error = %e, "Stage ended with an error");
                first_error.record(e);
            }
            Err(e) => first_error.record(join_error(&tag, &e)),
        }
    }
    for (tag, handle) in couplers {
        match handle.await {
            Ok(Ok(forwarded)) => debug!(stage = %tag, forwarded, "Coupler joined"),
            Ok(Err(e)) => first_error.record(e.into()),
            Err(e) => first_error.record(join_error(&tag, &e)),
        }
    }

    let walked = build_final_results(&seeded);
    for record in &walked.disappeared {
        if let Err(e) = fail_queue.put(Message::Item(record.clone())).await {
            first_error.record(e.into());
        }
    }
    let realtime_path = match fail_queue.put(Message::Terminate).await {
        Ok(()) => match fail_consumer.await {
            Ok(Ok(path)) => path,
            Ok(Err(e)) => {
                first_error.record(e);
                None
            }
            Err(e) => {
                first_error.record(join_error("fail queue", &e));
                None
            }
        },
        Err(e) => {
            first_error.record(e.into());
            fail_consumer.abort();
            None
        }
    };
    let fail_records = records.lock().clone();

    let mut leftovers = Vec::new();
    for stage in &stages {
        for message in inputs[&stage.id()].drain().await {
            if let Message::Item(task) = message {
                leftovers.push((stage.tag(), task));
            }
        }
    }
    if !leftovers.is_empty() {
        warn!(count = leftovers.len(), "Tasks left unconsumed at shutdown");
    }

    if let Some(dir) = &config.fallback_dir {
        if let Err(e) = save_unconsumed(dir, &leftovers).await {
            warn!(error = %e, "Failed to save unconsumed tasks");
        }
        let fail_tasks: BTreeMap<String, Vec<Value>> = stages
            .iter()
            .map(|s| {
                let tasks: Vec<Value> = s.state().failures().into_iter().map(|(task, _)| task).collect();
                (s.tag(), tasks)
            })
            .filter(|(_, tasks)| !tasks.is_empty())
            .collect();
        if !fail_tasks.is_empty() || !walked.failed_initial.is_empty() {
            match save_failures(dir, root.name(), &structure, &fail_tasks, &walked.failed_initial).await {
                Ok(path) => info!(path = %path.display(), "Saved failed tasks"),
                Err(e) => warn!(error = %e, "Failed to save failed tasks"),
            }
        }
    }

    #[cfg(feature = "reporter")]
    {
        if let Some(reporter) = reporter {
            reporter.finish().await;
        }
    }

    let duration = started.elapsed();
    logger.end_tree(duration);
    drop(logger);
    match sink.shutdown().await {
        Ok(written) => debug!(written, "Log sink closed"),
        Err(e) => first_error.record(e),
    }
    info!(elapsed_secs = duration.as_secs_f64(), "Task graph finished");

    first_error.into_result(RunReport {
        walked,
        fail_records,
        counts,
        duration,
        realtime_path,
    })
}
