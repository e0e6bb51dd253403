//! Runs a chain of built-in functions over integer tasks.
//!
//! The same executable serves as the worker for dedicated-process stages and
//! process pools, so every function it knows is available on both sides.

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicU64, Ordering};
use taskgraph::prelude::*;

/// Counter mutated by `bump_global`; each process has its own copy.
static GLOBAL: AtomicU64 = AtomicU64::new(0);

#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum StageModeArg {
    Inline,
    Process,
}

impl From<StageModeArg> for StageMode {
    fn from(arg: StageModeArg) -> Self {
        match arg {
            StageModeArg::Inline => Self::Inline,
            StageModeArg::Process => Self::Process,
        }
    }
}

#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum ExecutionModeArg {
    Sequential,
    Threads,
    Processes,
    Async,
}

impl From<ExecutionModeArg> for ExecutionMode {
    fn from(arg: ExecutionModeArg) -> Self {
        match arg {
            ExecutionModeArg::Sequential => Self::Sequential,
            ExecutionModeArg::Threads => Self::Threads,
            ExecutionModeArg::Processes => Self::Processes,
            ExecutionModeArg::Async => Self::Async,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "taskgraph-demo", about = "Run a chain of built-in stage functions")]
struct Args {
    /// Comma separated function names, one stage each.
    #[arg(long, value_delimiter = ',', default_value = "add_one,double")]
    stages: Vec<String>,

    /// Comma separated integer tasks seeded on the first stage.
    #[arg(long, value_delimiter = ',', conflicts_with = "range")]
    tasks: Vec<i64>,

    /// Seed the tasks 1..=N instead of an explicit list.
    #[arg(long)]
    range: Option<i64>,

    #[arg(long, value_enum, default_value_t = StageModeArg::Inline)]
    stage_mode: StageModeArg,

    #[arg(long, value_enum, default_value_t = ExecutionModeArg::Sequential)]
    execution_mode: ExecutionModeArg,

    #[arg(long, default_value_t = 4)]
    worker_limit: usize,

    #[arg(long, default_value_t = 0)]
    max_retries: u32,

    /// TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    log_dir: Option<PathBuf>,

    #[arg(long)]
    fallback_dir: Option<PathBuf>,

    /// Print the graph drawing to stderr before running.
    #[arg(long)]
    show_structure: bool,

    /// List the built-in functions and exit.
    #[arg(long)]
    list: bool,
}

fn as_int(task: &Value) -> Result<i64, TaskError> {
    task.as_i64()
        .ok_or_else(|| TaskError::new("TypeError", format!("expected an integer, got {task}")))
}

fn fibonacci(n: i64) -> Result<u64, TaskError> {
    if n < 0 {
        return Err(TaskError::new("ValueError", format!("negative input {n}")));
    }
    let (mut a, mut b) = (0u64, 1u64);
    for _ in 0..n {
        let next = a
            .checked_add(b)
            .ok_or_else(|| TaskError::new("OverflowError", format!("fibonacci({n}) overflows")))?;
        a = b;
        b = next;
    }
    Ok(a)
}

fn registry() -> FunctionRegistry {
    FunctionRegistry::new()
        .with(StageFunction::blocking("add_one", |t| Ok(json!(as_int(&t)? + 1))))
        .with(StageFunction::blocking("double", |t| Ok(json!(as_int(&t)? * 2))))
        .with(StageFunction::blocking("square", |t| {
            let n = as_int(&t)?;
            Ok(json!(n * n))
        }))
        .with(StageFunction::blocking("fibonacci", |t| Ok(json!(fibonacci(as_int(&t)?)?))))
        .with(StageFunction::blocking("split_units", |t| {
            let n = as_int(&t)?;
            Ok(json!((0..n).map(|i| format!("u_{n}_{i}")).collect::<Vec<_>>()))
        }))
        .with(StageFunction::blocking("str_len", |t| match t.as_str() {
            Some(s) => Ok(json!(s.len())),
            None => Err(TaskError::new("TypeError", format!("expected a string, got {t}"))),
        }))
        .with(StageFunction::blocking("bump_global", |t| {
            GLOBAL.fetch_add(1, Ordering::SeqCst);
            Ok(json!(as_int(&t)? + 1))
        }))
        .with(StageFunction::blocking("check_global", |t| {
            let seen = GLOBAL.load(Ordering::SeqCst);
            if seen != 0 {
                return Err(TaskError::new("StateLeak", format!("global counter is {seen}")));
            }
            Ok(json!(as_int(&t)? * 2))
        }))
        .with(StageFunction::blocking("always_timeout", |t| {
            Err(TaskError::new(kinds::READ_TIMEOUT, format!("{t} timed out")))
        }))
        // Takes the whole worker process down on task 3.
        .with(StageFunction::blocking("crashy", |t| {
            let n = as_int(&t)?;
            if n == 3 {
                std::process::exit(3);
            }
            Ok(json!(n))
        }))
}

fn build_chain(args: &Args, registry: &FunctionRegistry, config: GraphConfig) -> Result<TaskGraph> {
    let mut stages = Vec::with_capacity(args.stages.len());
    for name in &args.stages {
        let function = registry
            .resolve(name)
            .with_context(|| format!("unknown function '{name}', try --list"))?;
        let stage = if name == "split_units" {
            Stage::splitter(name.as_str(), function)
        } else {
            Stage::new(name.as_str(), function)
                .with_execution_mode(args.execution_mode.into())
                .with_worker_limit(args.worker_limit)
        };
        stages.push(
            stage
                .with_stage_mode(args.stage_mode.into())
                .with_max_retries(args.max_retries),
        );
    }
    Ok(TaskChain::with_config(stages, config)?)
}

fn render(graph: &TaskGraph) -> Value {
    let results: Vec<Value> = graph
        .final_results()
        .iter()
        .map(|(task, terminals)| {
            let terminals: Vec<Value> = terminals
                .iter()
                .map(|t| match &t.outcome {
                    Ok(value) => json!({"stage": t.stage, "value": value}),
                    Err(error) => json!({"stage": t.stage, "error": error.info()}),
                })
                .collect();
            json!({"task": task, "terminals": terminals})
        })
        .collect();

    let errors: serde_json::Map<String, Value> = graph
        .errors_by_stage()
        .into_iter()
        .map(|(tag, failures)| {
            let failures: Vec<Value> = failures
                .into_iter()
                .map(|(task, error)| json!({"task": task, "error": error.info()}))
                .collect();
            (tag, Value::Array(failures))
        })
        .collect();

    json!({
        "results": results,
        "failed_initial_tasks": graph.failed_initial_tasks(),
        "errors_by_stage": errors,
        "stages": graph.status(),
    })
}

async fn run(args: Args, registry: FunctionRegistry) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => GraphConfig::from_file(path)?,
        None => GraphConfig::new(),
    };
    if let Some(dir) = &args.log_dir {
        config = config.with_log_dir(dir);
    }
    if let Some(dir) = &args.fallback_dir {
        config = config.with_fallback_dir(dir);
    }

    let tasks: Vec<Value> = match args.range {
        Some(n) => (1..=n).map(|i| json!(i)).collect(),
        None => args.tasks.iter().map(|i| json!(i)).collect(),
    };
    if args.stages.is_empty() {
        bail!("at least one stage is required");
    }

    let mut graph = build_chain(&args, &registry, config)?;
    if args.show_structure {
        for line in graph.structure_lines() {
            eprintln!("{line}");
        }
    }

    let summary = graph.start_tree(tasks).await?;
    tracing::info!(
        run_id = %summary.run_id,
        elapsed_secs = summary.duration.as_secs_f64(),
        "Run finished"
    );
    println!("{}", serde_json::to_string_pretty(&render(&graph))?);
    Ok(())
}

fn main() -> ExitCode {
    let registry = registry();
    if let Some(code) = run_worker_if_requested(&registry) {
        return code;
    }

    init_tracing("info");
    let args = Args::parse();
    if args.list {
        for name in registry.names() {
            println!("{name}");
        }
        return ExitCode::SUCCESS;
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("error: failed to start the runtime: {e}");
            return ExitCode::FAILURE;
        }
    };
    match runtime.block_on(run(args, registry)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
