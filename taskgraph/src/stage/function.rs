//! User functions and the registry used to resolve them by name.

use crate::errors::WorkerError;
use crate::task::TaskError;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Future returned by async stage functions.
pub type TaskFuture = BoxFuture<'static, Result<Value, TaskError>>;

type BlockingFn = dyn Fn(Value) -> Result<Value, TaskError> + Send + Sync;
type AsyncFn = dyn Fn(Value) -> TaskFuture + Send + Sync;

fn shared_name(name: impl Into<String>) -> Arc<str> {
    let name: String = name.into();
    Arc::from(name)
}

/// How a function body runs.
#[derive(Clone)]
pub enum FunctionBody {
    /// Opaque blocking work, run off the async runtime.
    Blocking(Arc<BlockingFn>),
    /// A future, polled at whatever points it yields.
    Async(Arc<AsyncFn>),
    /// No body in this process; resolved by name inside worker processes.
    Named,
}

/// A named user function: one task in, one result out.
///
/// The name identifies the function across process boundaries, so it must
/// match the name registered in the worker executable's
/// [`FunctionRegistry`] when the stage runs in a worker process or a
/// process pool.
#[derive(Clone)]
pub struct StageFunction {
    name: Arc<str>,
    body: FunctionBody,
}

impl StageFunction {
    /// Wraps a blocking function.
    pub fn blocking<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(Value) -> Result<Value, TaskError> + Send + Sync + 'static,
    {
        Self {
            name: shared_name(name),
            body: FunctionBody::Blocking(Arc::new(func)),
        }
    }

    /// Wraps an async function.
    pub fn from_async<F, Fut>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, TaskError>> + Send + 'static,
    {
        Self {
            name: shared_name(name),
            body: FunctionBody::Async(Arc::new(move |task| func(task).boxed())),
        }
    }

    /// A function known only by name, resolved inside worker processes.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: shared_name(name),
            body: FunctionBody::Named,
        }
    }

    /// Returns the task unchanged.
    #[must_use]
    pub fn identity() -> Self {
        Self::blocking("identity", Ok)
    }

    /// Returns the function name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the body.
    #[must_use]
    pub fn body(&self) -> &FunctionBody {
        &self.body
    }

    /// Returns true for async bodies.
    #[must_use]
    pub fn is_async(&self) -> bool {
        matches!(self.body, FunctionBody::Async(_))
    }

    /// Returns true when the body is only available in worker processes.
    #[must_use]
    pub fn is_named(&self) -> bool {
        matches!(self.body, FunctionBody::Named)
    }
}

impl fmt::Debug for StageFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let body = match self.body {
            FunctionBody::Blocking(_) => "blocking",
            FunctionBody::Async(_) => "async",
            FunctionBody::Named => "named",
        };
        f.debug_struct("StageFunction")
            .field("name", &self.name)
            .field("body", &body)
            .finish()
    }
}

/// Functions a worker executable can run, by name.
#[derive(Debug, Clone, Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, StageFunction>,
}

impl FunctionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a function, returning the one it replaced.
    pub fn register(&mut self, function: StageFunction) -> Option<StageFunction> {
        self.functions.insert(function.name().to_string(), function)
    }

    /// Registers a function, builder style.
    #[must_use]
    pub fn with(mut self, function: StageFunction) -> Self {
        self.register(function);
        self
    }

    /// Looks up a function.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&StageFunction> {
        self.functions.get(name)
    }

    /// Looks up a function that must exist.
    pub fn resolve(&self, name: &str) -> Result<StageFunction, WorkerError> {
        self.get(name)
            .cloned()
            .ok_or_else(|| WorkerError::UnknownFunction(name.to_string()))
    }

    /// Returns true if `name` is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    /// Returns the registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.functions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Returns the number of registered functions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.functions.len()
    }

    /// Returns true if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}
