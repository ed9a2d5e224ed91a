//! Task descriptors.
//!
//! A [`Task`] wraps one stage's callable together with its validated
//! execution options. The callable's capabilities (does it yield many
//! values? is it async?) are carried by the [`TaskFn`] variant chosen at
//! construction instead of being re-discovered on every call.

mod options;

pub use options::TaskOptions;

use crate::errors::InvalidTaskConfig;
use futures::future::BoxFuture;
use futures::stream::{BoxStream, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Lazy sequence of outputs produced by a generator task.
pub type ItemIter = Box<dyn Iterator<Item = anyhow::Result<Value>> + Send>;

/// Lazy stream of outputs produced by an async generator task.
pub type ItemStream = BoxStream<'static, anyhow::Result<Value>>;

type SyncCall = dyn Fn(Value) -> anyhow::Result<Value> + Send + Sync;
type GeneratorCall = dyn Fn(Value) -> ItemIter + Send + Sync;
type AsyncCall = dyn Fn(Value) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync;
type AsyncGeneratorCall = dyn Fn(Value) -> ItemStream + Send + Sync;

/// The callable of a task, tagged with its execution capability.
#[derive(Clone)]
pub enum TaskFn {
    /// Returns exactly one value per call.
    Sync(Arc<SyncCall>),
    /// Returns a lazy iterator of values per call.
    Generator(Arc<GeneratorCall>),
    /// Returns a future resolving to one value per call.
    Async(Arc<AsyncCall>),
    /// Returns a stream of values per call.
    AsyncGenerator(Arc<AsyncGeneratorCall>),
}

impl TaskFn {
    /// Wraps a plain function.
    pub fn sync<F>(func: F) -> Self
    where
        F: Fn(Value) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        Self::Sync(Arc::new(func))
    }

    /// Wraps a function returning an iterator of results.
    pub fn generator<F, I>(func: F) -> Self
    where
        F: Fn(Value) -> I + Send + Sync + 'static,
        I: IntoIterator<Item = anyhow::Result<Value>>,
        I::IntoIter: Send + 'static,
    {
        Self::Generator(Arc::new(move |input| -> ItemIter {
            Box::new(func(input).into_iter())
        }))
    }

    /// Wraps an async function.
    pub fn asynchronous<F, Fut>(func: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Self::Async(Arc::new(move |input| -> BoxFuture<'static, anyhow::Result<Value>> {
            Box::pin(func(input))
        }))
    }

    /// Wraps a function returning a stream of results.
    pub fn async_generator<F, S>(func: F) -> Self
    where
        F: Fn(Value) -> S + Send + Sync + 'static,
        S: Stream<Item = anyhow::Result<Value>> + Send + 'static,
    {
        Self::AsyncGenerator(Arc::new(move |input| -> ItemStream { func(input).boxed() }))
    }

    /// Returns the capability tag.
    #[must_use]
    pub const fn kind(&self) -> TaskKind {
        match self {
            Self::Sync(_) => TaskKind::Sync,
            Self::Generator(_) => TaskKind::Generator,
            Self::Async(_) => TaskKind::Async,
            Self::AsyncGenerator(_) => TaskKind::AsyncGenerator,
        }
    }

    /// Returns true if a call yields many values.
    #[must_use]
    pub const fn is_generator(&self) -> bool {
        self.kind().is_generator()
    }

    /// Returns true if a call must be awaited.
    #[must_use]
    pub const fn is_async(&self) -> bool {
        self.kind().is_async()
    }

    /// Returns true if both handles share the same callable.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Sync(a), Self::Sync(b)) => Arc::ptr_eq(a, b),
            (Self::Generator(a), Self::Generator(b)) => Arc::ptr_eq(a, b),
            (Self::Async(a), Self::Async(b)) => Arc::ptr_eq(a, b),
            (Self::AsyncGenerator(a), Self::AsyncGenerator(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for TaskFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TaskFn").field(&self.kind()).finish()
    }
}

/// Execution capability of a task callable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// One value per call.
    Sync,
    /// Many values per call.
    Generator,
    /// One awaited value per call.
    Async,
    /// Many awaited values per call.
    AsyncGenerator,
}

impl TaskKind {
    /// Returns true for generator kinds.
    #[must_use]
    pub const fn is_generator(self) -> bool {
        matches!(self, Self::Generator | Self::AsyncGenerator)
    }

    /// Returns true for async kinds.
    #[must_use]
    pub const fn is_async(self) -> bool {
        matches!(self, Self::Async | Self::AsyncGenerator)
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sync => write!(f, "sync"),
            Self::Generator => write!(f, "generator"),
            Self::Async => write!(f, "async"),
            Self::AsyncGenerator => write!(f, "async_generator"),
        }
    }
}

/// An immutable, validated description of one pipeline stage.
///
/// Cloning a task shares its callable.
#[derive(Clone)]
pub struct Task {
    name: String,
    func: TaskFn,
    branch: bool,
    join: bool,
    concurrency: usize,
    throttle: usize,
    multiprocess: bool,
    daemon: bool,
}

impl Task {
    /// Validates the options against the callable and builds the task.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidTaskConfig`] if the concurrency is below 1, the
    /// throttle is negative, `branch` disagrees with the callable's
    /// generator capability, or an async callable is marked `daemon`.
    pub fn new(func: TaskFn, options: TaskOptions) -> Result<Self, InvalidTaskConfig> {
        let TaskOptions {
            name,
            branch,
            join,
            concurrency,
            throttle,
            multiprocess,
            daemon,
        } = options;

        let concurrency = usize::try_from(concurrency)
            .ok()
            .filter(|c| *c >= 1)
            .ok_or(InvalidTaskConfig::ConcurrencyTooLow { concurrency })?;
        let throttle = usize::try_from(throttle)
            .map_err(|_| InvalidTaskConfig::NegativeThrottle { throttle })?;

        if branch && !func.is_generator() {
            return Err(InvalidTaskConfig::BranchRequiresGenerator { task: name });
        }
        if !branch && func.is_generator() {
            return Err(InvalidTaskConfig::GeneratorRequiresBranch { task: name });
        }
        if func.is_async() && daemon {
            return Err(InvalidTaskConfig::AsyncDaemon { task: name });
        }

        Ok(Self {
            name,
            func,
            branch,
            join,
            concurrency,
            throttle,
            multiprocess,
            daemon,
        })
    }

    /// Starts a fluent builder around a callable.
    #[must_use]
    pub fn builder(func: TaskFn) -> TaskBuilder {
        TaskBuilder {
            func,
            options: TaskOptions::default(),
        }
    }

    /// Returns the task name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the callable.
    #[must_use]
    pub const fn func(&self) -> &TaskFn {
        &self.func
    }

    /// Returns the capability tag.
    #[must_use]
    pub const fn kind(&self) -> TaskKind {
        self.func.kind()
    }

    /// Returns true if a call yields many values.
    #[must_use]
    pub const fn is_generator(&self) -> bool {
        self.func.is_generator()
    }

    /// Returns true if a call must be awaited.
    #[must_use]
    pub const fn is_async(&self) -> bool {
        self.func.is_async()
    }

    /// Returns the branch flag.
    #[must_use]
    pub const fn branch(&self) -> bool {
        self.branch
    }

    /// Returns the join flag.
    #[must_use]
    pub const fn join(&self) -> bool {
        self.join
    }

    /// Returns the number of workers.
    #[must_use]
    pub const fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Returns the output queue bound (0 = unbounded).
    #[must_use]
    pub const fn throttle(&self) -> usize {
        self.throttle
    }

    /// Returns the multiprocess flag.
    #[must_use]
    pub const fn multiprocess(&self) -> bool {
        self.multiprocess
    }

    /// Returns the daemon flag.
    #[must_use]
    pub const fn daemon(&self) -> bool {
        self.daemon
    }

    /// Returns a copy of this task running a different callable.
    ///
    /// The daemon flag is cleared when the new callable is async.
    pub(crate) fn with_func(&self, func: TaskFn) -> Self {
        let daemon = self.daemon && !func.is_async();
        Self {
            func,
            daemon,
            ..self.clone()
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("kind", &self.kind())
            .field("branch", &self.branch)
            .field("join", &self.join)
            .field("concurrency", &self.concurrency)
            .field("throttle", &self.throttle)
            .field("multiprocess", &self.multiprocess)
            .field("daemon", &self.daemon)
            .finish()
    }
}

/// Fluent builder for [`Task`].
#[derive(Debug, Clone)]
pub struct TaskBuilder {
    func: TaskFn,
    options: TaskOptions,
}

impl TaskBuilder {
    /// Sets the name.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.options.name = name.into();
        self
    }

    /// Sets the branch flag.
    #[must_use]
    pub const fn branch(mut self, branch: bool) -> Self {
        self.options.branch = branch;
        self
    }

    /// Sets the join flag.
    #[must_use]
    pub const fn join(mut self, join: bool) -> Self {
        self.options.join = join;
        self
    }

    /// Sets the number of workers.
    #[must_use]
    pub const fn concurrency(mut self, concurrency: i64) -> Self {
        self.options.concurrency = concurrency;
        self
    }

    /// Sets the output queue bound.
    #[must_use]
    pub const fn throttle(mut self, throttle: i64) -> Self {
        self.options.throttle = throttle;
        self
    }

    /// Sets the multiprocess flag.
    #[must_use]
    pub const fn multiprocess(mut self, multiprocess: bool) -> Self {
        self.options.multiprocess = multiprocess;
        self
    }

    /// Sets the daemon flag.
    #[must_use]
    pub const fn daemon(mut self, daemon: bool) -> Self {
        self.options.daemon = daemon;
        self
    }

    /// Replaces all options at once.
    #[must_use]
    pub fn options(mut self, options: TaskOptions) -> Self {
        self.options = options;
        self
    }

    /// Validates and builds the task.
    pub fn build(self) -> Result<Task, InvalidTaskConfig> {
        Task::new(self.func, self.options)
    }
}
