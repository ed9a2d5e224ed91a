//! Executors that run blocking task calls off the async event loop.

use crate::errors::{StagepipeError, TaskPanicked};
use crate::pipeline::PipelineConfig;
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use tokio::sync::{oneshot, Semaphore};
use tracing::debug;

/// A blocking call to run on an executor.
pub type BlockingJob = Box<dyn FnOnce() -> anyhow::Result<Value> + Send + 'static>;

/// Runs blocking jobs and hands their result back to async code.
#[async_trait]
pub trait Executor: Send + Sync + fmt::Debug {
    /// Runs `job` to completion.
    ///
    /// The job's own error is returned unchanged. A panicking job is
    /// reported as a [`TaskPanicked`] error.
    async fn execute(&self, job: BlockingJob) -> anyhow::Result<Value>;
}

/// Runs jobs on tokio's blocking thread pool.
#[derive(Debug, Clone, Copy, Default)]
pub struct BlockingPoolExecutor;

#[async_trait]
impl Executor for BlockingPoolExecutor {
    async fn execute(&self, job: BlockingJob) -> anyhow::Result<Value> {
        match tokio::task::spawn_blocking(job).await {
            Ok(result) => result,
            Err(err) if err.is_panic() => {
                Err(TaskPanicked::from_payload(err.into_panic().as_ref()).into())
            }
            Err(err) => Err(StagepipeError::Runtime(format!("blocking job cancelled: {err}")).into()),
        }
    }
}

/// Runs every job on a fresh, dedicated OS thread.
///
/// The result crosses back as serialized bytes, so the job shares nothing
/// with the caller once it has started. At most `workers` jobs run at once.
#[derive(Debug, Clone)]
pub struct IsolatedExecutor {
    permits: Arc<Semaphore>,
    name_prefix: String,
}

impl IsolatedExecutor {
    /// Creates an executor running at most `workers` jobs at once.
    #[must_use]
    pub fn new(workers: usize, name_prefix: impl Into<String>) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(workers.max(1))),
            name_prefix: name_prefix.into(),
        }
    }

    /// Returns how many more jobs could start right now.
    #[must_use]
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

#[async_trait]
impl Executor for IsolatedExecutor {
    async fn execute(&self, job: BlockingJob) -> anyhow::Result<Value> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|err| StagepipeError::Runtime(format!("isolated executor closed: {err}")))?;

        let (tx, rx) = oneshot::channel::<anyhow::Result<Vec<u8>>>();
        let name = format!("{}-isolated", self.name_prefix);
        debug!(thread = %name, "Starting isolated job");

        thread::Builder::new().name(name).spawn(move || {
            let result = match panic::catch_unwind(AssertUnwindSafe(job)) {
                Ok(result) => result.and_then(|value| Ok(serde_json::to_vec(&value)?)),
                Err(payload) => Err(TaskPanicked::from_payload(payload.as_ref()).into()),
            };
            // The caller may have gone away; nothing to report to then.
            let _ = tx.send(result);
        })?;

        let bytes = rx.await.map_err(|_| {
            StagepipeError::Runtime("isolated job exited without a result".to_string())
        })??;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// The pair of executors a pipeline run dispatches blocking calls to.
#[derive(Debug, Clone)]
pub struct Executors {
    /// Executor for ordinary blocking calls.
    pub threads: Arc<dyn Executor>,
    /// Executor for calls of multiprocess tasks.
    pub isolated: Arc<dyn Executor>,
}

impl Executors {
    /// Creates the executors described by `config`.
    #[must_use]
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            threads: Arc::new(BlockingPoolExecutor),
            isolated: Arc::new(IsolatedExecutor::new(
                config.isolated_workers,
                config.thread_name_prefix.clone(),
            )),
        }
    }

    /// Returns the executor for a task with the given multiprocess flag.
    #[must_use]
    pub fn for_task(&self, multiprocess: bool) -> &Arc<dyn Executor> {
        if multiprocess {
            &self.isolated
        } else {
            &self.threads
        }
    }
}

impl Default for Executors {
    fn default() -> Self {
        Self::new(&PipelineConfig::default())
    }
}
