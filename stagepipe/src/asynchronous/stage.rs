//! Source and relay stage runners for tokio workers.
//!
//! These follow the same protocol as the threaded runners: one sentinel per
//! downstream worker, written by the last worker of a stage to finish, and
//! a worker that failed keeps draining its input up to its own sentinel.

use super::{AsyncDequeue, AsyncEnqueue, AsyncStageQueue};
use crate::control::{Arrival, CompletionCounter, ErrorSink, Scope, ShutdownFlag};
use crate::errors::{InvalidPipelineShape, TaskPanicked, WorkerFault};
use crate::observability::StageStats;
use crate::task::Task;
use futures::FutureExt;
use serde_json::Value;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, error};

fn settle(outcome: Result<anyhow::Result<()>, Box<dyn Any + Send>>) -> anyhow::Result<()> {
    match outcome {
        Ok(result) => result,
        Err(payload) => {
            let panicked = TaskPanicked::from_payload(payload.as_ref());
            error!(panic = %panicked.message, "Task panicked");
            Err(panicked.into())
        }
    }
}

async fn send_stops(stage: &str, queue: &AsyncStageQueue, count: usize) {
    for _ in 0..count {
        if let Err(err) = queue.put_stop().await {
            error!(stage, error = %err, "Failed to write sentinel");
        }
    }
}

struct SourceState {
    task: Task,
    q_out: Arc<AsyncStageQueue>,
    enqueue: AsyncEnqueue,
    errors: ErrorSink,
    shutdown: ShutdownFlag,
    stats: Arc<StageStats>,
    n_consumers: usize,
}

impl SourceState {
    async fn work(self: Arc<Self>, input: Value) {
        debug!(stage = %self.task.name(), "Async source worker started");

        let outcome = AssertUnwindSafe(self.enqueue.call(input)).catch_unwind().await;
        if let Err(err) = settle(outcome) {
            self.shutdown
                .set(format!("source stage '{}' failed", self.task.name()));
            self.stats.record_fault();
            self.errors.push(WorkerFault::new(self.task.name(), 0, err));
        }

        send_stops(self.task.name(), &self.q_out, self.n_consumers).await;
        debug!(stage = %self.task.name(), "Async source worker finished");
    }
}

/// Async runner for the first stage of a pipeline.
pub struct AsyncProducer {
    state: Arc<SourceState>,
}

impl AsyncProducer {
    /// Creates the runner and its output queue.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidPipelineShape`] if the task has a concurrency above
    /// 1 or joins its input.
    pub fn new(
        task: Task,
        next_task: Option<&Task>,
        errors: ErrorSink,
        shutdown: ShutdownFlag,
        stats: Arc<StageStats>,
    ) -> Result<Self, InvalidPipelineShape> {
        if task.concurrency() > 1 {
            return Err(InvalidPipelineShape::ConcurrentSource {
                task: task.name().to_string(),
                concurrency: task.concurrency(),
            });
        }
        if task.join() {
            return Err(InvalidPipelineShape::JoiningSource {
                task: task.name().to_string(),
            });
        }

        let q_out = Arc::new(AsyncStageQueue::for_boundary(&task, next_task));
        let enqueue = AsyncEnqueue::new(
            Arc::clone(&q_out),
            task.clone(),
            shutdown.clone(),
            Arc::clone(&stats),
        );

        Ok(Self {
            state: Arc::new(SourceState {
                task,
                q_out,
                enqueue,
                errors,
                shutdown,
                stats,
                n_consumers: next_task.map_or(1, Task::concurrency),
            }),
        })
    }

    /// Returns the output queue.
    #[must_use]
    pub fn q_out(&self) -> &Arc<AsyncStageQueue> {
        &self.state.q_out
    }

    /// Spawns the single source worker into `workers`.
    pub fn start(&self, workers: &mut JoinSet<()>, input: Value) {
        workers.spawn(Arc::clone(&self.state).work(input));
    }
}

impl std::fmt::Debug for AsyncProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncProducer")
            .field("task", &self.state.task.name())
            .field("n_consumers", &self.state.n_consumers)
            .finish()
    }
}

struct RelayState {
    task: Task,
    q_in: Arc<AsyncStageQueue>,
    q_out: Arc<AsyncStageQueue>,
    enqueue: AsyncEnqueue,
    errors: ErrorSink,
    shutdown: ShutdownFlag,
    stats: Arc<StageStats>,
    workers_done: CompletionCounter,
    n_consumers: usize,
}

impl RelayState {
    async fn work(self: Arc<Self>, worker: usize) {
        debug!(stage = %self.task.name(), worker, "Async relay worker started");

        let mut inputs = AsyncDequeue::new(Arc::clone(&self.q_in), &self.task);
        let outcome = AssertUnwindSafe(self.consume(&mut inputs))
            .catch_unwind()
            .await;
        if let Err(err) = settle(outcome) {
            self.shutdown.set(format!(
                "worker {worker} of stage '{}' failed",
                self.task.name()
            ));
            self.stats.record_fault();
            self.errors
                .push(WorkerFault::new(self.task.name(), worker, err));

            while inputs.next().await.is_some() {
                self.stats.record_dropped();
            }
        }

        match self.workers_done.arrive() {
            Arrival::Last => {
                send_stops(self.task.name(), &self.q_out, self.n_consumers).await;
                debug!(stage = %self.task.name(), worker, "Last async relay worker finished");
            }
            Arrival::Pending { remaining } => {
                debug!(stage = %self.task.name(), worker, remaining, "Async relay worker finished");
            }
        }
    }

    async fn consume(&self, inputs: &mut AsyncDequeue) -> anyhow::Result<()> {
        while let Some(input) = inputs.next().await {
            let input = input?;
            if self.shutdown.is_set() {
                self.stats.record_dropped();
                continue;
            }
            self.enqueue.call(input).await?;
        }
        Ok(())
    }
}

/// Async runner for every stage after the first.
pub struct AsyncProducerConsumer {
    state: Arc<RelayState>,
}

impl AsyncProducerConsumer {
    /// Creates the runner and its output queue.
    pub fn new(
        q_in: Arc<AsyncStageQueue>,
        task: Task,
        next_task: Option<&Task>,
        errors: ErrorSink,
        shutdown: ShutdownFlag,
        stats: Arc<StageStats>,
    ) -> Self {
        let q_out = Arc::new(AsyncStageQueue::for_boundary(&task, next_task));
        let enqueue = AsyncEnqueue::new(
            Arc::clone(&q_out),
            task.clone(),
            shutdown.clone(),
            Arc::clone(&stats),
        );
        let workers_done = CompletionCounter::new(
            task.concurrency(),
            Scope::for_multiprocess(task.multiprocess()),
        );

        Self {
            state: Arc::new(RelayState {
                task,
                q_in,
                q_out,
                enqueue,
                errors,
                shutdown,
                stats,
                workers_done,
                n_consumers: next_task.map_or(1, Task::concurrency),
            }),
        }
    }

    /// Returns the output queue.
    #[must_use]
    pub fn q_out(&self) -> &Arc<AsyncStageQueue> {
        &self.state.q_out
    }

    /// Returns the number of workers that have finished.
    #[must_use]
    pub fn workers_done(&self) -> usize {
        self.state.workers_done.completed()
    }

    /// Spawns `concurrency` workers into `workers`.
    pub fn start(&self, workers: &mut JoinSet<()>) {
        for worker in 0..self.state.task.concurrency() {
            workers.spawn(Arc::clone(&self.state).work(worker));
        }
    }
}

impl std::fmt::Debug for AsyncProducerConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncProducerConsumer")
            .field("task", &self.state.task.name())
            .field("concurrency", &self.state.task.concurrency())
            .field("workers_done", &self.workers_done())
            .finish()
    }
}
