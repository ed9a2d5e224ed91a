//! Source and relay stage runners.
//!
//! A [`Producer`] runs the first stage of a pipeline with a single worker.
//! A [`ProducerConsumer`] runs every later stage with `concurrency` workers
//! sharing one input queue and one output queue. Both guarantee that the
//! downstream stage receives exactly one sentinel per downstream worker,
//! whether their own workers succeed, fail or panic.

use super::{WorkerPool, WorkerSpec};
use crate::control::{Arrival, CompletionCounter, ErrorSink, Scope, ShutdownFlag};
use crate::errors::{InvalidPipelineShape, StagepipeError, TaskPanicked, WorkerFault};
use crate::observability::StageStats;
use crate::queue::{Dequeue, Enqueue, StageQueue};
use crate::task::Task;
use serde_json::Value;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, error};

/// Runs `body`, turning a panic into an error.
fn catch_fault(body: impl FnOnce() -> anyhow::Result<()>) -> anyhow::Result<()> {
    match panic::catch_unwind(AssertUnwindSafe(body)) {
        Ok(result) => result,
        Err(payload) => {
            let panicked = TaskPanicked::from_payload(payload.as_ref());
            error!(panic = %panicked.message, "Task panicked");
            Err(panicked.into())
        }
    }
}

/// Number of sentinels a stage owes its downstream neighbour.
fn consumers_of(next_task: Option<&Task>) -> usize {
    next_task.map_or(1, Task::concurrency)
}

struct SourceState {
    task: Task,
    q_out: Arc<StageQueue>,
    enqueue: Enqueue,
    errors: ErrorSink,
    shutdown: ShutdownFlag,
    stats: Arc<StageStats>,
    n_consumers: usize,
}

impl SourceState {
    fn work(&self, input: Value) {
        debug!(stage = %self.task.name(), "Source worker started");

        if let Err(err) = catch_fault(|| self.enqueue.call(input)) {
            self.shutdown
                .set(format!("source stage '{}' failed", self.task.name()));
            self.stats.record_fault();
            self.errors.push(WorkerFault::new(self.task.name(), 0, err));
        }

        for _ in 0..self.n_consumers {
            self.q_out.put_stop();
        }
        debug!(
            stage = %self.task.name(),
            sentinels = self.n_consumers,
            "Source worker finished"
        );
    }
}

/// Runner for the first stage of a pipeline.
///
/// The source stage has no input queue; its single worker is called with
/// the caller-supplied input.
pub struct Producer {
    state: Arc<SourceState>,
}

impl Producer {
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

        let q_out = Arc::new(StageQueue::for_boundary(&task, next_task));
        let enqueue = Enqueue::new(
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
                n_consumers: consumers_of(next_task),
            }),
        })
    }

    /// Returns the output queue.
    #[must_use]
    pub fn q_out(&self) -> &Arc<StageQueue> {
        &self.state.q_out
    }

    /// Submits the single source worker.
    pub fn start(&self, pool: &dyn WorkerPool, input: Value) -> Result<(), StagepipeError> {
        let task = &self.state.task;
        let spec = WorkerSpec::new(task.name(), 0)
            .with_daemon(task.daemon())
            .with_multiprocess(task.multiprocess());

        let state = Arc::clone(&self.state);
        pool.submit(spec, Box::new(move || state.work(input)))
    }
}

impl std::fmt::Debug for Producer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Producer")
            .field("task", &self.state.task.name())
            .field("n_consumers", &self.state.n_consumers)
            .finish()
    }
}

struct RelayState {
    task: Task,
    q_in: Arc<StageQueue>,
    q_out: Arc<StageQueue>,
    enqueue: Enqueue,
    errors: ErrorSink,
    shutdown: ShutdownFlag,
    stats: Arc<StageStats>,
    workers_done: CompletionCounter,
    n_consumers: usize,
}

impl RelayState {
    fn work(&self, worker: usize) {
        debug!(stage = %self.task.name(), worker, "Relay worker started");

        let mut inputs = Dequeue::new(Arc::clone(&self.q_in), &self.task);
        if let Err(err) = catch_fault(|| self.consume(&mut inputs)) {
            self.shutdown.set(format!(
                "worker {worker} of stage '{}' failed",
                self.task.name()
            ));
            self.stats.record_fault();
            self.errors
                .push(WorkerFault::new(self.task.name(), worker, err));

            // Keep reading up to our sentinel so upstream writers never
            // block on a queue nobody drains.
            for _ in inputs.by_ref() {
                self.stats.record_dropped();
            }
        }

        self.finish(worker);
    }

    fn consume(&self, inputs: &mut Dequeue) -> anyhow::Result<()> {
        for input in inputs {
            let input = input?;
            if self.shutdown.is_set() {
                self.stats.record_dropped();
                continue;
            }
            self.enqueue.call(input)?;
        }
        Ok(())
    }

    fn finish(&self, worker: usize) {
        match self.workers_done.arrive() {
            Arrival::Last => {
                for _ in 0..self.n_consumers {
                    self.q_out.put_stop();
                }
                debug!(
                    stage = %self.task.name(),
                    worker,
                    sentinels = self.n_consumers,
                    "Last relay worker finished"
                );
            }
            Arrival::Pending { remaining } => {
                debug!(stage = %self.task.name(), worker, remaining, "Relay worker finished");
            }
        }
    }
}

/// Runner for every stage after the first.
///
/// All `concurrency` workers read the same input queue and write the same
/// output queue. Only the last worker to finish writes the downstream
/// sentinels.
pub struct ProducerConsumer {
    state: Arc<RelayState>,
}

impl ProducerConsumer {
    /// Creates the runner and its output queue.
    pub fn new(
        q_in: Arc<StageQueue>,
        task: Task,
        next_task: Option<&Task>,
        errors: ErrorSink,
        shutdown: ShutdownFlag,
        stats: Arc<StageStats>,
    ) -> Self {
        let q_out = Arc::new(StageQueue::for_boundary(&task, next_task));
        let enqueue = Enqueue::new(
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
                n_consumers: consumers_of(next_task),
            }),
        }
    }

    /// Returns the output queue.
    #[must_use]
    pub fn q_out(&self) -> &Arc<StageQueue> {
        &self.state.q_out
    }

    /// Returns the number of workers that have finished.
    #[must_use]
    pub fn workers_done(&self) -> usize {
        self.state.workers_done.completed()
    }

    /// Submits `concurrency` workers.
    ///
    /// If the pool refuses a worker, the workers already submitted are sent
    /// one sentinel each so they exit, and the error is returned. The stage
    /// then never writes its own downstream sentinels.
    pub fn start(&self, pool: &dyn WorkerPool) -> Result<(), StagepipeError> {
        let task = &self.state.task;
        for worker in 0..task.concurrency() {
            let spec = WorkerSpec::new(task.name(), worker)
                .with_daemon(task.daemon())
                .with_multiprocess(task.multiprocess());
            let state = Arc::clone(&self.state);
            if let Err(err) = pool.submit(spec, Box::new(move || state.work(worker))) {
                error!(stage = %task.name(), worker, error = %err, "Failed to start relay worker");
                for _ in 0..worker {
                    self.state.q_in.put_stop();
                }
                return Err(err);
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for ProducerConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProducerConsumer")
            .field("task", &self.state.task.name())
            .field("concurrency", &self.state.task.concurrency())
            .field("n_consumers", &self.state.n_consumers)
            .field("workers_done", &self.workers_done())
            .finish()
    }
}
