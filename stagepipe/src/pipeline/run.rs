//! Thread-backed pipeline runs.

use super::PipelineConfig;
use crate::control::{ErrorSink, Scope, ShutdownFlag};
use crate::errors::{StagepipeError, WorkerFault};
use crate::observability::RunStats;
use crate::queue::{Message, StageQueue};
use crate::task::Task;
use crate::threaded::{Producer, ProducerConsumer, ThreadWorkerPool};
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, info_span, warn, Span};

/// A running pipeline, read as an iterator over the terminal stage's
/// outputs.
///
/// Outputs arrive in completion order. Once the terminal sentinel has been
/// read the workers are joined, and if any worker failed the first fault
/// is yielded as the final `Err` item. Outputs that reach the end of the
/// pipeline after a fault has been recorded are dropped.
///
/// Dropping an unfinished run requests shutdown and blocks until the
/// workers have drained.
pub struct PipelineRun {
    output: Arc<StageQueue>,
    pool: ThreadWorkerPool,
    shutdown: ShutdownFlag,
    errors: ErrorSink,
    stats: RunStats,
    terminal_stage: String,
    span: Span,
    finished: bool,
}

impl PipelineRun {
    pub(crate) fn start(
        tasks: &[Task],
        config: &PipelineConfig,
        input: Value,
    ) -> Result<Self, StagepipeError> {
        let Some((source_task, relay_tasks)) = tasks.split_first() else {
            return Err(StagepipeError::Runtime("pipeline has no tasks".to_string()));
        };

        let scope = Scope::widest(tasks.iter().map(Task::multiprocess));
        let shutdown = ShutdownFlag::new(scope);
        let errors = ErrorSink::new(scope);
        let mut stats = RunStats::new();
        let span = info_span!("pipeline_run", run_id = %stats.run_id(), stages = tasks.len());

        let source = Producer::new(
            source_task.clone(),
            relay_tasks.first(),
            errors.clone(),
            shutdown.clone(),
            stats.register(source_task.name()),
        )?;

        let mut relays: Vec<ProducerConsumer> = Vec::with_capacity(relay_tasks.len());
        let mut q_in = Arc::clone(source.q_out());
        for (idx, task) in relay_tasks.iter().enumerate() {
            let relay = ProducerConsumer::new(
                q_in,
                task.clone(),
                relay_tasks.get(idx + 1),
                errors.clone(),
                shutdown.clone(),
                stats.register(task.name()),
            );
            q_in = Arc::clone(relay.q_out());
            relays.push(relay);
        }

        let pool = ThreadWorkerPool::new(config.thread_name_prefix.clone());
        {
            let _entered = span.enter();
            info!(scope = %scope, "Pipeline run started");
            if let Err(err) = start_workers(&pool, &source, &relays, relay_tasks, input) {
                shutdown.set("worker pool failed");
                if let Err(join_err) = pool.join() {
                    warn!(error = %join_err, "Workers failed while unwinding a failed start");
                }
                return Err(err);
            }
        }

        let terminal_stage = tasks.last().map_or_else(String::new, |t| t.name().to_string());
        Ok(Self {
            output: q_in,
            pool,
            shutdown,
            errors,
            stats,
            terminal_stage,
            span,
            finished: false,
        })
    }

    /// Returns the run counters.
    #[must_use]
    pub const fn stats(&self) -> &RunStats {
        &self.stats
    }

    /// Returns true once shutdown was requested.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_set()
    }

    fn finish(&mut self) -> Result<(), StagepipeError> {
        self.finished = true;
        self.pool.join()?;

        info!(
            elapsed_ms = self.stats.elapsed_ms(),
            faults = self.stats.total_faults(),
            "Pipeline run finished"
        );
        match self.errors.take_first() {
            Some(fault) => {
                warn!(stage = %fault.stage, worker = fault.worker, "Surfacing first fault");
                Err(fault.into())
            }
            None => Ok(()),
        }
    }
}

/// Starts relays downstream-first, then the source.
///
/// When the pool refuses a worker, every stage below the failing one is
/// fed the sentinels it would otherwise have waited for.
fn start_workers(
    pool: &ThreadWorkerPool,
    source: &Producer,
    relays: &[ProducerConsumer],
    relay_tasks: &[Task],
    input: Value,
) -> Result<(), StagepipeError> {
    for (idx, relay) in relays.iter().enumerate().rev() {
        if let Err(err) = relay.start(pool) {
            release(relay.q_out(), relay_tasks.get(idx + 1));
            return Err(err);
        }
    }
    if let Err(err) = source.start(pool, input) {
        release(source.q_out(), relay_tasks.first());
        return Err(err);
    }
    Ok(())
}

fn release(queue: &StageQueue, reader: Option<&Task>) {
    if let Some(reader) = reader {
        for _ in 0..reader.concurrency() {
            queue.put_stop();
        }
    }
}

impl Iterator for PipelineRun {
    type Item = Result<Value, StagepipeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        let span = self.span.clone();
        let _entered = span.enter();

        loop {
            match self.output.get() {
                Ok(Message::Data(_)) if self.shutdown.is_set() => {}
                Ok(Message::Data(value)) => return Some(Ok(value)),
                Ok(Message::Stop) => return self.finish().err().map(Err),
                Err(err) => {
                    self.shutdown
                        .set(format!("output of stage '{}' unreadable", self.terminal_stage));
                    self.errors
                        .push(WorkerFault::new(self.terminal_stage.clone(), 0, err.into()));
                }
            }
        }
    }
}

impl Drop for PipelineRun {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let _entered = self.span.enter();
        self.shutdown.set("pipeline run dropped before completion");
        while !matches!(self.output.get(), Ok(Message::Stop)) {}
        if let Err(err) = self.pool.join() {
            warn!(error = %err, "Workers failed while draining a dropped run");
        }
        info!("Pipeline run abandoned");
    }
}

impl std::fmt::Debug for PipelineRun {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineRun")
            .field("run_id", &self.stats.run_id())
            .field("finished", &self.finished)
            .field("shutting_down", &self.shutdown.is_set())
            .finish()
    }
}
