//! Enqueue and dequeue strategies for worker threads.
//!
//! [`Enqueue`] turns one task invocation into zero or more queue writes;
//! [`Dequeue`] turns a stage's input queue into the lazy sequence of task
//! inputs one worker consumes.

use super::{Message, StageQueue};
use crate::control::ShutdownFlag;
use crate::errors::{InvalidPipelineShape, StagepipeError};
use crate::observability::StageStats;
use crate::task::{Task, TaskFn};
use serde_json::Value;
use std::sync::Arc;

/// Invokes a task and writes its output to a queue.
///
/// Branching tasks have every yielded element written individually; other
/// tasks write exactly one value per call. The shutdown flag is read before
/// every write, and once it is set the remaining output is dropped.
pub struct Enqueue {
    queue: Arc<StageQueue>,
    task: Task,
    shutdown: ShutdownFlag,
    stats: Arc<StageStats>,
}

impl Enqueue {
    /// Creates an enqueue strategy for `task` writing into `queue`.
    #[must_use]
    pub fn new(
        queue: Arc<StageQueue>,
        task: Task,
        shutdown: ShutdownFlag,
        stats: Arc<StageStats>,
    ) -> Self {
        Self {
            queue,
            task,
            shutdown,
            stats,
        }
    }

    /// Invokes the task on `input` and writes what it produces.
    pub fn call(&self, input: Value) -> anyhow::Result<()> {
        self.stats.record_processed();
        match self.task.func() {
            TaskFn::Sync(func) => {
                let output = func(input)?;
                self.emit(output)?;
            }
            TaskFn::Generator(func) => {
                for output in func(input) {
                    if !self.emit(output?)? {
                        break;
                    }
                }
            }
            TaskFn::Async(_) | TaskFn::AsyncGenerator(_) => {
                return Err(InvalidPipelineShape::AsyncTask {
                    task: self.task.name().to_string(),
                }
                .into());
            }
        }
        Ok(())
    }

    /// Writes one output unless shutdown was requested.
    ///
    /// Returns false if the output was dropped.
    fn emit(&self, output: Value) -> Result<bool, StagepipeError> {
        if self.shutdown.is_set() {
            self.stats.record_dropped();
            return Ok(false);
        }
        self.queue.put(output)?;
        self.stats.record_emitted();
        Ok(true)
    }
}

impl std::fmt::Debug for Enqueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Enqueue")
            .field("task", &self.task.name())
            .field("branch", &self.task.branch())
            .finish()
    }
}

/// The inputs one worker reads from its stage's input queue.
///
/// The sequence is lazy, finite and not restartable: it ends at the first
/// sentinel this worker reads. Upstream writes one sentinel per downstream
/// worker, after all of its data. A joining task sees a single
/// `Value::Array` holding everything read before the sentinel.
pub struct Dequeue {
    queue: Arc<StageQueue>,
    join: bool,
    collected: Vec<Value>,
    finished: bool,
}

impl Dequeue {
    /// Creates the input sequence for one worker of `task`.
    #[must_use]
    pub fn new(queue: Arc<StageQueue>, task: &Task) -> Self {
        Self {
            queue,
            join: task.join(),
            collected: Vec::new(),
            finished: false,
        }
    }

    /// Returns true once the sentinel has been read.
    #[must_use]
    pub const fn is_finished(&self) -> bool {
        self.finished
    }

    fn next_joined(&mut self) -> Option<Result<Value, StagepipeError>> {
        loop {
            match self.queue.get() {
                Ok(Message::Data(value)) => self.collected.push(value),
                Ok(Message::Stop) => {
                    self.finished = true;
                    return Some(Ok(Value::Array(std::mem::take(&mut self.collected))));
                }
                Err(err) => return Some(Err(err)),
            }
        }
    }
}

impl Iterator for Dequeue {
    type Item = Result<Value, StagepipeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        if self.join {
            return self.next_joined();
        }
        match self.queue.get() {
            Ok(Message::Data(value)) => Some(Ok(value)),
            Ok(Message::Stop) => {
                self.finished = true;
                None
            }
            Err(err) => Some(Err(err)),
        }
    }
}

impl std::fmt::Debug for Dequeue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dequeue")
            .field("join", &self.join)
            .field("finished", &self.finished)
            .finish()
    }
}
