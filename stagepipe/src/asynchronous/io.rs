//! Enqueue and dequeue strategies for tokio workers.

use super::AsyncStageQueue;
use crate::control::ShutdownFlag;
use crate::errors::StagepipeError;
use crate::observability::StageStats;
use crate::queue::Message;
use crate::task::{Task, TaskFn};
use futures::StreamExt;
use serde_json::Value;
use std::sync::Arc;

/// Awaits a task and writes its output to a queue.
///
/// Expects a task already passed through
/// [`asynchronize`](super::asynchronize).
pub struct AsyncEnqueue {
    queue: Arc<AsyncStageQueue>,
    task: Task,
    shutdown: ShutdownFlag,
    stats: Arc<StageStats>,
}

impl AsyncEnqueue {
    /// Creates an enqueue strategy for `task` writing into `queue`.
    #[must_use]
    pub fn new(
        queue: Arc<AsyncStageQueue>,
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

    /// Awaits the task on `input` and writes what it produces.
    pub async fn call(&self, input: Value) -> anyhow::Result<()> {
        self.stats.record_processed();
        match self.task.func() {
            TaskFn::Async(func) => {
                let output = func(input).await?;
                self.emit(output).await?;
            }
            TaskFn::AsyncGenerator(func) => {
                let mut outputs = func(input);
                while let Some(output) = outputs.next().await {
                    if !self.emit(output?).await? {
                        break;
                    }
                }
            }
            TaskFn::Sync(_) | TaskFn::Generator(_) => {
                return Err(StagepipeError::Runtime(format!(
                    "task '{}' must be asynchronized before it runs on the async backend",
                    self.task.name()
                ))
                .into());
            }
        }
        Ok(())
    }

    async fn emit(&self, output: Value) -> Result<bool, StagepipeError> {
        if self.shutdown.is_set() {
            self.stats.record_dropped();
            return Ok(false);
        }
        self.queue.put(output).await?;
        self.stats.record_emitted();
        Ok(true)
    }
}

impl std::fmt::Debug for AsyncEnqueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncEnqueue")
            .field("task", &self.task.name())
            .field("branch", &self.task.branch())
            .finish()
    }
}

/// The inputs one async worker reads from its stage's input queue.
///
/// Mirrors [`Dequeue`](crate::queue::Dequeue): it ends at the first
/// sentinel, and a joining task receives one `Value::Array`.
pub struct AsyncDequeue {
    queue: Arc<AsyncStageQueue>,
    join: bool,
    collected: Vec<Value>,
    finished: bool,
}

impl AsyncDequeue {
    /// Creates the input sequence for one worker of `task`.
    #[must_use]
    pub fn new(queue: Arc<AsyncStageQueue>, task: &Task) -> Self {
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

    /// Reads the next input, or `None` once the sentinel has been read.
    pub async fn next(&mut self) -> Option<Result<Value, StagepipeError>> {
        while !self.finished {
            match self.queue.get().await {
                Ok(Message::Data(value)) if self.join => self.collected.push(value),
                Ok(Message::Data(value)) => return Some(Ok(value)),
                Ok(Message::Stop) => {
                    self.finished = true;
                    if self.join {
                        return Some(Ok(Value::Array(std::mem::take(&mut self.collected))));
                    }
                }
                Err(err @ StagepipeError::Runtime(_)) => {
                    // The channel itself is gone; nothing more will arrive.
                    self.finished = true;
                    return Some(Err(err));
                }
                Err(err) => return Some(Err(err)),
            }
        }
        None
    }
}

impl std::fmt::Debug for AsyncDequeue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncDequeue")
            .field("join", &self.join)
            .field("finished", &self.finished)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::Transport;
    use futures::stream;
    use serde_json::json;

    fn queue() -> Arc<AsyncStageQueue> {
        Arc::new(AsyncStageQueue::new(0, Transport::Local))
    }

    #[tokio::test]
    async fn test_async_generator_writes_each_element() {
        let q = queue();
        let task = Task::builder(TaskFn::async_generator(|v| {
            stream::iter(vec![Ok(json!([v.clone(), 1])), Ok(json!([v, 2]))])
        }))
        .branch(true)
        .build()
        .unwrap();
        let enqueue = AsyncEnqueue::new(
            Arc::clone(&q),
            task,
            ShutdownFlag::default(),
            Arc::new(StageStats::default()),
        );

        enqueue.call(json!("x")).await.unwrap();

        assert_eq!(q.get().await.unwrap(), Message::Data(json!(["x", 1])));
        assert_eq!(q.get().await.unwrap(), Message::Data(json!(["x", 2])));
    }

    #[tokio::test]
    async fn test_shutdown_drops_output() {
        let q = queue();
        let shutdown = ShutdownFlag::default();
        shutdown.set("failed elsewhere");
        let task = Task::builder(TaskFn::asynchronous(|v| async move { Ok(v) }))
            .build()
            .unwrap();
        let enqueue = AsyncEnqueue::new(
            Arc::clone(&q),
            task,
            shutdown,
            Arc::new(StageStats::default()),
        );

        enqueue.call(json!(1)).await.unwrap();
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn test_unadapted_task_rejected() {
        let task = Task::builder(TaskFn::sync(Ok)).name("plain").build().unwrap();
        let enqueue = AsyncEnqueue::new(
            queue(),
            task,
            ShutdownFlag::default(),
            Arc::new(StageStats::default()),
        );

        let err = enqueue.call(json!(1)).await.unwrap_err();
        assert!(err.to_string().contains("plain"));
    }

    #[tokio::test]
    async fn test_dequeue_join_and_stop() {
        let q = queue();
        for i in 0..3 {
            q.put(json!(i)).await.unwrap();
        }
        q.put_stop().await.unwrap();
        q.put(json!("after")).await.unwrap();

        let task = Task::builder(TaskFn::sync(Ok)).join(true).build().unwrap();
        let mut inputs = AsyncDequeue::new(Arc::clone(&q), &task);

        assert_eq!(inputs.next().await.unwrap().unwrap(), json!([0, 1, 2]));
        assert!(inputs.next().await.is_none());
        assert!(inputs.is_finished());
        assert_eq!(q.len(), 1);
    }
}
