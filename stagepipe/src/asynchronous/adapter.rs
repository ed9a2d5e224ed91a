//! Turns any task into one the async backend can await.

use super::Executors;
use crate::task::{Task, TaskFn};
use futures::stream;
use serde_json::Value;
use std::sync::Arc;
use tracing::trace;

/// Returns an awaitable equivalent of `task`.
///
/// - Async tasks come back unchanged, sharing the same callable, so the
///   adapter is idempotent.
/// - Generator tasks become async generators whose stream drives the
///   original iterator directly, without an executor.
/// - Plain tasks become async tasks whose call runs on
///   `executors.isolated` when the task is multiprocess and on
///   `executors.threads` otherwise. Inputs bound for the isolated executor
///   are serialized before they leave the caller.
///
/// Every option is preserved except `daemon`, which async tasks cannot
/// carry.
#[must_use]
pub fn asynchronize(task: &Task, executors: &Executors) -> Task {
    match task.func() {
        TaskFn::Async(_) | TaskFn::AsyncGenerator(_) => task.clone(),
        TaskFn::Generator(func) => {
            let func = Arc::clone(func);
            trace!(task = %task.name(), "Adapting generator task");
            task.with_func(TaskFn::async_generator(move |input| {
                stream::iter(func(input))
            }))
        }
        TaskFn::Sync(func) => {
            let func = Arc::clone(func);
            let multiprocess = task.multiprocess();
            let executor = Arc::clone(executors.for_task(multiprocess));
            trace!(task = %task.name(), multiprocess, "Adapting blocking task");
            task.with_func(TaskFn::asynchronous(move |input| {
                let func = Arc::clone(&func);
                let executor = Arc::clone(&executor);
                async move {
                    if !multiprocess {
                        return executor.execute(Box::new(move || func(input))).await;
                    }
                    match serde_json::to_vec(&input) {
                        Ok(bytes) => {
                            executor
                                .execute(Box::new(move || -> anyhow::Result<Value> {
                                    func(serde_json::from_slice(&bytes)?)
                                }))
                                .await
                        }
                        Err(err) => Err(err.into()),
                    }
                }
            }))
        }
    }
}
