//! Thread-backed stage runners.
//!
//! Every worker runs on its own OS thread and talks to its neighbours
//! through blocking [`StageQueue`](crate::queue::StageQueue)s.

mod pool;
mod stage;

pub use pool::{Job, ThreadWorkerPool, WorkerPool, WorkerSpec};
pub use stage::{Producer, ProducerConsumer};

#[cfg(test)]
pub use pool::MockWorkerPool;
