//! # Stagepipe
//!
//! Linear, multi-stage data pipelines with per-stage concurrency and
//! backpressure.
//!
//! Stagepipe provides:
//!
//! - **Validated task descriptors**: each stage declares its callable and how
//!   it runs (workers, queue bound, fan-out, fan-in, isolation)
//! - **Clean termination**: every stage tells its downstream neighbour when
//!   it is done, exactly once per downstream worker
//! - **Fault propagation**: the first failure from any worker reaches the
//!   caller while the rest of the pipeline drains
//! - **Two backends**: OS worker threads, or tokio tasks for async callables
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use stagepipe::prelude::*;
//! use serde_json::json;
//!
//! let source = Task::builder(TaskFn::generator(|input| match input {
//!     serde_json::Value::Array(items) => items.into_iter().map(Ok).collect::<Vec<_>>(),
//!     other => vec![Ok(other)],
//! }))
//! .name("emit")
//! .branch(true)
//! .build()?;
//!
//! let double = Task::builder(TaskFn::sync(|v| Ok(json!(v.as_i64().unwrap_or(0) * 2))))
//!     .name("double")
//!     .concurrency(3)
//!     .throttle(16)
//!     .build()?;
//!
//! let outputs = (source | double).run(json!([1, 2, 3, 4, 5]))?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod asynchronous;
pub mod control;
pub mod errors;
pub mod observability;
pub mod pipeline;
pub mod queue;
pub mod task;
pub mod testing;
pub mod threaded;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::asynchronous::{asynchronize, Executor, Executors};
    pub use crate::control::{ErrorSink, Scope, ShutdownFlag};
    pub use crate::errors::{
        ContractErrorInfo, InvalidPipelineShape, InvalidTaskConfig, StagepipeError,
        TaskPanicked, WorkerFault,
    };
    pub use crate::observability::{init_tracing, LogFormat, RunStats};
    pub use crate::pipeline::{Pipeline, PipelineConfig, PipelineRun};
    pub use crate::queue::{Message, Transport};
    pub use crate::task::{Task, TaskBuilder, TaskFn, TaskKind, TaskOptions};
}
