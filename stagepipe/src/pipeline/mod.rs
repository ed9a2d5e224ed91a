//! Pipeline building and execution.
//!
//! This module provides:
//! - `Pipeline`, a linear chain of tasks built with `then` or `|`
//! - `PipelineRun`, the streaming handle of a thread-backed run
//! - `PipelineConfig`, run-level settings

mod async_run;
mod config;
mod run;

pub use config::{PipelineConfig, ENV_ISOLATED_WORKERS, ENV_THREAD_PREFIX};
pub use run::PipelineRun;

use crate::control::Scope;
use crate::errors::{InvalidPipelineShape, StagepipeError};
use crate::task::Task;
use serde_json::Value;
use std::ops::BitOr;

/// A linear chain of tasks. The first task is the source.
#[derive(Debug, Clone)]
pub struct Pipeline {
    tasks: Vec<Task>,
    config: PipelineConfig,
}

impl Pipeline {
    /// Starts a pipeline at `source`.
    #[must_use]
    pub fn new(source: Task) -> Self {
        Self {
            tasks: vec![source],
            config: PipelineConfig::default(),
        }
    }

    /// Appends a stage.
    #[must_use]
    pub fn then(mut self, task: Task) -> Self {
        self.tasks.push(task);
        self
    }

    /// Replaces the run configuration.
    #[must_use]
    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Returns the tasks in order.
    #[must_use]
    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    /// Returns the run configuration.
    #[must_use]
    pub const fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Returns the scope the run-wide shutdown flag and error sink need.
    #[must_use]
    pub fn scope(&self) -> Scope {
        Scope::widest(self.tasks.iter().map(Task::multiprocess))
    }

    /// Checks the shape of the chain without running it.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidPipelineShape`] if the source task is concurrent or
    /// joins its input.
    pub fn validate(&self) -> Result<(), InvalidPipelineShape> {
        let Some(source) = self.tasks.first() else {
            return Ok(());
        };
        if source.concurrency() > 1 {
            return Err(InvalidPipelineShape::ConcurrentSource {
                task: source.name().to_string(),
                concurrency: source.concurrency(),
            });
        }
        if source.join() {
            return Err(InvalidPipelineShape::JoiningSource {
                task: source.name().to_string(),
            });
        }
        Ok(())
    }

    /// Starts a thread-backed run and returns its output iterator.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidPipelineShape`] if the chain is malformed or holds
    /// an async task, and [`StagepipeError::Runtime`] or
    /// [`StagepipeError::Io`] if the worker threads cannot be started.
    pub fn stream(&self, input: Value) -> Result<PipelineRun, StagepipeError> {
        self.validate()?;
        if let Some(task) = self.tasks.iter().find(|t| t.is_async()) {
            return Err(InvalidPipelineShape::AsyncTask {
                task: task.name().to_string(),
            }
            .into());
        }
        PipelineRun::start(&self.tasks, &self.config, input)
    }

    /// Runs the pipeline on worker threads and collects every output.
    ///
    /// # Errors
    ///
    /// Returns the first worker fault, or any error [`stream`](Self::stream)
    /// returns.
    pub fn run(&self, input: Value) -> Result<Vec<Value>, StagepipeError> {
        self.stream(input)?.collect()
    }

    /// Runs the pipeline on the current tokio runtime and collects every
    /// output.
    ///
    /// Any task kind is accepted; blocking tasks are dispatched to
    /// executors.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidPipelineShape`] if the chain is malformed, or the
    /// first worker fault.
    pub async fn run_async(&self, input: Value) -> Result<Vec<Value>, StagepipeError> {
        self.validate()?;
        async_run::run(&self.tasks, &self.config, input).await
    }
}

impl From<Task> for Pipeline {
    fn from(source: Task) -> Self {
        Self::new(source)
    }
}

impl BitOr<Task> for Pipeline {
    type Output = Self;

    fn bitor(self, task: Task) -> Self {
        self.then(task)
    }
}

impl BitOr<Task> for Task {
    type Output = Pipeline;

    fn bitor(self, task: Task) -> Pipeline {
        Pipeline::new(self).then(task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskFn;
    use crate::testing::{
        assert_same_items, assert_worker_fault, doubler, emit_each, fail_on_nth, pairs, summer,
        ValueError,
    };
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_bitor_chains_in_order() {
        let pipeline = emit_each() | doubler(2) | summer();
        let names: Vec<&str> = pipeline.tasks().iter().map(Task::name).collect();
        assert_eq!(names, vec!["emit_each", "doubler", "summer"]);
    }

    #[test]
    fn test_scope_widens_for_multiprocess() {
        let isolated = Task::builder(TaskFn::sync(Ok))
            .multiprocess(true)
            .build()
            .unwrap();
        assert_eq!((emit_each() | doubler(1)).scope(), Scope::Thread);
        assert_eq!((emit_each() | isolated).scope(), Scope::Process);
    }

    #[test]
    fn test_run_doubles_every_item() {
        let outputs = (emit_each() | doubler(3)).run(json!([1, 2, 3, 4, 5])).unwrap();
        assert_same_items(
            &outputs,
            &[json!(2), json!(4), json!(6), json!(8), json!(10)],
        );
    }

    #[test]
    fn test_single_stage_keeps_order() {
        let outputs = Pipeline::new(emit_each()).run(json!(["a", "b", "c"])).unwrap();
        assert_eq!(outputs, vec![json!("a"), json!("b"), json!("c")]);
    }

    #[test]
    fn test_join_sums_stream() {
        let outputs = (emit_each() | doubler(2) | summer())
            .run(json!([1, 2, 3]))
            .unwrap();
        assert_eq!(outputs, vec![json!(12)]);
    }

    #[test]
    fn test_branch_fans_out() {
        let outputs = (emit_each() | pairs(2)).run(json!([1, 2])).unwrap();
        assert_same_items(
            &outputs,
            &[json!([1, "a"]), json!([1, "b"]), json!([2, "a"]), json!([2, "b"])],
        );
    }

    #[test]
    fn test_fault_is_surfaced() {
        let err = (emit_each() | fail_on_nth(3, 2))
            .run(json!([1, 2, 3, 4, 5, 6]))
            .unwrap_err();
        assert_eq!(assert_worker_fault::<ValueError>(&err).item, 3);
    }

    #[test]
    fn test_concurrent_source_rejected() {
        let err = Pipeline::new(doubler(2)).run(json!(1)).unwrap_err();
        assert!(matches!(
            err,
            StagepipeError::InvalidPipelineShape(InvalidPipelineShape::ConcurrentSource { .. })
        ));
    }

    #[test]
    fn test_joining_source_rejected() {
        assert!(matches!(
            Pipeline::new(summer()).validate(),
            Err(InvalidPipelineShape::JoiningSource { .. })
        ));
    }

    #[test]
    fn test_empty_chain_fails_to_run_without_panicking() {
        let pipeline = Pipeline {
            tasks: Vec::new(),
            config: PipelineConfig::default(),
        };
        assert!(pipeline.validate().is_ok());
        assert!(matches!(
            pipeline.run(json!(1)),
            Err(StagepipeError::Runtime(_))
        ));
    }

    #[test]
    fn test_async_task_rejected_on_threads() {
        let task = Task::builder(TaskFn::asynchronous(|v| async move { Ok(v) }))
            .name("fetch")
            .build()
            .unwrap();
        let err = (emit_each() | task).run(json!([1])).unwrap_err();
        let info = err.error_info().unwrap();
        assert_eq!(info.code, "PIPELINE-003-ASYNC_TASK");
    }

    #[test]
    fn test_stream_yields_items_then_ends() {
        let mut run = (emit_each() | doubler(1)).stream(json!([5, 6])).unwrap();
        assert_eq!(run.next().unwrap().unwrap(), json!(10));
        assert_eq!(run.next().unwrap().unwrap(), json!(12));
        assert!(run.next().is_none());
        assert!(run.next().is_none());

        let first = run.stats().stage(0).unwrap();
        assert_eq!(first.emitted, 2);
    }

    #[test]
    fn test_dropping_unfinished_run_drains() {
        let mut run = (crate::testing::range_source(10_000) | doubler(2))
            .stream(Value::Null)
            .unwrap();
        assert!(run.next().unwrap().is_ok());
        drop(run);
    }

    #[tokio::test]
    async fn test_run_async_accepts_sync_tasks() {
        let outputs = (emit_each() | doubler(2))
            .run_async(json!([1, 2]))
            .await
            .unwrap();
        assert_same_items(&outputs, &[json!(2), json!(4)]);
    }
}
