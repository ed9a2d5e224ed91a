//! Error types for the stagepipe framework.
//!
//! Construction-time problems (`InvalidTaskConfig`, `InvalidPipelineShape`)
//! are returned synchronously to whoever declares the pipeline. Failures
//! raised by task code while the pipeline runs are captured at the worker
//! boundary as [`WorkerFault`]s and surfaced by the driver once the run has
//! drained.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// The main error type for stagepipe operations.
#[derive(Debug, Error)]
pub enum StagepipeError {
    /// A task descriptor was rejected at construction.
    #[error("{0}")]
    InvalidTaskConfig(#[from] InvalidTaskConfig),

    /// The chain of tasks cannot form a pipeline.
    #[error("{0}")]
    InvalidPipelineShape(#[from] InvalidPipelineShape),

    /// A worker failed while the pipeline was running.
    #[error("{0}")]
    Worker(#[from] WorkerFault),

    /// A configuration value could not be used.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The worker pool or runtime failed.
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StagepipeError {
    /// Returns the worker fault, if this error is one.
    #[must_use]
    pub fn as_worker_fault(&self) -> Option<&WorkerFault> {
        match self {
            Self::Worker(fault) => Some(fault),
            _ => None,
        }
    }

    /// Returns the contract info for construction errors.
    #[must_use]
    pub fn error_info(&self) -> Option<ContractErrorInfo> {
        match self {
            Self::InvalidTaskConfig(err) => Some(err.error_info()),
            Self::InvalidPipelineShape(err) => Some(err.error_info()),
            _ => None,
        }
    }
}

/// Metadata about a contract error for better diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct ContractErrorInfo {
    /// Error code (e.g., "TASK-001-CONCURRENCY").
    pub code: String,
    /// Short summary of the error.
    pub summary: String,
    /// Hint for fixing the error.
    pub fix_hint: Option<String>,
    /// Additional context key-value pairs.
    #[serde(default)]
    pub context: HashMap<String, String>,
}

impl ContractErrorInfo {
    /// Creates a new contract error info.
    #[must_use]
    pub fn new(code: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            summary: summary.into(),
            fix_hint: None,
            context: HashMap::new(),
        }
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }

    /// Adds a single context entry.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Error raised when a task descriptor fails validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidTaskConfig {
    /// A stage needs at least one worker.
    #[error("concurrency cannot be less than 1 (got {concurrency})")]
    ConcurrencyTooLow {
        /// The rejected value.
        concurrency: i64,
    },

    /// Output queue bounds cannot be negative.
    #[error("throttle cannot be less than 0 (got {throttle})")]
    NegativeThrottle {
        /// The rejected value.
        throttle: i64,
    },

    /// `branch` was requested for a callable that yields one value.
    #[error("branching task '{task}' must exhibit generator behaviour")]
    BranchRequiresGenerator {
        /// The task name.
        task: String,
    },

    /// A generator callable was declared without `branch`.
    #[error("non-branching task '{task}' cannot be a generator")]
    GeneratorRequiresBranch {
        /// The task name.
        task: String,
    },

    /// Async callables cannot run as daemon workers.
    #[error("daemon cannot be true for async task '{task}'")]
    AsyncDaemon {
        /// The task name.
        task: String,
    },
}

impl InvalidTaskConfig {
    /// Returns the stable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::ConcurrencyTooLow { .. } => "TASK-001-CONCURRENCY",
            Self::NegativeThrottle { .. } => "TASK-002-THROTTLE",
            Self::BranchRequiresGenerator { .. } => "TASK-003-BRANCH",
            Self::GeneratorRequiresBranch { .. } => "TASK-004-GENERATOR",
            Self::AsyncDaemon { .. } => "TASK-005-DAEMON",
        }
    }

    /// Returns contract info with a fix hint.
    #[must_use]
    pub fn error_info(&self) -> ContractErrorInfo {
        let hint = match self {
            Self::ConcurrencyTooLow { .. } => "Run every stage with at least one worker.",
            Self::NegativeThrottle { .. } => "Use 0 for an unbounded output queue.",
            Self::BranchRequiresGenerator { .. } => {
                "Build the task with TaskFn::generator or TaskFn::async_generator."
            }
            Self::GeneratorRequiresBranch { .. } => "Set branch = true for generator tasks.",
            Self::AsyncDaemon { .. } => "Drop the daemon flag; async workers are always awaited.",
        };
        ContractErrorInfo::new(self.code(), self.to_string()).with_fix_hint(hint)
    }
}

/// Error raised when a chain of tasks cannot form a pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidPipelineShape {
    /// The source stage has no upstream to share work over.
    #[error("The first task in a pipeline ({task}) cannot have concurrency greater than 1 (got {concurrency})")]
    ConcurrentSource {
        /// The task name.
        task: String,
        /// The rejected concurrency.
        concurrency: usize,
    },

    /// The source stage has no upstream to join.
    #[error("The first task in a pipeline ({task}) cannot join previous results")]
    JoiningSource {
        /// The task name.
        task: String,
    },

    /// Worker threads cannot drive async callables.
    #[error("Task '{task}' is async; run the pipeline with run_async")]
    AsyncTask {
        /// The task name.
        task: String,
    },
}

impl InvalidPipelineShape {
    /// Returns the stable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::ConcurrentSource { .. } => "PIPELINE-001-SOURCE_CONCURRENCY",
            Self::JoiningSource { .. } => "PIPELINE-002-SOURCE_JOIN",
            Self::AsyncTask { .. } => "PIPELINE-003-ASYNC_TASK",
        }
    }

    /// Returns contract info with a fix hint.
    #[must_use]
    pub fn error_info(&self) -> ContractErrorInfo {
        let (task, hint) = match self {
            Self::ConcurrentSource { task, .. } => {
                (task, "Give the source task a concurrency of 1.")
            }
            Self::JoiningSource { task } => (task, "Only downstream tasks may join."),
            Self::AsyncTask { task } => (task, "Use Pipeline::run_async for async tasks."),
        };
        ContractErrorInfo::new(self.code(), self.to_string())
            .with_fix_hint(hint)
            .with_context_entry("task", task.clone())
    }
}

/// A failure raised by task code while a pipeline was running.
///
/// The original error is kept as an [`anyhow::Error`] so callers can
/// downcast it back to their own type.
pub struct WorkerFault {
    /// Name of the stage whose worker failed.
    pub stage: String,
    /// Index of the worker within its stage.
    pub worker: usize,
    /// When the fault was captured.
    pub occurred_at: DateTime<Utc>,
    /// The error raised by the task.
    pub error: anyhow::Error,
}

impl WorkerFault {
    /// Creates a new worker fault.
    #[must_use]
    pub fn new(stage: impl Into<String>, worker: usize, error: anyhow::Error) -> Self {
        Self {
            stage: stage.into(),
            worker,
            occurred_at: Utc::now(),
            error,
        }
    }

    /// Attempts to view the underlying error as `E`.
    #[must_use]
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.error.downcast_ref::<E>()
    }

    /// Returns true if the underlying error is an `E`.
    #[must_use]
    pub fn is<E>(&self) -> bool
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.error.is::<E>()
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("stage".to_string(), serde_json::json!(self.stage));
        map.insert("worker".to_string(), serde_json::json!(self.worker));
        map.insert(
            "occurred_at".to_string(),
            serde_json::json!(self.occurred_at.to_rfc3339()),
        );
        map.insert("error".to_string(), serde_json::json!(format!("{:#}", self.error)));
        map
    }
}

impl fmt::Debug for WorkerFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerFault")
            .field("stage", &self.stage)
            .field("worker", &self.worker)
            .field("occurred_at", &self.occurred_at)
            .field("error", &format_args!("{:#}", self.error))
            .finish()
    }
}

impl fmt::Display for WorkerFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Worker {} of stage '{}' failed: {:#}",
            self.worker, self.stage, self.error
        )
    }
}

impl std::error::Error for WorkerFault {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&*self.error)
    }
}

/// Error recorded when task code panics instead of returning an error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("task panicked: {message}")]
pub struct TaskPanicked {
    /// The panic message, if it was a string.
    pub message: String,
}

impl TaskPanicked {
    /// Builds the error from a caught panic payload.
    #[must_use]
    pub fn from_payload(payload: &(dyn Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(ToString::to_string)
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        Self { message }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("bad value {0}")]
    struct ValueError(i64);

    #[test]
    fn test_contract_error_info_creation() {
        let info = ContractErrorInfo::new("TEST-001", "Test error")
            .with_fix_hint("Fix this by doing that")
            .with_context_entry("stage", "my_stage");

        assert_eq!(info.code, "TEST-001");
        assert_eq!(info.summary, "Test error");
        assert_eq!(info.fix_hint, Some("Fix this by doing that".to_string()));
        assert_eq!(info.context.get("stage"), Some(&"my_stage".to_string()));
    }

    #[test]
    fn test_invalid_task_config_codes() {
        let err = InvalidTaskConfig::NegativeThrottle { throttle: -2 };
        assert_eq!(err.code(), "TASK-002-THROTTLE");
        assert!(err.to_string().contains("-2"));
        assert!(err.error_info().fix_hint.is_some());
    }

    #[test]
    fn test_invalid_pipeline_shape_info_names_task() {
        let err = InvalidPipelineShape::JoiningSource { task: "load".to_string() };
        let info = err.error_info();
        assert_eq!(info.code, "PIPELINE-002-SOURCE_JOIN");
        assert_eq!(info.context.get("task"), Some(&"load".to_string()));
    }

    #[test]
    fn test_worker_fault_downcast() {
        let fault = WorkerFault::new("double", 2, ValueError(3).into());

        assert!(fault.is::<ValueError>());
        assert_eq!(fault.downcast_ref::<ValueError>().map(|e| e.0), Some(3));
        assert!(fault.to_string().contains("stage 'double'"));
        assert!(std::error::Error::source(&fault).is_some());
    }

    #[test]
    fn test_worker_fault_to_dict() {
        let fault = WorkerFault::new("double", 0, anyhow::anyhow!("boom"));
        let dict = fault.to_dict();

        assert_eq!(dict.get("stage").unwrap(), "double");
        assert_eq!(dict.get("error").unwrap(), "boom");
    }

    #[test]
    fn test_task_panicked_from_payload() {
        let payload: Box<dyn Any + Send> = Box::new("exploded");
        assert_eq!(TaskPanicked::from_payload(payload.as_ref()).message, "exploded");

        let payload: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(TaskPanicked::from_payload(payload.as_ref()).message, "owned");

        let payload: Box<dyn Any + Send> = Box::new(42_u8);
        assert_eq!(
            TaskPanicked::from_payload(payload.as_ref()).message,
            "non-string panic payload"
        );
    }

    #[test]
    fn test_stagepipe_error_accessors() {
        let err: StagepipeError = WorkerFault::new("s", 0, anyhow::anyhow!("x")).into();
        assert!(err.as_worker_fault().is_some());
        assert!(err.error_info().is_none());

        let err: StagepipeError = InvalidTaskConfig::ConcurrencyTooLow { concurrency: 0 }.into();
        assert_eq!(err.error_info().unwrap().code, "TASK-001-CONCURRENCY");
    }
}
