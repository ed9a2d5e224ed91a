//! Recording tasks for asserting what a stage actually saw.

use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::thread;

use crate::task::{Task, TaskFn};

/// One recorded call.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    /// The input the task received.
    pub input: Value,
    /// Name of the thread the call ran on, if any.
    pub thread: Option<String>,
}

/// An identity task that records every input it receives.
///
/// Clones share the same recording.
#[derive(Debug, Clone, Default)]
pub struct RecordingTask {
    calls: Arc<Mutex<Vec<RecordedCall>>>,
}

impl RecordingTask {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a task with `concurrency` workers that records into `self`.
    ///
    /// # Errors
    ///
    /// Returns the validation error if `concurrency` is below 1.
    pub fn task(
        &self,
        name: &str,
        concurrency: i64,
    ) -> Result<Task, crate::errors::InvalidTaskConfig> {
        let calls = Arc::clone(&self.calls);
        Task::builder(TaskFn::sync(move |input: Value| {
            calls.lock().push(RecordedCall {
                input: input.clone(),
                thread: thread::current().name().map(ToString::to_string),
            });
            Ok(input)
        }))
        .name(name)
        .concurrency(concurrency)
        .build()
    }

    /// Returns all recorded calls in arrival order.
    #[must_use]
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    /// Returns the recorded inputs in arrival order.
    #[must_use]
    pub fn inputs(&self) -> Vec<Value> {
        self.calls.lock().iter().map(|c| c.input.clone()).collect()
    }

    /// Returns the number of calls.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Clears the recording.
    pub fn clear(&self) {
        self.calls.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_recording_is_shared_by_clones() {
        let recorder = RecordingTask::new();
        let task = recorder.clone().task("rec", 2).unwrap();
        let TaskFn::Sync(func) = task.func() else {
            panic!("expected a sync task");
        };

        assert_eq!(func(json!("x")).unwrap(), json!("x"));
        assert_eq!(recorder.inputs(), vec![json!("x")]);
        assert_eq!(task.concurrency(), 2);

        recorder.clear();
        assert_eq!(recorder.call_count(), 0);
    }

    #[test]
    fn test_rejects_zero_concurrency() {
        assert!(RecordingTask::new().task("rec", 0).is_err());
    }
}
