//! Declarative task options.

use crate::errors::StagepipeError;
use serde::{Deserialize, Serialize};

/// Execution options for a task, validated by [`super::Task::new`].
///
/// Integer fields are signed because options may come from external
/// configuration; negative values are rejected during validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOptions {
    /// Label used in logs and fault reports.
    #[serde(default = "default_name")]
    pub name: String,
    /// The callable yields many outputs per input.
    #[serde(default)]
    pub branch: bool,
    /// The callable receives the whole upstream stream as one input.
    #[serde(default)]
    pub join: bool,
    /// Number of parallel workers.
    #[serde(default = "default_concurrency")]
    pub concurrency: i64,
    /// Output queue bound; 0 means unbounded.
    #[serde(default)]
    pub throttle: i64,
    /// Run the callable in an isolated worker.
    #[serde(default)]
    pub multiprocess: bool,
    /// Do not track the worker for joining.
    #[serde(default)]
    pub daemon: bool,
}

fn default_name() -> String {
    "task".to_string()
}

const fn default_concurrency() -> i64 {
    1
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            name: default_name(),
            branch: false,
            join: false,
            concurrency: default_concurrency(),
            throttle: 0,
            multiprocess: false,
            daemon: false,
        }
    }
}

impl TaskOptions {
    /// Creates options with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses options from a JSON document.
    pub fn from_json(json: &str) -> Result<Self, StagepipeError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Sets the name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets the branch flag.
    #[must_use]
    pub const fn with_branch(mut self, branch: bool) -> Self {
        self.branch = branch;
        self
    }

    /// Sets the join flag.
    #[must_use]
    pub const fn with_join(mut self, join: bool) -> Self {
        self.join = join;
        self
    }

    /// Sets the concurrency.
    #[must_use]
    pub const fn with_concurrency(mut self, concurrency: i64) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Sets the throttle.
    #[must_use]
    pub const fn with_throttle(mut self, throttle: i64) -> Self {
        self.throttle = throttle;
        self
    }

    /// Sets the multiprocess flag.
    #[must_use]
    pub const fn with_multiprocess(mut self, multiprocess: bool) -> Self {
        self.multiprocess = multiprocess;
        self
    }

    /// Sets the daemon flag.
    #[must_use]
    pub const fn with_daemon(mut self, daemon: bool) -> Self {
        self.daemon = daemon;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let options = TaskOptions::default();
        assert_eq!(options.name, "task");
        assert_eq!(options.concurrency, 1);
        assert_eq!(options.throttle, 0);
        assert!(!options.branch && !options.join && !options.daemon && !options.multiprocess);
    }

    #[test]
    fn test_from_json_fills_defaults() {
        let options = TaskOptions::from_json(r#"{"name": "resize", "concurrency": 4}"#).unwrap();

        assert_eq!(
            options,
            TaskOptions::new().with_name("resize").with_concurrency(4)
        );
    }

    #[test]
    fn test_from_json_keeps_negative_values_for_validation() {
        let options = TaskOptions::from_json(r#"{"throttle": -1}"#).unwrap();
        assert_eq!(options.throttle, -1);
    }

    #[test]
    fn test_from_json_rejects_garbage() {
        assert!(matches!(
            TaskOptions::from_json("{not json"),
            Err(StagepipeError::Serialization(_))
        ));
    }
}
