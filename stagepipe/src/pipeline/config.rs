//! Run-level configuration.

use crate::errors::StagepipeError;
use serde::{Deserialize, Serialize};
use std::env;
use std::num::NonZeroUsize;
use std::thread;

/// Environment variable overriding [`PipelineConfig::thread_name_prefix`].
pub const ENV_THREAD_PREFIX: &str = "STAGEPIPE_THREAD_PREFIX";

/// Environment variable overriding [`PipelineConfig::isolated_workers`].
pub const ENV_ISOLATED_WORKERS: &str = "STAGEPIPE_ISOLATED_WORKERS";

/// Settings shared by every stage of one pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Prefix of worker thread names.
    #[serde(default = "default_thread_name_prefix")]
    pub thread_name_prefix: String,
    /// Maximum number of isolated jobs running at once on the async backend.
    #[serde(default = "default_isolated_workers")]
    pub isolated_workers: usize,
}

fn default_thread_name_prefix() -> String {
    "stagepipe".to_string()
}

fn default_isolated_workers() -> usize {
    thread::available_parallelism().map_or(1, NonZeroUsize::get)
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            thread_name_prefix: default_thread_name_prefix(),
            isolated_workers: default_isolated_workers(),
        }
    }
}

impl PipelineConfig {
    /// Creates a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a configuration from a JSON document.
    pub fn from_json(json: &str) -> Result<Self, StagepipeError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()
    }

    /// Builds a configuration from defaults overridden by `STAGEPIPE_*`
    /// environment variables.
    pub fn from_env() -> Result<Self, StagepipeError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, StagepipeError> {
        let mut config = Self::default();
        if let Some(prefix) = lookup(ENV_THREAD_PREFIX) {
            config.thread_name_prefix = prefix;
        }
        if let Some(raw) = lookup(ENV_ISOLATED_WORKERS) {
            config.isolated_workers = raw.trim().parse().map_err(|_| {
                StagepipeError::Config(format!(
                    "{ENV_ISOLATED_WORKERS} must be a positive integer, got '{raw}'"
                ))
            })?;
        }
        config.validate()
    }

    fn validate(self) -> Result<Self, StagepipeError> {
        if self.isolated_workers == 0 {
            return Err(StagepipeError::Config(
                "isolated_workers must be at least 1".to_string(),
            ));
        }
        if self.thread_name_prefix.is_empty() {
            return Err(StagepipeError::Config(
                "thread_name_prefix must not be empty".to_string(),
            ));
        }
        Ok(self)
    }

    /// Sets the thread name prefix.
    #[must_use]
    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    /// Sets the isolated worker limit (at least 1).
    #[must_use]
    pub fn with_isolated_workers(mut self, workers: usize) -> Self {
        self.isolated_workers = workers.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.thread_name_prefix, "stagepipe");
        assert!(config.isolated_workers >= 1);
    }

    #[test]
    fn test_from_json_fills_defaults() {
        let config = PipelineConfig::from_json(r#"{"isolated_workers": 3}"#).unwrap();
        assert_eq!(config.isolated_workers, 3);
        assert_eq!(config.thread_name_prefix, "stagepipe");
    }

    #[test]
    fn test_from_json_rejects_zero_workers() {
        let err = PipelineConfig::from_json(r#"{"isolated_workers": 0}"#).unwrap_err();
        assert!(matches!(err, StagepipeError::Config(_)));
    }

    #[test]
    fn test_env_overrides() {
        let config = PipelineConfig::from_lookup(lookup(&[
            (ENV_THREAD_PREFIX, "etl"),
            (ENV_ISOLATED_WORKERS, " 2 "),
        ]))
        .unwrap();

        assert_eq!(
            config,
            PipelineConfig {
                thread_name_prefix: "etl".to_string(),
                isolated_workers: 2,
            }
        );
    }

    #[test]
    fn test_env_rejects_garbage() {
        let err = PipelineConfig::from_lookup(lookup(&[(ENV_ISOLATED_WORKERS, "many")]))
            .unwrap_err();
        assert!(err.to_string().contains("STAGEPIPE_ISOLATED_WORKERS"));
    }

    #[test]
    fn test_builder_clamps_workers() {
        let config = PipelineConfig::new()
            .with_thread_name_prefix("job")
            .with_isolated_workers(0);
        assert_eq!(config.isolated_workers, 1);
        assert_eq!(config.thread_name_prefix, "job");
    }
}
