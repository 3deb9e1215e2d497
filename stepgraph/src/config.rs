//! Engine and run configuration.

use crate::core::StepId;
use crate::errors::ConfigError;
use crate::scheduler::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use uuid::Uuid;

/// Environment variable toggling the cache.
pub const ENV_ENABLE_CACHE: &str = "STEPGRAPH_ENABLE_CACHE";
/// Environment variable overriding the concurrency limit.
pub const ENV_CONCURRENCY: &str = "STEPGRAPH_CONCURRENCY";

fn default_concurrency() -> usize {
    4
}

fn default_pipeline_name() -> String {
    "pipeline".to_string()
}

fn default_pipeline_root() -> String {
    "pipeline_root".to_string()
}

/// Options for a single run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOptions {
    /// Whether the cache index is consulted and updated.
    #[serde(default)]
    pub cache_enabled: bool,
    /// Maximum number of steps executing at once.
    #[serde(default = "default_concurrency")]
    pub concurrency_limit: usize,
    /// Retry policy for steps that do not declare one.
    #[serde(default)]
    pub default_retry: RetryPolicy,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            cache_enabled: false,
            concurrency_limit: default_concurrency(),
            default_retry: RetryPolicy::default(),
        }
    }
}

impl RunOptions {
    /// Creates run options with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables or disables caching.
    #[must_use]
    pub fn with_cache(mut self, enabled: bool) -> Self {
        self.cache_enabled = enabled;
        self
    }

    /// Sets the concurrency limit.
    #[must_use]
    pub fn with_concurrency_limit(mut self, limit: usize) -> Self {
        self.concurrency_limit = limit;
        self
    }

    /// Sets the default retry policy.
    #[must_use]
    pub fn with_default_retry(mut self, retry: RetryPolicy) -> Self {
        self.default_retry = retry;
        self
    }

    /// Checks the options.
    ///
    /// # Errors
    ///
    /// Returns an error if the concurrency limit is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency_limit == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        Ok(())
    }
}

/// Engine-wide configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Logical pipeline name.
    #[serde(default = "default_pipeline_name")]
    pub pipeline_name: String,
    /// Root under which step outputs are located.
    #[serde(default = "default_pipeline_root")]
    pub pipeline_root: String,
    /// Defaults for runs started without explicit options.
    #[serde(default)]
    pub run: RunOptions,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pipeline_name: default_pipeline_name(),
            pipeline_root: default_pipeline_root(),
            run: RunOptions::default(),
        }
    }
}

impl EngineConfig {
    /// Creates a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the pipeline name.
    #[must_use]
    pub fn with_pipeline_name(mut self, name: impl Into<String>) -> Self {
        self.pipeline_name = name.into();
        self
    }

    /// Sets the pipeline root.
    #[must_use]
    pub fn with_pipeline_root(mut self, root: impl Into<String>) -> Self {
        self.pipeline_root = root.into();
        self
    }

    /// Sets the default run options.
    #[must_use]
    pub fn with_run_options(mut self, run: RunOptions) -> Self {
        self.run = run;
        self
    }

    /// Parses a JSON document.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed JSON or invalid values.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.run.validate()?;
        Ok(config)
    }

    /// Reads and parses a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Applies overrides from the process environment.
    ///
    /// # Errors
    ///
    /// Returns an error if an override cannot be parsed.
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    /// Applies overrides read through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns an error if an override cannot be parsed.
    pub fn with_overrides_from(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(value) = lookup(ENV_ENABLE_CACHE) {
            self.run.cache_enabled = parse_flag(&value).ok_or_else(|| {
                ConfigError::Parse(format!("{ENV_ENABLE_CACHE} must be a boolean, got '{value}'"))
            })?;
        }
        if let Some(value) = lookup(ENV_CONCURRENCY) {
            self.run.concurrency_limit = value.trim().parse().map_err(|_| {
                ConfigError::Parse(format!("{ENV_CONCURRENCY} must be an integer, got '{value}'"))
            })?;
        }
        self.run.validate()?;
        Ok(self)
    }

    /// Returns the location assigned to an output of a step in a run.
    #[must_use]
    pub fn output_location(&self, step: &StepId, output: &str, run_id: Uuid) -> String {
        format!(
            "{}/{}/{}/{}",
            self.pipeline_root.trim_end_matches('/'),
            step,
            output,
            run_id
        )
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
