//! Cache keys.

use super::fingerprint::fingerprint_value;
use crate::core::Artifact;
use crate::step::StepSpec;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Fingerprint over a step's identity, resolved inputs, parameters and
/// executor policy.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    /// Wraps a precomputed key.
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Returns the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Inputs to the cache key, prior to canonicalization.
#[derive(Debug, Serialize)]
struct CacheKeyInput<'a> {
    step_id: &'a str,
    input_fingerprints: Vec<(&'a str, Option<String>)>,
    params_fingerprint: String,
    executor_fingerprint: String,
}

/// Computes the cache key for `step` given its resolved inputs.
///
/// `inputs` must follow the step's input binding order; an absent optional
/// input contributes `null` so that its presence changes the key.
#[must_use]
pub fn compute_cache_key(step: &StepSpec, inputs: &[(&str, Option<&Artifact>)]) -> CacheKey {
    let params = serde_json::Value::Object(
        step.params
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    );

    let input = CacheKeyInput {
        step_id: step.id.as_str(),
        input_fingerprints: inputs
            .iter()
            .map(|(name, artifact)| (*name, artifact.map(Artifact::content_fingerprint)))
            .collect(),
        params_fingerprint: fingerprint_value(&params),
        executor_fingerprint: fingerprint_value(&step.executor.identity()),
    };

    let value = serde_json::to_value(&input).unwrap_or(serde_json::Value::Null);
    CacheKey(format!("ck:{}", fingerprint_value(&value)))
}
