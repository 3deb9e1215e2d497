//! Registers an external artifact as the output of an ordinary step.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::core::{ArtifactKind, StepId};
use crate::errors::ExecutionError;
use crate::step::{Component, ProducedOutput, StepContext, StepResult, StepSpec};

/// Name of the importer's single output.
pub const IMPORTER_OUTPUT: &str = "result";
/// Property recording where the imported artifact came from.
pub const SOURCE_URI_PROPERTY: &str = "source_uri";

/// A zero-input component that publishes an externally managed artifact.
///
/// Unlike an import binding, an importer is a step of its own: it appears in
/// the graph, takes part in caching and can be consumed by several steps
/// through its `result` output.
#[derive(Debug, Clone)]
pub struct Importer {
    kind: ArtifactKind,
    source_uri: String,
    properties: BTreeMap<String, serde_json::Value>,
}

impl Importer {
    /// Creates an importer for `source_uri`.
    #[must_use]
    pub fn new(kind: ArtifactKind, source_uri: impl Into<String>) -> Self {
        Self {
            kind,
            source_uri: source_uri.into(),
            properties: BTreeMap::new(),
        }
    }

    /// Adds a property to the imported artifact.
    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }

    /// Returns the kind of the imported artifact.
    #[must_use]
    pub fn kind(&self) -> ArtifactKind {
        self.kind
    }

    /// Wraps the importer in a step declaring its `result` output.
    ///
    /// The source URI is also recorded as a parameter so that pointing the
    /// importer elsewhere changes its cache key.
    #[must_use]
    pub fn into_step(self, id: impl Into<StepId>) -> StepSpec {
        let kind = self.kind;
        let uri = serde_json::Value::String(self.source_uri.clone());
        StepSpec::new(id, Arc::new(self))
            .param(SOURCE_URI_PROPERTY, uri)
            .output(IMPORTER_OUTPUT, kind)
    }
}

#[async_trait]
impl Component for Importer {
    fn name(&self) -> &str {
        "importer"
    }

    async fn run(&self, ctx: &StepContext) -> Result<StepResult, ExecutionError> {
        tracing::debug!(step = %ctx.step, source_uri = %self.source_uri, kind = %self.kind, "Importing artifact");
        let mut output = ProducedOutput::new()
            .with_property(SOURCE_URI_PROPERTY, serde_json::Value::String(self.source_uri.clone()));
        for (key, value) in &self.properties {
            output = output.with_property(key.clone(), value.clone());
        }
        Ok(StepResult::new().with_output(IMPORTER_OUTPUT, output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_emits_source_uri() {
        let importer = Importer::new(ArtifactKind::Schema, "schema/").with_property("version", serde_json::json!(3));
        let result = importer
            .run(&StepContext::new(Uuid::new_v4(), "schema_importer"))
            .await
            .unwrap();

        let output = result.output(IMPORTER_OUTPUT).unwrap();
        assert_eq!(output.properties[SOURCE_URI_PROPERTY], serde_json::json!("schema/"));
        assert_eq!(output.properties["version"], serde_json::json!(3));
    }

    #[test]
    fn test_into_step_declares_result() {
        let step = Importer::new(ArtifactKind::Schema, "schema/").into_step("schema_importer");
        assert_eq!(step.output_kind(IMPORTER_OUTPUT), Some(ArtifactKind::Schema));
        assert!(step.inputs.is_empty());
        assert_eq!(step.params[SOURCE_URI_PROPERTY], serde_json::json!("schema/"));
    }
}
