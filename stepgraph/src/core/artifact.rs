//! Artifact handles and kinds.

use super::{ArtifactState, StepId};
use crate::cache::fingerprint_value;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Producer recorded on artifacts that enter the graph through an import binding.
pub const IMPORT_PRODUCER: &str = "<import>";

/// The fixed set of artifact kinds understood by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// A data schema.
    Schema,
    /// A table of examples (e.g. exported embeddings).
    Dataset,
    /// A warehouse table or view produced in place.
    Table,
    /// Descriptive statistics over a dataset.
    Statistics,
    /// Anomalies found by checking statistics against a schema.
    Anomalies,
    /// A trained model, index or exported saved model.
    Model,
    /// Generic outcome of a quality check.
    ValidationResult,
    /// Outcome of a model evaluation check.
    ModelBlessing,
    /// Outcome of a serving-infrastructure check.
    InfraBlessing,
    /// Record of a model pushed to a destination.
    PushedModel,
}

impl ArtifactKind {
    /// All kinds, in declaration order.
    pub const ALL: [Self; 10] = [
        Self::Schema,
        Self::Dataset,
        Self::Table,
        Self::Statistics,
        Self::Anomalies,
        Self::Model,
        Self::ValidationResult,
        Self::ModelBlessing,
        Self::InfraBlessing,
        Self::PushedModel,
    ];
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Schema => "schema",
            Self::Dataset => "dataset",
            Self::Table => "table",
            Self::Statistics => "statistics",
            Self::Anomalies => "anomalies",
            Self::Model => "model",
            Self::ValidationResult => "validation_result",
            Self::ModelBlessing => "model_blessing",
            Self::InfraBlessing => "infra_blessing",
            Self::PushedModel => "pushed_model",
        };
        f.write_str(name)
    }
}

/// Unique artifact identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactId(Uuid);

impl ArtifactId {
    /// Generates a fresh identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A typed reference to a named output of a step.
///
/// Obtained from [`crate::step::StepSpec::output_ref`], which checks the
/// output exists, so bindings built from it carry the producer's kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactRef {
    /// The producing step.
    pub step: StepId,
    /// The output name on the producing step.
    pub output: String,
    /// The declared kind of that output.
    pub kind: ArtifactKind,
}

/// A typed, versioned handle to a unit of produced data.
///
/// The engine never reads artifact content; `location` is opaque and the
/// properties map carries scalar metadata such as a validation verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    /// Unique identifier.
    pub id: ArtifactId,
    /// The artifact kind.
    pub kind: ArtifactKind,
    /// Opaque location reference.
    pub location: String,
    /// Scalar properties reported by the producer.
    #[serde(default)]
    pub properties: BTreeMap<String, serde_json::Value>,
    /// The producing step.
    pub producer: StepId,
    /// The output name on the producing step.
    pub output_name: String,
    /// The run that produced the artifact, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Uuid>,
    /// Content fingerprint reported by the producer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    /// Lifecycle state.
    pub state: ArtifactState,
    /// When the artifact was created.
    pub created_at: DateTime<Utc>,
}

impl Artifact {
    /// Creates a pending artifact for a step that is about to start.
    #[must_use]
    pub fn pending(
        kind: ArtifactKind,
        location: impl Into<String>,
        producer: StepId,
        output_name: impl Into<String>,
        run_id: Uuid,
    ) -> Self {
        Self {
            id: ArtifactId::generate(),
            kind,
            location: location.into(),
            properties: BTreeMap::new(),
            producer,
            output_name: output_name.into(),
            run_id: Some(run_id),
            fingerprint: None,
            state: ArtifactState::Pending,
            created_at: Utc::now(),
        }
    }

    /// Creates an available artifact for an external import.
    #[must_use]
    pub fn imported(kind: ArtifactKind, location: impl Into<String>) -> Self {
        Self {
            id: ArtifactId::generate(),
            kind,
            location: location.into(),
            properties: BTreeMap::new(),
            producer: StepId::from(IMPORT_PRODUCER),
            output_name: "result".to_string(),
            run_id: None,
            fingerprint: None,
            state: ArtifactState::Available,
            created_at: Utc::now(),
        }
    }

    /// Adds a property.
    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }

    /// Sets an explicit content fingerprint.
    #[must_use]
    pub fn with_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.fingerprint = Some(fingerprint.into());
        self
    }

    /// Returns a property value.
    #[must_use]
    pub fn property(&self, key: &str) -> Option<&serde_json::Value> {
        self.properties.get(key)
    }

    /// Returns the content fingerprint.
    ///
    /// Falls back to a digest of kind, location and properties when the
    /// producer did not report one. The run id is deliberately left out so
    /// reused artifacts fingerprint identically across runs.
    #[must_use]
    pub fn content_fingerprint(&self) -> String {
        if let Some(ref fingerprint) = self.fingerprint {
            return fingerprint.clone();
        }
        fingerprint_value(&serde_json::json!({
            "kind": self.kind,
            "location": self.location,
            "properties": self.properties,
        }))
    }

    /// Returns true if the artifact can still be consumed.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.state.is_valid()
    }
}
