//! The item-embeddings pipeline: co-occurrence, matrix factorisation,
//! embedding export, statistics checks, and publication of a lookup model
//! and an approximate-nearest-neighbour index.
//!
//! Warehouse and training work is supplied by the caller as [`Component`]s;
//! this module only fixes the wiring between them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::core::ArtifactKind;
use crate::errors::ConstructionError;
use crate::graph::{Graph, GraphBuilder};
use crate::step::{Component, ExecutorPolicy, StepSpec};

use super::importer::{Importer, IMPORTER_OUTPUT};
use super::infra_validator::{InfraValidator, ServingProbe, ValidationSpec, VALIDATOR_OUTPUT};
use super::pusher::{PublishSink, PushDestination, Pusher, PUSHER_BLESSING_INPUT};

/// Logical name of the published lookup model.
pub const EMBEDDING_LOOKUP_MODEL_NAME: &str = "embeddings_lookup";
/// Logical name of the published index.
pub const SCANN_INDEX_MODEL_NAME: &str = "embeddings_scann";

/// Step identities, in declaration order.
pub mod steps {
    /// Computes item co-occurrence statistics.
    pub const PMI_COMPUTER: &str = "pmi_computer";
    /// Trains the item-matching model.
    pub const BQML_TRAINER: &str = "bqml_trainer";
    /// Extracts embeddings from the trained model.
    pub const EMBEDDINGS_EXTRACTOR: &str = "embeddings_extractor";
    /// Exports embeddings as examples.
    pub const EMBEDDINGS_EXPORTER: &str = "embeddings_exporter";
    /// Imports the raw schema.
    pub const SCHEMA_IMPORTER: &str = "schema_importer";
    /// Generates statistics over the exported embeddings.
    pub const STATS_GENERATOR: &str = "stats_generator";
    /// Validates statistics against the schema.
    pub const STATS_VALIDATOR: &str = "stats_validator";
    /// Exports the embedding lookup saved model.
    pub const LOOKUP_EXPORTER: &str = "lookup_savedmodel_exporter";
    /// Checks the lookup model can be served.
    pub const INFRA_VALIDATOR: &str = "infra_validator";
    /// Publishes the lookup model.
    pub const LOOKUP_PUSHER: &str = "embedding_lookup_pusher";
    /// Builds the ScaNN index.
    pub const SCANN_INDEXER: &str = "scann_indexer";
    /// Publishes the index once the lookup model is blessed.
    pub const SCANN_PUSHER: &str = "embedding_scann_pusher";
}

/// Pipeline parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingsParams {
    /// Warehouse project.
    pub project_id: String,
    /// Warehouse dataset holding the intermediate tables.
    pub dataset: String,
    /// Items seen fewer times than this are dropped.
    pub min_item_frequency: u64,
    /// Groups larger than this are ignored when counting co-occurrences.
    pub max_group_size: u64,
    /// Embedding dimensionality.
    pub dimensions: u64,
    /// Number of index partitions.
    pub num_leaves: u64,
    /// Where published models land.
    pub model_registry_uri: String,
    /// Location of the raw schema.
    pub schema_dir: String,
    /// Arguments for remote index training; empty means build locally.
    #[serde(default)]
    pub remote_training_args: BTreeMap<String, serde_json::Value>,
    /// Serving check settings.
    #[serde(default)]
    pub validation: ValidationSpec,
}

/// Caller-supplied implementations of the pipeline's work.
#[derive(Clone)]
pub struct EmbeddingsComponents {
    /// Produces the co-occurrence table.
    pub compute_pmi: Arc<dyn Component>,
    /// Trains the matrix-factorisation model.
    pub train_item_matching: Arc<dyn Component>,
    /// Writes the item embeddings table.
    pub extract_embeddings: Arc<dyn Component>,
    /// Exports embeddings as examples.
    pub export_embeddings: Arc<dyn Component>,
    /// Computes statistics over examples.
    pub generate_statistics: Arc<dyn Component>,
    /// Checks statistics against the schema.
    pub validate_statistics: Arc<dyn Component>,
    /// Exports the lookup model.
    pub export_lookup: Arc<dyn Component>,
    /// Builds the index.
    pub build_index: Arc<dyn Component>,
    /// Serving probe for the lookup model.
    pub probe: Arc<dyn ServingProbe>,
    /// Receiver of both published models.
    pub publisher: Arc<dyn PublishSink>,
}

impl fmt::Debug for EmbeddingsComponents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmbeddingsComponents").finish_non_exhaustive()
    }
}

/// Builds the twelve-step embeddings graph.
///
/// The index is built remotely iff `params.remote_training_args` is non-empty,
/// and the index pusher only runs when the lookup model passes infra
/// validation.
///
/// # Errors
///
/// Returns a construction error if the wiring does not validate.
pub fn build_embeddings_graph(
    name: impl Into<String>,
    params: &EmbeddingsParams,
    components: EmbeddingsComponents,
) -> Result<Graph, ConstructionError> {
    use serde_json::json;
    use steps::*;

    let warehouse = |step: StepSpec| {
        step.param("project_id", json!(params.project_id))
            .param("dataset", json!(params.dataset))
    };

    let remote_args = (!params.remote_training_args.is_empty()).then(|| params.remote_training_args.clone());
    let lookup_pusher = Pusher::new(
        PushDestination::new(&params.model_registry_uri, EMBEDDING_LOOKUP_MODEL_NAME),
        Arc::clone(&components.publisher),
    );
    let scann_pusher = Pusher::new(
        PushDestination::new(&params.model_registry_uri, SCANN_INDEX_MODEL_NAME),
        Arc::clone(&components.publisher),
    );

    GraphBuilder::new(name)
        .step(
            warehouse(StepSpec::new(PMI_COMPUTER, components.compute_pmi))
                .param("min_item_frequency", json!(params.min_item_frequency))
                .param("max_group_size", json!(params.max_group_size))
                .output("item_cooc", ArtifactKind::Table),
        )
        .step(
            warehouse(StepSpec::new(BQML_TRAINER, components.train_item_matching))
                .input("item_cooc", ArtifactKind::Table, PMI_COMPUTER, "item_cooc")
                .param("dimensions", json!(params.dimensions))
                .output("model", ArtifactKind::Model),
        )
        .step(
            warehouse(StepSpec::new(EMBEDDINGS_EXTRACTOR, components.extract_embeddings))
                .input("model", ArtifactKind::Model, BQML_TRAINER, "model")
                .output("item_embeddings", ArtifactKind::Table),
        )
        .step(
            // Reads the embeddings table by name, so the dependency is control-only.
            StepSpec::new(EMBEDDINGS_EXPORTER, components.export_embeddings)
                .param("query", json!(format!("SELECT item_Id, embedding FROM {}.item_embeddings", params.dataset)))
                .after(EMBEDDINGS_EXTRACTOR)
                .output("examples", ArtifactKind::Dataset),
        )
        .step(Importer::new(ArtifactKind::Schema, &params.schema_dir).into_step(SCHEMA_IMPORTER))
        .step(
            StepSpec::new(STATS_GENERATOR, components.generate_statistics)
                .input("examples", ArtifactKind::Dataset, EMBEDDINGS_EXPORTER, "examples")
                .output("statistics", ArtifactKind::Statistics),
        )
        .step(
            StepSpec::new(STATS_VALIDATOR, components.validate_statistics)
                .input("statistics", ArtifactKind::Statistics, STATS_GENERATOR, "statistics")
                .input("schema", ArtifactKind::Schema, SCHEMA_IMPORTER, IMPORTER_OUTPUT)
                .output("anomalies", ArtifactKind::Anomalies),
        )
        .step(
            StepSpec::new(LOOKUP_EXPORTER, components.export_lookup)
                .input("schema", ArtifactKind::Schema, SCHEMA_IMPORTER, IMPORTER_OUTPUT)
                .input("examples", ArtifactKind::Dataset, EMBEDDINGS_EXPORTER, "examples")
                .param("train_steps", json!(0))
                .after(STATS_VALIDATOR)
                .output("model", ArtifactKind::Model),
        )
        .step(
            InfraValidator::new(params.validation, components.probe)
                .into_step(INFRA_VALIDATOR, LOOKUP_EXPORTER, "model"),
        )
        .step(lookup_pusher.into_step(LOOKUP_PUSHER, LOOKUP_EXPORTER, "model"))
        .step(
            StepSpec::new(SCANN_INDEXER, components.build_index)
                .input("schema", ArtifactKind::Schema, SCHEMA_IMPORTER, IMPORTER_OUTPUT)
                .input("examples", ArtifactKind::Dataset, EMBEDDINGS_EXPORTER, "examples")
                .param("num_leaves", json!(params.num_leaves))
                .executor(ExecutorPolicy::from_remote_args(remote_args))
                .output("model", ArtifactKind::Model),
        )
        .step(
            scann_pusher
                .into_step(SCANN_PUSHER, SCANN_INDEXER, "model")
                .input(PUSHER_BLESSING_INPUT, ArtifactKind::InfraBlessing, INFRA_VALIDATOR, VALIDATOR_OUTPUT)
                .gated_on(PUSHER_BLESSING_INPUT),
        )
        .build()
}
