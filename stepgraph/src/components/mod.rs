//! Built-in components and the embeddings pipeline that wires them together.

pub mod embeddings;
mod importer;
mod infra_validator;
mod pusher;

pub use embeddings::{build_embeddings_graph, EmbeddingsComponents, EmbeddingsParams};
pub use importer::{Importer, IMPORTER_OUTPUT, SOURCE_URI_PROPERTY};
pub use infra_validator::{
    InfraValidator, ServingProbe, ValidationSpec, VALIDATOR_MODEL_INPUT, VALIDATOR_OUTPUT,
};
pub use pusher::{
    PublishSink, PushDestination, Pusher, PUSHER_BLESSING_INPUT, PUSHER_MODEL_INPUT, PUSHER_OUTPUT,
};
