//! Artifact metadata store.
//!
//! The engine records artifact handles and lifecycle state here; artifact
//! byte content lives wherever the `location` points and is never touched.

use crate::core::{Artifact, ArtifactId, ArtifactKind, ArtifactState, StepId};
use crate::errors::StoreError;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

/// Protocol for artifact metadata storage.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Registers an artifact and returns its id.
    async fn register(&self, artifact: Artifact) -> ArtifactId;

    /// Fetches an artifact by id.
    async fn get(&self, id: &ArtifactId) -> Option<Artifact>;

    /// Returns the most recently registered artifact for each output of `step`.
    async fn get_outputs(&self, step: &StepId) -> BTreeMap<String, Artifact>;

    /// Returns every artifact of `kind`, in registration order.
    async fn query_by_kind(&self, kind: ArtifactKind) -> Vec<Artifact>;

    /// Completes a pending artifact with the properties its producer reported.
    async fn mark_available(
        &self,
        id: &ArtifactId,
        properties: BTreeMap<String, serde_json::Value>,
        fingerprint: Option<String>,
    ) -> Result<Artifact, StoreError>;

    /// Moves an artifact to another lifecycle state.
    async fn transition(&self, id: &ArtifactId, to: ArtifactState) -> Result<Artifact, StoreError>;

    /// Marks an artifact as no longer usable.
    async fn invalidate(&self, id: &ArtifactId) -> Result<Artifact, StoreError> {
        self.transition(id, ArtifactState::Invalid).await
    }
}

#[derive(Debug, Default)]
struct StoreInner {
    artifacts: HashMap<ArtifactId, Artifact>,
    order: Vec<ArtifactId>,
    latest_by_step: HashMap<StepId, BTreeMap<String, ArtifactId>>,
}

/// In-memory artifact store.
#[derive(Debug, Default)]
pub struct InMemoryArtifactStore {
    inner: RwLock<StoreInner>,
}

impl InMemoryArtifactStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of registered artifacts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().artifacts.len()
    }

    /// Returns true if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().artifacts.is_empty()
    }
}

#[async_trait]
impl ArtifactStore for InMemoryArtifactStore {
    async fn register(&self, artifact: Artifact) -> ArtifactId {
        let id = artifact.id;
        let mut inner = self.inner.write();
        inner
            .latest_by_step
            .entry(artifact.producer.clone())
            .or_default()
            .insert(artifact.output_name.clone(), id);
        inner.order.push(id);
        inner.artifacts.insert(id, artifact);
        id
    }

    async fn get(&self, id: &ArtifactId) -> Option<Artifact> {
        self.inner.read().artifacts.get(id).cloned()
    }

    async fn get_outputs(&self, step: &StepId) -> BTreeMap<String, Artifact> {
        let inner = self.inner.read();
        inner
            .latest_by_step
            .get(step)
            .map(|outputs| {
                outputs
                    .iter()
                    .filter_map(|(name, id)| {
                        inner.artifacts.get(id).map(|a| (name.clone(), a.clone()))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    async fn query_by_kind(&self, kind: ArtifactKind) -> Vec<Artifact> {
        let inner = self.inner.read();
        inner
            .order
            .iter()
            .filter_map(|id| inner.artifacts.get(id))
            .filter(|artifact| artifact.kind == kind)
            .cloned()
            .collect()
    }

    async fn mark_available(
        &self,
        id: &ArtifactId,
        properties: BTreeMap<String, serde_json::Value>,
        fingerprint: Option<String>,
    ) -> Result<Artifact, StoreError> {
        let mut inner = self.inner.write();
        let artifact = inner.artifacts.get_mut(id).ok_or(StoreError::NotFound(*id))?;
        if artifact.state != ArtifactState::Pending {
            return Err(StoreError::InvalidTransition {
                id: *id,
                from: artifact.state,
                to: ArtifactState::Available,
            });
        }
        artifact.properties.extend(properties);
        if fingerprint.is_some() {
            artifact.fingerprint = fingerprint;
        }
        artifact.state = ArtifactState::Available;
        Ok(artifact.clone())
    }

    async fn transition(&self, id: &ArtifactId, to: ArtifactState) -> Result<Artifact, StoreError> {
        let mut inner = self.inner.write();
        let artifact = inner.artifacts.get_mut(id).ok_or(StoreError::NotFound(*id))?;
        if artifact.state == to {
            return Ok(artifact.clone());
        }
        if !artifact.state.can_transition_to(to) {
            return Err(StoreError::InvalidTransition {
                id: *id,
                from: artifact.state,
                to,
            });
        }
        artifact.state = to;
        Ok(artifact.clone())
    }
}
