//! Content-addressed record of prior step executions.

use super::CacheKey;
use crate::core::{Artifact, ArtifactId, StepId};
use crate::store::ArtifactStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// A recorded successful execution of a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// The key the execution was recorded under.
    pub key: CacheKey,
    /// The run that produced the outputs.
    pub run_id: Uuid,
    /// The step that produced the outputs.
    pub step: StepId,
    /// Output name -> artifact id.
    pub outputs: BTreeMap<String, ArtifactId>,
    /// When the entry was recorded.
    pub recorded_at: DateTime<Utc>,
}

impl CacheEntry {
    /// Creates a new cache entry.
    #[must_use]
    pub fn new(key: CacheKey, run_id: Uuid, step: StepId, outputs: BTreeMap<String, ArtifactId>) -> Self {
        Self {
            key,
            run_id,
            step,
            outputs,
            recorded_at: Utc::now(),
        }
    }
}

/// A hit returned by [`CacheIndex::lookup`].
#[derive(Debug, Clone)]
pub struct CacheHit {
    /// The matching entry.
    pub entry: CacheEntry,
    /// The recorded artifacts, all still valid.
    pub artifacts: BTreeMap<String, Artifact>,
}

/// Storage backend for cache entries.
#[async_trait]
pub trait CacheIndex: Send + Sync {
    /// Returns the most recent entry for `key` whose outputs are all still
    /// valid in `store`.
    async fn lookup(&self, key: &CacheKey, store: &dyn ArtifactStore) -> Option<CacheHit>;

    /// Records a successful execution.
    async fn insert(&self, entry: CacheEntry);

    /// Drops every entry recorded under `key`.
    async fn remove(&self, key: &CacheKey);

    /// Returns the number of recorded entries.
    fn len(&self) -> usize;

    /// Returns true if nothing is recorded.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-memory cache index.
#[derive(Debug, Default)]
pub struct InMemoryCacheIndex {
    entries: DashMap<CacheKey, Vec<CacheEntry>>,
}

impl InMemoryCacheIndex {
    /// Creates an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all entries recorded under `key`, oldest first.
    #[must_use]
    pub fn entries_for(&self, key: &CacheKey) -> Vec<CacheEntry> {
        self.entries
            .get(key)
            .map(|entries| entries.value().clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl CacheIndex for InMemoryCacheIndex {
    async fn lookup(&self, key: &CacheKey, store: &dyn ArtifactStore) -> Option<CacheHit> {
        // Clone out of the map so no shard lock is held across the awaits below.
        let candidates = self.entries_for(key);

        'entries: for entry in candidates.into_iter().rev() {
            let mut artifacts = BTreeMap::new();
            for (name, id) in &entry.outputs {
                match store.get(id).await {
                    Some(artifact) if artifact.is_valid() => {
                        artifacts.insert(name.clone(), artifact);
                    }
                    _ => {
                        tracing::debug!(
                            cache_key = %key,
                            run_id = %entry.run_id,
                            output = %name,
                            "Cache entry has an invalidated output"
                        );
                        continue 'entries;
                    }
                }
            }
            return Some(CacheHit { entry, artifacts });
        }

        None
    }

    async fn insert(&self, entry: CacheEntry) {
        self.entries.entry(entry.key.clone()).or_default().push(entry);
    }

    async fn remove(&self, key: &CacheKey) {
        self.entries.remove(key);
    }

    fn len(&self) -> usize {
        self.entries.iter().map(|entry| entry.value().len()).sum()
    }
}
