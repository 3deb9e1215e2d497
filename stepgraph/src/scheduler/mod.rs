//! Cache-aware, gate-aware scheduling of validated graphs.
//!
//! The [`Orchestrator`] owns the long-lived services (artifact store, cache
//! index, backends, event sink) and starts one run per call to
//! [`Orchestrator::run`]. Each run walks the graph in dependency order,
//! dispatching ready steps up to the concurrency limit.

mod cancellation;
mod engine;
mod readiness;
mod retry;
mod run;

#[cfg(test)]
mod integration_tests;

pub use cancellation::CancellationToken;
pub use retry::{BackoffStrategy, JitterStrategy, RetryPolicy};
pub use run::{RunRecord, RunResult, StepRunState};

use crate::backend::{BackendSelector, ExecutionBackend};
use crate::cache::{CacheIndex, InMemoryCacheIndex};
use crate::config::{EngineConfig, RunOptions};
use crate::errors::{ConstructionError, StepgraphError};
use crate::events::{EventSink, NoOpEventSink};
use crate::graph::Graph;
use crate::store::{ArtifactStore, InMemoryArtifactStore};
use engine::{RunEngine, RunServices};
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use tracing::Instrument;

/// Runs graphs against a shared store, cache index and set of backends.
pub struct Orchestrator {
    config: EngineConfig,
    selector: BackendSelector,
    store: Arc<dyn ArtifactStore>,
    cache: Arc<dyn CacheIndex>,
    events: Arc<dyn EventSink>,
    history: RwLock<Vec<Arc<RunRecord>>>,
}

impl Orchestrator {
    /// Creates an orchestrator with in-memory storage and a local backend.
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            selector: BackendSelector::default(),
            store: Arc::new(InMemoryArtifactStore::new()),
            cache: Arc::new(InMemoryCacheIndex::new()),
            events: Arc::new(NoOpEventSink),
            history: RwLock::new(Vec::new()),
        }
    }

    /// Replaces the backend selector.
    #[must_use]
    pub fn with_backends(mut self, selector: BackendSelector) -> Self {
        self.selector = selector;
        self
    }

    /// Registers the backend used for managed-remote steps.
    #[must_use]
    pub fn with_remote_backend(mut self, backend: Arc<dyn ExecutionBackend>) -> Self {
        self.selector = self.selector.with_remote(backend);
        self
    }

    /// Replaces the backend used for local steps.
    #[must_use]
    pub fn with_local_backend(mut self, backend: Arc<dyn ExecutionBackend>) -> Self {
        self.selector = self.selector.with_local(backend);
        self
    }

    /// Replaces the artifact store.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn ArtifactStore>) -> Self {
        self.store = store;
        self
    }

    /// Replaces the cache index.
    #[must_use]
    pub fn with_cache_index(mut self, cache: Arc<dyn CacheIndex>) -> Self {
        self.cache = cache;
        self
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Returns the engine configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Returns the artifact store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn ArtifactStore> {
        &self.store
    }

    /// Returns the cache index.
    #[must_use]
    pub fn cache(&self) -> &Arc<dyn CacheIndex> {
        &self.cache
    }

    /// Runs `graph` with the configured default options.
    ///
    /// # Errors
    ///
    /// See [`Orchestrator::run`].
    pub async fn run_default(&self, graph: &Arc<Graph>) -> Result<RunResult, StepgraphError> {
        self.run(graph, self.config.run.clone()).await
    }

    /// Runs `graph` to completion.
    ///
    /// Step failures do not surface here; they are recorded in the result.
    ///
    /// # Errors
    ///
    /// Returns an error if the options are invalid or a step's executor
    /// policy cannot be satisfied by the registered backends. Either way no
    /// step has started.
    pub async fn run(&self, graph: &Arc<Graph>, options: RunOptions) -> Result<RunResult, StepgraphError> {
        self.run_with_cancellation(graph, options, Arc::new(CancellationToken::new()))
            .await
    }

    /// Runs `graph`, stopping early once `token` is cancelled.
    ///
    /// Steps that have not started are skipped, running attempts are asked
    /// to stop, and the run ends as CANCELLED after they settle.
    ///
    /// # Errors
    ///
    /// See [`Orchestrator::run`].
    pub async fn run_with_cancellation(
        &self,
        graph: &Arc<Graph>,
        options: RunOptions,
        token: Arc<CancellationToken>,
    ) -> Result<RunResult, StepgraphError> {
        options.validate()?;
        self.selector
            .validate_graph(graph)
            .map_err(ConstructionError::from)?;

        let services = RunServices {
            config: &self.config,
            selector: &self.selector,
            store: Arc::clone(&self.store),
            cache: Arc::clone(&self.cache),
            events: Arc::clone(&self.events),
        };
        let engine = RunEngine::new(services, Arc::clone(graph), options, token);
        let span = tracing::info_span!(
            "run",
            run_id = %engine.run_id(),
            graph = graph.name(),
            pipeline = %self.config.pipeline_name,
        );

        let result = engine.execute().instrument(span).await;
        self.history.write().push(Arc::clone(&result.record));
        Ok(result)
    }

    /// Returns the records of every finished run, oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<Arc<RunRecord>> {
        self.history.read().clone()
    }

    /// Returns the record of the most recent run.
    #[must_use]
    pub fn last_run(&self) -> Option<Arc<RunRecord>> {
        self.history.read().last().cloned()
    }
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.config)
            .field("selector", &self.selector)
            .field("runs", &self.history.read().len())
            .finish_non_exhaustive()
    }
}
