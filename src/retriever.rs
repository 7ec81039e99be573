//! Facade tying index management, loading and querying to one index state.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;

use crate::embedder::EmbeddingClient;
use crate::error::{Result, RetrievalError};
use crate::index::{IndexLoader, IndexManager, IndexSchema, LoaderSettings, VectorIndexBackend};
use crate::query::{summarize, QueryService, QuerySettings, SearchResult};
use crate::state::{IndexHandle, IndexState};

/// Result of [`Retriever::ensure_index_and_load`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LoadOutcome {
    /// Whether chunks were written by this call.
    pub loaded: bool,
    /// Chunks the document consists of.
    pub chunk_count: usize,
}

/// Answer to a user query.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum QueryAnswer {
    /// At least one passage matched.
    Found {
        /// Ranked passages rendered for the assistant.
        summary_text: String,
        /// The passages themselves.
        results: Vec<SearchResult>,
    },
    /// Nothing matched.
    NoResults,
}

/// Owns the index state and serialises loads against it.
#[derive(Clone)]
pub struct Retriever {
    schema: IndexSchema,
    manager: IndexManager,
    loader: IndexLoader,
    query: QueryService,
    state: IndexHandle,
    load_lock: Arc<Mutex<()>>,
}

impl Retriever {
    /// Wires the pipeline. `admin` creates and writes the index, `reader`
    /// serves queries; both may be the same client.
    pub fn new(
        schema: IndexSchema,
        admin: Arc<dyn VectorIndexBackend>,
        reader: Arc<dyn VectorIndexBackend>,
        embedder: EmbeddingClient,
        loader_settings: LoaderSettings,
        query_settings: QuerySettings,
    ) -> Result<Self> {
        let state = IndexHandle::new();
        let loader = IndexLoader::new(admin.clone(), embedder.clone(), loader_settings)?;
        let query = QueryService::new(reader, embedder, schema.name(), state.clone(), query_settings)?;
        Ok(Self {
            schema,
            manager: IndexManager::new(admin),
            loader,
            query,
            state,
            load_lock: Arc::new(Mutex::new(())),
        })
    }

    /// Name of the managed index.
    pub fn index_name(&self) -> &str {
        self.schema.name()
    }

    /// Passages returned by [`answer_query`](Self::answer_query).
    pub fn default_top_k(&self) -> usize {
        self.query.default_top_k()
    }

    /// Current index state.
    pub async fn state(&self) -> IndexState {
        self.state.snapshot().await
    }

    /// Shared handle to the index state.
    pub fn handle(&self) -> IndexHandle {
        self.state.clone()
    }

    /// Records a failure that happened before loading, such as an unreadable
    /// document. Has no effect once the index is ready.
    pub async fn mark_failed(&self, reason: impl Into<String>) -> IndexState {
        self.state.mark_failed(reason.into()).await
    }

    /// Ensures the index exists and holds `document_text`, then marks it ready.
    ///
    /// On failure the state becomes `Failed` unless an earlier call already
    /// made it ready and the failed load left the index as it was.
    pub async fn ensure_index_and_load(
        &self,
        document_text: &str,
        document_id: &str,
    ) -> Result<LoadOutcome> {
        let _guard = self.load_lock.lock().await;
        self.load_locked(document_text, document_id).await
    }

    /// Drops and recreates the index, then loads `document_text` again.
    /// Queries fail with "not ready" until the reload finishes.
    pub async fn rebuild(&self, document_text: &str, document_id: &str) -> Result<LoadOutcome> {
        let _guard = self.load_lock.lock().await;
        self.state.mark_unready().await;
        if let Err(err) = self.manager.delete_index(self.schema.name()).await {
            self.state.mark_failed(err.to_string()).await;
            return Err(err);
        }
        self.load_locked(document_text, document_id).await
    }

    async fn load_locked(&self, document_text: &str, document_id: &str) -> Result<LoadOutcome> {
        let outcome = async {
            self.manager.ensure_index(&self.schema).await?;
            self.loader
                .load(document_text, document_id, self.schema.name())
                .await
        }
        .await;
        match outcome {
            Ok(report) => {
                self.state.mark_loaded(document_id, report.chunk_count).await;
                tracing::info!(
                    index = self.schema.name(),
                    document_id,
                    chunk_count = report.chunk_count,
                    upserted = report.upserted,
                    "index ready"
                );
                Ok(LoadOutcome {
                    loaded: report.upserted > 0,
                    chunk_count: report.chunk_count,
                })
            }
            Err(err @ RetrievalError::Inconsistent { .. }) => {
                let state = self.state.invalidate(err.to_string()).await;
                tracing::error!(index = self.schema.name(), %state, error = %err, "index contents no longer trusted");
                Err(err)
            }
            Err(err) => {
                let state = self.state.mark_failed(err.to_string()).await;
                tracing::error!(index = self.schema.name(), %state, error = %err, "index initialisation failed");
                Err(err)
            }
        }
    }

    /// Ranked passages for `search_query`.
    pub async fn query(&self, search_query: &str, top_k: usize) -> Result<Vec<SearchResult>> {
        self.query.query(search_query, top_k).await
    }

    /// Answers `search_query` with the default number of passages.
    pub async fn answer_query(&self, search_query: &str) -> Result<QueryAnswer> {
        let results = self.query.query(search_query, self.default_top_k()).await?;
        if results.is_empty() {
            return Ok(QueryAnswer::NoResults);
        }
        Ok(QueryAnswer::Found {
            summary_text: summarize(&results),
            results,
        })
    }
}
