//! Vector index backend abstraction, schema management and document loading.

pub mod azure;
pub mod loader;
pub mod manager;
pub mod schema;

use async_trait::async_trait;
use serde::Serialize;

use crate::embeddings::EmbeddedChunk;
use crate::error::Result;

pub use azure::AzureSearchClient;
pub use loader::{IndexLoader, LoadReport, LoaderSettings};
pub use manager::{IndexManager, IndexStatus};
pub use schema::{IndexDescription, IndexSchema, VectorMetric};

/// Top-k similarity search against an index.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchRequest {
    /// Query embedding.
    pub vector: Vec<f32>,
    /// Keyword text for hybrid or semantic ranking; `None` for pure k-NN.
    pub text: Option<String>,
    /// Nearest neighbours to return.
    pub top_k: usize,
    /// Semantic reranker configuration, when enabled.
    pub semantic_configuration: Option<String>,
}

/// One raw hit as returned by the backend, before ranking.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    /// Document key.
    pub key: String,
    /// Chunk text.
    pub text: String,
    /// Originating document id.
    pub source_document_id: String,
    /// Chunk position within its document.
    pub sequence_index: usize,
    /// Backend similarity (or fused) score.
    pub search_score: f64,
    /// Semantic reranker score, when semantic ranking ran.
    pub reranker_score: Option<f64>,
}

/// Managed vector index operations the pipeline depends on.
#[async_trait]
pub trait VectorIndexBackend: Send + Sync {
    /// Returns the live definition, or `None` when the index does not exist.
    async fn describe_index(&self, name: &str) -> Result<Option<IndexDescription>>;

    /// Creates the index described by `schema`.
    async fn create_index(&self, schema: &IndexSchema) -> Result<()>;

    /// Deletes the index; deleting a missing index succeeds.
    async fn delete_index(&self, name: &str) -> Result<()>;

    /// Number of documents stored for `source_document_id`.
    async fn count_documents(&self, index: &str, source_document_id: &str) -> Result<u64>;

    /// Inserts or replaces documents by key.
    async fn upsert(&self, index: &str, documents: &[EmbeddedChunk]) -> Result<()>;

    /// Every stored chunk of `source_document_id`, vectors included, ordered
    /// by sequence index.
    async fn fetch_documents(&self, index: &str, source_document_id: &str) -> Result<Vec<EmbeddedChunk>>;

    /// Removes documents by key; missing keys are ignored.
    async fn delete_documents(&self, index: &str, keys: &[String]) -> Result<()>;

    /// Runs a top-k search.
    async fn search(&self, index: &str, request: &SearchRequest) -> Result<Vec<SearchHit>>;
}
