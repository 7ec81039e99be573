#![warn(missing_docs)]
//! Voice assistant back end: realtime session relay plus two document
//! grounding tools, one of them backed by a chunk -> embed -> index -> query
//! retrieval pipeline over Azure AI Search.

pub mod chunker;
pub mod config;
pub mod document;
pub mod embedder;
pub mod embeddings;
pub mod error;
pub mod index;
pub mod logging;
pub mod query;
pub mod relay;
pub mod retriever;
mod retry;
pub mod session;
pub mod state;
pub mod tools;

#[cfg(test)]
mod testing;

pub use chunker::{chunk_document, Chunk, ChunkingConfig};
pub use document::{DocumentError, DocumentSource};
pub use embedder::{EmbeddingBackend, EmbeddingClient};
pub use embeddings::{document_key, EmbeddedChunk};
pub use error::{Result, RetrievalError};
pub use index::{
    AzureSearchClient, IndexLoader, IndexManager, IndexSchema, IndexStatus, LoadReport,
    LoaderSettings, SearchHit, SearchRequest, VectorIndexBackend,
};
pub use query::{rank_hits, summarize, QueryService, QuerySettings, RankingMode, SearchResult};
pub use relay::{RelayError, RelaySettings, SessionCredentials, SessionRelay};
pub use retriever::{LoadOutcome, QueryAnswer, Retriever};
pub use retry::RetryPolicy;
pub use session::SessionConfiguration;
pub use state::{IndexHandle, IndexState};
pub use tools::{ToolCall, ToolName, ToolOutcome, ToolRouter};
