//! Command-line and environment configuration shared by the binaries.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, ValueEnum};

use crate::chunker::ChunkingConfig;
use crate::document::DocumentSource;
use crate::embedder::{EmbeddingClient, EmbeddingEndpoint, OpenAiEmbedder};
use crate::error::{Result, RetrievalError};
use crate::index::azure::{AzureSearchClient, DEFAULT_API_VERSION};
use crate::index::{IndexSchema, LoaderSettings, VectorMetric};
use crate::query::{QuerySettings, RankingMode};
use crate::relay::RelaySettings;
use crate::retriever::Retriever;
use crate::retry::{ensure_attempts, RetryPolicy};

/// Embedding API dialect.
#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum EmbeddingProvider {
    /// OpenAI-compatible `/embeddings` with bearer auth.
    #[value(name = "openai")]
    OpenAi,
    /// Azure OpenAI deployment with `api-key` auth.
    Azure,
}

/// Embedding backend options.
#[derive(Args, Debug, Clone)]
pub struct EmbeddingArgs {
    /// Embedding API dialect
    #[arg(long, env = "EMBEDDING_PROVIDER", value_enum, default_value_t = EmbeddingProvider::Azure)]
    pub embedding_provider: EmbeddingProvider,

    /// API key for the embedding service
    #[arg(long, env = "AZURE_OPENAI_EMBEDDING_API_KEY", hide_env_values = true)]
    pub embedding_api_key: String,

    /// Azure OpenAI resource endpoint (azure provider)
    #[arg(long, env = "AZURE_OPENAI_EMBEDDING_ENDPOINT")]
    pub embedding_endpoint: Option<String>,

    /// Deployment (azure) or model (openai) name
    #[arg(
        long,
        env = "AZURE_OPENAI_EMBEDDING_DEPLOYMENT_ID",
        default_value = "text-embedding-3-small"
    )]
    pub embedding_deployment: String,

    /// Azure OpenAI REST API version
    #[arg(long, env = "AZURE_OPENAI_EMBEDDING_API_VERSION", default_value = "2024-02-01")]
    pub embedding_api_version: String,

    /// Base URL for OpenAI-compatible endpoints (openai provider)
    #[arg(long, env = "EMBEDDING_BASE_URL", default_value = "https://api.openai.com/v1")]
    pub embedding_base_url: String,

    /// Vector length produced by the model
    #[arg(long, env = "EMBEDDING_DIMENSIONS", default_value_t = 1536)]
    pub embedding_dimensions: usize,

    /// Send the dimensions in each request (text-embedding-3 models only)
    #[arg(long, env = "EMBEDDING_SEND_DIMENSIONS", default_value_t = false)]
    pub send_dimensions: bool,

    /// Inputs per embedding request
    #[arg(long, env = "EMBEDDING_BATCH_SIZE", default_value_t = 16)]
    pub embedding_batch_size: usize,

    /// Embedding requests in flight at once
    #[arg(long, env = "EMBEDDING_CONCURRENCY", default_value_t = 4)]
    pub embedding_concurrency: usize,

    /// Seconds before an embedding request times out
    #[arg(long, env = "EMBEDDING_TIMEOUT_SECS", default_value_t = 30)]
    pub embedding_timeout_secs: u64,
}

impl EmbeddingArgs {
    /// Resolves the endpoint for the selected provider.
    pub fn endpoint(&self) -> Result<EmbeddingEndpoint> {
        match self.embedding_provider {
            EmbeddingProvider::OpenAi => Ok(EmbeddingEndpoint::OpenAi {
                base_url: self.embedding_base_url.clone(),
                model: self.embedding_deployment.clone(),
            }),
            EmbeddingProvider::Azure => {
                let endpoint = self
                    .embedding_endpoint
                    .as_deref()
                    .filter(|endpoint| !endpoint.trim().is_empty())
                    .ok_or_else(|| {
                        RetrievalError::Config(
                            "AZURE_OPENAI_EMBEDDING_ENDPOINT is required for the azure provider".into(),
                        )
                    })?;
                Ok(EmbeddingEndpoint::Azure {
                    endpoint: endpoint.to_string(),
                    deployment: self.embedding_deployment.clone(),
                    api_version: self.embedding_api_version.clone(),
                })
            }
        }
    }

    /// Builds the retrying embedding client.
    pub fn build_client(&self, retry: RetryPolicy) -> Result<EmbeddingClient> {
        if self.embedding_dimensions == 0 {
            return Err(RetrievalError::Config("embedding dimensions must be positive".into()));
        }
        let backend = OpenAiEmbedder::new(
            &self.embedding_api_key,
            self.endpoint()?,
            self.send_dimensions.then_some(self.embedding_dimensions),
            Duration::from_secs(self.embedding_timeout_secs.max(1)),
        )?;
        Ok(
            EmbeddingClient::new(Arc::new(backend), self.embedding_dimensions, retry)
                .with_batching(self.embedding_batch_size, self.embedding_concurrency),
        )
    }
}

/// Azure AI Search options.
#[derive(Args, Debug, Clone)]
pub struct SearchArgs {
    /// Search service endpoint, e.g. https://name.search.windows.net
    #[arg(long, env = "AZURE_SEARCH_SERVICE_ENDPOINT")]
    pub search_endpoint: String,

    /// Admin key used to create and load the index
    #[arg(long, env = "AZURE_SEARCH_INDEX_ADMIN_KEY", hide_env_values = true)]
    pub search_admin_key: String,

    /// Query key used for searches (defaults to the admin key)
    #[arg(long, env = "AZURE_SEARCH_API_KEY", hide_env_values = true)]
    pub search_query_key: Option<String>,

    /// Index holding the earnings document
    #[arg(long, env = "AMAZON_INDEX_NAME", default_value = "amazon-earnings-q1-2025-index")]
    pub index_name: String,

    /// Semantic configuration created on the index and used for semantic ranking
    #[arg(long, env = "SEARCH_SEMANTIC_CONFIG", default_value = "semantic-config")]
    pub semantic_configuration: String,

    /// Similarity metric of the vector field, used when the index is created
    #[arg(long, env = "SEARCH_VECTOR_METRIC", value_enum, default_value_t = VectorMetric::Cosine)]
    pub vector_metric: VectorMetric,

    /// Search REST API version
    #[arg(long, env = "AZURE_SEARCH_API_VERSION", default_value = DEFAULT_API_VERSION)]
    pub search_api_version: String,

    /// Seconds before a search request times out
    #[arg(long, env = "SEARCH_TIMEOUT_SECS", default_value_t = 30)]
    pub search_timeout_secs: u64,
}

impl SearchArgs {
    fn client(&self, key: &str) -> Result<AzureSearchClient> {
        AzureSearchClient::new(
            &self.search_endpoint,
            key,
            &self.search_api_version,
            Duration::from_secs(self.search_timeout_secs.max(1)),
        )
    }

    /// Client authenticated with the admin key.
    pub fn admin_client(&self) -> Result<AzureSearchClient> {
        self.client(&self.search_admin_key)
    }

    /// Client authenticated with the query key, or the admin key when unset.
    pub fn query_client(&self) -> Result<AzureSearchClient> {
        match self.search_query_key.as_deref() {
            Some(key) if !key.trim().is_empty() => self.client(key),
            _ => self.admin_client(),
        }
    }

    /// Index schema for vectors of `dimensions`.
    pub fn schema(&self, dimensions: usize) -> Result<IndexSchema> {
        Ok(IndexSchema::new(self.index_name.clone(), dimensions)?
            .with_metric(self.vector_metric)
            .with_semantic_configuration(self.semantic_configuration.clone()))
    }
}

/// Chunking, loading and query options.
#[derive(Args, Debug, Clone)]
pub struct RetrievalArgs {
    /// Characters per chunk
    #[arg(long, env = "CHUNK_SIZE", default_value_t = 1000)]
    pub chunk_size: usize,

    /// Characters shared by consecutive chunks
    #[arg(long, env = "CHUNK_OVERLAP", default_value_t = 100)]
    pub chunk_overlap: usize,

    /// Documents per upsert request
    #[arg(long, env = "UPSERT_BATCH_SIZE", default_value_t = 100)]
    pub upsert_batch_size: usize,

    /// Attempts per embedding, upsert or search call
    #[arg(long, env = "RETRY_MAX_ATTEMPTS", default_value_t = 3)]
    pub retry_max_attempts: u32,

    /// Milliseconds before the first retry
    #[arg(long, env = "RETRY_BASE_DELAY_MS", default_value_t = 500)]
    pub retry_base_delay_ms: u64,

    /// Upper bound in milliseconds for a single retry delay
    #[arg(long, env = "RETRY_MAX_DELAY_MS", default_value_t = 8000)]
    pub retry_max_delay_ms: u64,

    /// Passages returned per query
    #[arg(long, env = "QUERY_TOP_K", default_value_t = 3)]
    pub top_k: usize,

    /// Drop passages scoring below this
    #[arg(long, env = "QUERY_MIN_SCORE")]
    pub min_score: Option<f64>,

    /// Ranking mode sent to the search service
    #[arg(long, env = "QUERY_RANKING", value_enum, default_value_t = RankingMode::Semantic)]
    pub ranking: RankingMode,

    /// Seconds a full document load may take
    #[arg(long, env = "LOAD_TIMEOUT_SECS", default_value_t = 120)]
    pub load_timeout_secs: u64,

    /// Seconds a query (embed + search) may take
    #[arg(long, env = "QUERY_TIMEOUT_SECS", default_value_t = 30)]
    pub query_timeout_secs: u64,

    /// Cached query embeddings (0 disables caching)
    #[arg(long, env = "QUERY_CACHE_SIZE", default_value_t = 256)]
    pub query_cache_size: usize,
}

impl RetrievalArgs {
    /// Converts the parsed options into a validated [`RetrievalConfig`].
    pub fn config(&self) -> Result<RetrievalConfig> {
        let config = RetrievalConfig {
            chunking: ChunkingConfig {
                chunk_size: self.chunk_size,
                overlap: self.chunk_overlap,
            },
            upsert_batch_size: self.upsert_batch_size,
            retry: RetryPolicy {
                max_attempts: self.retry_max_attempts,
                base_delay: Duration::from_millis(self.retry_base_delay_ms),
                max_delay: Duration::from_millis(self.retry_max_delay_ms),
                jitter: true,
            },
            top_k: self.top_k,
            min_score: self.min_score,
            ranking: self.ranking,
            load_timeout: Duration::from_secs(self.load_timeout_secs),
            query_timeout: Duration::from_secs(self.query_timeout_secs),
            query_cache_size: self.query_cache_size,
        };
        config.validate()?;
        Ok(config)
    }
}

/// Pipeline tuning independent of any backend.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievalConfig {
    /// Chunk window.
    pub chunking: ChunkingConfig,
    /// Documents per upsert request.
    pub upsert_batch_size: usize,
    /// Retry policy for every external call.
    pub retry: RetryPolicy,
    /// Passages returned per query.
    pub top_k: usize,
    /// Score threshold below which passages are dropped.
    pub min_score: Option<f64>,
    /// Ranking mode.
    pub ranking: RankingMode,
    /// Deadline for one document load.
    pub load_timeout: Duration,
    /// Deadline for one query.
    pub query_timeout: Duration,
    /// Cached query embeddings.
    pub query_cache_size: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        let loader = LoaderSettings::default();
        let query = QuerySettings::default();
        Self {
            chunking: loader.chunking,
            upsert_batch_size: loader.upsert_batch_size,
            retry: loader.retry,
            top_k: query.default_top_k,
            min_score: query.min_score,
            ranking: query.ranking,
            load_timeout: loader.timeout,
            query_timeout: query.timeout,
            query_cache_size: query.cache_size,
        }
    }
}

impl RetrievalConfig {
    /// Rejects settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        self.chunking.validate()?;
        ensure_attempts(&self.retry)?;
        if self.upsert_batch_size == 0 {
            return Err(RetrievalError::Config("upsert batch size must be positive".into()));
        }
        if self.top_k == 0 {
            return Err(RetrievalError::Config("top_k must be positive".into()));
        }
        if self.min_score.is_some_and(f64::is_nan) {
            return Err(RetrievalError::Config("min_score must be a number".into()));
        }
        if self.load_timeout.is_zero() || self.query_timeout.is_zero() {
            return Err(RetrievalError::Config("timeouts must be positive".into()));
        }
        Ok(())
    }

    /// Loader settings derived from this config.
    pub fn loader_settings(&self) -> LoaderSettings {
        LoaderSettings {
            chunking: self.chunking,
            upsert_batch_size: self.upsert_batch_size,
            retry: self.retry,
            timeout: self.load_timeout,
        }
    }

    /// Query settings derived from this config.
    pub fn query_settings(&self, semantic_configuration: &str) -> QuerySettings {
        QuerySettings {
            default_top_k: self.top_k,
            min_score: self.min_score,
            ranking: self.ranking,
            semantic_configuration: semantic_configuration.to_string(),
            retry: self.retry,
            timeout: self.query_timeout,
            cache_size: self.query_cache_size,
        }
    }
}

/// Where the earnings document lives.
#[derive(Args, Debug, Clone)]
pub struct DocumentArgs {
    /// Earnings document indexed for vector search (.pdf or text)
    #[arg(long, env = "AMAZON_PDF_PATH", default_value = "AMZN-Q1-2025-Earnings-Release.pdf")]
    pub earnings_document: PathBuf,

    /// Id stored with each chunk (defaults to the file name)
    #[arg(long, env = "EARNINGS_DOCUMENT_ID")]
    pub document_id: Option<String>,
}

impl DocumentArgs {
    /// Source for the earnings document.
    pub fn source(&self) -> DocumentSource {
        DocumentSource::new(&self.earnings_document, self.document_id.clone())
    }
}

/// Realtime service options.
#[derive(Args, Debug, Clone)]
pub struct RelayArgs {
    /// Realtime sessions endpoint issuing ephemeral keys
    #[arg(long, env = "SESSIONS_URL")]
    pub sessions_url: String,

    /// Realtime WebRTC endpoint receiving SDP offers
    #[arg(long, env = "WEBRTC_URL")]
    pub webrtc_url: String,

    /// API key for the realtime service
    #[arg(long, env = "API_KEY", hide_env_values = true)]
    pub realtime_api_key: String,

    /// Realtime model deployment
    #[arg(long, env = "DEPLOYMENT")]
    pub deployment: String,

    /// Assistant voice
    #[arg(long, env = "VOICE", default_value = "verse")]
    pub voice: String,

    /// Seconds before a realtime service request times out
    #[arg(long, env = "RELAY_TIMEOUT_SECS", default_value_t = 30)]
    pub relay_timeout_secs: u64,
}

impl RelayArgs {
    /// Relay settings from the parsed options.
    pub fn settings(&self) -> RelaySettings {
        RelaySettings {
            sessions_url: self.sessions_url.clone(),
            webrtc_url: self.webrtc_url.clone(),
            api_key: self.realtime_api_key.clone(),
            deployment: self.deployment.clone(),
            voice: self.voice.clone(),
            timeout: Duration::from_secs(self.relay_timeout_secs.max(1)),
        }
    }
}

/// Builds the retriever from the three option groups.
pub fn build_retriever(
    embedding: &EmbeddingArgs,
    search: &SearchArgs,
    retrieval: &RetrievalArgs,
) -> Result<Retriever> {
    let config = retrieval.config()?;
    let embedder = embedding.build_client(config.retry)?;
    let schema = search.schema(embedder.dimensions())?;
    Retriever::new(
        schema,
        Arc::new(search.admin_client()?),
        Arc::new(search.query_client()?),
        embedder,
        config.loader_settings(),
        config.query_settings(&search.semantic_configuration),
    )
}
