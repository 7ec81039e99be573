//! Query embedding, top-k search and ranking.

use std::fmt::Write as _;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::embedder::EmbeddingClient;
use crate::error::{Result, RetrievalError};
use crate::index::{SearchHit, SearchRequest, VectorIndexBackend};
use crate::retry::RetryPolicy;
use crate::state::IndexHandle;

/// How the backend scores candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum RankingMode {
    /// Pure k-NN over the embedding field.
    Vector,
    /// k-NN fused with keyword search over the chunk text.
    Hybrid,
    /// Hybrid retrieval reranked by the backend's semantic ranker.
    #[default]
    Semantic,
}

/// Query-time tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct QuerySettings {
    /// Results returned when the caller does not ask for a specific count.
    pub default_top_k: usize,
    /// Results scoring below this are dropped.
    pub min_score: Option<f64>,
    /// Ranking mode sent to the backend.
    pub ranking: RankingMode,
    /// Semantic configuration name used by [`RankingMode::Semantic`].
    pub semantic_configuration: String,
    /// Retry policy for the search request.
    pub retry: RetryPolicy,
    /// Deadline for embed + search.
    pub timeout: Duration,
    /// Cached query embeddings (0 disables the cache).
    pub cache_size: usize,
}

impl Default for QuerySettings {
    fn default() -> Self {
        Self {
            default_top_k: 3,
            min_score: None,
            ranking: RankingMode::default(),
            semantic_configuration: "semantic-config".to_string(),
            retry: RetryPolicy::default(),
            timeout: Duration::from_secs(30),
            cache_size: 256,
        }
    }
}

/// A ranked passage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    /// Passage text.
    pub text: String,
    /// Relevance; higher is better.
    pub score: f64,
    /// 1-based position in the result list.
    pub rank: usize,
    /// Document key of the chunk.
    pub key: String,
    /// Document the chunk came from.
    pub source_document_id: String,
    /// Chunk position within its document.
    pub sequence_index: usize,
    /// Raw backend score.
    pub search_score: f64,
    /// Semantic reranker score, when available.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reranker_score: Option<f64>,
}

type EmbeddingCache = Arc<Mutex<LruCache<String, Vec<f32>>>>;

/// Answers queries against one index.
#[derive(Clone)]
pub struct QueryService {
    backend: Arc<dyn VectorIndexBackend>,
    embedder: EmbeddingClient,
    index_name: String,
    handle: IndexHandle,
    settings: QuerySettings,
    cache: Option<EmbeddingCache>,
}

impl QueryService {
    /// Builds a service that only answers while `handle` is ready.
    pub fn new(
        backend: Arc<dyn VectorIndexBackend>,
        embedder: EmbeddingClient,
        index_name: impl Into<String>,
        handle: IndexHandle,
        settings: QuerySettings,
    ) -> Result<Self> {
        if settings.default_top_k == 0 {
            return Err(RetrievalError::Config("default top_k must be positive".into()));
        }
        let cache = NonZeroUsize::new(settings.cache_size)
            .map(|capacity| Arc::new(Mutex::new(LruCache::new(capacity))));
        Ok(Self {
            backend,
            embedder,
            index_name: index_name.into(),
            handle,
            settings,
            cache,
        })
    }

    /// Result count used when the caller passes none.
    pub fn default_top_k(&self) -> usize {
        self.settings.default_top_k
    }

    /// Returns up to `top_k` ranked passages for `search_query`.
    ///
    /// An empty vector means nothing matched; it is not an error.
    pub async fn query(&self, search_query: &str, top_k: usize) -> Result<Vec<SearchResult>> {
        let text = search_query.trim();
        if text.is_empty() {
            return Err(RetrievalError::query(search_query, "query text is empty"));
        }
        if top_k == 0 {
            return Err(RetrievalError::query(search_query, "top_k must be positive"));
        }
        self.handle
            .ensure_ready()
            .await
            .map_err(|state| RetrievalError::query(text, format!("index is not ready ({state})")))?;

        let results = tokio::time::timeout(self.settings.timeout, self.search(text, top_k))
            .await
            .unwrap_or_else(|_| {
                Err(RetrievalError::Timeout {
                    operation: format!("query `{text}`"),
                    elapsed: self.settings.timeout,
                })
            })
            .map_err(|err| match err {
                err @ RetrievalError::Timeout { .. } => err,
                other => RetrievalError::query(text, other),
            })?;
        tracing::debug!(query = text, top_k, results = results.len(), "query answered");
        Ok(results)
    }

    async fn search(&self, text: &str, top_k: usize) -> Result<Vec<SearchResult>> {
        let vector = self.embed_query(text).await?;
        let ranking = self.settings.ranking;
        let request = SearchRequest {
            vector,
            text: (ranking != RankingMode::Vector).then(|| text.to_string()),
            top_k,
            semantic_configuration: (ranking == RankingMode::Semantic)
                .then(|| self.settings.semantic_configuration.clone()),
        };
        let hits = self
            .settings
            .retry
            .run("search", |_| self.backend.search(&self.index_name, &request))
            .await?;
        Ok(rank_hits(hits, top_k, self.settings.min_score))
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        if let Some(cache) = &self.cache {
            if let Some(hit) = cache.lock().await.get(text).cloned() {
                return Ok(hit);
            }
        }
        let embedding = self.embedder.embed(text).await?;
        if let Some(cache) = &self.cache {
            cache.lock().await.put(text.to_string(), embedding.clone());
        }
        Ok(embedding)
    }
}

/// Orders hits by score (reranker score when present), breaking ties by
/// sequence index, drops NaN and below-threshold scores, truncates to `top_k`
/// and assigns 1-based ranks.
pub fn rank_hits(hits: Vec<SearchHit>, top_k: usize, min_score: Option<f64>) -> Vec<SearchResult> {
    let mut scored: Vec<(f64, SearchHit)> = hits
        .into_iter()
        .map(|hit| (hit.reranker_score.unwrap_or(hit.search_score), hit))
        .filter(|(score, _)| !score.is_nan() && min_score.map_or(true, |min| *score >= min))
        .collect();
    scored.sort_by(|(a_score, a), (b_score, b)| {
        b_score
            .total_cmp(a_score)
            .then_with(|| a.sequence_index.cmp(&b.sequence_index))
    });
    scored.truncate(top_k);
    scored
        .into_iter()
        .enumerate()
        .map(|(idx, (score, hit))| SearchResult {
            text: hit.text,
            score,
            rank: idx + 1,
            key: hit.key,
            source_document_id: hit.source_document_id,
            sequence_index: hit.sequence_index,
            search_score: hit.search_score,
            reranker_score: hit.reranker_score,
        })
        .collect()
}

/// Renders results as `[rank] text` entries separated by blank lines.
pub fn summarize(results: &[SearchResult]) -> String {
    let mut summary = String::new();
    for result in results {
        if !summary.is_empty() {
            summary.push_str("\n\n");
        }
        let _ = write!(summary, "[{}] {}", result.rank, result.text.trim());
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::Chunk;
    use crate::embeddings::EmbeddedChunk;
    use crate::index::{IndexManager, IndexSchema};
    use crate::testing::{HashEmbedder, MemoryIndex, DIMS};
    use pretty_assertions::assert_eq;
    use std::sync::atomic::Ordering;

    const PASSAGES: [&str; 4] = [
        "Revenue grew 12% to $143.3 billion in the quarter",
        "Net income was $10.4 billion",
        "Operating cash flow increased to $99.1 billion",
        "Free cash flow improved to $50.1 billion",
    ];

    fn hit(key: &str, seq: usize, score: f64, reranker: Option<f64>) -> SearchHit {
        SearchHit {
            key: key.to_string(),
            text: format!("chunk {key}"),
            source_document_id: "earnings.pdf".to_string(),
            sequence_index: seq,
            search_score: score,
            reranker_score: reranker,
        }
    }

    async fn service(
        embedder: Arc<HashEmbedder>,
        settings: QuerySettings,
    ) -> (Arc<MemoryIndex>, IndexHandle, QueryService) {
        let backend = Arc::new(MemoryIndex::new());
        IndexManager::new(backend.clone())
            .ensure_index(&IndexSchema::new("earnings", DIMS).unwrap())
            .await
            .unwrap();
        let records: Vec<EmbeddedChunk> = PASSAGES
            .iter()
            .enumerate()
            .map(|(seq, text)| {
                let chunk = Chunk {
                    sequence_index: seq,
                    text: text.to_string(),
                    source_document_id: "earnings.pdf".to_string(),
                };
                EmbeddedChunk::new(chunk, embedder.vector_for(text))
            })
            .collect();
        backend.upsert("earnings", &records).await.unwrap();

        let handle = IndexHandle::new();
        let client = EmbeddingClient::new(embedder, DIMS, RetryPolicy::none());
        let service =
            QueryService::new(backend.clone(), client, "earnings", handle.clone(), settings).unwrap();
        (backend, handle, service)
    }

    fn settings() -> QuerySettings {
        QuerySettings {
            ranking: RankingMode::Vector,
            retry: RetryPolicy::immediate(2),
            ..QuerySettings::default()
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn net_income_question_ranks_matching_chunk_first() {
        let (_, handle, service) = service(Arc::new(HashEmbedder::new(DIMS)), settings()).await;
        handle.mark_loaded("earnings.pdf", PASSAGES.len()).await;

        let results = service.query("What was net income?", 3).await.unwrap();
        assert_eq!(results[0].text, "Net income was $10.4 billion");
        assert_eq!(results[0].rank, 1);
        assert!(results.len() <= 3);
        assert!(results.windows(2).all(|pair| pair[0].score >= pair[1].score));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn not_ready_fails_fast_without_embedding() {
        let embedder = Arc::new(HashEmbedder::new(DIMS));
        let (backend, _, service) = service(embedder.clone(), settings()).await;

        let err = service.query("net income", 3).await.unwrap_err();
        assert!(matches!(err, RetrievalError::Query { .. }));
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 0);
        assert_eq!(backend.searches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn rejects_blank_query_and_zero_top_k() {
        let (_, handle, service) = service(Arc::new(HashEmbedder::new(DIMS)), settings()).await;
        handle.mark_loaded("earnings.pdf", 4).await;
        assert!(matches!(
            service.query("  ", 3).await,
            Err(RetrievalError::Query { .. })
        ));
        assert!(matches!(
            service.query("net income", 0).await,
            Err(RetrievalError::Query { .. })
        ));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn no_hits_is_empty_not_error() {
        let (backend, handle, service) = service(Arc::new(HashEmbedder::new(DIMS)), settings()).await;
        handle.mark_loaded("earnings.pdf", 4).await;
        backend.script_hits(Vec::new());
        assert!(service.query("quantum chromodynamics", 3).await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn slow_search_times_out() {
        let settings = QuerySettings {
            timeout: Duration::from_millis(50),
            ..settings()
        };
        let (backend, handle, service) = service(Arc::new(HashEmbedder::new(DIMS)), settings).await;
        handle.mark_loaded("earnings.pdf", 4).await;
        backend.stall_searches(Duration::from_secs(5));

        let err = service.query("net income", 3).await.unwrap_err();
        match err {
            RetrievalError::Timeout { operation, elapsed } => {
                assert_eq!(operation, "query `net income`");
                assert_eq!(elapsed, Duration::from_millis(50));
            }
            other => panic!("expected timeout, got {other}"),
        }
        assert_eq!(backend.searches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn search_failure_is_retried_then_wrapped() {
        let (backend, handle, service) = service(Arc::new(HashEmbedder::new(DIMS)), settings()).await;
        handle.mark_loaded("earnings.pdf", 4).await;
        backend.fail_searches.store(true, Ordering::SeqCst);

        let err = service.query("net income", 3).await.unwrap_err();
        match err {
            RetrievalError::Query { query, reason } => {
                assert_eq!(query, "net income");
                assert!(reason.contains("503"), "{reason}");
            }
            other => panic!("expected query error, got {other:?}"),
        }
        assert_eq!(backend.searches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn repeated_query_uses_cached_embedding() {
        let embedder = Arc::new(HashEmbedder::new(DIMS));
        let (_, handle, service) = service(embedder.clone(), settings()).await;
        handle.mark_loaded("earnings.pdf", 4).await;

        service.query("net income", 3).await.unwrap();
        service.query("  net income ", 3).await.unwrap();
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn min_score_drops_weak_matches() {
        let settings = QuerySettings {
            min_score: Some(0.5),
            ..settings()
        };
        let (backend, handle, service) = service(Arc::new(HashEmbedder::new(DIMS)), settings).await;
        handle.mark_loaded("earnings.pdf", 4).await;
        backend.script_hits(vec![hit("a", 0, 0.9, None), hit("b", 1, 0.2, None)]);

        let results = service.query("net income", 3).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].key, "a");
    }

    #[test]
    fn ties_break_by_sequence_index() {
        let hits = vec![
            hit("c", 7, 0.5, None),
            hit("a", 2, 0.5, None),
            hit("top", 9, 0.9, None),
            hit("b", 3, 0.5, None),
        ];
        let ranked = rank_hits(hits, 3, None);
        let order: Vec<(&str, usize)> = ranked
            .iter()
            .map(|result| (result.key.as_str(), result.rank))
            .collect();
        assert_eq!(order, vec![("top", 1), ("a", 2), ("b", 3)]);
    }

    #[test]
    fn reranker_score_takes_precedence() {
        let hits = vec![hit("vector", 0, 0.9, Some(1.2)), hit("semantic", 1, 0.1, Some(3.4))];
        let ranked = rank_hits(hits, 5, None);
        assert_eq!(ranked[0].key, "semantic");
        assert_eq!(ranked[0].score, 3.4);
        assert_eq!(ranked[0].search_score, 0.1);
    }

    #[test]
    fn nan_scores_are_dropped() {
        let ranked = rank_hits(vec![hit("nan", 0, f64::NAN, None), hit("ok", 1, 0.3, None)], 5, None);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].key, "ok");
    }

    #[test]
    fn summary_lists_ranked_passages() {
        let ranked = rank_hits(vec![hit("a", 0, 0.9, None), hit("b", 1, 0.4, None)], 5, None);
        assert_eq!(summarize(&ranked), "[1] chunk a\n\n[2] chunk b");
        assert_eq!(summarize(&[]), "");
    }
}
