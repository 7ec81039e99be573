//! Chunk, embed and upsert one document, all or nothing.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use super::VectorIndexBackend;
use crate::chunker::{chunk_document, Chunk, ChunkingConfig};
use crate::embedder::EmbeddingClient;
use crate::embeddings::EmbeddedChunk;
use crate::error::{Result, RetrievalError};
use crate::retry::RetryPolicy;

/// Loader tuning knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoaderSettings {
    /// How the document is cut into chunks.
    pub chunking: ChunkingConfig,
    /// Documents per upsert request.
    pub upsert_batch_size: usize,
    /// Retry policy for count and upsert requests.
    pub retry: RetryPolicy,
    /// Deadline for the embed + upsert phase of one load.
    pub timeout: Duration,
}

impl Default for LoaderSettings {
    fn default() -> Self {
        Self {
            chunking: ChunkingConfig::default(),
            upsert_batch_size: 100,
            retry: RetryPolicy::default(),
            timeout: Duration::from_secs(120),
        }
    }
}

/// What a call to [`IndexLoader::load`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadReport {
    /// Document that was loaded.
    pub document_id: String,
    /// Number of chunks the document splits into.
    pub chunk_count: usize,
    /// Chunks written by this call (0 when skipped).
    pub upserted: usize,
    /// Whether the index already held the whole document.
    pub skipped: bool,
}

/// Loads a document into the index.
#[derive(Clone)]
pub struct IndexLoader {
    backend: Arc<dyn VectorIndexBackend>,
    embedder: EmbeddingClient,
    settings: LoaderSettings,
}

impl IndexLoader {
    /// Builds a loader writing through `backend`.
    pub fn new(
        backend: Arc<dyn VectorIndexBackend>,
        embedder: EmbeddingClient,
        settings: LoaderSettings,
    ) -> Result<Self> {
        settings.chunking.validate()?;
        if settings.upsert_batch_size == 0 {
            return Err(RetrievalError::Config("upsert batch size must be positive".into()));
        }
        Ok(Self {
            backend,
            embedder,
            settings,
        })
    }

    /// Chunks, embeds and upserts `document_text` under `document_id`.
    ///
    /// Skips the work when the index already holds every chunk of the
    /// document. When some chunks are already stored they are read back
    /// first. On failure or timeout the chunks this call added are deleted and
    /// the ones it overwrote are written back, so the index returns to its
    /// prior contents. If that restore fails the error is
    /// [`RetrievalError::Inconsistent`].
    pub async fn load(
        &self,
        document_text: &str,
        document_id: &str,
        index_name: &str,
    ) -> Result<LoadReport> {
        let chunks = chunk_document(document_text, document_id, &self.settings.chunking)?;
        let mut report = LoadReport {
            document_id: document_id.to_string(),
            chunk_count: chunks.len(),
            upserted: 0,
            skipped: false,
        };
        if chunks.is_empty() {
            tracing::warn!(document_id, "document has no text, nothing to load");
            return Ok(report);
        }

        let existing = self
            .settings
            .retry
            .run("count documents", |_| {
                self.backend.count_documents(index_name, document_id)
            })
            .await
            .map_err(|err| err.context(format!("checking {document_id}")))?;
        if existing >= chunks.len() as u64 {
            tracing::info!(
                document_id,
                index = index_name,
                existing,
                "document already indexed, skipping load"
            );
            report.skipped = true;
            return Ok(report);
        }
        let previous = if existing > 0 {
            tracing::warn!(
                document_id,
                existing,
                expected = chunks.len(),
                "document partially indexed, reloading"
            );
            self.settings
                .retry
                .run("fetch documents", |_| {
                    self.backend.fetch_documents(index_name, document_id)
                })
                .await
                .map_err(|err| err.context(format!("reading back {document_id}")))?
        } else {
            Vec::new()
        };

        let mut written = Vec::new();
        let outcome = tokio::time::timeout(
            self.settings.timeout,
            self.embed_and_upsert(index_name, document_id, chunks, &mut written),
        )
        .await
        .unwrap_or_else(|_| {
            Err(RetrievalError::Timeout {
                operation: format!("load {document_id}"),
                elapsed: self.settings.timeout,
            })
        });

        match outcome {
            Ok(upserted) => {
                tracing::info!(document_id, index = index_name, upserted, "document loaded");
                report.upserted = upserted;
                Ok(report)
            }
            Err(err) => {
                tracing::error!(document_id, error = %err, "load failed");
                match self.rollback(index_name, &written, &previous).await {
                    Ok(()) => Err(err),
                    Err(rollback) => Err(RetrievalError::Inconsistent {
                        document_id: document_id.to_string(),
                        reason: format!("{err}; rollback: {rollback}"),
                    }),
                }
            }
        }
    }

    async fn embed_and_upsert(
        &self,
        index_name: &str,
        document_id: &str,
        chunks: Vec<Chunk>,
        written: &mut Vec<String>,
    ) -> Result<usize> {
        let vectors = {
            let texts: Vec<&str> = chunks.iter().map(|chunk| chunk.text.as_str()).collect();
            self.embedder
                .embed_all(&texts)
                .await
                .map_err(|err| err.context(format!("embedding {document_id}")))?
        };
        let records: Vec<EmbeddedChunk> = chunks
            .into_iter()
            .zip(vectors)
            .map(|(chunk, embedding)| EmbeddedChunk::new(chunk, embedding))
            .collect();

        let total_batches = records.len().div_ceil(self.settings.upsert_batch_size);
        for (batch_no, batch) in records.chunks(self.settings.upsert_batch_size).enumerate() {
            // Recorded before the request: a failed batch may still have landed in part.
            written.extend(batch.iter().map(|record| record.document_key.clone()));
            self.settings
                .retry
                .run("upsert", |_| self.backend.upsert(index_name, batch))
                .await
                .map_err(|err| err.context(format!("loading {document_id}")))?;
            tracing::debug!(
                document_id,
                batch = batch_no + 1,
                total_batches,
                "upserted batch"
            );
        }
        Ok(records.len())
    }

    /// Deletes keys this load added and writes back the records it overwrote.
    async fn rollback(
        &self,
        index_name: &str,
        written: &[String],
        previous: &[EmbeddedChunk],
    ) -> Result<()> {
        if written.is_empty() {
            return Ok(());
        }
        let written: HashSet<&str> = written.iter().map(String::as_str).collect();
        let prior: HashSet<&str> = previous
            .iter()
            .map(|record| record.document_key.as_str())
            .collect();
        let added: Vec<String> = written
            .iter()
            .filter(|key| !prior.contains(*key))
            .map(|key| key.to_string())
            .collect();
        let overwritten: Vec<EmbeddedChunk> = previous
            .iter()
            .filter(|record| written.contains(record.document_key.as_str()))
            .cloned()
            .collect();

        for batch in added.chunks(self.settings.upsert_batch_size) {
            self.settings
                .retry
                .run("rollback delete", |_| self.backend.delete_documents(index_name, batch))
                .await?;
        }
        for batch in overwritten.chunks(self.settings.upsert_batch_size) {
            self.settings
                .retry
                .run("rollback restore", |_| self.backend.upsert(index_name, batch))
                .await?;
        }
        tracing::warn!(
            index = index_name,
            deleted = added.len(),
            restored = overwritten.len(),
            "rolled back failed load"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::document_key;
    use crate::index::{IndexManager, IndexSchema};
    use crate::testing::{earnings_text, HashEmbedder, MemoryIndex, DIMS};
    use std::collections::HashSet;
    use std::sync::atomic::Ordering;

    fn settings() -> LoaderSettings {
        LoaderSettings {
            chunking: ChunkingConfig::new(3000, 200).unwrap(),
            upsert_batch_size: 2,
            retry: RetryPolicy::immediate(3),
            timeout: Duration::from_secs(5),
        }
    }

    async fn setup(embedder: Arc<HashEmbedder>) -> (Arc<MemoryIndex>, IndexLoader) {
        let backend = Arc::new(MemoryIndex::new());
        IndexManager::new(backend.clone())
            .ensure_index(&IndexSchema::new("earnings", DIMS).unwrap())
            .await
            .unwrap();
        let client = EmbeddingClient::new(embedder, DIMS, RetryPolicy::immediate(3));
        let loader = IndexLoader::new(backend.clone(), client, settings()).unwrap();
        (backend, loader)
    }

    #[tokio::test(flavor = "current_thread")]
    async fn loads_five_chunks_then_skips() {
        let (backend, loader) = setup(Arc::new(HashEmbedder::new(DIMS))).await;
        let text = earnings_text(12_000);

        let first = loader.load(&text, "earnings.pdf", "earnings").await.unwrap();
        assert_eq!(first.chunk_count, 5);
        assert_eq!(first.upserted, 5);
        assert!(!first.skipped);

        let second = loader.load(&text, "earnings.pdf", "earnings").await.unwrap();
        assert_eq!(second.upserted, 0);
        assert!(second.skipped);
        assert_eq!(backend.document_count("earnings"), 5);

        let keys: HashSet<String> = backend.keys("earnings").into_iter().collect();
        let expected: HashSet<String> = (0..5).map(|i| document_key("earnings.pdf", i)).collect();
        assert_eq!(keys, expected);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn reload_without_skip_does_not_duplicate() {
        let (backend, loader) = setup(Arc::new(HashEmbedder::new(DIMS))).await;
        let text = earnings_text(12_000);
        loader.load(&text, "earnings.pdf", "earnings").await.unwrap();

        // Drop one chunk so the existence check sees a partial document.
        backend.remove("earnings", &document_key("earnings.pdf", 4));
        let report = loader.load(&text, "earnings.pdf", "earnings").await.unwrap();
        assert_eq!(report.upserted, 5);
        assert_eq!(backend.document_count("earnings"), 5);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn embedding_failure_writes_nothing() {
        let embedder = Arc::new(HashEmbedder::new(DIMS));
        embedder.fail_next(100);
        let (backend, loader) = setup(embedder).await;

        let err = loader
            .load(&earnings_text(12_000), "earnings.pdf", "earnings")
            .await
            .unwrap_err();
        assert!(matches!(err, RetrievalError::EmbeddingService { .. }));
        assert!(err.to_string().contains("earnings.pdf"));
        assert_eq!(backend.upserts.load(Ordering::SeqCst), 0);
        assert_eq!(backend.document_count("earnings"), 0);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn failed_upsert_rolls_back_earlier_batches() {
        let (backend, loader) = setup(Arc::new(HashEmbedder::new(DIMS))).await;
        // Batches of 2: the first succeeds, the second keeps failing.
        backend.fail_upserts_after(1);

        let err = loader
            .load(&earnings_text(12_000), "earnings.pdf", "earnings")
            .await
            .unwrap_err();
        assert!(matches!(err, RetrievalError::IndexUpsert { .. }));
        assert_eq!(backend.upserts.load(Ordering::SeqCst), 1 + 3);
        assert_eq!(backend.document_count("earnings"), 0);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn failed_reload_of_grown_document_restores_previous_chunks() {
        let (backend, loader) = setup(Arc::new(HashEmbedder::new(DIMS))).await;
        loader
            .load(&earnings_text(12_000), "earnings.pdf", "earnings")
            .await
            .unwrap();
        let before = backend.records("earnings");
        assert_eq!(before.len(), 5);

        // The first load used 3 upsert calls. The reload's first two batches
        // overwrite chunks 0..4, then its third batch exhausts its retries.
        backend.fail_upserts_window(5, 3);
        let err = loader
            .load(&earnings_text(24_000), "earnings.pdf", "earnings")
            .await
            .unwrap_err();
        assert!(matches!(err, RetrievalError::IndexUpsert { .. }), "{err}");
        assert_eq!(backend.records("earnings"), before);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn failed_restore_reports_inconsistent_index() {
        let (backend, loader) = setup(Arc::new(HashEmbedder::new(DIMS))).await;
        loader
            .load(&earnings_text(12_000), "earnings.pdf", "earnings")
            .await
            .unwrap();

        backend.fail_upserts_after(3);
        let err = loader
            .load(&earnings_text(24_000), "earnings.pdf", "earnings")
            .await
            .unwrap_err();
        assert!(matches!(err, RetrievalError::Inconsistent { .. }), "{err}");
        assert!(err.to_string().contains("rollback"));
        assert!(!err.is_transient());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn timeout_rolls_back() {
        let (backend, loader) = setup(Arc::new(HashEmbedder::new(DIMS))).await;
        let loader = IndexLoader {
            settings: LoaderSettings {
                timeout: Duration::from_millis(50),
                ..loader.settings
            },
            ..loader
        };
        backend.stall_upserts_after(1, Duration::from_secs(5));

        let err = loader
            .load(&earnings_text(12_000), "earnings.pdf", "earnings")
            .await
            .unwrap_err();
        assert!(matches!(err, RetrievalError::Timeout { .. }));
        assert_eq!(backend.document_count("earnings"), 0);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn empty_document_is_not_an_error() {
        let (backend, loader) = setup(Arc::new(HashEmbedder::new(DIMS))).await;
        let report = loader.load("   ", "blank.pdf", "earnings").await.unwrap();
        assert_eq!(report.chunk_count, 0);
        assert_eq!(report.upserted, 0);
        assert_eq!(backend.document_count("earnings"), 0);
    }

    #[test]
    fn zero_batch_size_rejected() {
        let backend = Arc::new(MemoryIndex::new());
        let client = EmbeddingClient::new(Arc::new(HashEmbedder::new(DIMS)), DIMS, RetryPolicy::none());
        let settings = LoaderSettings {
            upsert_batch_size: 0,
            ..LoaderSettings::default()
        };
        assert!(IndexLoader::new(backend, client, settings).is_err());
    }
}
