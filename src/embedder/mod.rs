//! Embedding backends and the retrying, validating client built on them.

pub mod openai;

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt, TryStreamExt};

use crate::error::{Result, RetrievalError};
use crate::retry::RetryPolicy;

pub use openai::{EmbeddingEndpoint, OpenAiEmbedder};

/// Converts text batches into vectors with a single upstream attempt.
#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
    /// Embeds `inputs`, returning one vector per input in input order.
    async fn embed_batch(&self, inputs: &[&str]) -> Result<Vec<Vec<f32>>>;

    /// Model or deployment name, for logs.
    fn model_name(&self) -> &str;
}

/// Embedding client shared by the loader and the query service.
///
/// Batches inputs, keeps up to `concurrency` batches in flight, retries
/// transient failures and checks every vector has the configured length.
#[derive(Clone)]
pub struct EmbeddingClient {
    backend: Arc<dyn EmbeddingBackend>,
    retry: RetryPolicy,
    dimensions: usize,
    batch_size: usize,
    concurrency: usize,
}

impl EmbeddingClient {
    /// Wraps `backend`, expecting vectors of length `dimensions`.
    pub fn new(backend: Arc<dyn EmbeddingBackend>, dimensions: usize, retry: RetryPolicy) -> Self {
        Self {
            backend,
            retry,
            dimensions,
            batch_size: 16,
            concurrency: 4,
        }
    }

    /// Overrides the batch size and number of concurrent batches.
    pub fn with_batching(mut self, batch_size: usize, concurrency: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self.concurrency = concurrency.max(1);
        self
    }

    /// Vector length every embedding must have.
    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Embeds a single non-empty text.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_all(&[text])
            .await?
            .pop()
            .ok_or_else(|| RetrievalError::embedding("upstream returned no embedding", false))
    }

    /// Embeds every text, preserving input order.
    pub async fn embed_all(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        if let Some(position) = texts.iter().position(|text| text.trim().is_empty()) {
            return Err(RetrievalError::embedding(
                format!("input {position} is empty or whitespace"),
                false,
            ));
        }
        tracing::debug!(
            model = self.backend.model_name(),
            inputs = texts.len(),
            batch_size = self.batch_size,
            "embedding"
        );
        let pending: Vec<_> = texts
            .chunks(self.batch_size)
            .map(|batch| self.embed_batch(batch))
            .collect();
        let batches: Vec<Vec<Vec<f32>>> = stream::iter(pending)
            .buffered(self.concurrency)
            .try_collect()
            .await?;
        Ok(batches.into_iter().flatten().collect())
    }

    async fn embed_batch(&self, batch: &[&str]) -> Result<Vec<Vec<f32>>> {
        self.retry
            .run("embed", |_| async move {
                let vectors = self.backend.embed_batch(batch).await?;
                self.validate(batch.len(), vectors)
            })
            .await
    }

    fn validate(&self, expected: usize, vectors: Vec<Vec<f32>>) -> Result<Vec<Vec<f32>>> {
        if vectors.len() != expected {
            return Err(RetrievalError::embedding(
                format!("expected {expected} embeddings, got {}", vectors.len()),
                false,
            ));
        }
        for vector in &vectors {
            if vector.is_empty() {
                return Err(RetrievalError::embedding("upstream returned an empty vector", false));
            }
            if vector.len() != self.dimensions {
                return Err(RetrievalError::embedding(
                    format!(
                        "vector length {} does not match configured dimensions {}",
                        vector.len(),
                        self.dimensions
                    ),
                    false,
                ));
            }
        }
        Ok(vectors)
    }
}
