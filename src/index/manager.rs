//! Create-if-absent index management.

use std::sync::Arc;

use super::schema::IndexSchema;
use super::VectorIndexBackend;
use crate::error::{Result, RetrievalError};

/// Outcome of [`IndexManager::ensure_index`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexStatus {
    /// The index was created by this call.
    Created,
    /// A compatible index already existed.
    Existing,
}

/// Ensures the chunk index exists with a compatible schema.
#[derive(Clone)]
pub struct IndexManager {
    backend: Arc<dyn VectorIndexBackend>,
}

impl IndexManager {
    /// Wraps an admin-capable backend.
    pub fn new(backend: Arc<dyn VectorIndexBackend>) -> Self {
        Self { backend }
    }

    /// Creates the index unless a compatible one exists.
    ///
    /// Every failure is an [`RetrievalError::IndexCreation`]: an existing index
    /// with the wrong fields, a rejected definition, or a definition that is
    /// incomplete right after creation are not repaired automatically.
    pub async fn ensure_index(&self, schema: &IndexSchema) -> Result<IndexStatus> {
        let creation = |reason: String| RetrievalError::IndexCreation {
            index: schema.name().to_string(),
            reason,
        };

        if let Some(existing) = self
            .backend
            .describe_index(schema.name())
            .await
            .map_err(|err| creation(err.to_string()))?
        {
            schema
                .check(&existing)
                .map_err(|why| creation(format!("existing index is incompatible: {why}")))?;
            tracing::info!(index = schema.name(), "index already exists");
            return Ok(IndexStatus::Existing);
        }

        tracing::info!(
            index = schema.name(),
            dimensions = schema.dimensions(),
            "index not found, creating"
        );
        self.backend.create_index(schema).await.map_err(|err| match err {
            err @ RetrievalError::IndexCreation { .. } => err,
            other => creation(other.to_string()),
        })?;

        let created = self
            .backend
            .describe_index(schema.name())
            .await
            .map_err(|err| creation(format!("could not verify new index: {err}")))?
            .ok_or_else(|| creation("index not visible after creation".into()))?;
        schema
            .check(&created)
            .map_err(|why| creation(format!("index created partially: {why}")))?;
        tracing::info!(index = schema.name(), "index created");
        Ok(IndexStatus::Created)
    }

    /// Drops the index so the next [`ensure_index`](Self::ensure_index) rebuilds it.
    pub async fn delete_index(&self, name: &str) -> Result<()> {
        tracing::warn!(index = name, "deleting index");
        self.backend.delete_index(name).await
    }
}
