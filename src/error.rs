//! Error taxonomy for the retrieval pipeline.

use std::time::Duration;

use thiserror::Error;

/// Convenience alias used throughout the retrieval modules.
pub type Result<T, E = RetrievalError> = std::result::Result<T, E>;

/// Failures surfaced by the chunk -> embed -> index -> query pipeline.
#[derive(Debug, Error)]
pub enum RetrievalError {
    /// The embedding upstream failed or returned malformed data.
    #[error("embedding service error: {reason}")]
    EmbeddingService {
        /// Human readable cause, including the upstream body when available.
        reason: String,
        /// Whether a retry may succeed (rate limit, 5xx, network).
        transient: bool,
    },

    /// The index schema could not be established. Never retried.
    #[error("failed to create index `{index}`: {reason}")]
    IndexCreation {
        /// Index name.
        index: String,
        /// Cause reported by the backend or the schema check.
        reason: String,
    },

    /// A batch upsert failed.
    #[error("failed to upsert {count} document(s) into `{index}`: {reason}")]
    IndexUpsert {
        /// Index name.
        index: String,
        /// Size of the batch that failed.
        count: usize,
        /// Cause reported by the backend.
        reason: String,
        /// Whether a retry may succeed.
        transient: bool,
    },

    /// Any other index backend request (describe, count, delete, search) failed.
    #[error("index backend error during {operation}: {reason}")]
    IndexBackend {
        /// Backend operation name.
        operation: &'static str,
        /// Cause reported by the backend.
        reason: String,
        /// Whether a retry may succeed.
        transient: bool,
    },

    /// A query could not be answered.
    #[error("query `{query}` failed: {reason}")]
    Query {
        /// The user query text.
        query: String,
        /// Cause, including the wrapped lower-level error.
        reason: String,
    },

    /// An operation exceeded its configured deadline.
    #[error("{operation} timed out after {elapsed:?}")]
    Timeout {
        /// Operation label, e.g. `load earnings.pdf`.
        operation: String,
        /// Configured deadline.
        elapsed: Duration,
    },

    /// A load failed and its rollback could not restore the document's
    /// previous chunks, so the index holds a mix of old and new content.
    #[error("load of `{document_id}` failed and the index could not be restored: {reason}")]
    Inconsistent {
        /// Document whose chunks are mixed.
        document_id: String,
        /// The load failure followed by the rollback failure.
        reason: String,
    },

    /// Invalid configuration or input.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl RetrievalError {
    /// Whether the retry policy should attempt the operation again.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::EmbeddingService { transient, .. }
            | Self::IndexUpsert { transient, .. }
            | Self::IndexBackend { transient, .. } => *transient,
            Self::Timeout { .. } => true,
            Self::IndexCreation { .. }
            | Self::Query { .. }
            | Self::Inconsistent { .. }
            | Self::Config(_) => false,
        }
    }

    pub(crate) fn embedding(reason: impl Into<String>, transient: bool) -> Self {
        Self::EmbeddingService {
            reason: reason.into(),
            transient,
        }
    }

    pub(crate) fn backend(operation: &'static str, reason: impl Into<String>, transient: bool) -> Self {
        Self::IndexBackend {
            operation,
            reason: reason.into(),
            transient,
        }
    }

    pub(crate) fn query(query: &str, reason: impl std::fmt::Display) -> Self {
        Self::Query {
            query: query.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Prefixes the reason with `context` (operation, document id), keeping the variant.
    pub(crate) fn context(self, context: impl std::fmt::Display) -> Self {
        match self {
            Self::EmbeddingService { reason, transient } => Self::EmbeddingService {
                reason: format!("{context}: {reason}"),
                transient,
            },
            Self::IndexUpsert {
                index,
                count,
                reason,
                transient,
            } => Self::IndexUpsert {
                index,
                count,
                reason: format!("{context}: {reason}"),
                transient,
            },
            Self::IndexBackend {
                operation,
                reason,
                transient,
            } => Self::IndexBackend {
                operation,
                reason: format!("{context}: {reason}"),
                transient,
            },
            other => other,
        }
    }
}
