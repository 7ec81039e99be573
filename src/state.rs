//! Readiness of the vector index for the current process.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tokio::sync::RwLock;

/// Lifecycle of the index as seen by this process.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum IndexState {
    /// No successful ensure + load has happened yet.
    #[default]
    Unready,
    /// Index verified and at least one document fully loaded.
    Ready {
        /// Chunks across every document loaded by this process.
        chunk_count: usize,
    },
    /// Initialisation failed; queries must fail fast.
    Failed {
        /// Error that prevented initialisation.
        reason: String,
    },
}

impl fmt::Display for IndexState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unready => write!(f, "unready"),
            Self::Ready { chunk_count } => write!(f, "ready ({chunk_count} chunks)"),
            Self::Failed { reason } => write!(f, "failed: {reason}"),
        }
    }
}

#[derive(Debug, Default)]
struct Tracked {
    state: IndexState,
    documents: BTreeMap<String, usize>,
}

/// Shared handle to the index state. Written by the retriever's load
/// sequence, read by every query.
#[derive(Debug, Clone, Default)]
pub struct IndexHandle {
    inner: Arc<RwLock<Tracked>>,
}

impl IndexHandle {
    /// Creates a handle in the `Unready` state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the current state.
    pub async fn snapshot(&self) -> IndexState {
        self.inner.read().await.state.clone()
    }

    /// Chunk count of each document loaded by this process.
    pub async fn documents(&self) -> BTreeMap<String, usize> {
        self.inner.read().await.documents.clone()
    }

    /// Returns the loaded chunk count, or the state description when not ready.
    pub async fn ensure_ready(&self) -> Result<usize, IndexState> {
        match &self.inner.read().await.state {
            IndexState::Ready { chunk_count } => Ok(*chunk_count),
            other => Err(other.clone()),
        }
    }

    /// Records `document_id` as fully loaded and marks the index ready.
    pub(crate) async fn mark_loaded(&self, document_id: &str, chunk_count: usize) {
        let mut guard = self.inner.write().await;
        guard.documents.insert(document_id.to_string(), chunk_count);
        let total = guard.documents.values().sum::<usize>();
        guard.state = IndexState::Ready { chunk_count: total };
    }

    /// Forgets every loaded document.
    pub(crate) async fn mark_unready(&self) {
        let mut guard = self.inner.write().await;
        guard.documents.clear();
        guard.state = IndexState::Unready;
    }

    /// Records a failure unless an earlier load already made the index ready.
    pub(crate) async fn mark_failed(&self, reason: String) -> IndexState {
        let mut guard = self.inner.write().await;
        if !matches!(guard.state, IndexState::Ready { .. }) {
            guard.state = IndexState::Failed { reason };
        }
        guard.state.clone()
    }

    /// Records a failure even over a ready index, for when its contents can
    /// no longer be trusted.
    pub(crate) async fn invalidate(&self, reason: String) -> IndexState {
        let mut guard = self.inner.write().await;
        guard.documents.clear();
        guard.state = IndexState::Failed { reason };
        guard.state.clone()
    }
}
