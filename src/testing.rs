//! In-memory fakes of the embedding and index backends for unit tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::embedder::EmbeddingBackend;
use crate::embeddings::EmbeddedChunk;
use crate::error::{Result, RetrievalError};
use crate::index::schema::{
    DescribedField, IndexDescription, IndexSchema, CONTENT_FIELD, KEY_FIELD, SEQUENCE_FIELD,
    SOURCE_FIELD, VECTOR_FIELD,
};
use crate::index::{SearchHit, SearchRequest, VectorIndexBackend};

/// Vector length used by the fakes.
pub const DIMS: usize = 64;

/// Exactly `len` ASCII characters of earnings-release prose.
pub fn earnings_text(len: usize) -> String {
    const SENTENCES: &str = "Net sales increased 9% to $155.7 billion in the first quarter. \
        Operating income increased to $18.4 billion. \
        AWS segment sales increased 17% year-over-year to $29.3 billion. \
        Operating cash flow increased 15% to $113.9 billion for the trailing twelve months. ";
    SENTENCES.chars().cycle().take(len).collect()
}

/// Bag-of-words embedder: every lowercase alphanumeric token bumps one hashed slot.
pub struct HashEmbedder {
    dims: usize,
    pending_failures: AtomicUsize,
    pub calls: AtomicUsize,
}

impl HashEmbedder {
    pub fn new(dims: usize) -> Self {
        Self {
            dims,
            pending_failures: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    /// Makes the next `count` calls fail with a transient error.
    pub fn fail_next(&self, count: usize) {
        self.pending_failures.store(count, Ordering::SeqCst);
    }

    pub fn vector_for(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dims];
        for token in text
            .split(|ch: char| !ch.is_alphanumeric())
            .filter(|token| !token.is_empty())
        {
            let hash = token
                .to_lowercase()
                .bytes()
                .fold(0xcbf29ce484222325u64, |acc, byte| {
                    (acc ^ byte as u64).wrapping_mul(0x100000001b3)
                });
            vector[(hash % self.dims as u64) as usize] += 1.0;
        }
        vector
    }
}

#[async_trait]
impl EmbeddingBackend for HashEmbedder {
    async fn embed_batch(&self, inputs: &[&str]) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .pending_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(RetrievalError::embedding("503 Service Unavailable", true));
        }
        Ok(inputs.iter().map(|text| self.vector_for(text)).collect())
    }

    fn model_name(&self) -> &str {
        "hash-embedder"
    }
}

/// Returns the same vector for every input.
pub struct FixedEmbedder(pub Vec<f32>);

#[async_trait]
impl EmbeddingBackend for FixedEmbedder {
    async fn embed_batch(&self, inputs: &[&str]) -> Result<Vec<Vec<f32>>> {
        Ok(inputs.iter().map(|_| self.0.clone()).collect())
    }

    fn model_name(&self) -> &str {
        "fixed-embedder"
    }
}

struct Collection {
    description: IndexDescription,
    documents: BTreeMap<String, EmbeddedChunk>,
}

/// Index backend keeping documents in memory and ranking by cosine similarity.
#[derive(Default)]
pub struct MemoryIndex {
    collections: Mutex<HashMap<String, Collection>>,
    scripted_hits: Mutex<Option<Vec<SearchHit>>>,
    failing_upserts: Mutex<Option<(usize, usize)>>,
    stall_upserts: Mutex<Option<(usize, Duration)>>,
    stall_searches: Mutex<Option<Duration>>,
    pub creates: AtomicUsize,
    pub upserts: AtomicUsize,
    pub searches: AtomicUsize,
    pub reject_create: AtomicBool,
    pub create_without_vector: AtomicBool,
    pub fail_searches: AtomicBool,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert calls after the first `count` fail with a transient error.
    pub fn fail_upserts_after(&self, count: usize) {
        *self.failing_upserts.lock().unwrap() = Some((count, usize::MAX));
    }

    /// Upsert calls `after + 1 ..= after + failures` fail with a transient
    /// error; later calls succeed again.
    pub fn fail_upserts_window(&self, after: usize, failures: usize) {
        *self.failing_upserts.lock().unwrap() = Some((after, failures));
    }

    /// Every search sleeps for `delay` first.
    pub fn stall_searches(&self, delay: Duration) {
        *self.stall_searches.lock().unwrap() = Some(delay);
    }

    /// Upsert calls after the first `count` sleep for `delay` first.
    pub fn stall_upserts_after(&self, count: usize, delay: Duration) {
        *self.stall_upserts.lock().unwrap() = Some((count, delay));
    }

    /// Makes `search` return exactly these hits.
    pub fn script_hits(&self, hits: Vec<SearchHit>) {
        *self.scripted_hits.lock().unwrap() = Some(hits);
    }

    pub fn document_count(&self, index: &str) -> usize {
        self.collections
            .lock()
            .unwrap()
            .get(index)
            .map_or(0, |collection| collection.documents.len())
    }

    /// Stored records in key order.
    pub fn records(&self, index: &str) -> Vec<EmbeddedChunk> {
        self.collections
            .lock()
            .unwrap()
            .get(index)
            .map(|collection| collection.documents.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn keys(&self, index: &str) -> Vec<String> {
        self.collections
            .lock()
            .unwrap()
            .get(index)
            .map(|collection| collection.documents.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn remove(&self, index: &str, key: &str) {
        if let Some(collection) = self.collections.lock().unwrap().get_mut(index) {
            collection.documents.remove(key);
        }
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f64 {
    let dot: f64 = a.iter().zip(b).map(|(x, y)| (*x as f64) * (*y as f64)).sum();
    let norm = |v: &[f32]| v.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    let denominator = norm(a) * norm(b);
    if denominator == 0.0 {
        0.0
    } else {
        dot / denominator
    }
}

#[async_trait]
impl VectorIndexBackend for MemoryIndex {
    async fn describe_index(&self, name: &str) -> Result<Option<IndexDescription>> {
        Ok(self
            .collections
            .lock()
            .unwrap()
            .get(name)
            .map(|collection| collection.description.clone()))
    }

    async fn create_index(&self, schema: &IndexSchema) -> Result<()> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        if self.reject_create.load(Ordering::SeqCst) {
            return Err(RetrievalError::IndexCreation {
                index: schema.name().to_string(),
                reason: "400 Bad Request: invalid vector profile".into(),
            });
        }
        let field = |name: &str, key: bool, dimensions: Option<usize>| DescribedField {
            name: name.to_string(),
            key,
            dimensions,
        };
        let mut fields = vec![
            field(KEY_FIELD, true, None),
            field(CONTENT_FIELD, false, None),
            field(SOURCE_FIELD, false, None),
            field(SEQUENCE_FIELD, false, None),
        ];
        if !self.create_without_vector.load(Ordering::SeqCst) {
            fields.push(field(VECTOR_FIELD, false, Some(schema.dimensions())));
        }
        self.collections
            .lock()
            .unwrap()
            .entry(schema.name().to_string())
            .or_insert_with(|| Collection {
                description: IndexDescription {
                    name: schema.name().to_string(),
                    fields,
                },
                documents: BTreeMap::new(),
            });
        Ok(())
    }

    async fn delete_index(&self, name: &str) -> Result<()> {
        self.collections.lock().unwrap().remove(name);
        Ok(())
    }

    async fn count_documents(&self, index: &str, source_document_id: &str) -> Result<u64> {
        Ok(self
            .collections
            .lock()
            .unwrap()
            .get(index)
            .map_or(0, |collection| {
                collection
                    .documents
                    .values()
                    .filter(|doc| doc.source_document_id == source_document_id)
                    .count() as u64
            }))
    }

    async fn upsert(&self, index: &str, documents: &[EmbeddedChunk]) -> Result<()> {
        let call = self.upserts.fetch_add(1, Ordering::SeqCst) + 1;
        let stall = *self.stall_upserts.lock().unwrap();
        if let Some((after, delay)) = stall {
            if call > after {
                tokio::time::sleep(delay).await;
            }
        }
        let failing = *self.failing_upserts.lock().unwrap();
        if failing.is_some_and(|(after, failures)| call > after && call - after <= failures) {
            return Err(RetrievalError::IndexUpsert {
                index: index.to_string(),
                count: documents.len(),
                reason: "503 Service Unavailable".into(),
                transient: true,
            });
        }
        let mut collections = self.collections.lock().unwrap();
        let collection = collections.get_mut(index).ok_or_else(|| RetrievalError::IndexUpsert {
            index: index.to_string(),
            count: documents.len(),
            reason: "404 index not found".into(),
            transient: false,
        })?;
        for document in documents {
            collection
                .documents
                .insert(document.document_key.clone(), document.clone());
        }
        Ok(())
    }

    async fn fetch_documents(&self, index: &str, source_document_id: &str) -> Result<Vec<EmbeddedChunk>> {
        let mut records: Vec<EmbeddedChunk> = self
            .records(index)
            .into_iter()
            .filter(|record| record.source_document_id == source_document_id)
            .collect();
        records.sort_by_key(|record| record.sequence_index);
        Ok(records)
    }

    async fn delete_documents(&self, index: &str, keys: &[String]) -> Result<()> {
        if let Some(collection) = self.collections.lock().unwrap().get_mut(index) {
            for key in keys {
                collection.documents.remove(key);
            }
        }
        Ok(())
    }

    async fn search(&self, index: &str, request: &SearchRequest) -> Result<Vec<SearchHit>> {
        self.searches.fetch_add(1, Ordering::SeqCst);
        let stall = *self.stall_searches.lock().unwrap();
        if let Some(delay) = stall {
            tokio::time::sleep(delay).await;
        }
        if self.fail_searches.load(Ordering::SeqCst) {
            return Err(RetrievalError::backend("search", "503 Service Unavailable", true));
        }
        if let Some(hits) = self.scripted_hits.lock().unwrap().clone() {
            return Ok(hits);
        }
        let collections = self.collections.lock().unwrap();
        let Some(collection) = collections.get(index) else {
            return Err(RetrievalError::backend("search", "404 index not found", false));
        };
        let mut hits: Vec<SearchHit> = collection
            .documents
            .values()
            .map(|doc| SearchHit {
                key: doc.document_key.clone(),
                text: doc.text.clone(),
                source_document_id: doc.source_document_id.clone(),
                sequence_index: doc.sequence_index,
                search_score: cosine(&request.vector, &doc.embedding),
                reranker_score: None,
            })
            .collect();
        hits.sort_by(|a, b| b.search_score.total_cmp(&a.search_score));
        hits.truncate(request.top_k);
        Ok(hits)
    }
}
