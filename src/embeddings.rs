//! Embedded chunk records handed from the loader to the vector index.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::chunker::Chunk;

/// Chunk plus its vector, keyed for idempotent upserts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddedChunk {
    /// Index primary key derived from the document id and sequence index.
    pub document_key: String,
    /// 0-based chunk position within the document.
    pub sequence_index: usize,
    /// Chunk body text submitted to the embedding model.
    pub text: String,
    /// Stable identifier of the originating document.
    pub source_document_id: String,
    /// Model embedding vector.
    pub embedding: Vec<f32>,
}

impl EmbeddedChunk {
    /// Attaches an embedding to a chunk and derives its key.
    pub fn new(chunk: Chunk, embedding: Vec<f32>) -> Self {
        let document_key = document_key(&chunk.source_document_id, chunk.sequence_index);
        Self {
            document_key,
            sequence_index: chunk.sequence_index,
            text: chunk.text,
            source_document_id: chunk.source_document_id,
            embedding,
        }
    }
}

/// Deterministic index key for chunk `sequence_index` of `document_id`.
///
/// Only `[0-9a-f-]` characters are produced, which every key field accepts.
pub fn document_key(document_id: &str, sequence_index: usize) -> String {
    let digest = Sha256::digest(document_id.as_bytes());
    let prefix = hex::encode(&digest[..8]);
    format!("{prefix}-{sequence_index:06}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn keys_are_stable_across_calls() {
        assert_eq!(
            document_key("AMZN-Q1-2025-Earnings-Release.pdf", 3),
            document_key("AMZN-Q1-2025-Earnings-Release.pdf", 3)
        );
    }

    #[test]
    fn keys_differ_per_chunk_and_document() {
        let mut seen = HashSet::new();
        for doc in ["a.pdf", "b.pdf", "a_pdf"] {
            for idx in 0..50 {
                assert!(seen.insert(document_key(doc, idx)));
            }
        }
    }

    #[test]
    fn keys_use_safe_alphabet() {
        let key = document_key("weird name/with spaces?.pdf", 12);
        assert!(key.ends_with("-000012"));
        assert!(key
            .chars()
            .all(|ch| ch.is_ascii_hexdigit() || ch == '-' || ch.is_ascii_digit()));
    }

    #[test]
    fn embedded_chunk_inherits_chunk_fields() {
        let chunk = Chunk {
            sequence_index: 2,
            text: "Net income was $10.4 billion".into(),
            source_document_id: "earnings".into(),
        };
        let record = EmbeddedChunk::new(chunk, vec![0.5, 0.5]);
        assert_eq!(record.document_key, document_key("earnings", 2));
        assert_eq!(record.sequence_index, 2);
        assert_eq!(record.embedding, vec![0.5, 0.5]);
    }
}
