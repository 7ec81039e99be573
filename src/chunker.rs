//! Fixed-stride character windows over extracted document text.

use serde::{Deserialize, Serialize};

use crate::error::{Result, RetrievalError};

/// Chunking tuning knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingConfig {
    /// Maximum characters per chunk.
    pub chunk_size: usize,
    /// Characters shared by consecutive chunks. Must be below `chunk_size`.
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            overlap: 100,
        }
    }
}

impl ChunkingConfig {
    /// Builds a validated config.
    pub fn new(chunk_size: usize, overlap: usize) -> Result<Self> {
        let config = Self {
            chunk_size,
            overlap,
        };
        config.validate()?;
        Ok(config)
    }

    /// Rejects a zero chunk size or an overlap that would stall the window.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(RetrievalError::Config("chunk_size must be positive".into()));
        }
        if self.overlap >= self.chunk_size {
            return Err(RetrievalError::Config(format!(
                "overlap {} must be smaller than chunk_size {}",
                self.overlap, self.chunk_size
            )));
        }
        Ok(())
    }

    /// Distance between the starts of consecutive chunks.
    pub fn stride(&self) -> usize {
        self.chunk_size - self.overlap
    }
}

/// Contiguous slice of document text; the unit of embedding and retrieval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// 0-based position within the document.
    pub sequence_index: usize,
    /// Chunk body.
    pub text: String,
    /// Stable identifier of the originating document.
    pub source_document_id: String,
}

/// Splits `text` into windows of `chunk_size` characters advancing by
/// `chunk_size - overlap`.
///
/// Empty or whitespace-only input yields no chunks. The final window stops at
/// the end of the text, so dropping the first `overlap` characters of every
/// chunk after the first and concatenating reproduces `text` exactly.
pub fn chunk_document(
    text: &str,
    document_id: &str,
    config: &ChunkingConfig,
) -> Result<Vec<Chunk>> {
    config.validate()?;
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }

    // Byte offset of every char boundary, plus the end of the string.
    let boundaries: Vec<usize> = text
        .char_indices()
        .map(|(offset, _)| offset)
        .chain(std::iter::once(text.len()))
        .collect();
    let char_len = boundaries.len() - 1;

    let mut chunks = Vec::with_capacity(char_len / config.stride() + 1);
    let mut start = 0usize;
    loop {
        let end = (start + config.chunk_size).min(char_len);
        chunks.push(Chunk {
            sequence_index: chunks.len(),
            text: text[boundaries[start]..boundaries[end]].to_string(),
            source_document_id: document_id.to_string(),
        });
        if end == char_len {
            break;
        }
        start += config.stride();
    }
    Ok(chunks)
}
