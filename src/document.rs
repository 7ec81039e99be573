//! Source documents: PDF text extraction or plain UTF-8 files.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::OnceCell;

/// Failures while reading a source document.
#[derive(Debug, Error)]
pub enum DocumentError {
    /// The file does not exist.
    #[error("document `{}` not found", path.display())]
    NotFound {
        /// Requested path.
        path: PathBuf,
    },
    /// The file exists but could not be read.
    #[error("failed to read `{}`: {source}", path.display())]
    Io {
        /// Requested path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
    /// Text could not be extracted from the file contents.
    #[error("failed to extract text from `{}`: {reason}", path.display())]
    Extraction {
        /// Requested path.
        path: PathBuf,
        /// Extractor or decoder message.
        reason: String,
    },
}

/// A document on disk plus the id its chunks are stored under.
///
/// Extracted text is cached after the first successful read; clones share it.
#[derive(Debug, Clone)]
pub struct DocumentSource {
    path: PathBuf,
    document_id: String,
    text: Arc<OnceCell<String>>,
}

impl DocumentSource {
    /// Uses the file name as the document id unless `document_id` is given.
    pub fn new(path: impl Into<PathBuf>, document_id: Option<String>) -> Self {
        let path = path.into();
        let document_id = document_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| {
                path.file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_else(|| path.display().to_string())
            });
        Self {
            path,
            document_id,
            text: Arc::new(OnceCell::new()),
        }
    }

    /// Path the text is read from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Id used for chunk keys and the `sourcefile` field.
    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    /// Full document text. PDF extraction runs on the blocking pool.
    pub async fn text(&self) -> Result<&str, DocumentError> {
        let text = self
            .text
            .get_or_try_init(|| {
                let path = self.path.clone();
                async move {
                    let extracted = tokio::task::spawn_blocking({
                        let path = path.clone();
                        move || read_text(&path)
                    })
                    .await
                    .map_err(|err| DocumentError::Extraction {
                        path,
                        reason: format!("extraction task failed: {err}"),
                    })??;
                    Ok::<_, DocumentError>(extracted)
                }
            })
            .await?;
        Ok(text.as_str())
    }
}

fn is_pdf(path: &Path) -> bool {
    path.extension()
        .is_some_and(|extension| extension.eq_ignore_ascii_case("pdf"))
}

fn read_text(path: &Path) -> Result<String, DocumentError> {
    let bytes = std::fs::read(path).map_err(|source| match source.kind() {
        io::ErrorKind::NotFound => DocumentError::NotFound {
            path: path.to_path_buf(),
        },
        _ => DocumentError::Io {
            path: path.to_path_buf(),
            source,
        },
    })?;
    let text = if is_pdf(path) {
        pdf_extract::extract_text_from_mem(&bytes).map_err(|err| DocumentError::Extraction {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?
    } else {
        String::from_utf8(bytes).map_err(|err| DocumentError::Extraction {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?
    };
    tracing::info!(path = %path.display(), chars = text.chars().count(), "document text extracted");
    if text.trim().is_empty() {
        tracing::warn!(path = %path.display(), "document contains no extractable text");
    }
    Ok(text)
}
