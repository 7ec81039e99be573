//! Logical index schema and the checks run against a live index definition.

use clap::ValueEnum;

use crate::error::{Result, RetrievalError};

/// Key field name (unique document key).
pub const KEY_FIELD: &str = "id";
/// Searchable chunk text field.
pub const CONTENT_FIELD: &str = "content";
/// Vector field holding chunk embeddings.
pub const VECTOR_FIELD: &str = "embedding";
/// Filterable originating document id.
pub const SOURCE_FIELD: &str = "sourcefile";
/// Sortable chunk sequence index.
pub const SEQUENCE_FIELD: &str = "sequence";

/// Similarity metric used by the vector field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum VectorMetric {
    /// Cosine similarity.
    #[default]
    Cosine,
    /// Dot product (for normalised embeddings).
    #[value(name = "dot-product")]
    DotProduct,
}

impl VectorMetric {
    /// Wire name understood by the index backend.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cosine => "cosine",
            Self::DotProduct => "dotProduct",
        }
    }
}

/// Schema for a chunk index: key, content, vector, source and sequence fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSchema {
    name: String,
    dimensions: usize,
    metric: VectorMetric,
    semantic_configuration: Option<String>,
}

impl IndexSchema {
    /// Builds a schema, validating the index name and vector dimensions.
    pub fn new(name: impl Into<String>, dimensions: usize) -> Result<Self> {
        let name = name.into();
        validate_index_name(&name)?;
        if dimensions == 0 {
            return Err(RetrievalError::Config(
                "vector dimensions must be positive".into(),
            ));
        }
        Ok(Self {
            name,
            dimensions,
            metric: VectorMetric::default(),
            semantic_configuration: None,
        })
    }

    /// Overrides the similarity metric.
    pub fn with_metric(mut self, metric: VectorMetric) -> Self {
        self.metric = metric;
        self
    }

    /// Adds a semantic ranking configuration prioritising the content field.
    pub fn with_semantic_configuration(mut self, name: impl Into<String>) -> Self {
        self.semantic_configuration = Some(name.into());
        self
    }

    /// Index name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Vector dimension L.
    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Vector similarity metric.
    pub fn metric(&self) -> VectorMetric {
        self.metric
    }

    /// Semantic configuration name, when semantic ranking is enabled.
    pub fn semantic_configuration(&self) -> Option<&str> {
        self.semantic_configuration.as_deref()
    }

    /// Vector search profile referenced by the vector field.
    pub fn vector_profile(&self) -> String {
        format!("{}-vector-profile", self.name)
    }

    /// HNSW algorithm configuration referenced by the profile.
    pub fn hnsw_config(&self) -> String {
        format!("{}-hnsw", self.name)
    }

    /// Verifies a live index definition carries every field this schema needs.
    pub fn check(&self, description: &IndexDescription) -> Result<(), String> {
        match description.field(KEY_FIELD) {
            Some(field) if field.key => {}
            Some(_) => return Err(format!("field `{KEY_FIELD}` is not the index key")),
            None => return Err(format!("missing key field `{KEY_FIELD}`")),
        }
        for name in [CONTENT_FIELD, SOURCE_FIELD, SEQUENCE_FIELD] {
            if description.field(name).is_none() {
                return Err(format!("missing field `{name}`"));
            }
        }
        match description.field(VECTOR_FIELD).and_then(|f| f.dimensions) {
            Some(dims) if dims == self.dimensions => Ok(()),
            Some(dims) => Err(format!(
                "vector field `{VECTOR_FIELD}` has {dims} dimensions, expected {}",
                self.dimensions
            )),
            None => Err(format!("missing vector field `{VECTOR_FIELD}`")),
        }
    }
}

/// Field summary of a live index, as reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IndexDescription {
    /// Index name.
    pub name: String,
    /// Declared fields.
    pub fields: Vec<DescribedField>,
}

impl IndexDescription {
    /// Looks up a field by name.
    pub fn field(&self, name: &str) -> Option<&DescribedField> {
        self.fields.iter().find(|field| field.name == name)
    }
}

/// One field of a live index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescribedField {
    /// Field name.
    pub name: String,
    /// Whether this is the document key.
    pub key: bool,
    /// Vector dimensions for vector fields.
    pub dimensions: Option<usize>,
}

/// Index names: lowercase letters, digits and single dashes, 2-128 chars,
/// starting and ending with a letter or digit.
fn validate_index_name(name: &str) -> Result<()> {
    let invalid = |why: &str| RetrievalError::Config(format!("invalid index name `{name}`: {why}"));
    if name.len() < 2 || name.len() > 128 {
        return Err(invalid("length must be between 2 and 128"));
    }
    if !name
        .chars()
        .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '-')
    {
        return Err(invalid("only lowercase letters, digits and dashes are allowed"));
    }
    if name.starts_with('-') || name.ends_with('-') || name.contains("--") {
        return Err(invalid("dashes must separate letters or digits"));
    }
    Ok(())
}
