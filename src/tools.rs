//! Assistant tool calls: parsing and dispatch to the document tools.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::document::DocumentSource;
use crate::query::SearchResult;
use crate::retriever::{QueryAnswer, Retriever};

/// Tools the assistant session advertises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolName {
    /// Full text of the financial statements PDF.
    FetchPdfDocument,
    /// Vector search over the earnings release.
    HandleAmazonQueryTool,
}

impl ToolName {
    /// Every supported tool, in advertisement order.
    pub const ALL: [ToolName; 2] = [ToolName::FetchPdfDocument, ToolName::HandleAmazonQueryTool];

    /// Wire name used by the assistant.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FetchPdfDocument => "fetch_pdf_document",
            Self::HandleAmazonQueryTool => "handle_amazon_query_tool",
        }
    }

    /// Looks a tool up by wire name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|tool| tool.as_str() == name)
    }

    /// Function definition sent in the session configuration.
    pub fn definition(&self) -> ToolDefinition {
        let (description, parameters) = match self {
            Self::FetchPdfDocument => (
                "Returns the full text of the consolidated financial statements document.",
                json!({ "type": "object", "properties": {}, "required": [] }),
            ),
            Self::HandleAmazonQueryTool => (
                "Answers questions about the quarterly earnings release by searching its indexed passages.",
                json!({
                    "type": "object",
                    "properties": {
                        "search_query": {
                            "type": "string",
                            "description": "The user's question, phrased as a search query."
                        }
                    },
                    "required": ["search_query"]
                }),
            ),
        };
        ToolDefinition {
            kind: "function".to_string(),
            name: self.as_str().to_string(),
            description: description.to_string(),
            parameters,
        }
    }
}

/// Function tool as described to the assistant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Always `function`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Wire name.
    pub name: String,
    /// What the tool does, for the model.
    pub description: String,
    /// JSON schema of the arguments.
    pub parameters: Value,
}

/// A parsed tool invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolCall {
    /// `fetch_pdf_document`
    FetchPdfDocument,
    /// `handle_amazon_query_tool`
    HandleAmazonQuery {
        /// Query text to search for.
        search_query: String,
    },
}

/// Why a raw tool call could not be parsed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ToolCallError {
    /// The assistant named a tool this server does not provide.
    #[error("unsupported tool `{0}`")]
    Unknown(String),
    /// The arguments did not match the tool's schema.
    #[error("invalid arguments for `{tool}`: {reason}")]
    InvalidArguments {
        /// Tool wire name.
        tool: &'static str,
        /// Parse failure.
        reason: String,
    },
}

#[derive(Deserialize)]
struct QueryArguments {
    search_query: String,
}

impl ToolCall {
    /// Parses `name` and its arguments. Arguments may be a JSON object or a
    /// string holding one, as the realtime API sends them.
    pub fn parse(name: &str, arguments: &Value) -> Result<Self, ToolCallError> {
        let tool = ToolName::from_name(name).ok_or_else(|| ToolCallError::Unknown(name.to_string()))?;
        let invalid = |reason: String| ToolCallError::InvalidArguments {
            tool: tool.as_str(),
            reason,
        };
        let arguments = match arguments {
            Value::String(raw) if raw.trim().is_empty() => json!({}),
            Value::String(raw) => serde_json::from_str(raw).map_err(|err| invalid(err.to_string()))?,
            Value::Null => json!({}),
            other => other.clone(),
        };
        match tool {
            ToolName::FetchPdfDocument => Ok(Self::FetchPdfDocument),
            ToolName::HandleAmazonQueryTool => {
                let QueryArguments { search_query } =
                    serde_json::from_value(arguments).map_err(|err| invalid(err.to_string()))?;
                if search_query.trim().is_empty() {
                    return Err(invalid("search_query must not be empty".into()));
                }
                Ok(Self::HandleAmazonQuery { search_query })
            }
        }
    }
}

/// Result of a tool call, serialised back to the client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ToolOutcome {
    /// Document text.
    Document {
        /// Extracted text.
        text: String,
    },
    /// Ranked passages answering the query.
    Answer {
        /// Passages rendered for the assistant.
        summary_text: String,
        /// The passages themselves.
        results: Vec<SearchResult>,
    },
    /// The search ran but nothing matched.
    NoResults {
        /// Message the assistant can relay.
        message: String,
    },
    /// The tool is not provided by this server.
    Unsupported {
        /// Requested tool name.
        name: String,
    },
    /// The tool failed; `message` is safe to show the user.
    Failed {
        /// Fallback message.
        message: String,
    },
}

const NO_RESULTS_MESSAGE: &str = "No passages in the earnings release matched that question.";
const QUERY_FAILED_MESSAGE: &str =
    "The earnings search is unavailable right now. Please try again later.";
const DOCUMENT_FAILED_MESSAGE: &str = "The financial statements document could not be read.";

/// Routes tool calls to the statements document and the retriever.
#[derive(Clone)]
pub struct ToolRouter {
    statements: DocumentSource,
    retriever: Retriever,
}

impl ToolRouter {
    /// Builds a router over the statements document and earnings retriever.
    pub fn new(statements: DocumentSource, retriever: Retriever) -> Self {
        Self {
            statements,
            retriever,
        }
    }

    /// The statements document served by `fetch_pdf_document`.
    pub fn statements(&self) -> &DocumentSource {
        &self.statements
    }

    /// The earnings retriever behind `handle_amazon_query_tool`.
    pub fn retriever(&self) -> &Retriever {
        &self.retriever
    }

    /// Parses and runs a raw call. Unknown tools yield [`ToolOutcome::Unsupported`].
    pub async fn dispatch_raw(&self, name: &str, arguments: &Value) -> ToolOutcome {
        match ToolCall::parse(name, arguments) {
            Ok(call) => self.dispatch(call).await,
            Err(ToolCallError::Unknown(name)) => {
                tracing::warn!(tool = %name, "unsupported tool call");
                ToolOutcome::Unsupported { name }
            }
            Err(err) => {
                tracing::warn!(error = %err, "rejected tool call");
                ToolOutcome::Failed {
                    message: err.to_string(),
                }
            }
        }
    }

    /// Runs a parsed call; failures become [`ToolOutcome::Failed`].
    pub async fn dispatch(&self, call: ToolCall) -> ToolOutcome {
        match call {
            ToolCall::FetchPdfDocument => match self.statements.text().await {
                Ok(text) => ToolOutcome::Document {
                    text: text.to_string(),
                },
                Err(err) => {
                    tracing::error!(error = %err, "fetch_pdf_document failed");
                    ToolOutcome::Failed {
                        message: DOCUMENT_FAILED_MESSAGE.to_string(),
                    }
                }
            },
            ToolCall::HandleAmazonQuery { search_query } => {
                match self.retriever.answer_query(&search_query).await {
                    Ok(QueryAnswer::Found {
                        summary_text,
                        results,
                    }) => ToolOutcome::Answer {
                        summary_text,
                        results,
                    },
                    Ok(QueryAnswer::NoResults) => ToolOutcome::NoResults {
                        message: NO_RESULTS_MESSAGE.to_string(),
                    },
                    Err(err) => {
                        tracing::error!(query = %search_query, error = %err, "earnings query failed");
                        ToolOutcome::Failed {
                            message: QUERY_FAILED_MESSAGE.to_string(),
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::ChunkingConfig;
    use crate::embedder::EmbeddingClient;
    use crate::index::{IndexSchema, LoaderSettings};
    use crate::query::{QuerySettings, RankingMode};
    use crate::retry::RetryPolicy;
    use crate::testing::{HashEmbedder, MemoryIndex, DIMS};
    use pretty_assertions::assert_eq;
    use std::io::Write;
    use std::sync::Arc;
    use std::time::Duration;

    fn retriever() -> Retriever {
        let backend = Arc::new(MemoryIndex::new());
        Retriever::new(
            IndexSchema::new("earnings", DIMS).unwrap(),
            backend.clone(),
            backend,
            EmbeddingClient::new(Arc::new(HashEmbedder::new(DIMS)), DIMS, RetryPolicy::none()),
            LoaderSettings {
                chunking: ChunkingConfig::new(36, 0).unwrap(),
                upsert_batch_size: 10,
                retry: RetryPolicy::none(),
                timeout: Duration::from_secs(5),
            },
            QuerySettings {
                ranking: RankingMode::Vector,
                retry: RetryPolicy::none(),
                ..QuerySettings::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn names_round_trip() {
        for tool in ToolName::ALL {
            assert_eq!(ToolName::from_name(tool.as_str()), Some(tool));
        }
        assert_eq!(ToolName::from_name("get_weather"), None);
    }

    #[test]
    fn parses_string_and_object_arguments() {
        let expected = ToolCall::HandleAmazonQuery {
            search_query: "net income".into(),
        };
        assert_eq!(
            ToolCall::parse("handle_amazon_query_tool", &json!({"search_query": "net income"})),
            Ok(expected.clone())
        );
        assert_eq!(
            ToolCall::parse("handle_amazon_query_tool", &json!("{\"search_query\":\"net income\"}")),
            Ok(expected)
        );
        assert_eq!(
            ToolCall::parse("fetch_pdf_document", &Value::Null),
            Ok(ToolCall::FetchPdfDocument)
        );
    }

    #[test]
    fn rejects_bad_calls() {
        assert_eq!(
            ToolCall::parse("get_weather", &json!({})),
            Err(ToolCallError::Unknown("get_weather".into()))
        );
        assert!(matches!(
            ToolCall::parse("handle_amazon_query_tool", &json!({})),
            Err(ToolCallError::InvalidArguments { .. })
        ));
        assert!(matches!(
            ToolCall::parse("handle_amazon_query_tool", &json!({"search_query": "  "})),
            Err(ToolCallError::InvalidArguments { .. })
        ));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn unknown_tool_is_unsupported() {
        let router = ToolRouter::new(DocumentSource::new("missing.pdf", None), retriever());
        assert_eq!(
            router.dispatch_raw("get_weather", &json!({})).await,
            ToolOutcome::Unsupported {
                name: "get_weather".into()
            }
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn fetches_statements_text() {
        let mut file = tempfile::Builder::new().suffix(".txt").tempfile().unwrap();
        write!(file, "Total net sales 95,359").unwrap();
        let router = ToolRouter::new(DocumentSource::new(file.path(), None), retriever());
        assert_eq!(
            router.dispatch(ToolCall::FetchPdfDocument).await,
            ToolOutcome::Document {
                text: "Total net sales 95,359".into()
            }
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn missing_statements_is_graceful_failure() {
        let router = ToolRouter::new(DocumentSource::new("/nonexistent/statements.pdf", None), retriever());
        assert!(matches!(
            router.dispatch(ToolCall::FetchPdfDocument).await,
            ToolOutcome::Failed { .. }
        ));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn query_before_index_ready_is_graceful_failure() {
        let router = ToolRouter::new(DocumentSource::new("missing.pdf", None), retriever());
        let outcome = router
            .dispatch_raw("handle_amazon_query_tool", &json!({"search_query": "net income"}))
            .await;
        assert_eq!(
            outcome,
            ToolOutcome::Failed {
                message: QUERY_FAILED_MESSAGE.into()
            }
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn query_answers_from_loaded_index() {
        let retriever = retriever();
        retriever
            .ensure_index_and_load(
                "Revenue grew 12% to $143.3 billion. Net income was $10.4 billion.",
                "earnings.pdf",
            )
            .await
            .unwrap();
        let router = ToolRouter::new(DocumentSource::new("missing.pdf", None), retriever);
        match router
            .dispatch(ToolCall::HandleAmazonQuery {
                search_query: "What was net income?".into(),
            })
            .await
        {
            ToolOutcome::Answer { results, summary_text } => {
                assert!(results[0].text.contains("Net income"));
                assert!(summary_text.starts_with("[1] "));
            }
            other => panic!("expected answer, got {other:?}"),
        }
    }
}
