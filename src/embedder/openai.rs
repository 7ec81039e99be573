//! OpenAI and Azure OpenAI embedding backends.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::EmbeddingBackend;
use crate::error::{Result, RetrievalError};
use crate::retry::{is_retryable_status, is_retryable_transport};

/// Where embedding requests are sent and how they are authenticated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmbeddingEndpoint {
    /// OpenAI-compatible API (`{base_url}/embeddings`, bearer auth).
    OpenAi {
        /// API root, e.g. `https://api.openai.com/v1`.
        base_url: String,
        /// Model identifier sent in the request body.
        model: String,
    },
    /// Azure OpenAI deployment (`api-key` auth, deployment in the path).
    Azure {
        /// Resource endpoint, e.g. `https://my-resource.openai.azure.com`.
        endpoint: String,
        /// Embedding deployment name.
        deployment: String,
        /// REST API version query parameter.
        api_version: String,
    },
}

impl EmbeddingEndpoint {
    /// Full URL embedding batches are posted to.
    pub fn url(&self) -> String {
        match self {
            Self::OpenAi { base_url, .. } => {
                format!("{}/embeddings", base_url.trim_end_matches('/'))
            }
            Self::Azure {
                endpoint,
                deployment,
                api_version,
            } => format!(
                "{}/openai/deployments/{}/embeddings?api-version={}",
                endpoint.trim_end_matches('/'),
                deployment,
                api_version
            ),
        }
    }

    fn model(&self) -> &str {
        match self {
            Self::OpenAi { model, .. } => model,
            Self::Azure { deployment, .. } => deployment,
        }
    }

    fn auth_headers(&self, api_key: &str) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        let invalid = |_| RetrievalError::Config("invalid embedding API key".into());
        match self {
            Self::OpenAi { .. } => {
                let value = HeaderValue::from_str(&format!("Bearer {api_key}")).map_err(invalid)?;
                headers.insert(AUTHORIZATION, value);
            }
            Self::Azure { .. } => {
                headers.insert("api-key", HeaderValue::from_str(api_key).map_err(invalid)?);
            }
        }
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }
}

/// Single-attempt embeddings client; retries live in [`super::EmbeddingClient`].
#[derive(Clone)]
pub struct OpenAiEmbedder {
    client: Client,
    url: String,
    endpoint: EmbeddingEndpoint,
    dimensions: Option<usize>,
}

impl OpenAiEmbedder {
    /// Builds a new embeddings client.
    pub fn new(
        api_key: &str,
        endpoint: EmbeddingEndpoint,
        dimensions: Option<usize>,
        timeout: Duration,
    ) -> Result<Self> {
        let api_key = api_key.trim();
        if api_key.is_empty() {
            return Err(RetrievalError::Config("missing embedding API key".into()));
        }
        if endpoint.model().trim().is_empty() {
            return Err(RetrievalError::Config(
                "missing embedding model or deployment name".into(),
            ));
        }
        let client = Client::builder()
            .timeout(timeout)
            .default_headers(endpoint.auth_headers(api_key)?)
            .build()
            .map_err(|err| RetrievalError::Config(format!("failed to build HTTP client: {err}")))?;
        Ok(Self {
            client,
            url: endpoint.url(),
            endpoint,
            dimensions,
        })
    }

    fn request<'a>(&'a self, inputs: &'a [&'a str]) -> EmbeddingRequest<'a> {
        let model = match &self.endpoint {
            EmbeddingEndpoint::OpenAi { model, .. } => Some(model.as_str()),
            EmbeddingEndpoint::Azure { .. } => None,
        };
        EmbeddingRequest {
            model,
            input: inputs,
            dimensions: self.dimensions,
        }
    }
}

#[async_trait]
impl EmbeddingBackend for OpenAiEmbedder {
    async fn embed_batch(&self, inputs: &[&str]) -> Result<Vec<Vec<f32>>> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }
        let response = self
            .client
            .post(&self.url)
            .json(&self.request(inputs))
            .send()
            .await
            .map_err(|err| {
                RetrievalError::embedding(
                    format!("request to {} failed: {err}", self.url),
                    is_retryable_transport(&err),
                )
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(RetrievalError::embedding(
                format!("embeddings request failed ({status}): {body}"),
                is_retryable_status(status),
            ));
        }

        let parsed: EmbeddingResponse = response.json().await.map_err(|err| {
            RetrievalError::embedding(format!("failed to parse embedding response: {err}"), false)
        })?;
        parsed.into_vectors(inputs.len())
    }

    fn model_name(&self) -> &str {
        self.endpoint.model()
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
    #[serde(borrow)]
    input: &'a [&'a str],
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

impl EmbeddingResponse {
    fn into_vectors(mut self, expected: usize) -> Result<Vec<Vec<f32>>> {
        if self.data.len() != expected {
            return Err(RetrievalError::embedding(
                format!(
                    "upstream returned {} embeddings for {} inputs",
                    self.data.len(),
                    expected
                ),
                false,
            ));
        }
        self.data.sort_by_key(|entry| entry.index);
        Ok(self.data.into_iter().map(|entry| entry.embedding).collect())
    }
}
