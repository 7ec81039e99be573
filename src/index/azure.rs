//! Azure AI Search REST backend.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Map, Value};

use super::schema::{
    DescribedField, IndexDescription, IndexSchema, CONTENT_FIELD, KEY_FIELD, SEQUENCE_FIELD,
    SOURCE_FIELD, VECTOR_FIELD,
};
use super::{SearchHit, SearchRequest, VectorIndexBackend};
use crate::embeddings::EmbeddedChunk;
use crate::error::{Result, RetrievalError};
use crate::retry::{is_retryable_status, is_retryable_transport};

/// REST API version with GA vector and semantic search.
pub const DEFAULT_API_VERSION: &str = "2024-07-01";

/// Largest `top` the search endpoint accepts.
const FETCH_PAGE_SIZE: usize = 1000;

/// Client for one Azure AI Search service, authenticated with one key.
#[derive(Clone)]
pub struct AzureSearchClient {
    client: Client,
    endpoint: String,
    api_version: String,
}

impl AzureSearchClient {
    /// Builds a client for `endpoint` (e.g. `https://name.search.windows.net`).
    pub fn new(endpoint: &str, api_key: &str, api_version: &str, timeout: Duration) -> Result<Self> {
        if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
            return Err(RetrievalError::Config(format!(
                "search endpoint `{endpoint}` must be an http(s) URL"
            )));
        }
        if api_key.trim().is_empty() {
            return Err(RetrievalError::Config("missing search API key".into()));
        }
        let mut headers = HeaderMap::new();
        headers.insert(
            "api-key",
            HeaderValue::from_str(api_key.trim())
                .map_err(|_| RetrievalError::Config("invalid search API key".into()))?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(|err| RetrievalError::Config(format!("failed to build HTTP client: {err}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_version: api_version.to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}?api-version={}", self.endpoint, path, self.api_version)
    }

    async fn send(&self, operation: &'static str, request: RequestBuilder) -> Result<Response> {
        request.send().await.map_err(|err| {
            RetrievalError::backend(operation, err.to_string(), is_retryable_transport(&err))
        })
    }

    async fn index_batch(&self, index: &str, actions: Vec<Value>) -> Result<(), (String, bool)> {
        let request = self
            .client
            .post(self.url(&format!("indexes/{index}/docs/index")))
            .json(&json!({ "value": actions }));
        let response = request
            .send()
            .await
            .map_err(|err| (err.to_string(), is_retryable_transport(&err)))?;
        let status = response.status();
        if status != StatusCode::OK && status != StatusCode::MULTI_STATUS {
            let body = error_body(response).await;
            return Err((format!("{status}: {body}"), is_retryable_status(status)));
        }
        let parsed: BatchResponse = response
            .json()
            .await
            .map_err(|err| (format!("malformed batch response: {err}"), false))?;
        parsed.first_failure()
    }
}

#[async_trait]
impl VectorIndexBackend for AzureSearchClient {
    async fn describe_index(&self, name: &str) -> Result<Option<IndexDescription>> {
        let response = self
            .send("describe index", self.client.get(self.url(&format!("indexes/{name}"))))
            .await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = error_body(response).await;
            return Err(RetrievalError::backend(
                "describe index",
                format!("{status}: {body}"),
                is_retryable_status(status),
            ));
        }
        let definition: IndexDefinition = response.json().await.map_err(|err| {
            RetrievalError::backend("describe index", format!("malformed definition: {err}"), false)
        })?;
        Ok(Some(definition.into_description()))
    }

    async fn create_index(&self, schema: &IndexSchema) -> Result<()> {
        let creation = |reason: String| RetrievalError::IndexCreation {
            index: schema.name().to_string(),
            reason,
        };
        let response = self
            .client
            .put(self.url(&format!("indexes/{}", schema.name())))
            .json(&index_definition(schema))
            .send()
            .await
            .map_err(|err| creation(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = error_body(response).await;
            return Err(creation(format!("{status}: {body}")));
        }
        Ok(())
    }

    async fn delete_index(&self, name: &str) -> Result<()> {
        let response = self
            .send("delete index", self.client.delete(self.url(&format!("indexes/{name}"))))
            .await?;
        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(());
        }
        let body = error_body(response).await;
        Err(RetrievalError::backend(
            "delete index",
            format!("{status}: {body}"),
            is_retryable_status(status),
        ))
    }

    async fn count_documents(&self, index: &str, source_document_id: &str) -> Result<u64> {
        let body = json!({
            "search": "*",
            "filter": source_filter(source_document_id),
            "count": true,
            "top": 0,
        });
        let response = self
            .send(
                "count documents",
                self.client
                    .post(self.url(&format!("indexes/{index}/docs/search")))
                    .json(&body),
            )
            .await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(0);
        }
        if !status.is_success() {
            let body = error_body(response).await;
            return Err(RetrievalError::backend(
                "count documents",
                format!("{status}: {body}"),
                is_retryable_status(status),
            ));
        }
        let parsed: CountResponse = response.json().await.map_err(|err| {
            RetrievalError::backend("count documents", format!("malformed response: {err}"), false)
        })?;
        Ok(parsed.count.unwrap_or(0))
    }

    async fn upsert(&self, index: &str, documents: &[EmbeddedChunk]) -> Result<()> {
        if documents.is_empty() {
            return Ok(());
        }
        let actions = documents.iter().map(upload_action).collect();
        self.index_batch(index, actions)
            .await
            .map_err(|(reason, transient)| RetrievalError::IndexUpsert {
                index: index.to_string(),
                count: documents.len(),
                reason,
                transient,
            })
    }

    async fn fetch_documents(&self, index: &str, source_document_id: &str) -> Result<Vec<EmbeddedChunk>> {
        let select = [KEY_FIELD, CONTENT_FIELD, SOURCE_FIELD, SEQUENCE_FIELD, VECTOR_FIELD].join(",");
        let mut records = Vec::new();
        loop {
            let body = json!({
                "search": "*",
                "filter": source_filter(source_document_id),
                "select": select,
                "orderby": format!("{SEQUENCE_FIELD} asc"),
                "top": FETCH_PAGE_SIZE,
                "skip": records.len(),
            });
            let response = self
                .send(
                    "fetch documents",
                    self.client
                        .post(self.url(&format!("indexes/{index}/docs/search")))
                        .json(&body),
                )
                .await?;
            let status = response.status();
            if status == StatusCode::NOT_FOUND {
                return Ok(records);
            }
            if !status.is_success() {
                let body = error_body(response).await;
                return Err(RetrievalError::backend(
                    "fetch documents",
                    format!("{status}: {body}"),
                    is_retryable_status(status),
                ));
            }
            let parsed: SearchResponse = response.json().await.map_err(|err| {
                RetrievalError::backend("fetch documents", format!("malformed response: {err}"), false)
            })?;
            let page = parsed.value.len();
            for raw in parsed.value {
                records.push(parse_record(raw)?);
            }
            if page < FETCH_PAGE_SIZE {
                return Ok(records);
            }
        }
    }

    async fn delete_documents(&self, index: &str, keys: &[String]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let actions = keys.iter().map(|key| delete_action(key)).collect();
        self.index_batch(index, actions)
            .await
            .map_err(|(reason, transient)| RetrievalError::backend("delete documents", reason, transient))
    }

    async fn search(&self, index: &str, request: &SearchRequest) -> Result<Vec<SearchHit>> {
        let response = self
            .send(
                "search",
                self.client
                    .post(self.url(&format!("indexes/{index}/docs/search")))
                    .json(&search_body(request)),
            )
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = error_body(response).await;
            return Err(RetrievalError::backend(
                "search",
                format!("{status}: {body}"),
                is_retryable_status(status),
            ));
        }
        let parsed: SearchResponse = response.json().await.map_err(|err| {
            RetrievalError::backend("search", format!("malformed response: {err}"), false)
        })?;
        parsed.value.into_iter().map(parse_hit).collect()
    }
}

async fn error_body(response: Response) -> String {
    response
        .text()
        .await
        .unwrap_or_else(|_| "<body unavailable>".to_string())
}

/// OData filter selecting every chunk of one document.
fn source_filter(source_document_id: &str) -> String {
    format!("{SOURCE_FIELD} eq '{}'", source_document_id.replace('\'', "''"))
}

fn index_definition(schema: &IndexSchema) -> Value {
    let mut definition = json!({
        "name": schema.name(),
        "fields": [
            {
                "name": KEY_FIELD,
                "type": "Edm.String",
                "key": true,
                "filterable": true,
                "sortable": true,
                "facetable": true
            },
            {
                "name": CONTENT_FIELD,
                "type": "Edm.String",
                "searchable": true,
                "filterable": false,
                "sortable": false,
                "facetable": false
            },
            {
                "name": VECTOR_FIELD,
                "type": "Collection(Edm.Single)",
                "searchable": true,
                "retrievable": true,
                "dimensions": schema.dimensions(),
                "vectorSearchProfile": schema.vector_profile()
            },
            {
                "name": SOURCE_FIELD,
                "type": "Edm.String",
                "filterable": true,
                "facetable": true
            },
            {
                "name": SEQUENCE_FIELD,
                "type": "Edm.Int32",
                "filterable": true,
                "sortable": true
            }
        ],
        "vectorSearch": {
            "algorithms": [{
                "name": schema.hnsw_config(),
                "kind": "hnsw",
                "hnswParameters": { "metric": schema.metric().as_str() }
            }],
            "profiles": [{
                "name": schema.vector_profile(),
                "algorithm": schema.hnsw_config()
            }]
        }
    });
    if let Some(configuration) = schema.semantic_configuration() {
        definition["semantic"] = json!({
            "configurations": [{
                "name": configuration,
                "prioritizedFields": {
                    "prioritizedContentFields": [{ "fieldName": CONTENT_FIELD }]
                }
            }]
        });
    }
    definition
}

fn upload_action(document: &EmbeddedChunk) -> Value {
    let mut action = Map::new();
    action.insert("@search.action".into(), Value::from("mergeOrUpload"));
    action.insert(KEY_FIELD.into(), Value::from(document.document_key.as_str()));
    action.insert(CONTENT_FIELD.into(), Value::from(document.text.as_str()));
    action.insert(VECTOR_FIELD.into(), Value::from(document.embedding.clone()));
    action.insert(
        SOURCE_FIELD.into(),
        Value::from(document.source_document_id.as_str()),
    );
    action.insert(
        SEQUENCE_FIELD.into(),
        Value::from(document.sequence_index as u64),
    );
    Value::Object(action)
}

fn delete_action(key: &str) -> Value {
    let mut action = Map::new();
    action.insert("@search.action".into(), Value::from("delete"));
    action.insert(KEY_FIELD.into(), Value::from(key));
    Value::Object(action)
}

fn search_body(request: &SearchRequest) -> Value {
    let select = [KEY_FIELD, CONTENT_FIELD, SOURCE_FIELD, SEQUENCE_FIELD].join(",");
    let mut body = json!({
        "vectorQueries": [{
            "kind": "vector",
            "vector": request.vector,
            "k": request.top_k,
            "fields": VECTOR_FIELD
        }],
        "select": select,
        "top": request.top_k,
    });
    if let Some(text) = &request.text {
        body["search"] = json!(text);
    }
    if let Some(configuration) = &request.semantic_configuration {
        body["queryType"] = json!("semantic");
        body["semanticConfiguration"] = json!(configuration);
    }
    body
}

fn parse_hit(mut raw: Map<String, Value>) -> Result<SearchHit> {
    let malformed =
        |what: &str| RetrievalError::backend("search", format!("hit missing `{what}`"), false);
    let mut take_string = |field: &str| match raw.remove(field) {
        Some(Value::String(value)) => Ok(value),
        _ => Err(malformed(field)),
    };
    let key = take_string(KEY_FIELD)?;
    let text = take_string(CONTENT_FIELD)?;
    let source_document_id = take_string(SOURCE_FIELD)?;
    let sequence_index = raw
        .get(SEQUENCE_FIELD)
        .and_then(Value::as_u64)
        .ok_or_else(|| malformed(SEQUENCE_FIELD))? as usize;
    let search_score = raw
        .get("@search.score")
        .and_then(Value::as_f64)
        .ok_or_else(|| malformed("@search.score"))?;
    let reranker_score = raw.get("@search.rerankerScore").and_then(Value::as_f64);
    Ok(SearchHit {
        key,
        text,
        source_document_id,
        sequence_index,
        search_score,
        reranker_score,
    })
}

/// A stored chunk read back with its vector. Indexes created with a
/// non-retrievable vector field fail here.
fn parse_record(mut raw: Map<String, Value>) -> Result<EmbeddedChunk> {
    let embedding = raw
        .remove(VECTOR_FIELD)
        .and_then(|value| match value {
            Value::Array(values) => values
                .iter()
                .map(|value| value.as_f64().map(|component| component as f32))
                .collect::<Option<Vec<f32>>>(),
            _ => None,
        })
        .filter(|embedding| !embedding.is_empty())
        .ok_or_else(|| {
            RetrievalError::backend(
                "fetch documents",
                format!("document missing `{VECTOR_FIELD}`"),
                false,
            )
        })?;
    let hit = parse_hit(raw)?;
    Ok(EmbeddedChunk {
        document_key: hit.key,
        sequence_index: hit.sequence_index,
        text: hit.text,
        source_document_id: hit.source_document_id,
        embedding,
    })
}

#[derive(Debug, Deserialize)]
struct IndexDefinition {
    name: String,
    #[serde(default)]
    fields: Vec<FieldDefinition>,
}

#[derive(Debug, Deserialize)]
struct FieldDefinition {
    name: String,
    #[serde(default)]
    key: Option<bool>,
    #[serde(default)]
    dimensions: Option<usize>,
}

impl IndexDefinition {
    fn into_description(self) -> IndexDescription {
        IndexDescription {
            name: self.name,
            fields: self
                .fields
                .into_iter()
                .map(|field| DescribedField {
                    name: field.name,
                    key: field.key.unwrap_or(false),
                    dimensions: field.dimensions,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CountResponse {
    #[serde(rename = "@odata.count")]
    count: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    value: Vec<Map<String, Value>>,
}

#[derive(Debug, Deserialize)]
struct BatchResponse {
    #[serde(default)]
    value: Vec<BatchItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BatchItem {
    key: String,
    status: bool,
    #[serde(default)]
    error_message: Option<String>,
    status_code: u16,
}

impl BatchResponse {
    fn first_failure(self) -> Result<(), (String, bool)> {
        let failed: Vec<BatchItem> = self.value.into_iter().filter(|item| !item.status).collect();
        let Some(first) = failed.first() else {
            return Ok(());
        };
        // 409/422 are version conflicts on concurrent writes and clear on retry.
        let transient = failed
            .iter()
            .all(|item| matches!(item.status_code, 409 | 422 | 429 | 500..=599));
        Err((
            format!(
                "{} item(s) rejected; first `{}` ({}): {}",
                failed.len(),
                first.key,
                first.status_code,
                first.error_message.as_deref().unwrap_or("no message")
            ),
            transient,
        ))
    }
}
