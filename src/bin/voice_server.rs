use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use docvoice::config::{
    build_retriever, DocumentArgs, EmbeddingArgs, RelayArgs, RetrievalArgs, SearchArgs,
};
use docvoice::{
    logging, DocumentError, DocumentSource, IndexState, RelayError, RetrievalError, Retriever,
    SearchResult, SessionConfiguration, SessionCredentials, SessionRelay, ToolOutcome, ToolRouter,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

#[derive(Parser, Debug)]
#[command(
    name = "voice_server",
    about = "HTTP back end for the voice assistant: session relay and document tools"
)]
struct ServerCli {
    /// Address to bind the HTTP server to (host:port).
    #[arg(long, env = "BIND_ADDR", default_value = "127.0.0.1:8080")]
    bind: String,

    /// Financial statements document returned whole by fetch_pdf_document.
    #[arg(
        long,
        env = "STATEMENTS_PDF_PATH",
        default_value = "FY25_Q2_Consolidated_Financial_Statements.pdf"
    )]
    statements_document: PathBuf,

    /// JSON file overriding the built-in session configuration.
    #[arg(long, env = "SESSION_CONFIG_PATH")]
    session_config: Option<PathBuf>,

    /// Max query requests per minute allowed (0 disables rate limiting).
    #[arg(long, env = "MAX_REQUESTS_PER_MINUTE", default_value_t = 120)]
    max_requests_per_minute: u32,

    /// Rate-limit burst size (tokens available instantly).
    #[arg(long, env = "RATE_LIMIT_BURST", default_value_t = 12)]
    rate_limit_burst: u32,

    /// Maximum top-k a client may request.
    #[arg(long, env = "MAX_TOP_K", default_value_t = 10)]
    max_top_k: usize,

    #[command(flatten)]
    document: DocumentArgs,

    #[command(flatten)]
    relay: RelayArgs,

    #[command(flatten)]
    embedding: EmbeddingArgs,

    #[command(flatten)]
    search: SearchArgs,

    #[command(flatten)]
    retrieval: RetrievalArgs,
}

#[derive(Clone)]
struct AppState {
    relay: SessionRelay,
    tools: ToolRouter,
    session: Arc<SessionConfiguration>,
    rate_limiter: Option<RateLimiter>,
    max_top_k: usize,
}

#[derive(Debug, Deserialize)]
struct SdpRequest {
    ephemeral_key: String,
    offer_sdp: String,
}

#[derive(Debug, Serialize)]
struct SdpResponse {
    answer_sdp: String,
}

#[derive(Debug, Serialize)]
struct PdfResponse {
    pdf_text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QueryRequest {
    search_query: String,
    #[serde(default)]
    top_k: Option<usize>,
}

#[derive(Debug, Serialize)]
struct QueryResponse {
    results: Vec<SearchResult>,
}

#[derive(Debug, Deserialize)]
struct ToolCallRequest {
    name: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Debug, Serialize)]
struct HealthBody {
    status: &'static str,
    index: String,
    documents: BTreeMap<String, usize>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

type ApiError = (StatusCode, Json<ErrorBody>);

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();
    let cli = ServerCli::parse();

    let session = match &cli.session_config {
        Some(path) => SessionConfiguration::from_file(path)
            .with_context(|| format!("failed to load session configuration {}", path.display()))?,
        None => SessionConfiguration::default(),
    };
    let relay = SessionRelay::new(cli.relay.settings()).context("invalid realtime relay settings")?;
    let retriever = build_retriever(&cli.embedding, &cli.search, &cli.retrieval)
        .context("invalid retrieval settings")?;

    tokio::spawn(initialise_index(retriever.clone(), cli.document.source()));

    let state = AppState {
        relay,
        tools: ToolRouter::new(DocumentSource::new(&cli.statements_document, None), retriever),
        session: Arc::new(session),
        rate_limiter: RateLimiter::new(cli.max_requests_per_minute, cli.rate_limit_burst),
        max_top_k: cli.max_top_k.max(1),
    };
    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/get-session-configuration", get(session_configuration))
        .route("/start-session", post(start_session))
        .route("/webrtc-sdp", post(webrtc_sdp))
        .route("/get-pdf-content", post(pdf_content))
        .route("/handle-amazon-query", post(amazon_query))
        .route("/tool-call", post(tool_call))
        .with_state(state);

    let addr: SocketAddr = cli
        .bind
        .parse()
        .with_context(|| format!("invalid bind address {}", cli.bind))?;
    tracing::info!(%addr, "voice_server listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app)
        .await
        .context("server shutdown")?;
    Ok(())
}

/// Loads the earnings document in the background. Queries answer 503 until
/// the index is ready.
async fn initialise_index(retriever: Retriever, earnings: DocumentSource) {
    let started = Instant::now();
    let text = match earnings.text().await {
        Ok(text) => text,
        Err(err) => {
            tracing::error!(error = %err, "earnings document unavailable");
            retriever.mark_failed(err.to_string()).await;
            return;
        }
    };
    match retriever
        .ensure_index_and_load(text, earnings.document_id())
        .await
    {
        Ok(outcome) => tracing::info!(
            index = retriever.index_name(),
            loaded = outcome.loaded,
            chunk_count = outcome.chunk_count,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "earnings index initialised"
        ),
        Err(err) => tracing::error!(
            index = retriever.index_name(),
            error = %err,
            "earnings index initialisation failed; queries will be rejected"
        ),
    }
}

async fn healthz(State(state): State<AppState>) -> Json<HealthBody> {
    let handle = state.tools.retriever().handle();
    Json(HealthBody {
        status: "ok",
        index: handle.snapshot().await.to_string(),
        documents: handle.documents().await,
    })
}

async fn session_configuration(State(state): State<AppState>) -> Json<SessionConfiguration> {
    Json(state.session.as_ref().clone())
}

async fn start_session(State(state): State<AppState>) -> Result<Json<SessionCredentials>, ApiError> {
    state
        .relay
        .start_session()
        .await
        .map(Json)
        .map_err(relay_error)
}

async fn webrtc_sdp(
    State(state): State<AppState>,
    payload: Result<Json<SdpRequest>, JsonRejection>,
) -> Result<Json<SdpResponse>, ApiError> {
    let Json(request) = payload.map_err(json_rejection)?;
    let answer_sdp = state
        .relay
        .exchange_sdp(&request.ephemeral_key, &request.offer_sdp)
        .await
        .map_err(relay_error)?;
    Ok(Json(SdpResponse { answer_sdp }))
}

async fn pdf_content(State(state): State<AppState>) -> Result<Json<PdfResponse>, ApiError> {
    match state.tools.statements().text().await {
        Ok(text) if text.trim().is_empty() => Ok(Json(PdfResponse {
            pdf_text: String::new(),
            message: Some("No text could be extracted from the PDF.".into()),
        })),
        Ok(text) => Ok(Json(PdfResponse {
            pdf_text: text.to_string(),
            message: None,
        })),
        Err(err @ DocumentError::NotFound { .. }) => {
            tracing::error!(error = %err, "statements document missing");
            Err(error_body(StatusCode::NOT_FOUND, "PDF file not found.", None))
        }
        Err(err) => {
            tracing::error!(error = %err, "statements document unreadable");
            Err(error_body(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Could not process PDF.",
                Some(err.to_string()),
            ))
        }
    }
}

async fn amazon_query(
    State(state): State<AppState>,
    payload: Result<Json<QueryRequest>, JsonRejection>,
) -> Result<Json<QueryResponse>, ApiError> {
    let Json(request) = payload.map_err(json_rejection)?;
    if request.search_query.trim().is_empty() {
        return Err(error_body(
            StatusCode::BAD_REQUEST,
            "'search_query' parameter is required and must be a non-empty string",
            None,
        ));
    }
    check_rate_limit(&state).await?;
    let retriever = state.tools.retriever();
    if let index_state @ (IndexState::Unready | IndexState::Failed { .. }) = retriever.state().await {
        return Err(error_body(
            StatusCode::SERVICE_UNAVAILABLE,
            "Earnings search index not available.",
            Some(index_state.to_string()),
        ));
    }
    let top_k = request
        .top_k
        .unwrap_or(retriever.default_top_k())
        .clamp(1, state.max_top_k);
    let results = retriever
        .query(&request.search_query, top_k)
        .await
        .map_err(query_error)?;
    tracing::info!(query = %request.search_query, results = results.len(), "earnings query answered");
    Ok(Json(QueryResponse { results }))
}

async fn tool_call(
    State(state): State<AppState>,
    payload: Result<Json<ToolCallRequest>, JsonRejection>,
) -> Result<Json<ToolOutcome>, ApiError> {
    let Json(request) = payload.map_err(json_rejection)?;
    check_rate_limit(&state).await?;
    tracing::info!(tool = %request.name, "tool call");
    Ok(Json(
        state
            .tools
            .dispatch_raw(&request.name, &request.arguments)
            .await,
    ))
}

async fn check_rate_limit(state: &AppState) -> Result<(), ApiError> {
    if let Some(limiter) = &state.rate_limiter {
        if !limiter.acquire().await {
            return Err(error_body(
                StatusCode::TOO_MANY_REQUESTS,
                "rate limit exceeded",
                None,
            ));
        }
    }
    Ok(())
}

fn error_body(status: StatusCode, error: impl Into<String>, details: Option<String>) -> ApiError {
    (
        status,
        Json(ErrorBody {
            error: error.into(),
            details,
        }),
    )
}

fn json_rejection(rejection: JsonRejection) -> ApiError {
    tracing::warn!(error = %rejection.body_text(), "rejected request body");
    error_body(
        StatusCode::BAD_REQUEST,
        "Request body must be JSON with the required fields.",
        Some(rejection.body_text()),
    )
}

fn relay_status(err: &RelayError) -> StatusCode {
    match err {
        RelayError::Config(_) => StatusCode::BAD_REQUEST,
        RelayError::Transport { .. } | RelayError::Upstream { .. } | RelayError::Malformed { .. } => {
            StatusCode::BAD_GATEWAY
        }
    }
}

fn relay_error(err: RelayError) -> ApiError {
    tracing::error!(error = %err, "realtime relay request failed");
    error_body(relay_status(&err), "Realtime service request failed.", Some(err.to_string()))
}

fn query_status(err: &RetrievalError) -> StatusCode {
    match err {
        RetrievalError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        RetrievalError::Config(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::BAD_GATEWAY,
    }
}

fn query_error(err: RetrievalError) -> ApiError {
    tracing::error!(error = %err, "earnings query failed");
    error_body(query_status(&err), "Failed to handle earnings query.", Some(err.to_string()))
}

#[derive(Clone)]
struct RateLimiter {
    state: Arc<Mutex<RateState>>,
    capacity: f64,
    refill_per_sec: f64,
}

struct RateState {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    fn new(max_per_minute: u32, burst: u32) -> Option<Self> {
        if max_per_minute == 0 || burst == 0 {
            return None;
        }
        let capacity = burst as f64;
        Some(Self {
            state: Arc::new(Mutex::new(RateState {
                tokens: capacity,
                last_refill: Instant::now(),
            })),
            capacity,
            refill_per_sec: max_per_minute as f64 / 60.0,
        })
    }

    async fn acquire(&self) -> bool {
        let mut guard = self.state.lock().await;
        let now = Instant::now();
        let elapsed = now.duration_since(guard.last_refill).as_secs_f64();
        guard.last_refill = now;
        guard.tokens = (guard.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        if guard.tokens >= 1.0 {
            guard.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}
