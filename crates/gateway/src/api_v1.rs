//! HTTP API v1: thread continuation over JSON.
//!
//! Endpoints:
//!
//! - `POST /v1/threads`                  — Start (no id) or resume (with id) a conversation
//! - `POST /v1/threads/{id}/reconstruct` — Read-only bounded reconstruction
//! - `POST /v1/threads/{id}/responses`   — Record the model's answer
//! - `GET  /v1/threads/{id}`             — Raw thread record
//! - `GET  /v1/threads/{id}/chain`       — Parent chain, oldest first
//! - `GET  /v1/status`                   — Store and uptime summary

use axum::{
    Router,
    extract::rejection::JsonRejection,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

use threadgate_config::AppConfig;
use threadgate_core::error::{Error, ThreadError};
use threadgate_core::thread::{AttachedFile, ContinuationId, Thread, TtlClass, Turn};
use threadgate_engine::{
    ContinuationEngine, ReconstructionRequest, ResumeBundle, TurnOutcome, TurnRequest,
    render_history,
};

// ── State ─────────────────────────────────────────────────────────────────

/// Shared state for the v1 API.
pub struct ApiV1State {
    pub engine: Arc<ContinuationEngine>,
    pub config: AppConfig,
    pub start_time: DateTime<Utc>,
}

pub type SharedApiState = Arc<ApiV1State>;

// ── Router ────────────────────────────────────────────────────────────────

/// Build the v1 API router. Nest this under "/v1" in the main router.
pub fn v1_router(state: SharedApiState) -> Router {
    Router::new()
        .route("/threads", post(turn_handler))
        .route("/threads/{id}", get(get_thread_handler))
        .route("/threads/{id}/reconstruct", post(reconstruct_handler))
        .route("/threads/{id}/responses", post(record_response_handler))
        .route("/threads/{id}/chain", get(chain_handler))
        .route("/status", get(status_handler))
        .with_state(state)
}

// ── Request / Response types ──────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
struct ReconstructBody {
    #[serde(default)]
    token_ceiling: Option<usize>,
    #[serde(default)]
    include_parents: bool,
}

#[derive(Debug, Deserialize)]
struct ResponseBody {
    tool_name: String,
    text: String,
    #[serde(default)]
    files: Vec<PathBuf>,
    /// Stored verbatim.
    #[serde(default)]
    provider_metadata: Option<serde_json::Value>,
}

/// A bundle plus its rendered history block.
#[derive(Debug, Serialize, Deserialize)]
pub struct ResumeResponse {
    #[serde(flatten)]
    pub bundle: ResumeBundle,
    pub history: String,
}

impl From<ResumeBundle> for ResumeResponse {
    fn from(bundle: ResumeBundle) -> Self {
        let history = render_history(&bundle);
        Self { bundle, history }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChainEntry {
    pub continuation_id: ContinuationId,
    pub parent_id: Option<ContinuationId>,
    pub tool_name: String,
    pub turns: usize,
    pub ttl_class: TtlClass,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

impl From<&Thread> for ChainEntry {
    fn from(thread: &Thread) -> Self {
        Self {
            continuation_id: thread.continuation_id.clone(),
            parent_id: thread.parent_id.clone(),
            tool_name: thread.tool_name.clone(),
            turns: thread.turn_count(),
            ttl_class: thread.ttl_class,
            created_at: thread.created_at,
            last_activity_at: thread.last_activity_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
    pub backend: String,
    pub live_threads: usize,
    pub max_turns: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub retryable: bool,
}

// ── Errors ────────────────────────────────────────────────────────────────

/// A failed request, rendered as `{error, retryable}`.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    PayloadTooLarge(String),
    Engine(Error),
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError::Engine(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            ApiError::PayloadTooLarge(rejection.body_text())
        } else {
            ApiError::BadRequest(rejection.body_text())
        }
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::Engine(Error::Thread(ThreadError::NotFound { .. })) => StatusCode::NOT_FOUND,
            ApiError::Engine(Error::Thread(ThreadError::TurnLimitReached { .. })) => {
                StatusCode::CONFLICT
            }
            ApiError::Engine(e) if e.is_retryable() => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Engine(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let (message, retryable) = match &self {
            ApiError::BadRequest(message) | ApiError::PayloadTooLarge(message) => {
                (message.clone(), false)
            }
            ApiError::Engine(e) => (e.to_string(), e.is_retryable()),
        };
        if status.is_server_error() {
            error!(status = status.as_u16(), error = %message, "Request failed");
        }
        (
            status,
            Json(ErrorResponse {
                error: message,
                retryable,
            }),
        )
            .into_response()
    }
}

fn check_absolute(files: &[PathBuf]) -> Result<(), ApiError> {
    match files.iter().find(|p| !p.is_absolute()) {
        Some(path) => Err(ApiError::BadRequest(format!(
            "file paths must be absolute: {}",
            path.display()
        ))),
        None => Ok(()),
    }
}

// ── Handlers ──────────────────────────────────────────────────────────────

async fn turn_handler(
    State(state): State<SharedApiState>,
    payload: Result<Json<TurnRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = payload?;
    if request.tool_name.trim().is_empty() {
        return Err(ApiError::BadRequest("tool_name must not be empty".into()));
    }
    check_absolute(&request.files)?;

    info!(
        tool = %request.tool_name,
        resume = request.continuation_id.is_some(),
        files = request.files.len(),
        "v1/threads request"
    );

    match state.engine.handle(request).await? {
        TurnOutcome::Started(outcome) => Ok((StatusCode::CREATED, Json(outcome)).into_response()),
        TurnOutcome::Resumed(bundle) => Ok(Json(ResumeResponse::from(bundle)).into_response()),
    }
}

async fn reconstruct_handler(
    State(state): State<SharedApiState>,
    Path(id): Path<String>,
    payload: Result<Json<ReconstructBody>, JsonRejection>,
) -> Result<Json<ResumeResponse>, ApiError> {
    let Json(body) = payload?;
    let request = ReconstructionRequest {
        continuation_id: ContinuationId::from(id.as_str()),
        token_ceiling: body.token_ceiling,
        include_parents: body.include_parents,
    };
    let bundle = state.engine.reconstruct(&request).await?;
    Ok(Json(bundle.into()))
}

async fn record_response_handler(
    State(state): State<SharedApiState>,
    Path(id): Path<String>,
    payload: Result<Json<ResponseBody>, JsonRejection>,
) -> Result<(StatusCode, Json<Turn>), ApiError> {
    let Json(body) = payload?;
    check_absolute(&body.files)?;

    let mut turn = Turn::assistant(body.tool_name, body.text)
        .with_files(body.files.into_iter().map(AttachedFile::new).collect());
    if let Some(metadata) = body.provider_metadata {
        turn = turn.with_provider_metadata(metadata);
    }

    let stored = state
        .engine
        .record_response(&ContinuationId::from(id.as_str()), turn)
        .await?;
    Ok((StatusCode::CREATED, Json(stored)))
}

async fn get_thread_handler(
    State(state): State<SharedApiState>,
    Path(id): Path<String>,
) -> Result<Json<Thread>, ApiError> {
    let thread = state.engine.store().read(&ContinuationId::from(id.as_str())).await?;
    Ok(Json(thread))
}

async fn chain_handler(
    State(state): State<SharedApiState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<ChainEntry>>, ApiError> {
    let chain = state.engine.chain(&ContinuationId::from(id.as_str())).await?;
    Ok(Json(chain.iter().map(ChainEntry::from).collect()))
}

async fn status_handler(State(state): State<SharedApiState>) -> Result<Json<StatusResponse>, ApiError> {
    let store = state.engine.store();
    let live_threads = store.count().await?;
    let uptime = Utc::now()
        .signed_duration_since(state.start_time)
        .num_seconds()
        .max(0) as u64;

    Ok(Json(StatusResponse {
        status: "healthy".into(),
        version: env!("CARGO_PKG_VERSION").into(),
        uptime_secs: uptime,
        backend: store.backend_name().to_string(),
        live_threads,
        max_turns: store.max_turns(),
    }))
}
