//! HTTP surface for triggering runs and querying the index.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Version plus the current ingestion run state |
//! | `POST` | `/ingest` | Run one ingestion and return its summary |
//! | `POST` | `/search` | Semantic search over indexed tasks |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "ingestion_already_running", "message": "..." } }
//! ```
//!
//! Error codes: `bad_request` (400), `ingestion_already_running` (409),
//! `timeout` (504), `internal` (500), plus any [`SyncError`] code for
//! failed searches.
//!
//! The ingestion lock is shared with every other caller in the process, so
//! a second `POST /ingest` while a run is active answers 409 immediately.
//! Runs execute on their own task and finish even if the client hangs up.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use task_harness_core::store::SearchHit;
use task_harness_core::SyncError;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;
use crate::enrichment::{create_gateway, EnrichmentGateway};
use crate::ingest::{build_coordinator, IngestionCoordinator, IngestionSummary};
use crate::lock::{IngestionLock, IngestionRun};
use crate::progress::NoProgress;
use crate::search::{search_tasks, SearchOptions};
use crate::vector_index::{SqliteVectorIndex, VectorIndexAdapter};
use crate::db;

const DEFAULT_LIMIT: usize = 10;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    coordinator: Arc<IngestionCoordinator>,
    gateway: Arc<dyn EnrichmentGateway>,
    index: VectorIndexAdapter,
    call_timeout: Duration,
    shutdown: CancellationToken,
}

impl AppState {
    pub fn new(
        coordinator: Arc<IngestionCoordinator>,
        gateway: Arc<dyn EnrichmentGateway>,
        index: VectorIndexAdapter,
        call_timeout: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            coordinator,
            gateway,
            index,
            call_timeout,
            shutdown,
        }
    }

    fn from_config(config: &Config, pool: SqlitePool, shutdown: CancellationToken) -> anyhow::Result<Self> {
        let call_timeout = Duration::from_secs(config.ingest.call_timeout_secs);
        let coordinator = build_coordinator(config, pool.clone(), IngestionLock::new())?;
        let gateway: Arc<dyn EnrichmentGateway> = Arc::from(create_gateway(&config.enrichment)?);
        let index = VectorIndexAdapter::new(Arc::new(SqliteVectorIndex::new(pool)), call_timeout);
        Ok(Self::new(
            Arc::new(coordinator),
            gateway,
            index,
            call_timeout,
            shutdown,
        ))
    }
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/ingest", post(handle_ingest))
        .route("/search", post(handle_search))
        .layer(cors)
        .with_state(state)
}

/// Serve on `[server].bind` until Ctrl-C. Shutdown cancels any active run,
/// which drains its in-flight tasks before the process exits.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let pool = db::connect(config).await?;
    let shutdown = CancellationToken::new();
    let state = AppState::from_config(config, pool, shutdown.clone())?;
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    tracing::info!(bind = %config.server.bind, "server listening");
    println!("taskh server listening on http://{}", config.server.bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
            shutdown.cancel();
        })
        .await?;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn internal(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: message.into(),
    }
}

impl From<SyncError> for AppError {
    fn from(err: SyncError) -> Self {
        let status = match &err {
            SyncError::IngestionAlreadyRunning => StatusCode::CONFLICT,
            SyncError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            SyncError::EnrichmentUnavailable { .. } | SyncError::TransientSource(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            SyncError::EnrichmentRejected { .. } => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        AppError {
            status,
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    ingestion: IngestionRun,
}

async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        ingestion: state.coordinator.lock().snapshot(),
    })
}

// ============ POST /ingest ============

async fn handle_ingest(State(state): State<AppState>) -> Result<Json<IngestionSummary>, AppError> {
    // Fail fast without spawning when a run is already active.
    if state.coordinator.lock().is_held() {
        return Err(SyncError::IngestionAlreadyRunning.into());
    }

    let coordinator = state.coordinator.clone();
    let cancel = state.shutdown.child_token();
    let summary = tokio::spawn(async move { coordinator.run(&NoProgress, &cancel).await })
        .await
        .map_err(|e| internal(format!("ingestion task failed: {}", e)))??;
    Ok(Json(summary))
}

// ============ POST /search ============

#[derive(Debug, Deserialize)]
struct SearchRequest {
    query: String,
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    project_id: Option<String>,
    #[serde(default)]
    min_priority: Option<u8>,
    #[serde(default)]
    include_completed: bool,
}

#[derive(Serialize)]
struct SearchResponse {
    results: Vec<SearchHit>,
}

async fn handle_search(
    State(state): State<AppState>,
    Json(req): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, AppError> {
    if req.query.trim().is_empty() {
        return Err(bad_request("query must not be empty"));
    }
    let options = SearchOptions {
        limit: req.limit.unwrap_or(DEFAULT_LIMIT),
        project_id: req.project_id,
        min_priority: req.min_priority,
        include_completed: req.include_completed,
    };
    let results = search_tasks(
        state.gateway.as_ref(),
        &state.index,
        state.call_timeout,
        &req.query,
        options.limit,
        &options.filters(),
    )
    .await?;
    Ok(Json(SearchResponse { results }))
}
