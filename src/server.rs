//! HTTP server.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/webhooks/{codebase_id}` | Signed push delivery; 202 with a job id when a sync starts |
//! | `POST` | `/sync` | Start a sync: `{"codebase_id", "ref"?, "full"?}` → 202 `{"job_id"}` |
//! | `GET`  | `/jobs/{id}` | Poll a job: `{phase, progress, message, errors, result?}` |
//! | `GET`  | `/codebases/{id}/status` | Last synced commit, file count, running job |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "sync_in_progress", "message": "a sync is already running for codebase 'acme-api'" } }
//! ```
//!
//! Error codes: `bad_request` / `validation` (400), `unauthorized` (401),
//! `not_found` (404), `sync_in_progress` (409), everything else 500.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};

use codesync_core::error::SyncError;

use crate::app::{AppContext, CodebaseStatus};
use crate::jobs::{spawn_janitor, JobStatus};
use crate::orchestrator::SyncRequest;
use crate::webhook::{WebhookError, WebhookOutcome, EVENT_HEADER, SIGNATURE_HEADER};

/// Build the router over a shared context.
pub fn router(ctx: Arc<AppContext>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/webhooks/{codebase_id}", post(handle_webhook))
        .route("/sync", post(handle_sync))
        .route("/jobs/{id}", get(handle_job))
        .route("/codebases/{id}/status", get(handle_status))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(ctx)
}

/// Serve until the process is terminated. Also runs the job janitor.
pub async fn run_server(ctx: AppContext) -> anyhow::Result<()> {
    let bind_addr = ctx.config.server.bind.clone();
    let janitor_every = Duration::from_secs(ctx.config.sync.janitor_interval_secs.max(1));
    let _janitor = spawn_janitor(ctx.jobs.clone(), janitor_every);

    let app = router(Arc::new(ctx));
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(bind = %bind_addr, "codesync server listening");
    axum::serve(listener, app).await?;
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

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

fn internal(err: anyhow::Error) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: format!("{:#}", err),
    }
}

impl From<SyncError> for AppError {
    fn from(err: SyncError) -> Self {
        let status = match &err {
            SyncError::Validation(_) => StatusCode::BAD_REQUEST,
            SyncError::AlreadyRunning(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        AppError {
            status,
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

impl From<WebhookError> for AppError {
    fn from(err: WebhookError) -> Self {
        match err {
            WebhookError::Unauthorized => AppError {
                status: StatusCode::UNAUTHORIZED,
                code: "unauthorized".to_string(),
                message: err.to_string(),
            },
            WebhookError::BadRequest(_) => AppError {
                status: StatusCode::BAD_REQUEST,
                code: "bad_request".to_string(),
                message: err.to_string(),
            },
            WebhookError::UnknownCodebase(_) => not_found(err.to_string()),
            WebhookError::Sync(e) => e.into(),
        }
    }
}

// ============ POST /webhooks/{codebase_id} ============

async fn handle_webhook(
    State(ctx): State<Arc<AppContext>>,
    Path(codebase_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<WebhookOutcome>), AppError> {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
    let outcome = ctx
        .webhooks
        .handle(
            &codebase_id,
            header(EVENT_HEADER),
            header(SIGNATURE_HEADER),
            &body,
        )
        .await?;
    let status = match outcome {
        WebhookOutcome::Accepted { .. } => StatusCode::ACCEPTED,
        WebhookOutcome::Ignored { .. } => StatusCode::OK,
    };
    Ok((status, Json(outcome)))
}

// ============ POST /sync ============

#[derive(Deserialize)]
struct SyncBody {
    codebase_id: String,
    #[serde(default, rename = "ref")]
    git_ref: Option<String>,
    #[serde(default)]
    full: bool,
}

#[derive(Serialize)]
struct SyncStarted {
    job_id: String,
}

async fn handle_sync(
    State(ctx): State<Arc<AppContext>>,
    Json(body): Json<SyncBody>,
) -> Result<(StatusCode, Json<SyncStarted>), AppError> {
    let entry = ctx
        .catalog
        .get(&body.codebase_id)
        .ok_or_else(|| not_found(format!("unknown codebase '{}'", body.codebase_id)))?;
    let job_id = ctx.orchestrator.start(
        SyncRequest::for_entry(&entry)
            .at_ref(body.git_ref)
            .full(body.full),
    )?;
    Ok((StatusCode::ACCEPTED, Json(SyncStarted { job_id })))
}

// ============ GET /jobs/{id} ============

async fn handle_job(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
) -> Result<Json<JobStatus>, AppError> {
    match ctx.jobs.get(&id).map_err(internal)? {
        Some(job) => Ok(Json(job.status())),
        None => Err(not_found(format!("job '{}' not found or expired", id))),
    }
}

// ============ GET /codebases/{id}/status ============

async fn handle_status(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
) -> Result<Json<CodebaseStatus>, AppError> {
    if ctx.catalog.get(&id).is_none() {
        return Err(not_found(format!("unknown codebase '{}'", id)));
    }
    Ok(Json(ctx.codebase_status(&id).await.map_err(internal)?))
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}
