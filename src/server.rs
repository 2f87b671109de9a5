//! Local HTTP API for browser clients.
//!
//! Exposes the bridge operations as JSON endpoints so the browser layer can
//! fetch workspace files, rank apply destinations, and apply changes without
//! speaking the companion's socket protocol itself.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `GET`  | `/status` | Connection, cache, and apply state |
//! | `GET`  | `/files` | Workspace file list |
//! | `POST` | `/files/contents` | Contents of one file (cached) |
//! | `POST` | `/files/populate` | Fetch listed files into the cache |
//! | `POST` | `/predict` | Rank apply destinations for a snippet |
//! | `POST` | `/apply` | Apply a snippet to a destination |
//! | `POST` | `/project/changed` | Clear the cache, reconnect if needed |
//! | `PUT`  | `/settings/port` | Persist a new companion port and reconnect |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_connected", "message": "not connected: ..." } }
//! ```
//!
//! | Code | Status |
//! |------|--------|
//! | `bad_request`, `no_snippet`, `no_candidates` | 400 |
//! | `timeout` | 408 |
//! | `busy` | 409 |
//! | `prediction_failed`, `apply_failed` | 500 |
//! | `protocol_error`, `server_error` | 502 |
//! | `not_connected` | 503 |
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted so extension and page
//! scripts can call the API directly.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};

use crate::apply::ApplyOutcome;
use crate::bridge::{Bridge, BridgeStatus, PopulateReport};
use crate::config::Config;
use crate::connection::ConnectionState;
use crate::error::{BridgeError, PredictionError};
use crate::predictor::{CorpusEntry, SimilarityResult};

/// Starts the HTTP server and the bridge behind it.
///
/// Binds to `[server].bind`, connects to the companion, and serves until
/// Ctrl-C, then closes the companion connection.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let bridge = Bridge::new(config.clone())?;
    let state = bridge.start().await;
    tracing::info!(connection = ?state, "companion connection started");

    let app = router(bridge.clone());

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!("bridge API listening on http://{}", bind_addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    bridge.shutdown();
    Ok(())
}

/// Build the API router over an existing bridge.
pub fn router(bridge: Bridge) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/status", get(handle_status))
        .route("/files", get(handle_files))
        .route("/files/contents", post(handle_file_contents))
        .route("/files/populate", post(handle_populate))
        .route("/predict", post(handle_predict))
        .route("/apply", post(handle_apply))
        .route("/project/changed", post(handle_project_changed))
        .route("/settings/port", put(handle_set_port))
        .layer(cors)
        .with_state(bridge)
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

impl From<BridgeError> for AppError {
    fn from(err: BridgeError) -> Self {
        let status = match &err {
            BridgeError::Connection(_) => StatusCode::SERVICE_UNAVAILABLE,
            BridgeError::Timeout { .. } => StatusCode::REQUEST_TIMEOUT,
            BridgeError::Protocol(_) | BridgeError::Server(_) => StatusCode::BAD_GATEWAY,
            BridgeError::Prediction(PredictionError::NoSnippet)
            | BridgeError::Prediction(PredictionError::NoCandidates) => StatusCode::BAD_REQUEST,
            BridgeError::Prediction(PredictionError::Failed(_)) | BridgeError::Apply { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            BridgeError::Busy(_) => StatusCode::CONFLICT,
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
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ GET /status ============

async fn handle_status(State(bridge): State<Bridge>) -> Json<BridgeStatus> {
    Json(bridge.status())
}

// ============ GET /files ============

#[derive(Serialize)]
struct FilesResponse {
    files: Vec<String>,
}

async fn handle_files(State(bridge): State<Bridge>) -> Result<Json<FilesResponse>, AppError> {
    let files = bridge.list_files().await?;
    Ok(Json(FilesResponse { files }))
}

// ============ POST /files/contents ============

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileContentsRequest {
    file_path: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FileContentsResponse {
    file_path: String,
    content: String,
}

async fn handle_file_contents(
    State(bridge): State<Bridge>,
    Json(req): Json<FileContentsRequest>,
) -> Result<Json<FileContentsResponse>, AppError> {
    let file_path = req.file_path.trim().to_string();
    if file_path.is_empty() {
        return Err(bad_request("filePath must not be empty"));
    }
    let content = bridge.get_file_contents(&file_path).await?;
    Ok(Json(FileContentsResponse { file_path, content }))
}

// ============ POST /files/populate ============

#[derive(Deserialize, Default)]
struct PopulateRequest {
    #[serde(default)]
    files: Option<Vec<String>>,
}

async fn handle_populate(
    State(bridge): State<Bridge>,
    body: Option<Json<PopulateRequest>>,
) -> Json<PopulateReport> {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    Json(bridge.populate_cache(req.files).await)
}

// ============ POST /predict ============

#[derive(Deserialize)]
struct PredictRequest {
    code: String,
    #[serde(default)]
    files: Option<Vec<CorpusEntry>>,
}

async fn handle_predict(
    State(bridge): State<Bridge>,
    Json(req): Json<PredictRequest>,
) -> Result<Json<Vec<SimilarityResult>>, AppError> {
    let results = bridge.predict_apply_destination(&req.code, req.files.as_deref())?;
    Ok(Json(results))
}

// ============ POST /apply ============

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApplyRequest {
    file_name: String,
    code: String,
}

async fn handle_apply(
    State(bridge): State<Bridge>,
    Json(req): Json<ApplyRequest>,
) -> Result<Json<ApplyOutcome>, AppError> {
    if req.file_name.trim().is_empty() {
        return Err(bad_request("fileName must not be empty"));
    }
    let outcome = bridge.apply_diff(&req.file_name, &req.code).await?;
    Ok(Json(outcome))
}

// ============ POST /project/changed ============

#[derive(Serialize)]
struct ProjectChangedResponse {
    cleared: usize,
    connection: ConnectionState,
}

async fn handle_project_changed(State(bridge): State<Bridge>) -> Json<ProjectChangedResponse> {
    let cleared = bridge.project_changed().await;
    Json(ProjectChangedResponse {
        cleared,
        connection: bridge.connection().state(),
    })
}

// ============ PUT /settings/port ============

#[derive(Deserialize)]
struct PortRequest {
    port: u16,
}

#[derive(Serialize)]
struct PortResponse {
    port: u16,
    connection: ConnectionState,
}

async fn handle_set_port(
    State(bridge): State<Bridge>,
    Json(req): Json<PortRequest>,
) -> Result<Json<PortResponse>, AppError> {
    if req.port == 0 {
        return Err(bad_request("port must be > 0"));
    }
    let connection = bridge.set_port(req.port).await.map_err(|e| AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: format!("{:#}", e),
    })?;
    Ok(Json(PortResponse {
        port: req.port,
        connection,
    }))
}
