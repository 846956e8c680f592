//! HTTP API.
//!
//! Read access to Pages, Versions, and Diffs, the ranked review queue,
//! annotation entry, and reviewer checkout. Ingestion and the pipelines
//! run from the CLI (`wm ingest`, `wm diff`, `wm triage`, `wm watch`).
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `GET`  | `/stats` | Entity counts and queue depths |
//! | `GET`  | `/pages?url=...` | Look a Page up by url |
//! | `GET`  | `/pages/{uuid}` | One Page |
//! | `GET`  | `/pages/{uuid}/versions` | The Page's Versions, newest first |
//! | `GET`  | `/versions/{uuid}` | One Version |
//! | `GET`  | `/diffs/{uuid}?content=true` | One Diff, optionally with payload |
//! | `GET`  | `/diffs/{uuid}/annotations` | Annotations on a Diff |
//! | `POST` | `/diffs/{uuid}/annotations` | Add an annotation |
//! | `GET`  | `/queue?limit=N` | Prioritized Diffs, highest first |
//! | `POST` | `/review/checkout` | Check out the next (or a given) Diff |
//! | `POST` | `/review/checkin` | Release the caller's Diff |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_found", "message": "diff not found: ..." } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `queue_empty` (404),
//! `conflict` (409), `internal` (500).

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;
use web_monitoring_core::models::{Annotation, Diff, NewAnnotation, Page, StoreStats, Version};
use web_monitoring_core::store::Store;
use web_monitoring_core::Error;

use crate::config::Config;
use crate::db;
use crate::payload::PayloadStore;
use crate::review::ReviewQueue;
use crate::sqlite_store::SqliteStore;

#[derive(Clone)]
struct AppState {
    store: Arc<dyn Store>,
    payloads: PayloadStore,
    review: Arc<ReviewQueue>,
}

/// Build the API router over `store`.
pub fn router(store: Arc<dyn Store>, payloads: PayloadStore) -> Router {
    let state = AppState {
        review: Arc::new(ReviewQueue::new(Arc::clone(&store))),
        store,
        payloads,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/stats", get(handle_stats))
        .route("/pages", get(handle_page_by_url))
        .route("/pages/{id}", get(handle_page))
        .route("/pages/{id}/versions", get(handle_page_versions))
        .route("/versions/{id}", get(handle_version))
        .route("/diffs/{id}", get(handle_diff))
        .route(
            "/diffs/{id}/annotations",
            get(handle_list_annotations).post(handle_create_annotation),
        )
        .route("/queue", get(handle_queue))
        .route("/review/checkout", post(handle_checkout))
        .route("/review/checkin", post(handle_checkin))
        .layer(cors)
        .with_state(state)
}

/// Starts the HTTP server on `[server].bind`. Runs until the process is
/// terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let store = Arc::new(SqliteStore::new(db::connect(config).await?));
    let app = router(store, PayloadStore::new(&config.storage.payload_dir));

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    println!("listening on http://{}", listener.local_addr()?);
    tracing::info!(bind = %config.server.bind, "server started");

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
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
    }
}

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        let (status, code) = match &err {
            Error::NotFound { .. } => (StatusCode::NOT_FOUND, "not_found"),
            Error::QueueEmpty(_) => (StatusCode::NOT_FOUND, "queue_empty"),
            Error::DuplicateKey { .. } => (StatusCode::CONFLICT, "conflict"),
            Error::PageMismatch { .. } => (StatusCode::BAD_REQUEST, "bad_request"),
            _ => {
                tracing::error!(error = %err, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal")
            }
        };
        AppError {
            status,
            code,
            message: err.to_string(),
        }
    }
}

fn parse_id(raw: &str) -> Result<Uuid, AppError> {
    Uuid::parse_str(raw).map_err(|_| bad_request(format!("invalid uuid: {}", raw)))
}

// ============ Handlers ============

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

async fn handle_stats(State(state): State<AppState>) -> Result<Json<StoreStats>, AppError> {
    Ok(Json(state.store.stats().await?))
}

#[derive(Deserialize)]
struct UrlQuery {
    url: String,
}

async fn handle_page_by_url(
    State(state): State<AppState>,
    Query(query): Query<UrlQuery>,
) -> Result<Json<Page>, AppError> {
    match state.store.page_by_url(&query.url).await? {
        Some(page) => Ok(Json(page)),
        None => Err(Error::not_found("page", &query.url).into()),
    }
}

#[derive(Serialize)]
struct PageResponse {
    #[serde(flatten)]
    page: Page,
    version_count: usize,
    oldest: Option<Version>,
}

async fn handle_page(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<PageResponse>, AppError> {
    let page = state.store.get_page(parse_id(&id)?).await?;
    let version_count = state.store.page_versions(page.uuid).await?.len();
    let oldest = state.store.oldest(page.uuid).await?;
    Ok(Json(PageResponse {
        page,
        version_count,
        oldest,
    }))
}

async fn handle_page_versions(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<Version>>, AppError> {
    let page = state.store.get_page(parse_id(&id)?).await?;
    Ok(Json(state.store.history(page.uuid).await?))
}

async fn handle_version(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Version>, AppError> {
    Ok(Json(state.store.get_version(parse_id(&id)?).await?))
}

#[derive(Deserialize, Default)]
struct DiffQuery {
    #[serde(default)]
    content: bool,
}

async fn handle_diff(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<DiffQuery>,
) -> Result<Json<Diff>, AppError> {
    let diff = state.store.get_diff(parse_id(&id)?).await?;
    if query.content {
        return Ok(Json(state.payloads.load_content(diff).await?));
    }
    Ok(Json(diff))
}

async fn handle_list_annotations(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<Annotation>>, AppError> {
    let diff = state.store.get_diff(parse_id(&id)?).await?;
    Ok(Json(state.store.annotations_for_diff(diff.uuid).await?))
}

#[derive(Deserialize)]
struct AnnotationRequest {
    author: String,
    content: serde_json::Value,
}

async fn handle_create_annotation(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<AnnotationRequest>,
) -> Result<(StatusCode, Json<Annotation>), AppError> {
    if req.author.trim().is_empty() {
        return Err(bad_request("author must not be empty"));
    }
    let created = state
        .store
        .insert_annotation(&NewAnnotation {
            uuid: None,
            diff_uuid: parse_id(&id)?,
            author: req.author,
            content: req.content,
        })
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(state.store.get_annotation(created).await?),
    ))
}

#[derive(Deserialize)]
struct QueueQuery {
    #[serde(default = "default_queue_limit")]
    limit: usize,
}

fn default_queue_limit() -> usize {
    50
}

async fn handle_queue(
    State(state): State<AppState>,
    Query(query): Query<QueueQuery>,
) -> Result<Json<Vec<Diff>>, AppError> {
    Ok(Json(state.store.ranked_diffs(query.limit).await?))
}

#[derive(Deserialize)]
struct CheckoutRequest {
    user: String,
    #[serde(default)]
    diff: Option<Uuid>,
}

async fn handle_checkout(
    State(state): State<AppState>,
    Json(req): Json<CheckoutRequest>,
) -> Result<Json<Diff>, AppError> {
    if req.user.trim().is_empty() {
        return Err(bad_request("user must not be empty"));
    }
    let diff = match req.diff {
        Some(id) => state.review.checkout(&req.user, id).await?,
        None => state.review.checkout_next(&req.user).await?,
    };
    Ok(Json(diff))
}

#[derive(Deserialize)]
struct CheckinRequest {
    user: String,
}

#[derive(Serialize)]
struct CheckinResponse {
    released: Uuid,
}

async fn handle_checkin(
    State(state): State<AppState>,
    Json(req): Json<CheckinRequest>,
) -> Result<Json<CheckinResponse>, AppError> {
    let released = state.review.checkin(&req.user).await?;
    Ok(Json(CheckinResponse { released }))
}
