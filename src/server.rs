//! HTTP API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `GET`  | `/api/books` | Book catalogue |
//! | `GET`  | `/api/books/{bookId}/search?q=` | Full-text search in one book |
//! | `POST` | `/api/builds/trigger` | Start a build (`{bookId, triggeredBy?}`) |
//! | `GET`  | `/api/builds?bookId=&latest=` | Build records, newest first |
//! | `GET`  | `/api/builds/{id}` | One build record |
//! | `GET`  | `/api/builds/{id}/logs` | Persisted build ledger |
//! | `GET`  | `/api/builds/{id}/stream` | Live ledger as server-sent events |
//! | `POST` | `/api/webhook` | Push webhook |
//! | `GET`  | `/api/webhook` | Webhook liveness |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "bookId must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `unauthorized` (401), `not_found` (404),
//! `internal` (500).

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive},
        IntoResponse, Response, Sse,
    },
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::{Stream, StreamExt};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::book;
use crate::config::Config;
use crate::db;
use crate::events::StreamMessage;
use crate::indexer;
use crate::models::{Book, BuildRecord};
use crate::orchestrator::Orchestrator;
use crate::store::BuildStore;
use crate::webhook::{self, Decision};

pub const EVENT_HEADER: &str = "x-github-event";
pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";

#[derive(Clone)]
struct AppState {
    orchestrator: Arc<Orchestrator>,
}

impl AppState {
    fn config(&self) -> &Config {
        self.orchestrator.config()
    }

    fn store(&self) -> &Arc<dyn BuildStore> {
        self.orchestrator.store()
    }
}

/// Open the database, then serve on `[server].bind` until the process ends.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let config = Arc::new(config.clone());
    let store = db::open_store(&config).await?;
    let orchestrator = Orchestrator::with_http(config.clone(), store)?;

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    info!(addr = %listener.local_addr()?, "bindery listening");
    axum::serve(listener, router(orchestrator)).await?;
    Ok(())
}

/// All routes, with permissive CORS.
pub fn router(orchestrator: Arc<Orchestrator>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/api/books", get(handle_list_books))
        .route("/api/books/{book_id}/search", get(handle_search))
        .route("/api/builds", get(handle_list_builds))
        .route("/api/builds/trigger", post(handle_trigger))
        .route("/api/builds/{id}", get(handle_get_build))
        .route("/api/builds/{id}/logs", get(handle_build_logs))
        .route("/api/builds/{id}/stream", get(handle_build_stream))
        .route("/api/webhook", post(handle_webhook).get(handle_webhook_status))
        .layer(cors)
        .with_state(AppState { orchestrator })
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: &'static str,
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
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "internal",
            message: format!("{:#}", err),
        }
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
    }
}

fn unauthorized(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::UNAUTHORIZED,
        code: "unauthorized",
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found",
        message: message.into(),
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

// ============ Books ============

#[derive(Serialize)]
struct BooksResponse {
    books: Vec<Book>,
}

async fn handle_list_books(State(state): State<AppState>) -> Result<Json<BooksResponse>, AppError> {
    let books = book::list_books(state.config()).await?;
    Ok(Json(BooksResponse { books }))
}

#[derive(Deserialize)]
struct SearchParams {
    #[serde(default)]
    q: String,
}

async fn handle_search(
    State(state): State<AppState>,
    Path(book_id): Path<String>,
    Query(params): Query<SearchParams>,
) -> Result<Json<serde_json::Value>, AppError> {
    let book = book::resolve_book(state.config(), &book_id)
        .await?
        .ok_or_else(|| not_found(format!("book not found: {}", book_id)))?;
    let results = indexer::search(state.config(), &book, &params.q).await?;
    Ok(Json(json!({
        "bookId": book.id,
        "query": params.q,
        "results": results,
    })))
}

// ============ Builds ============

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TriggerRequest {
    #[serde(default)]
    book_id: String,
    #[serde(default)]
    triggered_by: Option<String>,
}

async fn handle_trigger(
    State(state): State<AppState>,
    Json(req): Json<TriggerRequest>,
) -> Result<(StatusCode, Json<BuildRecord>), AppError> {
    let book_id = req.book_id.trim();
    if book_id.is_empty() {
        return Err(bad_request("bookId must not be empty"));
    }
    if !book::is_valid_book_id(book_id) {
        return Err(bad_request(format!("invalid bookId: {}", book_id)));
    }
    let record = state.orchestrator.trigger(book_id, req.triggered_by).await?;
    Ok((StatusCode::ACCEPTED, Json(record)))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BuildsQuery {
    #[serde(default)]
    book_id: Option<String>,
    #[serde(default)]
    latest: bool,
}

#[derive(Serialize)]
struct BuildsResponse {
    builds: Vec<BuildRecord>,
}

async fn handle_list_builds(
    State(state): State<AppState>,
    Query(query): Query<BuildsQuery>,
) -> Result<Json<BuildsResponse>, AppError> {
    let book_id = query.book_id.as_deref().filter(|b| !b.is_empty());
    let builds = if query.latest {
        let mut latest = state.store().latest_builds().await?;
        if let Some(id) = book_id {
            latest.retain(|b| b.book_id == id);
        }
        latest
    } else {
        state.store().list_builds(book_id).await?
    };
    Ok(Json(BuildsResponse { builds }))
}

async fn find_build(state: &AppState, id: i64) -> Result<BuildRecord, AppError> {
    state
        .store()
        .get_build(id)
        .await?
        .ok_or_else(|| not_found(format!("build not found: {}", id)))
}

async fn handle_get_build(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<BuildRecord>, AppError> {
    Ok(Json(find_build(&state, id).await?))
}

async fn handle_build_logs(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, AppError> {
    let build = find_build(&state, id).await?;
    let lines: Vec<serde_json::Value> = state
        .store()
        .log_lines(id)
        .await?
        .into_iter()
        .map(|line| StreamMessage::Line(line).to_json())
        .collect();
    Ok(Json(json!({
        "buildId": build.id,
        "status": build.status,
        "lines": lines,
    })))
}

async fn handle_build_stream(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    find_build(&state, id).await?;
    let messages = state.orchestrator.bus().subscribe(id).await?;
    let events = messages
        .map(|message| Ok::<_, Infallible>(Event::default().data(message.to_json().to_string())));
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

// ============ Webhook ============

async fn handle_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

    if let Some(secret) = state.config().webhook.secret.as_deref() {
        if !webhook::verify_signature(secret, &body, header(SIGNATURE_HEADER)) {
            return Err(unauthorized("invalid webhook signature"));
        }
    }

    let event = header(EVENT_HEADER);
    if event != Some(webhook::PUSH_EVENT) {
        return Ok((StatusCode::OK, Json(json!({ "message": "Event ignored" }))));
    }

    let payload: webhook::PushPayload = serde_json::from_slice(&body)
        .map_err(|e| bad_request(format!("invalid webhook payload: {}", e)))?;

    match webhook::evaluate(&state.config().source.organization, event, &payload) {
        Decision::Ignore(message) => Ok((StatusCode::OK, Json(json!({ "message": message })))),
        Decision::Reject(message) => Err(bad_request(message)),
        Decision::Build {
            repository,
            book_id,
        } => {
            let record = state
                .orchestrator
                .trigger(&book_id, Some(format!("webhook:{}", repository)))
                .await?;
            info!(build_id = record.id, %repository, "webhook build triggered");
            Ok((
                StatusCode::ACCEPTED,
                Json(json!({
                    "message": "Build triggered",
                    "repository": repository,
                    "buildId": record.id,
                })),
            ))
        }
    }
}

async fn handle_webhook_status(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "message": "Webhook endpoint is active",
        "organization": state.config().source.organization,
    }))
}
