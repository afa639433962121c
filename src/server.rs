//! HTTP request layer.
//!
//! A thin JSON adapter over the query engine and the store. Every handler
//! shares one [`QueryEngine`] and one connection pool through Axum state.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/api/search?q&mode&limit&offset&include_deleted` | Ranked results page |
//! | `GET`  | `/api/suggest?q&mode` | Type-ahead suggestions |
//! | `GET`  | `/api/issues/{key}` | Full issue, tombstoned ones included |
//! | `GET`  | `/api/validate?q&mode` | Syntax check without execution |
//! | `GET`  | `/api/status` | Counts, checkpoints, recent runs |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! The `/api` routes pass through [`require_api_access`]: an `X-API-Key`
//! check and a per-client request window, configured under `[api]`.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "query_syntax", "message": "...", "position": 7 } }
//! ```
//!
//! Error codes: `query_syntax` (400), `invalid_api_key` / `api_key_required`
//! (401), `not_found` (404), `query_timeout` (408), `rate_limited` (429),
//! `internal` (500).

use axum::{
    extract::{Path, Query as QueryParams, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use jira_mirror_core::models::Issue;
use jira_mirror_core::query::engine::SearchRequest;
use jira_mirror_core::query::{Query, QueryEngine, QueryError, QueryMode, ResultPage, Suggestion};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use crate::api_auth::{require_api_access, ApiGuard};
use crate::config::Config;
use crate::get::get_issue;
use crate::sqlite_store::{self, SqliteStore};
use crate::status::{status_report, StatusReport};

#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    store: Arc<SqliteStore>,
    engine: Arc<QueryEngine<SqliteStore>>,
}

impl AppState {
    pub fn new(config: Arc<Config>, store: Arc<SqliteStore>) -> Self {
        let engine = QueryEngine::new(store.clone(), config.catalog(), config.engine_settings());
        Self {
            config,
            store,
            engine: Arc::new(engine),
        }
    }
}

/// The router with every route and the CORS layer attached.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let guard = ApiGuard::from_config(&state.config.api);
    let api_routes = Router::new()
        .route("/api/search", get(handle_search))
        .route("/api/suggest", get(handle_suggest))
        .route("/api/issues/{key}", get(handle_issue))
        .route("/api/validate", get(handle_validate))
        .route("/api/status", get(handle_status))
        .route_layer(middleware::from_fn_with_state(guard, require_api_access));

    Router::new()
        .merge(api_routes)
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state)
}

/// Serve on `[server].bind` until the process is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let store = Arc::new(sqlite_store::open(config).await?);
    let app = router(AppState::new(Arc::new(config.clone()), store));

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, "http server started");
    println!("Jira Mirror listening on http://{}", bind_addr);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
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
    #[serde(skip_serializing_if = "Option::is_none")]
    position: Option<usize>,
}

#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
    position: Option<usize>,
}

impl AppError {
    pub(crate) fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            position: None,
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(code = self.code, message = %self.message, "request failed");
        }
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
                position: self.position,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<QueryError> for AppError {
    fn from(e: QueryError) -> Self {
        match e {
            QueryError::Syntax { position, reason } => AppError {
                status: StatusCode::BAD_REQUEST,
                code: "query_syntax",
                message: reason,
                position: Some(position),
            },
            e @ QueryError::Timeout { .. } => {
                AppError::new(StatusCode::REQUEST_TIMEOUT, "query_timeout", e.to_string())
            }
            QueryError::Store(s) => AppError::internal(s.to_string()),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(e: anyhow::Error) -> Self {
        AppError::internal(e.to_string())
    }
}

fn parse_mode(mode: Option<&str>) -> Result<QueryMode, AppError> {
    match mode {
        None => Ok(QueryMode::Natural),
        Some(m) => QueryMode::parse(m).ok_or_else(|| {
            AppError::new(
                StatusCode::BAD_REQUEST,
                "query_syntax",
                format!("unknown mode '{}': use natural, jql or regex", m),
            )
        }),
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

// ============ Query endpoints ============

#[derive(Debug, Deserialize)]
struct SearchParams {
    #[serde(default)]
    q: String,
    mode: Option<String>,
    limit: Option<usize>,
    #[serde(default)]
    offset: usize,
    #[serde(default)]
    include_deleted: bool,
}

async fn handle_search(
    State(state): State<AppState>,
    QueryParams(params): QueryParams<SearchParams>,
) -> Result<Json<ResultPage>, AppError> {
    let mode = parse_mode(params.mode.as_deref())?;
    let request = SearchRequest {
        limit: params.limit,
        offset: params.offset,
        include_deleted: params.include_deleted,
        ..SearchRequest::new(Query::new(mode, params.q))
    };
    Ok(Json(state.engine.search(&request).await?))
}

#[derive(Debug, Deserialize)]
struct PrefixParams {
    #[serde(default)]
    q: String,
    mode: Option<String>,
}

#[derive(Serialize)]
struct SuggestResponse {
    suggestions: Vec<Suggestion>,
}

async fn handle_suggest(
    State(state): State<AppState>,
    QueryParams(params): QueryParams<PrefixParams>,
) -> Result<Json<SuggestResponse>, AppError> {
    let mode = parse_mode(params.mode.as_deref())?;
    let suggestions = state.engine.suggest(&params.q, mode).await?;
    Ok(Json(SuggestResponse { suggestions }))
}

#[derive(Serialize)]
struct ValidateResponse {
    valid: bool,
    mode: &'static str,
}

async fn handle_validate(
    State(state): State<AppState>,
    QueryParams(params): QueryParams<PrefixParams>,
) -> Result<Json<ValidateResponse>, AppError> {
    let mode = parse_mode(params.mode.as_deref())?;
    state.engine.validate(&Query::new(mode, params.q))?;
    Ok(Json(ValidateResponse {
        valid: true,
        mode: mode.as_str(),
    }))
}

async fn handle_issue(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<Issue>, AppError> {
    match get_issue(state.store.as_ref(), &key).await? {
        Some(issue) => Ok(Json(issue)),
        None => Err(AppError::new(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("issue not found: {}", key),
        )),
    }
}

async fn handle_status(State(state): State<AppState>) -> Result<Json<StatusReport>, AppError> {
    Ok(Json(status_report(&state.store, &state.config).await?))
}
