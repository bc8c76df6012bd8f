//! HTTP search API.
//!
//! Exposes the secured query engine, suggestions and index maintenance as a
//! JSON HTTP API. Authentication happens upstream: the requesting principal
//! is read from the trusted `x-dms-user` and `x-dms-roles` headers.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `POST` | `/search` | Run an expression with an optional count strategy |
//! | `POST` | `/search/simple` | Run an expression with the configured strategy |
//! | `GET`  | `/nodes/{uuid}/similar` | More-like-this documents |
//! | `GET`  | `/nodes/{uuid}/terms` | Analyzed terms of a node's text |
//! | `GET`  | `/folders/{uuid}/descendants` | Readable descendant folders |
//! | `GET`  | `/suggest?q=` | Term suggestions for a prefix |
//! | `POST` | `/admin/reindex` | Rebuild the text index |
//! | `POST` | `/admin/suggest/rebuild` | Rebuild the suggestion structure |
//! | `POST` | `/admin/nodes/{uuid}/reindex` | Re-index one node |
//! | `GET`  | `/admin/permissions` | Users and roles named in node permissions |
//! | `DELETE` | `/admin/permissions/{user\|role}/{name}` | Purge one subject and reindex its nodes |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "parse failure at 4: ..." } }
//! ```
//!
//! Error codes: `bad_request` (400), `access_denied` (403), `not_found` (404),
//! `read_only` (409), `internal` (500).

use axum::{
    extract::{Path, Query as QueryParams, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use dms_search_core::collaborators::{AccessDecision, NoProgress, NodeRepository};
use dms_search_core::maintainer::RebuildStats;
use dms_search_core::models::{NodeKind, Permission, Principal, ResultPage};
use dms_search_core::strategy::CountStrategy;
use dms_search_core::SearchError;

use crate::services::{PermissionSubjects, PurgeStats, Services};
use crate::sqlite_nodes::SubjectKind;

pub const USER_HEADER: &str = "x-dms-user";
pub const ROLES_HEADER: &str = "x-dms-roles";

const DEFAULT_LIMIT: u64 = 10;
const DEFAULT_SIMILAR: u64 = 10;
const DEFAULT_SUGGESTIONS: usize = 10;

#[derive(Clone)]
struct AppState {
    services: Arc<Services>,
}

/// Starts the HTTP server on `[server].bind`.
///
/// Runs the startup index check first, so an empty index is rebuilt before
/// the first request is accepted. Runs until the process is terminated.
pub async fn run_server(services: Services) -> anyhow::Result<()> {
    if let Some(stats) = services.startup_check(&NoProgress).await? {
        info!(indexed = stats.indexed, failed = stats.failed, "startup rebuild finished");
    }

    let bind_addr = services.config.server.bind.clone();
    let app = router(Arc::new(services));

    println!("DMS search listening on http://{}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Build the router over shared services.
pub fn router(services: Arc<Services>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/search", post(handle_search))
        .route("/search/simple", post(handle_search_simple))
        .route("/nodes/{uuid}/similar", get(handle_similar))
        .route("/nodes/{uuid}/terms", get(handle_terms))
        .route("/folders/{uuid}/descendants", get(handle_descendants))
        .route("/suggest", get(handle_suggest))
        .route("/admin/reindex", post(handle_reindex))
        .route("/admin/suggest/rebuild", post(handle_suggest_rebuild))
        .route("/admin/nodes/{uuid}/reindex", post(handle_reindex_node))
        .route("/admin/permissions", get(handle_permissions))
        .route("/admin/permissions/{kind}/{name}", delete(handle_purge_permissions))
        .layer(cors)
        .with_state(AppState { services })
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

#[derive(Debug)]
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

fn app_error(status: StatusCode, code: &str, message: impl Into<String>) -> AppError {
    AppError {
        status,
        code: code.to_string(),
        message: message.into(),
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    app_error(StatusCode::BAD_REQUEST, "bad_request", message)
}

fn read_only(message: impl Into<String>) -> AppError {
    app_error(StatusCode::CONFLICT, "read_only", message)
}

impl From<SearchError> for AppError {
    fn from(err: SearchError) -> Self {
        let message = err.to_string();
        match err {
            SearchError::NotFound(_) => app_error(StatusCode::NOT_FOUND, "not_found", message),
            SearchError::AccessDenied(_) => {
                app_error(StatusCode::FORBIDDEN, "access_denied", message)
            }
            SearchError::ParseFailure { .. } => bad_request(message),
            other => {
                warn!(error_type = other.error_type(), error = %message, "request failed");
                app_error(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
            }
        }
    }
}

/// The requesting principal from the upstream identity headers.
fn principal(headers: &HeaderMap) -> Result<Principal, AppError> {
    let user = headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| bad_request(format!("missing {} header", USER_HEADER)))?;
    let roles = headers
        .get(ROLES_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|r| !r.is_empty())
                .map(str::to_string)
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    Ok(Principal::new(user, roles))
}

fn writable(services: &Services) -> Result<(), AppError> {
    if services.flags.is_read_only() {
        return Err(read_only("repository is read-only or under maintenance"));
    }
    Ok(())
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    maintenance: bool,
    read_only: bool,
}

async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    let flags = &state.services.flags;
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        maintenance: flags.is_maintenance(),
        read_only: flags.is_read_only(),
    })
}

// ============ POST /search, /search/simple ============

#[derive(Deserialize)]
struct SearchRequest {
    query: String,
    #[serde(default)]
    offset: u64,
    #[serde(default = "default_limit")]
    limit: u64,
    strategy: Option<String>,
}

#[derive(Deserialize)]
struct SimpleSearchRequest {
    expression: String,
    #[serde(default)]
    offset: u64,
    #[serde(default = "default_limit")]
    limit: u64,
}

fn default_limit() -> u64 {
    DEFAULT_LIMIT
}

async fn handle_search(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<SearchRequest>,
) -> Result<Json<ResultPage>, AppError> {
    let principal = principal(&headers)?;
    let engine = &state.services.engine;
    let strategy = match req.strategy.as_deref() {
        Some(name) => name.parse::<CountStrategy>().map_err(bad_request)?,
        None => engine.settings().strategy,
    };
    let query = engine.parse(&req.query)?;
    let page = engine
        .search_with_strategy(&principal, &query, req.offset, req.limit, strategy)
        .await?;
    Ok(Json(page))
}

async fn handle_search_simple(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<SimpleSearchRequest>,
) -> Result<Json<ResultPage>, AppError> {
    let principal = principal(&headers)?;
    let page = state
        .services
        .engine
        .search_simple(&principal, &req.expression, req.offset, req.limit)
        .await?;
    Ok(Json(page))
}

// ============ GET /nodes/{uuid}/similar ============

#[derive(Deserialize)]
struct SimilarParams {
    max: Option<u64>,
}

async fn handle_similar(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(uuid): Path<String>,
    QueryParams(params): QueryParams<SimilarParams>,
) -> Result<Json<ResultPage>, AppError> {
    let principal = principal(&headers)?;
    let page = state
        .services
        .engine
        .more_like_this(&principal, &uuid, params.max.unwrap_or(DEFAULT_SIMILAR))
        .await?;
    Ok(Json(page))
}

// ============ GET /nodes/{uuid}/terms ============

#[derive(Serialize)]
struct TermsResponse {
    uuid: String,
    kind: NodeKind,
    terms: Vec<String>,
}

async fn handle_terms(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(uuid): Path<String>,
) -> Result<Json<TermsResponse>, AppError> {
    let principal = principal(&headers)?;
    let services = &state.services;
    let node = services
        .nodes
        .get(&uuid)
        .await?
        .ok_or_else(|| SearchError::NotFound(uuid.clone()))?;
    if !services
        .nodes
        .is_granted(&principal, &node, Permission::Read)
        .await?
    {
        return Err(SearchError::AccessDenied(uuid).into());
    }
    let terms = services.engine.get_terms(node.kind, &uuid).await?;
    Ok(Json(TermsResponse {
        uuid,
        kind: node.kind,
        terms,
    }))
}

// ============ GET /folders/{uuid}/descendants ============

#[derive(Serialize)]
struct DescendantsResponse {
    folders: Vec<String>,
}

async fn handle_descendants(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(uuid): Path<String>,
) -> Result<Json<DescendantsResponse>, AppError> {
    let principal = principal(&headers)?;
    let folders = state
        .services
        .engine
        .folders_in_depth(&principal, &uuid)
        .await?;
    Ok(Json(DescendantsResponse { folders }))
}

// ============ GET /suggest ============

#[derive(Deserialize)]
struct SuggestParams {
    q: String,
    max: Option<usize>,
}

#[derive(Serialize)]
struct SuggestResponse {
    suggestions: Vec<String>,
}

async fn handle_suggest(
    State(state): State<AppState>,
    QueryParams(params): QueryParams<SuggestParams>,
) -> Json<SuggestResponse> {
    let suggestions = state
        .services
        .suggest
        .suggest(&params.q, params.max.unwrap_or(DEFAULT_SUGGESTIONS));
    Json(SuggestResponse { suggestions })
}

// ============ POST /admin/reindex ============

#[derive(Deserialize, Default)]
struct ReindexRequest {
    #[serde(default)]
    kinds: Vec<NodeKind>,
}

async fn handle_reindex(
    State(state): State<AppState>,
    body: Option<Json<ReindexRequest>>,
) -> Result<Json<RebuildStats>, AppError> {
    let req = body.map(|Json(r)| r).unwrap_or_default();
    match state.services.rebuild(&req.kinds, &NoProgress).await? {
        Some(stats) => Ok(Json(stats)),
        None => Err(read_only("a rebuild is already running")),
    }
}

// ============ POST /admin/suggest/rebuild ============

#[derive(Serialize)]
struct SuggestRebuildResponse {
    terms: usize,
}

async fn handle_suggest_rebuild(
    State(state): State<AppState>,
) -> Result<Json<SuggestRebuildResponse>, AppError> {
    let services = &state.services;
    let terms = services.suggest.build(services.index.as_ref()).await?;
    Ok(Json(SuggestRebuildResponse { terms }))
}

// ============ POST /admin/nodes/{uuid}/reindex ============

#[derive(Serialize)]
struct NodeReindexResponse {
    uuid: String,
    indexed: bool,
}

async fn handle_reindex_node(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
) -> Result<Json<NodeReindexResponse>, AppError> {
    let services = &state.services;
    writable(services)?;
    services.maintainer.index_uuid(&uuid).await?;
    Ok(Json(NodeReindexResponse {
        uuid,
        indexed: true,
    }))
}

// ============ GET /admin/permissions ============

async fn handle_permissions(
    State(state): State<AppState>,
) -> Result<Json<PermissionSubjects>, AppError> {
    Ok(Json(state.services.permission_subjects().await?))
}

// ============ DELETE /admin/permissions/{kind}/{name} ============

async fn handle_purge_permissions(
    State(state): State<AppState>,
    Path((kind, name)): Path<(SubjectKind, String)>,
) -> Result<Json<PurgeStats>, AppError> {
    let services = &state.services;
    writable(services)?;
    Ok(Json(services.purge_permissions(kind, &name).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn principal_from_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(USER_HEADER, HeaderValue::from_static("alice"));
        headers.insert(ROLES_HEADER, HeaderValue::from_static("ROLE_USER, ROLE_HR,"));
        let p = principal(&headers).unwrap();
        assert_eq!(p.user, "alice");
        assert!(p.has_role("ROLE_USER"));
        assert!(p.has_role("ROLE_HR"));
        assert_eq!(p.roles.len(), 2);
    }

    #[test]
    fn missing_user_is_bad_request() {
        let err = principal(&HeaderMap::new()).err().unwrap();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn search_errors_map_to_statuses() {
        let cases = [
            (SearchError::NotFound("x".into()), StatusCode::NOT_FOUND, "not_found"),
            (SearchError::AccessDenied("x".into()), StatusCode::FORBIDDEN, "access_denied"),
            (SearchError::parse("bad", 3), StatusCode::BAD_REQUEST, "bad_request"),
            (SearchError::IndexIo("x".into()), StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        ];
        for (err, status, code) in cases {
            let app: AppError = err.into();
            assert_eq!(app.status, status);
            assert_eq!(app.code, code);
        }
    }
}
