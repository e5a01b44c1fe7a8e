//! HTTP API server.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/api/search` | Hybrid search, or recent conversations for an empty `q` |
//! | `GET`  | `/api/status` | Indexing status, counts and sidecar state |
//! | `POST` | `/api/index` | Start a background indexing pass |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! `/api/search` accepts `q`, `project`, `role`, `after`, `before`, `limit`
//! and `offset` query parameters. Parsing is lenient: an unparsable number
//! falls back to its default, and filters that cannot match produce an empty
//! result rather than an error.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "internal", "message": "..." } }
//! ```
//!
//! Only storage failures produce errors; user input never maps to a 5xx.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;
use crate::scheduler::{IndexScheduler, IndexStatus};
use crate::search::{SearchEngine, SearchFilters, SearchRequest, SearchResponse};

/// Shared state for all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub search: SearchEngine,
    pub scheduler: Arc<IndexScheduler>,
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/search", get(handle_search))
        .route("/api/status", get(handle_status))
        .route("/api/index", post(handle_index))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state)
}

/// Bind to `[server].bind` and serve until the process is terminated.
pub async fn run_server(config: &Config, state: AppState) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    tracing::info!(addr = %config.server.bind, "search server listening");
    axum::serve(listener, router(state)).await?;
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

fn internal(err: anyhow::Error) -> AppError {
    tracing::error!(error = %err, "request failed");
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: format!("{:#}", err),
    }
}

// ============ GET /api/search ============

/// Build a [`SearchRequest`] from raw query parameters.
pub fn search_request_from_params(params: &HashMap<String, String>) -> SearchRequest {
    let text = |key: &str| params.get(key).cloned();
    let number = |key: &str| params.get(key).and_then(|v| v.trim().parse::<i64>().ok());

    SearchRequest {
        query: text("q").unwrap_or_default(),
        filters: SearchFilters {
            project: text("project"),
            role: text("role"),
            after: text("after"),
            before: text("before"),
        },
        limit: number("limit"),
        offset: number("offset"),
    }
}

async fn handle_search(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<SearchResponse>, AppError> {
    let request = search_request_from_params(&params);
    let response = state.search.search(&request).await.map_err(internal)?;
    Ok(Json(response))
}

// ============ GET /api/status ============

async fn handle_status(State(state): State<AppState>) -> Json<IndexStatus> {
    Json(state.scheduler.status().await)
}

// ============ POST /api/index ============

#[derive(Serialize)]
struct IndexTriggerResponse {
    started: bool,
}

async fn handle_index(State(state): State<AppState>) -> (StatusCode, Json<IndexTriggerResponse>) {
    let started = state.scheduler.trigger();
    (StatusCode::ACCEPTED, Json(IndexTriggerResponse { started }))
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lenient_param_parsing() {
        let params: HashMap<String, String> = [
            ("q", "tokio"),
            ("limit", "ten"),
            ("offset", " 5 "),
            ("role", "assistant"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let req = search_request_from_params(&params);
        assert_eq!(req.query, "tokio");
        assert_eq!(req.limit, None);
        assert_eq!(req.offset, Some(5));
        assert_eq!(req.filters.role.as_deref(), Some("assistant"));
        assert_eq!(req.filters.project, None);
    }
}
