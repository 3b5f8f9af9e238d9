use axum::{
    Json, Router,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::cache::InvalidationOutcome;

use super::RouterState;

#[derive(Debug, Deserialize)]
struct InvalidateQuery {
    path: String,
}

/// Observability and invalidation endpoints. Never routed through the cache.
pub fn build_admin_router() -> Router<RouterState> {
    Router::new()
        .route("/_cache/stats", get(cache_stats))
        .route("/_cache/invalidate", post(invalidate_cache))
}

async fn cache_stats(State(state): State<RouterState>) -> Response {
    Json(state.engine.stats()).into_response()
}

async fn invalidate_cache(
    State(state): State<RouterState>,
    Query(query): Query<InvalidateQuery>,
) -> Response {
    if !query.path.starts_with('/') {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "path must be an absolute request path" })),
        )
            .into_response();
    }

    let outcome = state.engine.invalidate_cache(&query.path);
    info!(path = %query.path, outcome = ?outcome, "invalidation requested");

    let status = match outcome {
        InvalidationOutcome::Vetoed { .. } => StatusCode::CONFLICT,
        InvalidationOutcome::Invalidated { .. } => StatusCode::OK,
    };
    (status, Json(outcome)).into_response()
}
