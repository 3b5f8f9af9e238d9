use std::time::Instant;

use axum::{
    body::Body,
    extract::State,
    http::{HeaderName, Request},
    middleware::Next,
    response::Response,
};
use tracing::{error, info, warn};

use crate::cache::{CACHE_MARKER_HEADER, RemoteUser};

/// Request header carrying the authenticated user id, set by a trusted proxy.
#[derive(Debug, Clone)]
pub struct RemoteUserHeader(pub HeaderName);

pub async fn extract_remote_user(
    State(header): State<RemoteUserHeader>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let user = request
        .headers()
        .get(&header.0)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string);

    if let Some(user) = user {
        request.extensions_mut().insert(RemoteUser(user));
    }
    next.run(request).await
}

pub async fn log_responses(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let start = Instant::now();

    let response = next.run(request).await;
    let status = response.status();
    let elapsed_ms = start.elapsed().as_millis();
    let cache = response
        .headers()
        .get(CACHE_MARKER_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");

    if status.is_server_error() {
        error!(
            target = "httpcache::http::response",
            status = status.as_u16(),
            method = %method,
            path = %uri.path(),
            query = uri.query().unwrap_or(""),
            elapsed_ms = elapsed_ms,
            "request failed",
        );
    } else if status.is_client_error() {
        warn!(
            target = "httpcache::http::response",
            status = status.as_u16(),
            method = %method,
            path = %uri.path(),
            query = uri.query().unwrap_or(""),
            elapsed_ms = elapsed_ms,
            "client request error",
        );
    } else {
        info!(
            target = "httpcache::http::response",
            status = status.as_u16(),
            method = %method,
            path = %uri.path(),
            elapsed_ms = elapsed_ms,
            cache = cache,
            "request served",
        );
    }

    response
}
