use std::io::ErrorKind;

use axum::{
    Router,
    body::Body,
    extract::State,
    http::{
        HeaderValue, Request, StatusCode,
        header::{CONTENT_LENGTH, CONTENT_TYPE},
    },
    middleware,
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use tracing::error;

use crate::{
    cache::{CacheState, response_cache_layer},
    infra::site::{SiteError, SiteFile},
};

use super::RouterState;

/// Every path not claimed by another router is a site file, served through
/// the response cache.
pub fn build_public_router(cache: CacheState) -> Router<RouterState> {
    Router::new()
        .fallback(serve_file)
        .layer(middleware::from_fn_with_state(cache, response_cache_layer))
}

async fn serve_file(State(state): State<RouterState>, request: Request<Body>) -> Response {
    const SOURCE: &str = "infra::http::public::serve_file";

    let path = request.uri().path().to_string();
    match state.site.read(&path).await {
        Ok(file) => build_file_response(file),
        Err(SiteError::InvalidPath) => not_found(),
        Err(SiteError::Io(err)) if err.kind() == ErrorKind::NotFound => not_found(),
        Err(err) => {
            error!(
                target = SOURCE,
                path = %path,
                error = %err,
                "failed to read site file"
            );
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to read the requested file",
            )
                .into_response()
        }
    }
}

fn build_file_response(file: SiteFile) -> Response {
    let length = file.bytes.len();
    let mut response = Response::new(Body::from(file.bytes));
    *response.status_mut() = StatusCode::OK;

    let headers = response.headers_mut();
    let mime = mime_guess::from_path(&file.path).first_or_octet_stream();
    if let Ok(value) = HeaderValue::from_str(mime.as_ref()) {
        headers.insert(CONTENT_TYPE, value);
    }
    if let Ok(value) = HeaderValue::from_str(&length.to_string()) {
        headers.insert(CONTENT_LENGTH, value);
    }

    response
}

fn not_found() -> Response {
    (StatusCode::NOT_FOUND, Bytes::from_static(b"Not found")).into_response()
}
