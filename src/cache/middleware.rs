//! Axum response cache middleware.
//!
//! Runs the engine flow around the inner handler: hits are served from the
//! store, misses are rendered, teed through a [`ResponseCapture`] and stored.
//! Any cache failure degrades to a live render.

use std::sync::Arc;

use axum::{
    body::{Body, Bytes, HttpBody},
    extract::State,
    http::{
        HeaderValue, Method, Request, StatusCode,
        header::{CONTENT_LENGTH, CONTENT_TYPE, COOKIE, TRANSFER_ENCODING},
        response::Parts,
    },
    middleware::Next,
    response::{IntoResponse, Response},
};
use bytes::BytesMut;
use futures::{StreamExt, stream};
use http_body_util::BodyExt;
use tracing::{debug, instrument, warn};

use super::config::CacheConfig;
use super::engine::CacheEngine;
use super::error::CacheError;
use super::http::{BufferedResponse, HttpResponse, RequestSnapshot};

/// Authenticated user id, inserted as a request extension by upstream auth.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteUser(pub String);

/// Shared state for [`response_cache_layer`].
#[derive(Clone)]
pub struct CacheState {
    pub engine: Arc<CacheEngine>,
    /// Largest body the layer buffers for capture.
    pub body_limit: usize,
}

#[instrument(skip_all, fields(method = %request.method(), path = %request.uri().path()))]
pub async fn response_cache_layer(
    State(cache): State<CacheState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let view = request_view(&request);
    let config = match resolve(&cache.engine, &view) {
        Ok(Some(config)) => config,
        Ok(None) => return next.run(request).await,
        Err(error) => {
            warn!(error = %error, "cache bypassed");
            return next.run(request).await;
        }
    };

    match cache.engine.is_cache_hit(&view, &config) {
        Ok(true) => {
            let mut buffered = BufferedResponse::new();
            match cache
                .engine
                .deliver_cache_content(&view, &mut buffered, &config)
            {
                Ok(true) => return into_response(buffered),
                Ok(false) => debug!(outcome = "declined", "cache hit not delivered"),
                Err(error) => warn!(error = %error, "cache delivery failed, rendering live"),
            }
        }
        Ok(false) => {}
        Err(error) => {
            warn!(error = %error, "cache lookup failed, rendering live");
            return next.run(request).await;
        }
    }

    let store_after = request.method() != Method::HEAD;
    let response = next.run(request).await;
    if !store_after {
        return response;
    }

    let (parts, body) = response.into_parts();
    if !capturable(&parts, cache.body_limit) {
        debug!(outcome = "skipped", "response not capturable");
        return Response::from_parts(parts, body);
    }

    let bytes = match buffer_body(body, cache.body_limit).await {
        Buffered::Complete(bytes) => bytes,
        Buffered::PassThrough(body) => {
            debug!(outcome = "skipped", "response body exceeds the buffer limit");
            return Response::from_parts(parts, body);
        }
    };

    let mut live = BufferedResponse::new();
    match capture(&cache.engine, &view, &config, &parts, &bytes, &mut live) {
        Ok(stored) => {
            debug!(stored, outcome = "miss", "response captured");
            into_response(live)
        }
        Err(error) => {
            warn!(error = %error, "response capture failed");
            Response::from_parts(parts, Body::from(bytes))
        }
    }
}

fn resolve(
    engine: &CacheEngine,
    view: &RequestSnapshot,
) -> Result<Option<Arc<CacheConfig>>, CacheError> {
    if !engine.is_request_cacheable(view)? {
        return Ok(None);
    }
    engine.get_cache_config(view)
}

/// Owned view of the request the engine can read.
pub fn request_view(request: &Request<Body>) -> RequestSnapshot {
    let mut view = RequestSnapshot::new(request.method().as_str(), request.uri().path())
        .with_query(request.uri().query().unwrap_or_default());

    for (name, value) in request.headers() {
        if let Ok(value) = value.to_str() {
            view = view.with_header(name.as_str(), value);
        }
    }
    for value in request.headers().get_all(COOKIE) {
        if let Ok(value) = value.to_str() {
            view = view.with_cookie_header(value);
        }
    }
    if let Some(RemoteUser(user)) = request.extensions().get::<RemoteUser>() {
        view = view.with_user(user.clone());
    }
    view
}

/// Headers must be text and the declared length within the buffer limit.
fn capturable(parts: &Parts, body_limit: usize) -> bool {
    let declared = parts
        .headers
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<usize>().ok());
    if declared.is_some_and(|length| length > body_limit) {
        return false;
    }
    parts.headers.values().all(|value| value.to_str().is_ok())
}

enum Buffered {
    Complete(Bytes),
    /// The body could not be held in full; it is replayed unchanged.
    PassThrough(Body),
}

/// Collect at most `limit` body bytes. Past the limit, or on a body error,
/// the bytes read so far are re-emitted ahead of the rest of the stream.
async fn buffer_body(mut body: Body, limit: usize) -> Buffered {
    if body.size_hint().lower() > limit as u64 {
        return Buffered::PassThrough(body);
    }

    let mut collected = BytesMut::new();
    while let Some(frame) = body.frame().await {
        let data = match frame {
            Ok(frame) => match frame.into_data() {
                Ok(data) => data,
                Err(_trailers) => continue,
            },
            Err(error) => {
                warn!(error = %error, "response body failed while buffering");
                let head = stream::iter([Ok(collected.freeze()), Err(error)]);
                return Buffered::PassThrough(Body::from_stream(head));
            }
        };

        if collected.len() + data.len() > limit {
            let head = stream::iter([Ok::<_, axum::Error>(collected.freeze()), Ok(data)]);
            let rest = body.into_data_stream();
            return Buffered::PassThrough(Body::from_stream(head.chain(rest)));
        }
        collected.extend_from_slice(&data);
    }
    Buffered::Complete(collected.freeze())
}

fn capture(
    engine: &CacheEngine,
    view: &RequestSnapshot,
    config: &CacheConfig,
    parts: &Parts,
    body: &Bytes,
    live: &mut BufferedResponse,
) -> Result<bool, CacheError> {
    let mut capture = engine.wrap_response(view, live, config)?;
    capture.set_status(parts.status.as_u16());
    for (name, value) in &parts.headers {
        let Ok(value) = value.to_str() else {
            continue;
        };
        if name == CONTENT_TYPE {
            capture.set_content_type(value);
        } else if name != CONTENT_LENGTH && name != TRANSFER_ENCODING {
            capture.add_header(name.as_str(), value);
        }
    }
    if !body.is_empty() {
        capture.write_bytes(body)?;
    }
    capture.flush()?;
    engine.cache_response(view, capture, config)
}

fn into_response(buffered: BufferedResponse) -> Response {
    let mut builder = Response::builder().status(buffered.status());
    for (name, value) in buffered.headers() {
        if let Ok(value) = HeaderValue::from_str(&value) {
            builder = builder.header(name, value);
        }
    }
    if let Some(content_type) = buffered.content_type_header() {
        builder = builder.header(CONTENT_TYPE, content_type);
    }

    builder
        .body(Body::from(buffered.into_body()))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::http::HttpRequest;

    #[test]
    fn request_view_collects_query_cookies_and_user() {
        let mut request = Request::builder()
            .method("GET")
            .uri("/products/42.json?page=2&sort=asc")
            .header("X-Country", "NL")
            .header(COOKIE, "theme=dark; lang=en")
            .body(Body::empty())
            .unwrap();
        request
            .extensions_mut()
            .insert(RemoteUser("alice".into()));

        let view = request_view(&request);
        assert_eq!(view.method(), "GET");
        assert_eq!(view.path(), "/products/42.json");
        assert_eq!(view.parameter("page"), Some("2"));
        assert_eq!(view.cookie("lang"), Some("en"));
        assert_eq!(view.header("x-country"), Some("NL"));
        assert_eq!(view.remote_user(), Some("alice"));
    }

    #[test]
    fn oversized_declared_length_is_not_capturable() {
        let (parts, _) = Response::builder()
            .header(CONTENT_LENGTH, "2048")
            .body(())
            .unwrap()
            .into_parts();
        assert!(!capturable(&parts, 1024));
        assert!(capturable(&parts, 4096));
    }

    #[tokio::test]
    async fn small_body_is_buffered_in_full() {
        match buffer_body(Body::from("hello"), 16).await {
            Buffered::Complete(bytes) => assert_eq!(&bytes[..], b"hello"),
            Buffered::PassThrough(_) => panic!("expected a complete buffer"),
        }
    }

    #[tokio::test]
    async fn oversized_stream_is_replayed_unchanged() {
        let chunks = ["aaaa", "bbbb", "cccc", "dddd", "eeee"]
            .map(|chunk| Ok::<_, axum::Error>(Bytes::from_static(chunk.as_bytes())));
        let body = Body::from_stream(stream::iter(chunks));

        let Buffered::PassThrough(body) = buffer_body(body, 10).await else {
            panic!("expected the body to pass through");
        };
        let replayed = axum::body::to_bytes(body, usize::MAX).await.unwrap();
        assert_eq!(&replayed[..], b"aaaabbbbccccddddeeee");
    }

    #[test]
    fn buffered_response_converts_with_charset() {
        let mut buffered = BufferedResponse::new();
        buffered.set_status(201);
        buffered.set_content_type("text/plain; charset=utf-8");
        buffered.add_header("X-Cache", "HIT");
        buffered.write_text("hello").unwrap();

        let response = into_response(buffered);
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "text/plain; charset=utf-8"
        );
        assert_eq!(response.headers().get("x-cache").unwrap(), "HIT");
    }
}
