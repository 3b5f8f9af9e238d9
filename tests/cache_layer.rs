//! The full router: site files behind the response cache plus `/_cache` endpoints.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::num::NonZeroU64;
use std::path::Path;

use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Method, Request, Response, StatusCode, header::CONTENT_TYPE},
    middleware,
    routing::get as get_route,
};
use httpcache::cache::{
    AuthRequirement, CacheConfig, CacheState, SpillMedium, response_cache_layer,
};
use httpcache::config::{
    IdentitySettings, LogFormat, LoggingSettings, RuleSettings, ServerSettings, Settings,
    StoreSettings,
};
use httpcache::infra;
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;
use tracing::level_filters::LevelFilter;

const REMOTE_USER_HEADER: &str = "X-Remote-User";

fn settings(root: &Path) -> Settings {
    Settings {
        server: ServerSettings {
            addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            root: root.to_path_buf(),
            body_limit_bytes: 64 * 1024,
            remote_user_header: Some(REMOTE_USER_HEADER.to_string()),
        },
        logging: LoggingSettings {
            level: LevelFilter::WARN,
            format: LogFormat::Compact,
        },
        stores: vec![StoreSettings {
            name: "MEM".to_string(),
            max_weight_bytes: NonZeroU64::new(1024 * 1024).unwrap(),
            default_ttl: None,
            spill: SpillMedium::Memory,
        }],
        configs: vec![
            CacheConfig::builder("pages", "MEM")
                .include("/pages/.*")
                .auth(AuthRequirement::Anonymous)
                .invalidate_on("/content/pages(/.*)?")
                .build()
                .unwrap(),
        ],
        rules: RuleSettings::defaults(),
        identity: IdentitySettings {
            users: BTreeMap::new(),
        },
    }
}

fn app() -> (TempDir, Router) {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::create_dir_all(dir.path().join("pages")).expect("mkdir");
    let settings = settings(dir.path());
    let engine = infra::cache::build_engine(&settings);
    let router = infra::http::build_router(&settings.server, engine).expect("router");
    (dir, router)
}

fn write_page(dir: &TempDir, name: &str, body: &str) {
    std::fs::write(dir.path().join("pages").join(name), body).expect("write page");
}

async fn send(router: &Router, request: Request<Body>) -> Response<Body> {
    router.clone().oneshot(request).await.expect("infallible")
}

async fn get(router: &Router, uri: &str) -> Response<Body> {
    send(router, Request::get(uri).body(Body::empty()).unwrap()).await
}

async fn body_text(response: Response<Body>) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn second_request_is_served_from_cache() {
    let (dir, router) = app();
    write_page(&dir, "home.html", "<h1>v1</h1>");

    let first = get(&router, "/pages/home.html").await;
    assert_eq!(first.status(), StatusCode::OK);
    assert!(first.headers().get("x-cache").is_none());
    assert_eq!(
        first.headers().get(CONTENT_TYPE).unwrap(),
        "text/html"
    );
    assert_eq!(body_text(first).await, "<h1>v1</h1>");

    write_page(&dir, "home.html", "<h1>v2</h1>");

    let second = get(&router, "/pages/home.html").await;
    assert_eq!(second.status(), StatusCode::OK);
    assert_eq!(second.headers().get("x-cache").unwrap(), "HIT");
    assert_eq!(second.headers().get(CONTENT_TYPE).unwrap(), "text/html");
    assert_eq!(body_text(second).await, "<h1>v1</h1>");
}

#[tokio::test]
async fn authenticated_callers_bypass_anonymous_entries() {
    let (dir, router) = app();
    write_page(&dir, "home.html", "<h1>v1</h1>");
    get(&router, "/pages/home.html").await;
    write_page(&dir, "home.html", "<h1>v2</h1>");

    let request = Request::get("/pages/home.html")
        .header(REMOTE_USER_HEADER, "alice")
        .body(Body::empty())
        .unwrap();
    let response = send(&router, request).await;
    assert!(response.headers().get("x-cache").is_none());
    assert_eq!(body_text(response).await, "<h1>v2</h1>");
}

#[tokio::test]
async fn uncached_paths_and_methods_render_live() {
    let (dir, router) = app();
    write_page(&dir, "home.html", "v1");
    std::fs::write(dir.path().join("robots.txt"), "v1").unwrap();

    get(&router, "/robots.txt").await;
    std::fs::write(dir.path().join("robots.txt"), "v2").unwrap();
    assert_eq!(body_text(get(&router, "/robots.txt").await).await, "v2");

    let head = Request::builder()
        .method(Method::HEAD)
        .uri("/pages/home.html")
        .body(Body::empty())
        .unwrap();
    send(&router, head).await;
    write_page(&dir, "home.html", "v2");
    assert_eq!(body_text(get(&router, "/pages/home.html").await).await, "v2");
}

#[tokio::test]
async fn not_found_responses_are_not_stored() {
    let (dir, router) = app();

    let missing = get(&router, "/pages/later.html").await;
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);

    write_page(&dir, "later.html", "now here");
    let present = get(&router, "/pages/later.html").await;
    assert_eq!(present.status(), StatusCode::OK);
    assert_eq!(body_text(present).await, "now here");
}

#[tokio::test]
async fn traversal_outside_the_root_is_not_found() {
    let (_dir, router) = app();

    let response = get(&router, "/pages/../../etc/passwd").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn stats_endpoint_reports_entries() {
    let (dir, router) = app();
    write_page(&dir, "home.html", "<h1>home</h1>");
    get(&router, "/pages/home.html").await;
    get(&router, "/pages/home.html").await;

    let response = get(&router, "/_cache/stats").await;
    assert_eq!(response.status(), StatusCode::OK);
    let stats: Value = serde_json::from_str(&body_text(response).await).unwrap();

    let store = &stats[0];
    assert_eq!(store["name"], "MEM");
    assert_eq!(store["entries"], 1);
    assert_eq!(store["hits"], 1);
    assert_eq!(store["entry_stats"][0]["uri"], "/pages/home.html");
    assert_eq!(store["entry_stats"][0]["config"], "pages");
}

#[tokio::test]
async fn invalidate_endpoint_drops_matching_entries() {
    let (dir, router) = app();
    write_page(&dir, "home.html", "v1");
    get(&router, "/pages/home.html").await;
    write_page(&dir, "home.html", "v2");

    let request = Request::post("/_cache/invalidate?path=/content/pages/home")
        .body(Body::empty())
        .unwrap();
    let response = send(&router, request).await;
    assert_eq!(response.status(), StatusCode::OK);
    let outcome: Value = serde_json::from_str(&body_text(response).await).unwrap();
    assert_eq!(outcome["outcome"], "invalidated");
    assert_eq!(outcome["configs"][0], "pages");

    let fresh = get(&router, "/pages/home.html").await;
    assert!(fresh.headers().get("x-cache").is_none());
    assert_eq!(body_text(fresh).await, "v2");
}

#[tokio::test]
async fn invalidate_endpoint_rejects_relative_paths() {
    let (_dir, router) = app();

    let request = Request::post("/_cache/invalidate?path=content")
        .body(Body::empty())
        .unwrap();
    let response = send(&router, request).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn bodies_over_the_buffer_limit_are_served_uncached() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = infra::cache::build_engine(&settings(dir.path()));
    let cache = CacheState {
        engine,
        body_limit: 16,
    };
    let router = Router::new()
        .route("/pages/big.txt", get_route(|| async { "x".repeat(100) }))
        .layer(middleware::from_fn_with_state(cache, response_cache_layer));

    for _ in 0..2 {
        let response = get(&router, "/pages/big.txt").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get("x-cache").is_none());
        assert_eq!(body_text(response).await, "x".repeat(100));
    }
}
