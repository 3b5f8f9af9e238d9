//! Handling rules: extension hooks that can veto caching decisions.
//!
//! Every hook defaults to `true` (no veto). Request-received hooks are
//! AND-aggregated over all rules; the other three hooks stop at the first
//! veto.

use std::fmt;

use metrics::counter;
use tracing::debug;

use super::config::CacheConfig;
use super::content::CacheContent;
use super::http::{HttpRequest, HttpResponse};

const METRIC_VETO: &str = "httpcache_rule_veto_total";

/// Header set on responses served from cache by [`MarkResponseAsCacheDelivered`].
pub const CACHE_MARKER_HEADER: &str = "X-Cache";

/// Lifecycle point at which a rule is consulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleHook {
    RequestReceive,
    CacheDeliver,
    ResponseCache,
    CacheInvalidate,
}

impl RuleHook {
    pub fn as_str(self) -> &'static str {
        match self {
            RuleHook::RequestReceive => "request_receive",
            RuleHook::CacheDeliver => "cache_deliver",
            RuleHook::ResponseCache => "response_cache",
            RuleHook::CacheInvalidate => "cache_invalidate",
        }
    }
}

impl fmt::Display for RuleHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub trait HandlingRule: Send + Sync {
    /// Identity used for registration and logging.
    fn name(&self) -> &str;

    fn on_request_receive(&self, _request: &dyn HttpRequest) -> bool {
        true
    }

    /// May decorate `response` before the cached content is written.
    fn on_cache_deliver(
        &self,
        _request: &dyn HttpRequest,
        _response: &mut dyn HttpResponse,
        _config: &CacheConfig,
        _content: &CacheContent,
    ) -> bool {
        true
    }

    /// May rewrite `content` before it is stored.
    fn on_response_cache(
        &self,
        _request: &dyn HttpRequest,
        _config: &CacheConfig,
        _content: &mut CacheContent,
    ) -> bool {
        true
    }

    fn on_cache_invalidate(&self, _path: &str) -> bool {
        true
    }
}

pub(crate) fn record_veto(rule: &dyn HandlingRule, hook: RuleHook) {
    debug!(rule = rule.name(), hook = %hook, outcome = "veto", "handling rule vetoed");
    counter!(
        METRIC_VETO,
        "rule" => rule.name().to_string(),
        "hook" => hook.as_str()
    )
    .increment(1);
}

/// Only GET and HEAD requests are cacheable.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheOnlyGetRequest;

impl HandlingRule for CacheOnlyGetRequest {
    fn name(&self) -> &str {
        "cache_only_get_request"
    }

    fn on_request_receive(&self, request: &dyn HttpRequest) -> bool {
        let method = request.method();
        method.eq_ignore_ascii_case("GET") || method.eq_ignore_ascii_case("HEAD")
    }
}

/// Only `200 OK` responses are stored.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheOnlyResponse200;

impl HandlingRule for CacheOnlyResponse200 {
    fn name(&self) -> &str {
        "cache_only_response_200"
    }

    fn on_response_cache(
        &self,
        _request: &dyn HttpRequest,
        _config: &CacheConfig,
        content: &mut CacheContent,
    ) -> bool {
        content.status() == 200
    }
}

/// Responses marked `no-cache`, `no-store` or `private` are not stored.
#[derive(Debug, Clone, Copy, Default)]
pub struct HonorCacheControlHeaders;

const UNCACHEABLE_DIRECTIVES: [&str; 3] = ["no-cache", "no-store", "private"];

impl HandlingRule for HonorCacheControlHeaders {
    fn name(&self) -> &str {
        "honor_cache_control_headers"
    }

    fn on_response_cache(
        &self,
        _request: &dyn HttpRequest,
        _config: &CacheConfig,
        content: &mut CacheContent,
    ) -> bool {
        !content
            .header_values("cache-control")
            .flat_map(|value| value.split(','))
            .map(|directive| {
                directive
                    .split('=')
                    .next()
                    .unwrap_or_default()
                    .trim()
                    .to_ascii_lowercase()
            })
            .any(|directive| UNCACHEABLE_DIRECTIVES.contains(&directive.as_str()))
    }
}

/// Tags cache hits with `X-Cache: HIT`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MarkResponseAsCacheDelivered;

impl HandlingRule for MarkResponseAsCacheDelivered {
    fn name(&self) -> &str {
        "mark_response_as_cache_delivered"
    }

    fn on_cache_deliver(
        &self,
        _request: &dyn HttpRequest,
        response: &mut dyn HttpResponse,
        _config: &CacheConfig,
        _content: &CacheContent,
    ) -> bool {
        response.set_header(CACHE_MARKER_HEADER, "HIT");
        true
    }
}

/// Removes per-user headers from snapshots before they are stored.
#[derive(Debug, Clone)]
pub struct StripResponseHeaders {
    headers: Vec<String>,
}

impl StripResponseHeaders {
    pub fn new<I, S>(headers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            headers: headers.into_iter().map(Into::into).collect(),
        }
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }
}

impl Default for StripResponseHeaders {
    fn default() -> Self {
        Self::new(["Set-Cookie"])
    }
}

impl HandlingRule for StripResponseHeaders {
    fn name(&self) -> &str {
        "strip_response_headers"
    }

    fn on_response_cache(
        &self,
        _request: &dyn HttpRequest,
        _config: &CacheConfig,
        content: &mut CacheContent,
    ) -> bool {
        for header in &self.headers {
            content.remove_header(header);
        }
        true
    }
}
