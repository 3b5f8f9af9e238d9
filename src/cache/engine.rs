//! Cache orchestration.
//!
//! Per request: [`CacheEngine::is_request_cacheable`], then
//! [`CacheEngine::get_cache_config`], then [`CacheEngine::is_cache_hit`].
//! A hit is served with [`CacheEngine::deliver_cache_content`]; a miss is
//! rendered through [`CacheEngine::wrap_response`] and stored with
//! [`CacheEngine::cache_response`]. Content changes flow through
//! [`CacheEngine::invalidate_cache`].

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, instrument, warn};

use super::capture::ResponseCapture;
use super::config::CacheConfig;
use super::error::CacheError;
use super::http::{HttpRequest, HttpResponse, IdentityProvider};
use super::keys::CacheKey;
use super::registry::CacheRegistry;
use super::resolver::CacheConfigResolver;
use super::rules::{RuleHook, record_veto};
use super::store::{CacheStore, StoreStats};

/// Result of [`CacheEngine::invalidate_cache`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum InvalidationOutcome {
    /// A rule aborted the invalidation.
    Vetoed { rule: String },
    /// Names of the configs whose entries were dropped.
    Invalidated { configs: Vec<String> },
}

pub struct CacheEngine {
    registry: Arc<CacheRegistry>,
    identity: Arc<dyn IdentityProvider>,
}

impl CacheEngine {
    pub fn new(registry: Arc<CacheRegistry>, identity: Arc<dyn IdentityProvider>) -> Self {
        Self { registry, identity }
    }

    pub fn registry(&self) -> &Arc<CacheRegistry> {
        &self.registry
    }

    fn store_for(&self, config: &CacheConfig) -> Result<Arc<dyn CacheStore>, CacheError> {
        self.registry
            .store(config.store())
            .ok_or_else(|| CacheError::persistence(config.store()))
    }

    /// Every request-received rule runs; any veto makes the request
    /// uncacheable whatever the configs say.
    #[instrument(skip_all, fields(path = request.path()))]
    pub fn is_request_cacheable(&self, request: &dyn HttpRequest) -> Result<bool, CacheError> {
        let mut accepted = true;
        for rule in self.registry.rules().iter() {
            if !rule.on_request_receive(request) {
                record_veto(rule.as_ref(), RuleHook::RequestReceive);
                accepted = false;
            }
        }
        if !accepted {
            return Ok(false);
        }

        let configs = self.registry.configs();
        CacheConfigResolver::new(&configs, self.identity.as_ref()).is_config_found(request)
    }

    #[instrument(skip_all, fields(path = request.path()))]
    pub fn get_cache_config(
        &self,
        request: &dyn HttpRequest,
    ) -> Result<Option<Arc<CacheConfig>>, CacheError> {
        let configs = self.registry.configs();
        CacheConfigResolver::new(&configs, self.identity.as_ref()).resolve_config(request)
    }

    pub fn is_cache_hit(
        &self,
        request: &dyn HttpRequest,
        config: &CacheConfig,
    ) -> Result<bool, CacheError> {
        let store = self.store_for(config)?;
        let key = CacheKey::from_request(request, config)?;
        let hit = store.contains(&key);
        debug!(
            store = store.name(),
            key = %key,
            outcome = if hit { "hit" } else { "miss" },
            "cache lookup"
        );
        Ok(hit)
    }

    /// Serve the stored entry onto `response`. `Ok(false)` means nothing was
    /// written and the caller renders live.
    ///
    /// The snapshot is read before the deliver hooks run, so a vetoed
    /// delivery still counts as a store hit.
    #[instrument(skip_all, fields(path = request.path(), config = config.name()))]
    pub fn deliver_cache_content(
        &self,
        request: &dyn HttpRequest,
        response: &mut dyn HttpResponse,
        config: &CacheConfig,
    ) -> Result<bool, CacheError> {
        let store = self.store_for(config)?;
        let key = CacheKey::from_request(request, config)?;
        let Some(content) = store.get_if_present(&key) else {
            debug!(key = %key, outcome = "gone", "entry vanished before delivery");
            return Ok(false);
        };

        for rule in self.registry.rules().iter() {
            if !rule.on_cache_deliver(request, response, config, &content) {
                record_veto(rule.as_ref(), RuleHook::CacheDeliver);
                return Ok(false);
            }
        }

        content.write_to(response)?;
        debug!(key = %key, bytes = content.payload_len(), outcome = "delivered", "served from cache");
        Ok(true)
    }

    /// Tee `response` into a capture keyed by this request.
    pub fn wrap_response<'r>(
        &self,
        request: &dyn HttpRequest,
        response: &'r mut dyn HttpResponse,
        config: &CacheConfig,
    ) -> Result<ResponseCapture<'r>, CacheError> {
        let store = self.store_for(config)?;
        let key = CacheKey::from_request(request, config)?;
        Ok(ResponseCapture::new(response, key, store))
    }

    /// Store what `capture` recorded. `Ok(false)` means a rule discarded it.
    ///
    /// # Panics
    ///
    /// When `capture` was wrapped for a different request or config.
    #[instrument(skip_all, fields(path = request.path(), config = config.name()))]
    pub fn cache_response(
        &self,
        request: &dyn HttpRequest,
        capture: ResponseCapture<'_>,
        config: &CacheConfig,
    ) -> Result<bool, CacheError> {
        let key = CacheKey::from_request(request, config)?;
        assert!(
            capture.key() == &key,
            "capture for {} handed to cache_response for {}",
            capture.key(),
            key
        );
        let store = self.store_for(config)?;

        let mut content = capture.into_content()?;
        if content.content_type().is_none()
            && let Some(mime) = config.response_mime_type()
        {
            content = content.with_content_type(mime);
        }

        for rule in self.registry.rules().iter() {
            if !rule.on_response_cache(request, config, &mut content) {
                record_veto(rule.as_ref(), RuleHook::ResponseCache);
                return Ok(false);
            }
        }

        let bytes = content.payload_len();
        store.put(key, content)?;
        debug!(store = store.name(), bytes, outcome = "stored", "cached response");
        Ok(true)
    }

    /// Cheap pre-filter for content-change events.
    pub fn is_path_potential_to_invalidate(&self, path: &str) -> bool {
        self.registry
            .configs()
            .iter()
            .any(|config| config.matches_invalidation(path))
    }

    #[instrument(skip_all, fields(path = path))]
    pub fn invalidate_cache(&self, path: &str) -> InvalidationOutcome {
        for rule in self.registry.rules().iter() {
            if !rule.on_cache_invalidate(path) {
                record_veto(rule.as_ref(), RuleHook::CacheInvalidate);
                return InvalidationOutcome::Vetoed {
                    rule: rule.name().to_string(),
                };
            }
        }

        let mut invalidated = Vec::new();
        for config in self.registry.configs().iter() {
            if !config.matches_invalidation(path) {
                continue;
            }
            match self.store_for(config) {
                Ok(store) => {
                    store.invalidate_config(config);
                    invalidated.push(config.name().to_string());
                }
                Err(error) => warn!(config = config.name(), error = %error, "skipping invalidation"),
            }
        }
        debug!(configs = invalidated.len(), "content change processed");
        InvalidationOutcome::Invalidated {
            configs: invalidated,
        }
    }

    /// Stats of every registered store, ordered by name.
    pub fn stats(&self) -> Vec<StoreStats> {
        let mut stats: Vec<_> = self.registry.stores().values().map(|s| s.stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::cache::content::CacheContent;
    use crate::cache::http::{BufferedResponse, DirectoryIdentity, RequestSnapshot};
    use crate::cache::mem_store::MemCacheStore;
    use crate::cache::rules::{HandlingRule, StripResponseHeaders};

    struct Veto {
        name: &'static str,
        calls: AtomicUsize,
    }

    impl Veto {
        fn new(name: &'static str) -> Arc<Self> {
            Arc::new(Self {
                name,
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl HandlingRule for Veto {
        fn name(&self) -> &str {
            self.name
        }

        fn on_request_receive(&self, _request: &dyn HttpRequest) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            false
        }

        fn on_cache_invalidate(&self, _path: &str) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            false
        }
    }

    fn engine() -> (CacheEngine, Arc<MemCacheStore>) {
        let registry = Arc::new(CacheRegistry::new());
        let store = Arc::new(MemCacheStore::new("MEM", 1024));
        registry.register_store(store.clone());
        registry.register_config(
            CacheConfig::builder("pages", "MEM")
                .include("/pages/.*")
                .invalidate_on("/content/pages(/.*)?")
                .response_mime_type("text/html")
                .build()
                .unwrap(),
        );
        (
            CacheEngine::new(registry, Arc::new(DirectoryIdentity::new())),
            store,
        )
    }

    #[test]
    fn every_request_rule_runs_even_after_a_veto() {
        let (engine, _) = engine();
        let first = Veto::new("first");
        let second = Veto::new("second");
        engine.registry().register_rule(first.clone());
        engine.registry().register_rule(second.clone());

        let request = RequestSnapshot::get("/pages/home.html");
        assert!(!engine.is_request_cacheable(&request).unwrap());
        assert_eq!(first.calls.load(Ordering::SeqCst), 1);
        assert_eq!(second.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn first_invalidation_veto_stops_the_chain() {
        let (engine, _) = engine();
        let first = Veto::new("first");
        let second = Veto::new("second");
        engine.registry().register_rule(first.clone());
        engine.registry().register_rule(second.clone());

        let outcome = engine.invalidate_cache("/content/pages/home");
        assert_eq!(
            outcome,
            InvalidationOutcome::Vetoed {
                rule: "first".into()
            }
        );
        assert_eq!(second.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn capture_then_deliver() {
        let (engine, store) = engine();
        engine
            .registry()
            .register_rule(Arc::new(StripResponseHeaders::default()));
        let request = RequestSnapshot::get("/pages/home.html");
        let config = engine.get_cache_config(&request).unwrap().unwrap();
        assert!(!engine.is_cache_hit(&request, &config).unwrap());

        let mut live = BufferedResponse::new();
        let mut capture = engine.wrap_response(&request, &mut live, &config).unwrap();
        capture.add_header("Set-Cookie", "session=1");
        capture.add_header("ETag", "\"v1\"");
        capture.write_bytes(b"<h1>home</h1>").unwrap();
        assert!(engine.cache_response(&request, capture, &config).unwrap());
        assert_eq!(live.body(), b"<h1>home</h1>");
        assert_eq!(store.size(), 1);

        assert!(engine.is_cache_hit(&request, &config).unwrap());
        let mut replay = BufferedResponse::new();
        assert!(engine
            .deliver_cache_content(&request, &mut replay, &config)
            .unwrap());
        assert_eq!(replay.body(), b"<h1>home</h1>");
        assert_eq!(replay.content_type(), Some("text/html"));
        assert_eq!(replay.header("etag").as_deref(), Some("\"v1\""));
        assert_eq!(replay.header("set-cookie"), None);
    }

    #[test]
    #[should_panic(expected = "handed to cache_response")]
    fn foreign_capture_is_a_programming_error() {
        let (engine, _) = engine();
        let home = RequestSnapshot::get("/pages/home.html");
        let about = RequestSnapshot::get("/pages/about.html");
        let config = engine.get_cache_config(&home).unwrap().unwrap();

        let mut live = BufferedResponse::new();
        let capture = engine.wrap_response(&home, &mut live, &config).unwrap();
        let _ = engine.cache_response(&about, capture, &config);
    }

    #[test]
    fn missing_store_is_a_persistence_error() {
        let registry = Arc::new(CacheRegistry::new());
        let config = registry.register_config(
            CacheConfig::builder("pages", "DISK")
                .include("/pages/.*")
                .build()
                .unwrap(),
        );
        let engine = CacheEngine::new(registry, Arc::new(DirectoryIdentity::new()));
        let request = RequestSnapshot::get("/pages/home.html");

        let error = engine.is_cache_hit(&request, &config).unwrap_err();
        assert!(matches!(error, CacheError::Persistence { store } if store == "DISK"));
    }

    #[test]
    fn invalidation_reaches_matching_configs_only() {
        let (engine, store) = engine();
        let config = engine.registry().config("pages").unwrap();
        let key = CacheKey::for_uri("/pages/home.html", &config).unwrap();
        store.put(key.clone(), CacheContent::new(200, "home")).unwrap();

        assert!(!engine.is_path_potential_to_invalidate("/content/news"));
        let untouched = engine.invalidate_cache("/content/news");
        assert_eq!(untouched, InvalidationOutcome::Invalidated { configs: vec![] });
        assert!(store.contains(&key));

        assert!(engine.is_path_potential_to_invalidate("/content/pages/home"));
        let outcome = engine.invalidate_cache("/content/pages/home");
        assert_eq!(
            outcome,
            InvalidationOutcome::Invalidated {
                configs: vec!["pages".into()]
            }
        );
        assert!(!store.contains(&key));
    }
}
