//! In-process store.
//!
//! Entries live in a sharded [`DashMap`], so fills and lookups of different
//! keys only contend when they hash to the same shard. Weight is tracked in an
//! atomic counter and enforced after every `put` by evicting the least
//! recently accessed entries. Expiry is lazy: expired entries are hidden
//! immediately and reclaimed on the next lookup, put or eviction pass.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use metrics::{counter, gauge};
use tracing::{debug, instrument, warn};

use super::config::CacheConfig;
use super::content::CacheContent;
use super::error::CacheError;
use super::keys::{CacheKey, ExpiryOverrides};
use super::sink::{SpillMedium, TempSink};
use super::store::{
    CacheStore, Clock, EntryStats, PayloadWeigher, StoreStats, SystemClock, Weigher,
};

const METRIC_HIT: &str = "httpcache_hit_total";
const METRIC_MISS: &str = "httpcache_miss_total";
const METRIC_EVICT: &str = "httpcache_evict_total";
const METRIC_EXPIRED: &str = "httpcache_expired_total";
const METRIC_INVALIDATE: &str = "httpcache_invalidate_total";
const METRIC_FALLBACK: &str = "httpcache_invalidate_all_fallback_total";
const METRIC_WEIGHT: &str = "httpcache_store_weight_bytes";

struct StoredEntry {
    content: CacheContent,
    weight: u64,
    expiry: ExpiryOverrides,
    expires_at: Option<Instant>,
    hits: u64,
    last_access: u64,
}

impl StoredEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| deadline <= now)
    }
}

pub struct MemCacheStore {
    name: String,
    entries: DashMap<CacheKey, StoredEntry>,
    max_weight: u64,
    default_ttl: Option<Duration>,
    weigher: Box<dyn Weigher>,
    clock: Arc<dyn Clock>,
    spill: SpillMedium,
    total_weight: AtomicU64,
    tick: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl MemCacheStore {
    /// Store bounded at `max_weight_bytes`, payload-weighted, never expiring
    /// by default, spilling captures to memory.
    pub fn new(name: impl Into<String>, max_weight_bytes: u64) -> Self {
        Self {
            name: name.into(),
            entries: DashMap::new(),
            max_weight: max_weight_bytes,
            default_ttl: None,
            weigher: Box::new(PayloadWeigher),
            clock: Arc::new(SystemClock),
            spill: SpillMedium::Memory,
            total_weight: AtomicU64::new(0),
            tick: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// `None` keeps entries until evicted or invalidated.
    pub fn with_default_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.default_ttl = ttl.filter(|ttl| !ttl.is_zero());
        self
    }

    pub fn with_weigher(mut self, weigher: impl Weigher + 'static) -> Self {
        self.weigher = Box::new(weigher);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_spill(mut self, spill: SpillMedium) -> Self {
        self.spill = spill;
        self
    }

    pub fn total_weight(&self) -> u64 {
        self.total_weight.load(Ordering::SeqCst)
    }

    pub fn max_weight(&self) -> u64 {
        self.max_weight
    }

    /// Hit count of one entry, `None` when absent.
    pub fn hit_count(&self, key: &CacheKey) -> Option<u64> {
        self.entries.get(key).map(|entry| entry.hits)
    }

    fn next_tick(&self) -> u64 {
        self.tick.fetch_add(1, Ordering::SeqCst)
    }

    fn deadline(&self, now: Instant, ttl: Option<Duration>) -> Option<Instant> {
        ttl.or(self.default_ttl).map(|ttl| now + ttl)
    }

    fn release_weight(&self, freed: u64) {
        if freed > 0 {
            self.total_weight.fetch_sub(freed, Ordering::SeqCst);
        }
        gauge!(METRIC_WEIGHT, "store" => self.name.clone()).set(self.total_weight() as f64);
    }

    /// Remove every entry matching `predicate`. Returns the number removed.
    fn remove_where(&self, mut predicate: impl FnMut(&CacheKey, &StoredEntry) -> bool) -> usize {
        let mut removed = 0;
        let mut freed = 0;
        self.entries.retain(|key, entry| {
            if predicate(key, entry) {
                removed += 1;
                freed += entry.weight;
                false
            } else {
                true
            }
        });
        self.release_weight(freed);
        removed
    }

    fn purge_expired(&self, now: Instant) -> usize {
        let purged = self.remove_where(|_, entry| entry.is_expired(now));
        if purged > 0 {
            counter!(METRIC_EXPIRED, "store" => self.name.clone()).increment(purged as u64);
        }
        purged
    }

    /// Evict least recently accessed entries until the weight bound holds.
    /// `protected` (the entry just written) goes last.
    fn enforce_weight(&self, protected: &CacheKey) {
        if self.total_weight() <= self.max_weight {
            return;
        }
        self.purge_expired(self.clock.now());
        if self.total_weight() <= self.max_weight {
            return;
        }

        let mut candidates: Vec<(CacheKey, u64)> = self
            .entries
            .iter()
            .filter(|entry| entry.key() != protected)
            .map(|entry| (entry.key().clone(), entry.last_access))
            .collect();
        candidates.sort_by_key(|(_, last_access)| *last_access);

        let mut evicted = 0u64;
        for (key, _) in candidates {
            if self.total_weight() <= self.max_weight {
                break;
            }
            if let Some((_, entry)) = self.entries.remove(&key) {
                self.release_weight(entry.weight);
                evicted += 1;
                debug!(store = %self.name, key = %key, weight = entry.weight, "evicted cache entry");
            }
        }

        if self.total_weight() > self.max_weight
            && let Some((_, entry)) = self.entries.remove(protected)
        {
            self.release_weight(entry.weight);
            evicted += 1;
        }

        if evicted > 0 {
            self.evictions.fetch_add(evicted, Ordering::SeqCst);
            counter!(METRIC_EVICT, "store" => self.name.clone()).increment(evicted);
        }
    }
}

impl CacheStore for MemCacheStore {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip_all, fields(store = %self.name, key = %key))]
    fn put(&self, key: CacheKey, content: CacheContent) -> Result<(), CacheError> {
        let weight = self.weigher.weigh(&key, &content);
        if weight > self.max_weight {
            debug!(
                weight,
                max_weight = self.max_weight,
                "entry heavier than the store bound, not cached"
            );
            if let Some((_, stale)) = self.entries.remove(&key) {
                self.release_weight(stale.weight);
            }
            return Ok(());
        }

        let now = self.clock.now();
        let last_access = self.next_tick();
        let expiry = key.expiry();
        let protected = key.clone();

        match self.entries.entry(key) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                let previous = entry.weight;
                entry.content = content;
                entry.weight = weight;
                entry.expiry = expiry;
                entry.expires_at = self.deadline(now, expiry.on_update());
                entry.hits = 0;
                entry.last_access = last_access;
                self.total_weight.fetch_add(weight, Ordering::SeqCst);
                self.total_weight.fetch_sub(previous, Ordering::SeqCst);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(StoredEntry {
                    content,
                    weight,
                    expiry,
                    expires_at: self.deadline(now, expiry.on_create()),
                    hits: 0,
                    last_access,
                });
                self.total_weight.fetch_add(weight, Ordering::SeqCst);
            }
        }

        self.enforce_weight(&protected);
        gauge!(METRIC_WEIGHT, "store" => self.name.clone()).set(self.total_weight() as f64);
        Ok(())
    }

    fn contains(&self, key: &CacheKey) -> bool {
        let now = self.clock.now();
        self.entries
            .get(key)
            .is_some_and(|entry| !entry.is_expired(now))
    }

    fn get_if_present(&self, key: &CacheKey) -> Option<CacheContent> {
        let now = self.clock.now();
        let tick = self.next_tick();
        let mut expired = false;

        let found = match self.entries.get_mut(key) {
            Some(mut entry) if !entry.is_expired(now) => {
                entry.hits += 1;
                entry.last_access = tick;
                if let Some(ttl) = entry.expiry.on_access() {
                    entry.expires_at = Some(now + ttl);
                }
                Some(entry.content.clone())
            }
            Some(_) => {
                expired = true;
                None
            }
            None => None,
        };

        if expired
            && let Some((_, entry)) = self.entries.remove_if(key, |_, entry| entry.is_expired(now))
        {
            self.release_weight(entry.weight);
            counter!(METRIC_EXPIRED, "store" => self.name.clone()).increment(1);
        }

        if found.is_some() {
            self.hits.fetch_add(1, Ordering::SeqCst);
            counter!(METRIC_HIT, "store" => self.name.clone()).increment(1);
        } else {
            self.misses.fetch_add(1, Ordering::SeqCst);
            counter!(METRIC_MISS, "store" => self.name.clone()).increment(1);
        }
        found
    }

    fn invalidate_key(&self, key: &CacheKey) {
        let removed = self.remove_where(|candidate, _| candidate.is_invalidated_by(key));
        counter!(METRIC_INVALIDATE, "store" => self.name.clone()).increment(removed as u64);
        debug!(store = %self.name, key = %key, removed, "invalidated by key");
    }

    #[instrument(skip_all, fields(store = %self.name, config = %config.name()))]
    fn invalidate_config(&self, config: &CacheConfig) {
        let mut unclassified: Option<(CacheKey, CacheError)> = None;
        let removed = self.remove_where(|key, _| match config.knows(key) {
            Ok(known) => known,
            Err(error) => {
                if unclassified.is_none() {
                    unclassified = Some((key.clone(), error));
                }
                false
            }
        });
        counter!(METRIC_INVALIDATE, "store" => self.name.clone()).increment(removed as u64);

        if let Some((key, error)) = unclassified {
            warn!(
                key = %key,
                error = %error,
                "could not classify cache entry, clearing the whole store"
            );
            counter!(METRIC_FALLBACK, "store" => self.name.clone()).increment(1);
            self.invalidate_all();
            return;
        }
        debug!(removed, "invalidated by config");
    }

    fn invalidate_all(&self) {
        let removed = self.remove_where(|_, _| true);
        if removed > 0 {
            counter!(METRIC_INVALIDATE, "store" => self.name.clone()).increment(removed as u64);
            debug!(store = %self.name, removed, "invalidated all entries");
        }
    }

    fn size(&self) -> usize {
        self.entries.len()
    }

    fn create_temp_sink(&self) -> Result<Box<dyn TempSink>, CacheError> {
        Ok(self.spill.create()?)
    }

    fn stats(&self) -> StoreStats {
        let now = self.clock.now();
        let entry_stats = self
            .entries
            .iter()
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| {
                let (key, stored) = entry.pair();
                EntryStats {
                    uri: key.uri().to_string(),
                    config: key.config_name().to_string(),
                    fingerprint: key.fingerprint(),
                    status: stored.content.status(),
                    size_bytes: stored.content.payload_len() as u64,
                    content_type: stored.content.content_type().map(str::to_string),
                    character_encoding: stored.content.character_encoding().map(str::to_string),
                    hits: stored.hits,
                    bytes_served: stored.hits * stored.content.payload_len() as u64,
                    expires_in_ms: stored
                        .expires_at
                        .map(|deadline| deadline.saturating_duration_since(now).as_millis() as u64),
                }
            })
            .collect::<Vec<_>>();

        StoreStats {
            name: self.name.clone(),
            entries: entry_stats.len(),
            total_weight_bytes: self.total_weight(),
            max_weight_bytes: self.max_weight,
            default_ttl_seconds: self.default_ttl.map(|ttl| ttl.as_secs()),
            hits: self.hits.load(Ordering::SeqCst),
            misses: self.misses.load(Ordering::SeqCst),
            evictions: self.evictions.load(Ordering::SeqCst),
            entry_stats,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::cache::config::KeyFacet;
    use crate::cache::store::ManualClock;

    fn config(name: &str) -> CacheConfig {
        CacheConfig::builder(name, "MEM")
            .include(format!("/{name}/.*"))
            .build()
            .unwrap()
    }

    fn key(config: &CacheConfig, uri: &str) -> CacheKey {
        CacheKey::for_uri(uri, config).unwrap()
    }

    fn content(body: &str) -> CacheContent {
        CacheContent::new(200, body.to_string())
            .with_content_type("application/json")
            .with_character_encoding("utf-8")
            .with_header("Vary", "Accept")
    }

    fn store_with_clock(ttl: Option<Duration>) -> (MemCacheStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let store = MemCacheStore::new("MEM", 1024)
            .with_default_ttl(ttl)
            .with_clock(clock.clone());
        (store, clock)
    }

    #[test]
    fn put_then_get_round_trips_and_counts_hits() {
        let store = MemCacheStore::new("MEM", 1024);
        let products = config("products");
        let key = key(&products, "/products/42.json");
        let original = content("{\"id\":42}");

        store.put(key.clone(), original.clone()).unwrap();

        let first = store.get_if_present(&key).expect("cached");
        assert_eq!(first, original);
        assert_eq!(store.hit_count(&key), Some(1));

        let second = store.get_if_present(&key).expect("cached");
        assert_eq!(second.payload(), original.payload());
        assert_eq!(store.hit_count(&key), Some(2));

        assert!(store.contains(&key));
        assert_eq!(store.hit_count(&key), Some(2));
    }

    #[test]
    fn put_overwrites_existing_entry() {
        let store = MemCacheStore::new("MEM", 1024);
        let products = config("products");
        let key = key(&products, "/products/42.json");

        store.put(key.clone(), content("old")).unwrap();
        store.put(key.clone(), content("newer")).unwrap();

        assert_eq!(store.size(), 1);
        assert_eq!(store.total_weight(), 5);
        assert_eq!(store.get_if_present(&key).unwrap().payload(), "newer");
    }

    #[test]
    fn creation_override_beats_store_default() {
        let (store, clock) = store_with_clock(Some(Duration::from_secs(3600)));
        let products = config("products");
        let short = key(&products, "/products/1.json").with_expiry(ExpiryOverrides {
            on_create: Some(Duration::from_secs(5)),
            ..Default::default()
        });
        let default = key(&products, "/products/2.json");

        store.put(short.clone(), content("a")).unwrap();
        store.put(default.clone(), content("b")).unwrap();

        clock.advance(Duration::from_secs(6));
        assert!(!store.contains(&short));
        assert!(store.contains(&default));
        assert!(store.get_if_present(&short).is_none());
        assert_eq!(store.size(), 1);
    }

    #[test]
    fn unbounded_default_never_expires() {
        let (store, clock) = store_with_clock(None);
        let products = config("products");
        let key = key(&products, "/products/1.json");

        store.put(key.clone(), content("a")).unwrap();
        clock.advance(Duration::from_secs(60 * 60 * 24 * 365));
        assert!(store.contains(&key));
    }

    #[test]
    fn creation_override_under_unbounded_default() {
        let (store, clock) = store_with_clock(None);
        let products = config("products");
        let key = key(&products, "/products/1.json").with_expiry(ExpiryOverrides {
            on_create: Some(Duration::from_secs(10)),
            ..Default::default()
        });

        store.put(key.clone(), content("a")).unwrap();
        clock.advance(Duration::from_secs(9));
        assert!(store.contains(&key));
        clock.advance(Duration::from_secs(2));
        assert!(!store.contains(&key));
    }

    #[test]
    fn update_override_applies_on_overwrite() {
        let (store, clock) = store_with_clock(Some(Duration::from_secs(100)));
        let products = config("products");
        let key = key(&products, "/products/1.json").with_expiry(ExpiryOverrides {
            on_update: Some(Duration::from_secs(3)),
            ..Default::default()
        });

        store.put(key.clone(), content("a")).unwrap();
        clock.advance(Duration::from_secs(50));
        assert!(store.contains(&key));

        store.put(key.clone(), content("b")).unwrap();
        clock.advance(Duration::from_secs(4));
        assert!(!store.contains(&key));
    }

    #[test]
    fn access_override_extends_deadline() {
        let (store, clock) = store_with_clock(Some(Duration::from_secs(10)));
        let products = config("products");
        let key = key(&products, "/products/1.json").with_expiry(ExpiryOverrides {
            on_access: Some(Duration::from_secs(30)),
            ..Default::default()
        });

        store.put(key.clone(), content("a")).unwrap();
        clock.advance(Duration::from_secs(8));
        assert!(store.get_if_present(&key).is_some());
        clock.advance(Duration::from_secs(20));
        assert!(store.contains(&key));
        clock.advance(Duration::from_secs(11));
        assert!(!store.contains(&key));
    }

    #[test]
    fn weight_bound_holds_after_every_put() {
        let store = MemCacheStore::new("MEM", 10);
        let products = config("products");

        for id in 0..20 {
            store
                .put(key(&products, &format!("/products/{id}.json")), content("abcd"))
                .unwrap();
            assert!(store.total_weight() <= 10);
        }
        assert_eq!(store.size(), 2);
        assert_eq!(store.stats().evictions, 18);
    }

    #[test]
    fn eviction_prefers_least_recently_accessed() {
        let store = MemCacheStore::new("MEM", 12);
        let products = config("products");
        let first = key(&products, "/products/1.json");
        let second = key(&products, "/products/2.json");
        let third = key(&products, "/products/3.json");
        let fourth = key(&products, "/products/4.json");

        store.put(first.clone(), content("aaaa")).unwrap();
        store.put(second.clone(), content("bbbb")).unwrap();
        store.put(third.clone(), content("cccc")).unwrap();
        assert!(store.get_if_present(&first).is_some());

        store.put(fourth.clone(), content("dddd")).unwrap();

        assert!(store.contains(&first));
        assert!(!store.contains(&second));
        assert!(store.contains(&third));
        assert!(store.contains(&fourth));
    }

    #[test]
    fn oversized_entry_is_not_stored() {
        let store = MemCacheStore::new("MEM", 4);
        let products = config("products");
        let key = key(&products, "/products/1.json");

        store.put(key.clone(), content("tiny")).unwrap();
        store.put(key.clone(), content("far too large")).unwrap();

        assert!(!store.contains(&key));
        assert_eq!(store.total_weight(), 0);
    }

    #[test]
    fn custom_weigher_drives_the_bound() {
        let store = MemCacheStore::new("MEM", 100).with_weigher(|_: &CacheKey, _: &CacheContent| 40_u64);
        let products = config("products");
        for id in 0..3 {
            store
                .put(key(&products, &format!("/products/{id}.json")), content("x"))
                .unwrap();
        }
        assert_eq!(store.size(), 2);
        assert_eq!(store.total_weight(), 80);
    }

    #[test]
    fn invalidate_key_removes_variants_and_descendants() {
        let store = MemCacheStore::new("MEM", 1024);
        let pages = config("content");

        let page = key(&pages, "/content/site/page.html");
        let variant = key(&pages, "/content/site/page.mobile.html");
        let child = key(&pages, "/content/site/page/child.html");
        let other = key(&pages, "/content/site/other.html");
        for key in [&page, &variant, &child, &other] {
            store.put(key.clone(), content("x")).unwrap();
        }

        store.invalidate_key(&key(&pages, "/content/site/page.json"));

        assert!(!store.contains(&page));
        assert!(!store.contains(&variant));
        assert!(!store.contains(&child));
        assert!(store.contains(&other));
        assert_eq!(store.total_weight(), 1);
    }

    #[test]
    fn invalidate_config_leaves_other_configs_alone() {
        let store = MemCacheStore::new("MEM", 1024);
        let products = config("products");
        let news = config("news");
        let product_key = key(&products, "/products/1.json");
        let news_key = key(&news, "/news/today.html");

        store.put(product_key.clone(), content("p")).unwrap();
        store.put(news_key.clone(), content("n")).unwrap();
        store.invalidate_config(&products);

        assert!(!store.contains(&product_key));
        assert!(store.contains(&news_key));
    }

    #[test]
    fn invalidate_config_spares_overlapping_configs() {
        let store = MemCacheStore::new("MEM", 1024);
        let pages = config("pages");
        let news = CacheConfig::builder("news", "MEM")
            .include("/pages/news/.*")
            .build()
            .unwrap();
        let page_key = key(&pages, "/pages/news/today.html");
        let news_key = key(&news, "/pages/news/today.html");

        store.put(page_key.clone(), content("p")).unwrap();
        store.put(news_key.clone(), content("n")).unwrap();
        store.invalidate_config(&pages);

        assert!(!store.contains(&page_key));
        assert!(store.contains(&news_key));
        assert_eq!(store.total_weight(), 1);
    }

    #[test]
    fn unclassifiable_entry_falls_back_to_clearing_everything() {
        let store = MemCacheStore::new("MEM", 1024);
        let before = CacheConfig::builder("products", "MEM")
            .include("/products/.*")
            .build()
            .unwrap();
        let news = config("news");
        store
            .put(key(&before, "/products/1.json"), content("p"))
            .unwrap();
        store.put(key(&news, "/news/today.html"), content("n")).unwrap();

        let reconfigured = CacheConfig::builder("products", "MEM")
            .include("/products/.*")
            .facet(KeyFacet::Header("X-Country".into()))
            .build()
            .unwrap();
        store.invalidate_config(&reconfigured);

        assert_eq!(store.size(), 0);
        assert_eq!(store.total_weight(), 0);
    }

    #[test]
    fn invalidate_all_is_idempotent() {
        let store = MemCacheStore::new("MEM", 1024);
        let products = config("products");
        store.put(key(&products, "/products/1.json"), content("a")).unwrap();
        store.put(key(&products, "/products/2.json"), content("b")).unwrap();

        store.invalidate_all();
        assert_eq!(store.size(), 0);
        store.invalidate_all();
        assert_eq!(store.size(), 0);
        assert_eq!(store.total_weight(), 0);
    }

    #[test]
    fn concurrent_fills_of_different_keys_all_land() {
        let store = MemCacheStore::new("MEM", 1024 * 1024);
        let products = config("products");

        thread::scope(|scope| {
            for worker in 0..8 {
                let store = &store;
                let products = &products;
                scope.spawn(move || {
                    for id in 0..50 {
                        let uri = format!("/products/{worker}-{id}.json");
                        store.put(key(products, &uri), content("abc")).unwrap();
                        assert!(store.get_if_present(&key(products, &uri)).is_some());
                    }
                });
            }
        });

        assert_eq!(store.size(), 400);
        assert_eq!(store.total_weight(), 1200);
    }

    #[test]
    fn stats_describe_every_entry() {
        let store = MemCacheStore::new("MEM", 1024).with_default_ttl(Some(Duration::from_secs(60)));
        let products = config("products");
        let key = key(&products, "/products/1.json");
        store.put(key.clone(), content("abcd")).unwrap();
        store.get_if_present(&key);
        store.get_if_present(&key);
        let missing = CacheKey::for_uri("/products/2.json", &products).unwrap();
        store.get_if_present(&missing);

        let stats = store.stats();
        assert_eq!(stats.name, "MEM");
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.default_ttl_seconds, Some(60));

        let entry = &stats.entry_stats[0];
        assert_eq!(entry.uri, "/products/1.json");
        assert_eq!(entry.config, "products");
        assert_eq!(entry.status, 200);
        assert_eq!(entry.size_bytes, 4);
        assert_eq!(entry.content_type.as_deref(), Some("application/json"));
        assert_eq!(entry.character_encoding.as_deref(), Some("utf-8"));
        assert_eq!(entry.hits, 2);
        assert_eq!(entry.bytes_served, 8);
        assert_eq!(entry.fingerprint, key.fingerprint());
    }
}
