//! Store contract shared by every cache backend.
//!
//! A store maps [`CacheKey`] to [`CacheContent`], bounded by a cumulative
//! weight and expired by a default TTL that keys may override.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;

use super::config::CacheConfig;
use super::content::CacheContent;
use super::error::CacheError;
use super::keys::CacheKey;
use super::lock::mutex_lock;
use super::sink::TempSink;

const SOURCE: &str = "cache::store";

pub trait CacheStore: Send + Sync {
    /// Name configs use to address this store.
    fn name(&self) -> &str;

    /// Insert or overwrite the entry for `key`.
    fn put(&self, key: CacheKey, content: CacheContent) -> Result<(), CacheError>;

    /// Existence check without touching hit counters or expiry.
    fn contains(&self, key: &CacheKey) -> bool;

    /// Fresh snapshot of the entry; counts exactly one hit.
    fn get_if_present(&self, key: &CacheKey) -> Option<CacheContent>;

    /// Remove every entry `k` where `k.is_invalidated_by(key)`.
    fn invalidate_key(&self, key: &CacheKey);

    /// Remove every entry `config` knows. Falls back to
    /// [`invalidate_all`](CacheStore::invalidate_all) when any entry cannot be classified.
    fn invalidate_config(&self, config: &CacheConfig);

    fn invalidate_all(&self);

    /// Number of live entries.
    fn size(&self) -> usize;

    /// Scratch destination for one response capture.
    fn create_temp_sink(&self) -> Result<Box<dyn TempSink>, CacheError>;

    fn stats(&self) -> StoreStats;
}

/// Eviction cost of one entry.
pub trait Weigher: Send + Sync {
    fn weigh(&self, key: &CacheKey, content: &CacheContent) -> u64;
}

impl<F> Weigher for F
where
    F: Fn(&CacheKey, &CacheContent) -> u64 + Send + Sync,
{
    fn weigh(&self, key: &CacheKey, content: &CacheContent) -> u64 {
        self(key, content)
    }
}

/// Weighs entries by payload size in bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct PayloadWeigher;

impl Weigher for PayloadWeigher {
    fn weigh(&self, _key: &CacheKey, content: &CacheContent) -> u64 {
        content.payload_len() as u64
    }
}

/// Time source for expiry decisions.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        *mutex_lock(&self.offset, SOURCE, "manual_clock.advance") += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + *mutex_lock(&self.offset, SOURCE, "manual_clock.now")
    }
}

/// Read-only view of a store for monitoring.
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub name: String,
    pub entries: usize,
    pub total_weight_bytes: u64,
    pub max_weight_bytes: u64,
    /// `None` when entries never expire by default.
    pub default_ttl_seconds: Option<u64>,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entry_stats: Vec<EntryStats>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EntryStats {
    pub uri: String,
    pub config: String,
    pub fingerprint: String,
    pub status: u16,
    pub size_bytes: u64,
    pub content_type: Option<String>,
    pub character_encoding: Option<String>,
    /// Snapshot reads. A read whose delivery a rule vetoed still counts.
    pub hits: u64,
    /// `hits` times the payload size, an upper bound on bytes delivered.
    pub bytes_served: u64,
    pub expires_in_ms: Option<u64>,
}
