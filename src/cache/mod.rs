//! HTTP Response Cache
//!
//! Captures rendered responses and serves them again for equivalent requests:
//!
//! - **Configs** decide which requests are cacheable and how keys are built
//! - **Stores** hold captured content under a weight bound with expiry
//! - **Rules** can veto caching, delivery and invalidation at fixed hooks
//!
//! [`CacheEngine`] orchestrates the flow; [`response_cache_layer`] runs it
//! around an axum handler.

mod capture;
mod config;
mod content;
mod engine;
mod error;
mod http;
mod keys;
mod lock;
mod mem_store;
mod middleware;
mod registry;
mod resolver;
mod rules;
mod sink;
mod store;

pub use capture::ResponseCapture;
pub use config::{AuthRequirement, CacheConfig, CacheConfigBuilder, KeyFacet, Pattern};
pub use content::{CacheContent, WriteMode};
pub use engine::{CacheEngine, InvalidationOutcome};
pub use error::CacheError;
pub use http::{
    BufferedResponse, DirectoryIdentity, HttpRequest, HttpResponse, IdentityProvider,
    RequestPathInfo, RequestSnapshot, split_content_type,
};
pub use keys::{CacheKey, ExpiryOverrides};
pub use mem_store::MemCacheStore;
pub use middleware::{CacheState, RemoteUser, request_view, response_cache_layer};
pub use registry::{CacheRegistry, ConfigSnapshot, RuleSnapshot, StoreSnapshot};
pub use resolver::CacheConfigResolver;
pub use rules::{
    CACHE_MARKER_HEADER, CacheOnlyGetRequest, CacheOnlyResponse200, HandlingRule,
    HonorCacheControlHeaders, MarkResponseAsCacheDelivered, RuleHook, StripResponseHeaders,
};
pub use sink::{FileTempSink, MemTempSink, SpillMedium, TempSink};
pub use store::{
    CacheStore, Clock, EntryStats, ManualClock, PayloadWeigher, StoreStats, SystemClock, Weigher,
};
