//! Builds the cache engine from resolved settings.

use std::sync::Arc;

use tracing::{info, warn};

use crate::cache::{
    CacheEngine, CacheOnlyGetRequest, CacheOnlyResponse200, CacheRegistry, DirectoryIdentity,
    HandlingRule, HonorCacheControlHeaders, MarkResponseAsCacheDelivered, MemCacheStore,
    StripResponseHeaders,
};
use crate::config::{RuleSettings, Settings, StoreSettings};

pub fn build_engine(settings: &Settings) -> Arc<CacheEngine> {
    let registry = Arc::new(CacheRegistry::new());

    for store in &settings.stores {
        registry.register_store(Arc::new(build_store(store)));
    }
    for rule in &settings.rules {
        registry.register_rule(build_rule(rule));
    }
    for config in &settings.configs {
        if registry.store(config.store()).is_none() {
            warn!(
                config = config.name(),
                store = config.store(),
                "cache config targets an unknown store, its requests will be served live"
            );
        }
        registry.register_config(config.clone());
    }

    let identity = settings
        .identity
        .users
        .iter()
        .fold(DirectoryIdentity::new(), |directory, (user, groups)| {
            directory.with_user(user.clone(), groups.iter().cloned())
        });

    info!(
        stores = settings.stores.len(),
        configs = settings.configs.len(),
        rules = settings.rules.len(),
        "cache engine ready"
    );
    Arc::new(CacheEngine::new(registry, Arc::new(identity)))
}

fn build_store(settings: &StoreSettings) -> MemCacheStore {
    MemCacheStore::new(settings.name.clone(), settings.max_weight_bytes.get())
        .with_default_ttl(settings.default_ttl)
        .with_spill(settings.spill.clone())
}

fn build_rule(settings: &RuleSettings) -> Arc<dyn HandlingRule> {
    match settings {
        RuleSettings::CacheOnlyGetRequest => Arc::new(CacheOnlyGetRequest),
        RuleSettings::CacheOnlyResponse200 => Arc::new(CacheOnlyResponse200),
        RuleSettings::HonorCacheControlHeaders => Arc::new(HonorCacheControlHeaders),
        RuleSettings::MarkResponseAsCacheDelivered => Arc::new(MarkResponseAsCacheDelivered),
        RuleSettings::StripResponseHeaders { headers } => {
            Arc::new(StripResponseHeaders::new(headers.iter().cloned()))
        }
    }
}
