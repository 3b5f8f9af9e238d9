//! Lifecycle-scoped registry of configs, stores and handling rules.
//!
//! Each collection sits behind an `RwLock<Arc<_>>`. Writers copy on write via
//! [`Arc::make_mut`]; readers take a cheap snapshot and iterate it without
//! holding the lock, so a request never observes a half-applied change.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::{info, warn};

use super::config::CacheConfig;
use super::lock::{rw_read, rw_write};
use super::rules::HandlingRule;
use super::store::CacheStore;

const SOURCE: &str = "cache::registry";

pub type ConfigSnapshot = Arc<Vec<Arc<CacheConfig>>>;
pub type StoreSnapshot = Arc<HashMap<String, Arc<dyn CacheStore>>>;
pub type RuleSnapshot = Arc<Vec<Arc<dyn HandlingRule>>>;

#[derive(Default)]
pub struct CacheRegistry {
    configs: RwLock<ConfigSnapshot>,
    stores: RwLock<StoreSnapshot>,
    rules: RwLock<RuleSnapshot>,
}

impl CacheRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Activate `config`. A config with the same name is replaced in place
    /// and its entries are invalidated.
    pub fn register_config(&self, config: CacheConfig) -> Arc<CacheConfig> {
        let config = Arc::new(config);
        let replaced = {
            let mut guard = rw_write(&self.configs, SOURCE, "register_config");
            let configs = Arc::make_mut(&mut *guard);
            match configs.iter_mut().find(|c| c.name() == config.name()) {
                Some(slot) => Some(std::mem::replace(slot, Arc::clone(&config))),
                None => {
                    configs.push(Arc::clone(&config));
                    None
                }
            }
        };

        match replaced {
            Some(previous) => {
                warn!(config = config.name(), "cache config registered twice, replacing");
                self.invalidate_entries_of(&previous);
            }
            None => info!(config = config.name(), store = config.store(), "cache config registered"),
        }
        config
    }

    /// Deactivate a config and drop every entry it owns.
    pub fn unregister_config(&self, name: &str) -> Option<Arc<CacheConfig>> {
        let removed = {
            let mut guard = rw_write(&self.configs, SOURCE, "unregister_config");
            let configs = Arc::make_mut(&mut *guard);
            let index = configs.iter().position(|c| c.name() == name)?;
            configs.remove(index)
        };

        info!(config = name, "cache config unregistered");
        self.invalidate_entries_of(&removed);
        Some(removed)
    }

    fn invalidate_entries_of(&self, config: &CacheConfig) {
        match self.store(config.store()) {
            Some(store) => store.invalidate_config(config),
            None => warn!(
                config = config.name(),
                store = config.store(),
                "cache store not registered, nothing to invalidate"
            ),
        }
    }

    pub fn configs(&self) -> ConfigSnapshot {
        Arc::clone(&rw_read(&self.configs, SOURCE, "configs"))
    }

    pub fn config(&self, name: &str) -> Option<Arc<CacheConfig>> {
        self.configs().iter().find(|c| c.name() == name).cloned()
    }

    pub fn register_store(&self, store: Arc<dyn CacheStore>) {
        let name = store.name().to_string();
        let previous = {
            let mut guard = rw_write(&self.stores, SOURCE, "register_store");
            Arc::make_mut(&mut *guard).insert(name.clone(), store)
        };
        if previous.is_some() {
            warn!(store = %name, "cache store registered twice, replacing");
        } else {
            info!(store = %name, "cache store registered");
        }
    }

    pub fn unregister_store(&self, name: &str) -> Option<Arc<dyn CacheStore>> {
        let mut guard = rw_write(&self.stores, SOURCE, "unregister_store");
        let removed = Arc::make_mut(&mut *guard).remove(name);
        if removed.is_some() {
            info!(store = name, "cache store unregistered");
        }
        removed
    }

    pub fn stores(&self) -> StoreSnapshot {
        Arc::clone(&rw_read(&self.stores, SOURCE, "stores"))
    }

    pub fn store(&self, name: &str) -> Option<Arc<dyn CacheStore>> {
        rw_read(&self.stores, SOURCE, "store").get(name).cloned()
    }

    /// Append `rule`. A rule with the same name keeps its position and is replaced.
    pub fn register_rule(&self, rule: Arc<dyn HandlingRule>) {
        let mut guard = rw_write(&self.rules, SOURCE, "register_rule");
        let rules = Arc::make_mut(&mut *guard);
        match rules.iter_mut().find(|r| r.name() == rule.name()) {
            Some(slot) => {
                warn!(rule = rule.name(), "handling rule registered twice, replacing");
                *slot = rule;
            }
            None => {
                info!(rule = rule.name(), "handling rule registered");
                rules.push(rule);
            }
        }
    }

    pub fn unregister_rule(&self, name: &str) -> bool {
        let mut guard = rw_write(&self.rules, SOURCE, "unregister_rule");
        let rules = Arc::make_mut(&mut *guard);
        let before = rules.len();
        rules.retain(|rule| rule.name() != name);
        before != rules.len()
    }

    pub fn rules(&self) -> RuleSnapshot {
        Arc::clone(&rw_read(&self.rules, SOURCE, "rules"))
    }
}
