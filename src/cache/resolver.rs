//! Matches requests against registered configs.

use std::sync::Arc;

use tracing::debug;

use super::config::CacheConfig;
use super::error::CacheError;
use super::http::{HttpRequest, IdentityProvider};

/// Resolves the single config that applies to a request.
///
/// There is no ranking between configs: when more than one accepts a
/// request, resolution fails with [`CacheError::ConfigConflict`].
pub struct CacheConfigResolver<'a> {
    configs: &'a [Arc<CacheConfig>],
    identity: &'a dyn IdentityProvider,
}

impl<'a> CacheConfigResolver<'a> {
    pub fn new(configs: &'a [Arc<CacheConfig>], identity: &'a dyn IdentityProvider) -> Self {
        Self { configs, identity }
    }

    /// Whether at least one config accepts `request`.
    pub fn is_config_found(&self, request: &dyn HttpRequest) -> Result<bool, CacheError> {
        for config in self.configs {
            if config.accepts(request, self.identity)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn resolve_config(
        &self,
        request: &dyn HttpRequest,
    ) -> Result<Option<Arc<CacheConfig>>, CacheError> {
        let mut matched = Vec::new();
        for config in self.configs {
            if config.accepts(request, self.identity)? {
                matched.push(config);
            }
        }

        match matched.as_slice() {
            [] => Ok(None),
            [config] => {
                debug!(path = request.path(), config = config.name(), "resolved cache config");
                Ok(Some(Arc::clone(config)))
            }
            _ => Err(CacheError::ConfigConflict {
                path: request.path().to_string(),
                configs: matched
                    .iter()
                    .map(|config| config.name().to_string())
                    .collect(),
            }),
        }
    }
}
