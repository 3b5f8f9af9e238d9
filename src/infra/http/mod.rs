mod admin;
mod middleware;
mod public;

use std::sync::Arc;

use axum::{Router, http::HeaderName, middleware as axum_middleware};

use crate::cache::{CacheEngine, CacheState};
use crate::config::ServerSettings;

use super::error::InfraError;
use super::site::SiteRoot;

pub use middleware::RemoteUserHeader;

#[derive(Clone)]
pub struct RouterState {
    pub engine: Arc<CacheEngine>,
    pub site: Arc<SiteRoot>,
}

/// Assemble the full application router: cached site files plus the
/// `/_cache` endpoints.
pub fn build_router(
    settings: &ServerSettings,
    engine: Arc<CacheEngine>,
) -> Result<Router, InfraError> {
    let state = RouterState {
        engine: engine.clone(),
        site: Arc::new(SiteRoot::new(settings.root.clone())),
    };
    let cache = CacheState {
        engine,
        body_limit: settings.body_limit_bytes,
    };

    let router = public::build_public_router(cache)
        .merge(admin::build_admin_router())
        .with_state(state);

    let router = match settings.remote_user_header.as_deref() {
        Some(name) => {
            let header = HeaderName::try_from(name).map_err(|err| {
                InfraError::server(format!("invalid remote user header `{name}`: {err}"))
            })?;
            router.layer(axum_middleware::from_fn_with_state(
                RemoteUserHeader(header),
                middleware::extract_remote_user,
            ))
        }
        None => router,
    };

    Ok(router.layer(axum_middleware::from_fn(middleware::log_responses)))
}
