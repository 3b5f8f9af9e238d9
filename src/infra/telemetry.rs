use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

/// Register descriptions for every metric the cache emits. Idempotent.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "httpcache_hit_total",
            Unit::Count,
            "Lookups answered from a cache store."
        );
        describe_counter!(
            "httpcache_miss_total",
            Unit::Count,
            "Lookups that found no live entry."
        );
        describe_counter!(
            "httpcache_evict_total",
            Unit::Count,
            "Entries evicted to keep a store under its weight bound."
        );
        describe_counter!(
            "httpcache_expired_total",
            Unit::Count,
            "Expired entries reclaimed."
        );
        describe_counter!(
            "httpcache_invalidate_total",
            Unit::Count,
            "Entries removed by invalidation."
        );
        describe_counter!(
            "httpcache_invalidate_all_fallback_total",
            Unit::Count,
            "Config invalidations that fell back to clearing the whole store."
        );
        describe_counter!(
            "httpcache_rule_veto_total",
            Unit::Count,
            "Vetoes issued by handling rules, by rule and hook."
        );
        describe_gauge!(
            "httpcache_store_weight_bytes",
            Unit::Bytes,
            "Cumulative weight of the entries held by a store."
        );
    });
}
