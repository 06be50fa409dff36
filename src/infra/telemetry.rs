use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::cache::{
    METRIC_CACHE_HIT, METRIC_CACHE_INVALIDATED, METRIC_CACHE_MISS, METRIC_CACHE_STALE,
    METRIC_CACHE_WRITE_FAILED, METRIC_FETCH_COALESCED, METRIC_FETCH_MS,
};
use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber. Logs go to stderr so command output
/// on stdout stays machine-readable.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_current_span(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_writer(std::io::stderr)
            .with_target(false)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| InfraError::telemetry(format!("failed to install tracing subscriber: {err}")))
}

/// Register descriptions for every metric the cache layer emits.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(METRIC_CACHE_HIT, Unit::Count, "Cache reads served from storage.");
        describe_counter!(METRIC_CACHE_MISS, Unit::Count, "Cache reads that found nothing usable.");
        describe_counter!(
            METRIC_CACHE_STALE,
            Unit::Count,
            "Entries discarded on read for expiry or version mismatch."
        );
        describe_counter!(
            METRIC_CACHE_WRITE_FAILED,
            Unit::Count,
            "Cache writes rejected by the backend."
        );
        describe_counter!(
            METRIC_CACHE_INVALIDATED,
            Unit::Count,
            "Entries removed by prefix invalidation or clearing."
        );
        describe_counter!(
            METRIC_FETCH_COALESCED,
            Unit::Count,
            "Callers that joined a fetch already in flight."
        );
        describe_histogram!(
            METRIC_FETCH_MS,
            Unit::Milliseconds,
            "Latency of fetches started on a cache miss."
        );
    });
}
