use std::sync::Once;

use metrics::{Unit, describe_counter};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::cache::{
    METRIC_CACHE_HIT, METRIC_CACHE_MISS, METRIC_CACHE_NEGATIVE_HIT, METRIC_CACHE_REBUILD_REJECTED,
    METRIC_CACHE_REBUILD_SCHEDULED, METRIC_CACHE_STALE_SERVED, METRIC_REBUILD_COMPLETED,
};
use crate::config::{LogFormat, LoggingSettings};
use crate::seckill::{
    METRIC_ORDERS_FINALIZED, METRIC_PERSISTER_POISON, METRIC_SECKILL_ADMITTED,
    METRIC_SECKILL_REJECTED,
};

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

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            METRIC_CACHE_HIT,
            Unit::Count,
            "Total number of cache hits, labelled by namespace."
        );
        describe_counter!(
            METRIC_CACHE_MISS,
            Unit::Count,
            "Total number of cache misses, labelled by namespace."
        );
        describe_counter!(
            METRIC_CACHE_NEGATIVE_HIT,
            Unit::Count,
            "Total number of reads absorbed by a negative entry."
        );
        describe_counter!(
            METRIC_CACHE_STALE_SERVED,
            Unit::Count,
            "Total number of logically-expired entries served stale."
        );
        describe_counter!(
            METRIC_CACHE_REBUILD_SCHEDULED,
            Unit::Count,
            "Total number of background cache rebuilds handed to the pool."
        );
        describe_counter!(
            METRIC_CACHE_REBUILD_REJECTED,
            Unit::Count,
            "Total number of cache rebuilds rejected by a full backlog."
        );
        describe_counter!(
            METRIC_REBUILD_COMPLETED,
            Unit::Count,
            "Total number of background cache rebuild jobs completed."
        );
        describe_counter!(
            METRIC_SECKILL_ADMITTED,
            Unit::Count,
            "Total number of purchase attempts admitted."
        );
        describe_counter!(
            METRIC_SECKILL_REJECTED,
            Unit::Count,
            "Total number of purchase attempts rejected, labelled by reason."
        );
        describe_counter!(
            METRIC_ORDERS_FINALIZED,
            Unit::Count,
            "Total number of orders finalized against the relational store."
        );
        describe_counter!(
            METRIC_PERSISTER_POISON,
            Unit::Count,
            "Total number of malformed stream entries dropped by the persister."
        );
    });
}
