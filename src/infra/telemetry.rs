use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
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

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "certcache_lookup_total",
            Unit::Count,
            "Total number of gateway lookups, labelled by hit or miss."
        );
        describe_counter!(
            "certcache_store_read_error_total",
            Unit::Count,
            "Total number of store reads that failed and were treated as misses."
        );
        describe_counter!(
            "certcache_store_expired_total",
            Unit::Count,
            "Total number of artifacts evicted by the in-process store."
        );
        describe_counter!(
            "certcache_queue_submitted_total",
            Unit::Count,
            "Total number of generation requests accepted by the queue, labelled by source."
        );
        describe_counter!(
            "certcache_queue_rejected_total",
            Unit::Count,
            "Total number of generation requests rejected because the queue was full."
        );
        describe_counter!(
            "certcache_queue_deduplicated_total",
            Unit::Count,
            "Total number of submissions skipped because the key was already in flight."
        );
        describe_counter!(
            "certcache_jobs_total",
            Unit::Count,
            "Total number of finished generation jobs, labelled by outcome."
        );
        describe_counter!(
            "certcache_watcher_events_total",
            Unit::Count,
            "Total number of host expiration notifications received."
        );
        describe_gauge!(
            "certcache_workers_busy",
            Unit::Count,
            "Number of workers currently running a job."
        );
        describe_histogram!(
            "certcache_generation_ms",
            Unit::Milliseconds,
            "Artifact generation latency in milliseconds."
        );
    });
}
