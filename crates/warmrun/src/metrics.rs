//! OpenTelemetry metrics for the pool and the dispatcher.
//!
//! Instruments are always created; they are no-ops until [`init_provider`]
//! installs a meter provider, so tests never need a collector.

use std::time::Duration;

use anyhow::Result;
use opentelemetry::{
    KeyValue,
    metrics::{Counter, Histogram},
};
use opentelemetry_otlp::{MetricExporter, WithExportConfig};
use opentelemetry_sdk::{
    Resource,
    metrics::{PeriodicReader, SdkMeterProvider},
};

use crate::{config::TelemetryConfig, function::PoolKey};

const METER_NAME: &str = "warmrun";

/// Initialize the OpenTelemetry metrics provider.
///
/// Installs the global meter provider with OTLP export if metrics are
/// enabled. Must be called before [`WarmrunMetrics::new`] for the
/// instruments to be exported.
pub fn init_provider(config: &TelemetryConfig, instance_id: &str) -> Result<()> {
    if !config.enable_metrics {
        return Ok(());
    }

    let resource = Resource::builder()
        .with_attribute(KeyValue::new("service.name", "warmrun"))
        .with_attribute(KeyValue::new("service.version", env!("CARGO_PKG_VERSION")))
        .with_attribute(KeyValue::new(
            "warmrun.instance.id",
            instance_id.to_string(),
        ))
        .build();

    let mut exporter_builder = MetricExporter::builder().with_tonic();
    if let Some(endpoint) = &config.endpoint {
        exporter_builder = exporter_builder.with_endpoint(endpoint.clone());
    }
    let exporter = exporter_builder.build()?;

    let reader = PeriodicReader::builder(exporter)
        .with_interval(config.metrics_interval)
        .build();

    let provider = SdkMeterProvider::builder()
        .with_resource(resource)
        .with_reader(reader)
        .build();

    opentelemetry::global::set_meter_provider(provider);

    tracing::info!(
        endpoint = ?config.endpoint,
        interval_secs = config.metrics_interval.as_secs(),
        "Metrics provider initialized"
    );

    Ok(())
}

#[derive(Clone)]
pub struct WarmrunMetrics {
    invocations: Counter<u64>,
    cold_starts: Counter<u64>,
    start_failures: Counter<u64>,
    warm_hits: Counter<u64>,
    evictions: Counter<u64>,
    invocation_latency_seconds: Histogram<f64>,
    acquire_wait_seconds: Histogram<f64>,
}

impl Default for WarmrunMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl WarmrunMetrics {
    pub fn new() -> Self {
        let meter = opentelemetry::global::meter(METER_NAME);

        Self {
            invocations: meter
                .u64_counter("warmrun.invocations")
                .with_description("Number of invocations by result kind")
                .build(),
            cold_starts: meter
                .u64_counter("warmrun.pool.cold_starts")
                .with_description("Number of instances started on acquire")
                .build(),
            start_failures: meter
                .u64_counter("warmrun.pool.start_failures")
                .with_description("Number of instance starts that failed")
                .build(),
            warm_hits: meter
                .u64_counter("warmrun.pool.warm_hits")
                .with_description("Number of acquires served by a warm instance")
                .build(),
            evictions: meter
                .u64_counter("warmrun.pool.evictions")
                .with_description("Number of instances removed from the pool")
                .build(),
            invocation_latency_seconds: meter
                .f64_histogram("warmrun.invocation.latency_seconds")
                .with_description("End to end invocation latency")
                .with_unit("s")
                .build(),
            acquire_wait_seconds: meter
                .f64_histogram("warmrun.pool.acquire_wait_seconds")
                .with_description("Time spent waiting for an instance, including cold start")
                .with_unit("s")
                .build(),
        }
    }

    fn key_attrs(key: &PoolKey) -> [KeyValue; 1] {
        [KeyValue::new("language", key.language.as_str())]
    }

    pub fn record_invocation(&self, key: &PoolKey, result: &'static str, elapsed: Duration) {
        let attrs = [
            KeyValue::new("language", key.language.as_str()),
            KeyValue::new("result", result),
        ];
        self.invocations.add(1, &attrs);
        self.invocation_latency_seconds
            .record(elapsed.as_secs_f64(), &attrs);
    }

    pub fn record_cold_start(&self, key: &PoolKey) {
        self.cold_starts.add(1, &Self::key_attrs(key));
    }

    pub fn record_start_failure(&self, key: &PoolKey) {
        self.start_failures.add(1, &Self::key_attrs(key));
    }

    pub fn record_warm_hit(&self, key: &PoolKey) {
        self.warm_hits.add(1, &Self::key_attrs(key));
    }

    pub fn record_eviction(&self, key: &PoolKey, reason: &'static str) {
        self.evictions.add(
            1,
            &[
                KeyValue::new("language", key.language.as_str()),
                KeyValue::new("reason", reason),
            ],
        );
    }

    pub fn record_acquire_wait(&self, key: &PoolKey, waited: Duration) {
        self.acquire_wait_seconds
            .record(waited.as_secs_f64(), &Self::key_attrs(key));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::Language;

    #[test]
    fn test_recording_without_provider() {
        let metrics = WarmrunMetrics::default();
        let key = PoolKey::new(1, Language::Python);
        metrics.record_cold_start(&key);
        metrics.record_warm_hit(&key);
        metrics.record_eviction(&key, "idle_timeout");
        metrics.record_invocation(&key, "success", Duration::from_millis(5));
        metrics.record_acquire_wait(&key, Duration::ZERO);
    }
}
