use std::io::IsTerminal;

use anyhow::Result;
use opentelemetry::{KeyValue, trace::TracerProvider};
use opentelemetry_otlp::{SpanExporter as OtlpSpanExporter, WithExportConfig, WithTonicConfig};
use opentelemetry_sdk::{
    Resource,
    trace::{BatchConfigBuilder, BatchSpanProcessor, SdkTracerProvider},
};
use opentelemetry_stdout::SpanExporter as StdoutSpanExporter;
use tracing_subscriber::{
    EnvFilter,
    Layer,
    filter::{FilterExt, LevelFilter, filter_fn},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use crate::config::{TelemetryConfig, TracingExporter, WarmrunConfig};

const SERVICE_NAME: &str = "warmrun";

/// Applied when `RUST_LOG` is unset.
const DEFAULT_DIRECTIVES: &[&str] = &["bollard=warn", "hyper=warn", "h2=warn"];

/// Targets never exported as spans, whatever the log filter says.
fn is_noisy_target(target: &str) -> bool {
    ["h2", "hyper", "tokio", "bollard", "tower"]
        .iter()
        .any(|prefix| target == *prefix || target.starts_with(&format!("{}::", prefix)))
}

/// `RUST_LOG` when set, INFO plus [`DEFAULT_DIRECTIVES`] otherwise.
pub fn env_filter() -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    DEFAULT_DIRECTIVES.iter().fold(
        EnvFilter::default().add_directive(LevelFilter::INFO.into()),
        |filter, directive| match directive.parse() {
            Ok(directive) => filter.add_directive(directive),
            Err(_) => filter,
        },
    )
}

fn log_layer<S>(config: &WarmrunConfig) -> Box<dyn Layer<S> + Send + Sync>
where
    S: for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    S: tracing::Subscriber,
{
    if config.structured_logging() {
        return Box::new(
            json_subscriber::fmt::layer()
                .with_span_list(false)
                .flatten_event(true)
                .flatten_current_span_on_top_level(true),
        );
    }

    Box::new(
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_ansi(std::io::stderr().is_terminal())
            .compact(),
    )
}

fn tracer_provider(
    telemetry: &TelemetryConfig,
    instance_id: &str,
) -> Result<Option<SdkTracerProvider>> {
    let Some(exporter) = &telemetry.tracing_exporter else {
        return Ok(None);
    };

    let resource = Resource::builder_empty()
        .with_service_name(SERVICE_NAME)
        .with_attribute(KeyValue::new("service.version", env!("CARGO_PKG_VERSION")))
        .with_attribute(KeyValue::new("service.instance.id", instance_id.to_string()))
        .build();
    let builder = SdkTracerProvider::builder().with_resource(resource);

    let provider = match exporter {
        TracingExporter::Otlp => {
            let mut otlp = OtlpSpanExporter::builder()
                .with_tonic()
                .with_compression(opentelemetry_otlp::Compression::Gzip);
            if let Some(endpoint) = &telemetry.endpoint {
                otlp = otlp.with_endpoint(endpoint);
            }
            let processor = BatchSpanProcessor::builder(otlp.build()?)
                .with_batch_config(
                    BatchConfigBuilder::default()
                        .with_max_export_batch_size(128)
                        .build(),
                )
                .build();
            builder.with_span_processor(processor).build()
        }
        TracingExporter::Stdout => builder
            .with_simple_exporter(StdoutSpanExporter::default())
            .build(),
    };
    Ok(Some(provider))
}

/// Install the global subscriber: human or JSON logs, plus span export when
/// `telemetry.tracing_exporter` is set.
pub fn setup_tracing(config: &WarmrunConfig, instance_id: &str) -> Result<()> {
    let provider = tracer_provider(&config.telemetry, instance_id)?;

    let span_layer = provider.map(|provider| {
        let tracer = provider.tracer(SERVICE_NAME);
        opentelemetry::global::set_tracer_provider(provider);
        let exported = filter_fn(|metadata: &tracing::Metadata<'_>| {
            !is_noisy_target(metadata.target())
        });
        tracing_opentelemetry::layer()
            .with_tracer(tracer)
            .with_filter(exported.and(env_filter()))
    });

    tracing_subscriber::registry()
        .with(span_layer)
        .with(log_layer(config).with_filter(env_filter()))
        .try_init()?;
    Ok(())
}
