use crate::prometheus_exporter::{PrometheusExporter, set_global_exporter};

use dexop_k8s_util::error::{Error, Result};

use opentelemetry::trace::{TraceContextExt, TraceId, TracerProvider as _};
use opentelemetry_otlp::{SpanExporter, WithExportConfig};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::trace::{Sampler, SdkTracerProvider};
use tokio::time::Duration;
use tracing_opentelemetry::OpenTelemetrySpanExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, layer::SubscriberExt};

pub const SERVICE_NAME: &str = "dex-operator";
const METRICS_EXPORT_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Clone, Debug, clap::ValueEnum)]
pub enum LogFormat {
    Json,
    Text,
}

/// Fetch the OpenTelemetry trace id of the current span
pub fn get_trace_id() -> TraceId {
    tracing::Span::current()
        .context()
        .span()
        .span_context()
        .trace_id()
}

fn init_tracer_provider(url: &str, sample_ratio: f64) -> Result<SdkTracerProvider> {
    let exporter = SpanExporter::builder()
        .with_tonic()
        .with_endpoint(url)
        .build()
        .map_err(|e| Error::TelemetryError(format!("failed to build span exporter: {e}")))?;

    Ok(SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_sampler(Sampler::ParentBased(Box::new(Sampler::TraceIdRatioBased(
            sample_ratio,
        ))))
        .with_resource(Resource::builder().with_service_name(SERVICE_NAME).build())
        .build())
}

/// Initialize logging and, when an endpoint is given, OTLP tracing
pub async fn init(
    log_filter: &str,
    log_format: LogFormat,
    tracing_url: Option<&str>,
    sample_ratio: f64,
) -> Result<()> {
    let env_filter = EnvFilter::try_new(log_filter)
        .map_err(|e| Error::TelemetryError(format!("invalid log filter {log_filter}: {e}")))?;

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();
    match log_format {
        LogFormat::Json => layers.push(tracing_subscriber::fmt::layer().json().boxed()),
        LogFormat::Text => layers.push(tracing_subscriber::fmt::layer().compact().boxed()),
    }

    if let Some(url) = tracing_url {
        let provider = init_tracer_provider(url, sample_ratio)?;
        let tracer = provider.tracer(SERVICE_NAME);
        opentelemetry::global::set_tracer_provider(provider);
        layers.push(tracing_opentelemetry::layer().with_tracer(tracer).boxed());
    }

    let subscriber = tracing_subscriber::registry()
        .with(layers)
        .with(env_filter);
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| Error::TelemetryError(format!("failed to set global subscriber: {e}")))
}

/// Create the meter provider backing `/metrics`
pub fn init_meter_provider() -> SdkMeterProvider {
    let exporter = PrometheusExporter::new();
    let reader = PeriodicReader::builder(exporter.clone())
        .with_interval(METRICS_EXPORT_INTERVAL)
        .build();
    set_global_exporter(exporter);
    SdkMeterProvider::builder()
        .with_reader(reader)
        .with_resource(Resource::builder().with_service_name(SERVICE_NAME).build())
        .build()
}

#[cfg(test)]
mod test {
    use super::get_trace_id;

    use opentelemetry::trace::TraceId;

    #[test]
    fn test_trace_id_without_tracer() {
        assert_eq!(get_trace_id(), TraceId::INVALID);
    }
}
