use std::fmt::Write as FmtWrite;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use opentelemetry::KeyValue;
use opentelemetry_sdk::error::OTelSdkError;
use opentelemetry_sdk::metrics::Temporality;
use opentelemetry_sdk::metrics::data::{
    AggregatedMetrics, Gauge, Histogram, MetricData, ResourceMetrics, Sum,
};
use opentelemetry_sdk::metrics::exporter::PushMetricExporter;
use tracing::debug;

/// Push exporter keeping the last collection rendered in the Prometheus text format
#[derive(Clone, Default)]
pub struct PrometheusExporter {
    data: Arc<Mutex<Option<String>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl PrometheusExporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last rendered collection, if any collection happened yet
    pub fn get_metrics(&self) -> Option<String> {
        lock(&self.data).clone()
    }

    fn render(metrics: &ResourceMetrics) -> String {
        let mut output = String::new();
        for scope_metrics in metrics.scope_metrics() {
            let scope = scope_metrics.scope().name();
            for metric in scope_metrics.metrics() {
                let name = sanitize_name(&format!("{scope}_{}", metric.name()));
                writeln!(output, "# HELP {name} {}", metric.description()).ok();
                match metric.data() {
                    AggregatedMetrics::F64(data) => render_data(&name, data, &mut output, |v| v),
                    AggregatedMetrics::U64(data) => {
                        render_data(&name, data, &mut output, |v| v as f64)
                    }
                    AggregatedMetrics::I64(data) => {
                        render_data(&name, data, &mut output, |v| v as f64)
                    }
                }
            }
        }
        writeln!(output, "# EOF").ok();
        output
    }
}

fn render_data<T: Copy>(
    name: &str,
    data: &MetricData<T>,
    output: &mut String,
    to_f64: impl Fn(T) -> f64,
) {
    match data {
        MetricData::Sum(sum) => {
            writeln!(output, "# TYPE {name} counter").ok();
            render_sum(name, sum, output, to_f64);
        }
        MetricData::Gauge(gauge) => {
            writeln!(output, "# TYPE {name} gauge").ok();
            render_gauge(name, gauge, output, to_f64);
        }
        MetricData::Histogram(histogram) => {
            writeln!(output, "# TYPE {name} histogram").ok();
            render_histogram(name, histogram, output, to_f64);
        }
        // not produced by the instruments of this operator
        MetricData::ExponentialHistogram(_) => {}
    }
}

fn render_sum<T: Copy>(name: &str, sum: &Sum<T>, output: &mut String, to_f64: impl Fn(T) -> f64) {
    for point in sum.data_points() {
        let labels = format_labels(point.attributes(), None);
        writeln!(output, "{name}{labels} {}", to_f64(point.value())).ok();
    }
}

fn render_gauge<T: Copy>(
    name: &str,
    gauge: &Gauge<T>,
    output: &mut String,
    to_f64: impl Fn(T) -> f64,
) {
    for point in gauge.data_points() {
        let labels = format_labels(point.attributes(), None);
        writeln!(output, "{name}{labels} {}", to_f64(point.value())).ok();
    }
}

fn render_histogram<T: Copy>(
    name: &str,
    histogram: &Histogram<T>,
    output: &mut String,
    to_f64: impl Fn(T) -> f64,
) {
    for point in histogram.data_points() {
        let bounds: Vec<f64> = point.bounds().collect();
        let mut cumulative = 0u64;
        for (i, count) in point.bucket_counts().enumerate() {
            cumulative += count;
            let le = bounds
                .get(i)
                .map_or_else(|| "+Inf".to_string(), |b| b.to_string());
            let labels = format_labels(point.attributes(), Some(("le", &le)));
            writeln!(output, "{name}_bucket{labels} {cumulative}").ok();
        }
        let labels = format_labels(point.attributes(), None);
        writeln!(output, "{name}_sum{labels} {}", to_f64(point.sum())).ok();
        writeln!(output, "{name}_count{labels} {}", point.count()).ok();
    }
}

impl PushMetricExporter for PrometheusExporter {
    async fn export(&self, metrics: &ResourceMetrics) -> Result<(), OTelSdkError> {
        *lock(&self.data) = Some(Self::render(metrics));
        Ok(())
    }

    fn force_flush(&self) -> Result<(), OTelSdkError> {
        Ok(())
    }

    fn shutdown(&self) -> Result<(), OTelSdkError> {
        Ok(())
    }

    fn shutdown_with_timeout(&self, _timeout: Duration) -> Result<(), OTelSdkError> {
        Ok(())
    }

    fn temporality(&self) -> Temporality {
        Temporality::Cumulative
    }
}

/// Metric names only allow `[a-zA-Z0-9_:]`
fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '_' | ':' => c,
            _ => '_',
        })
        .collect()
}

fn escape_label_value(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

fn format_labels<'a>(
    attrs: impl Iterator<Item = &'a KeyValue>,
    extra: Option<(&str, &str)>,
) -> String {
    let pairs: Vec<String> = attrs
        .map(|kv| {
            format!(
                "{}=\"{}\"",
                sanitize_name(kv.key.as_str()),
                escape_label_value(&kv.value.to_string())
            )
        })
        .chain(extra.map(|(k, v)| format!("{k}=\"{}\"", escape_label_value(v))))
        .collect();
    if pairs.is_empty() {
        String::new()
    } else {
        format!("{{{}}}", pairs.join(","))
    }
}

static PROMETHEUS_EXPORTER: Mutex<Option<PrometheusExporter>> = Mutex::new(None);

pub fn set_global_exporter(exporter: PrometheusExporter) {
    debug!("setting global Prometheus exporter");
    *lock(&PROMETHEUS_EXPORTER) = Some(exporter);
}

/// Render the metrics of the global exporter
pub fn format_prometheus_metrics() -> Result<String, String> {
    lock(&PROMETHEUS_EXPORTER)
        .as_ref()
        .ok_or_else(|| "Prometheus exporter not initialized".to_string())?
        .get_metrics()
        .ok_or_else(|| "no metrics available yet".to_string())
}

#[cfg(test)]
mod test {
    use super::*;

    use opentelemetry::metrics::{Meter, MeterProvider};
    use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};

    fn test_meter(scope: &'static str) -> (SdkMeterProvider, PrometheusExporter, Meter) {
        let exporter = PrometheusExporter::new();
        let reader = PeriodicReader::builder(exporter.clone())
            .with_interval(Duration::from_millis(50))
            .build();
        let provider = SdkMeterProvider::builder().with_reader(reader).build();
        let meter = provider.meter(scope);
        (provider, exporter, meter)
    }

    async fn wait_for_export() {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn test_counter_and_gauge_export() {
        let (_provider, exporter, meter) = test_meter("dex-operator");

        let counter = meter
            .u64_counter("reconcile_operations")
            .with_description("Total number of reconcile operations")
            .build();
        counter.add(2, &[KeyValue::new("controller", "dex")]);
        let gauge = meter.i64_gauge("dex_replicas").build();
        gauge.record(3, &[KeyValue::new("name", "kubic-dex-deploy")]);

        wait_for_export().await;

        let text = exporter.get_metrics().expect("metrics exported");
        assert!(text.contains("# TYPE dex_operator_reconcile_operations counter"));
        assert!(text.contains(r#"dex_operator_reconcile_operations{controller="dex"} 2"#));
        assert!(text.contains(r#"dex_operator_dex_replicas{name="kubic-dex-deploy"} 3"#));
        assert!(text.ends_with("# EOF\n"));
    }

    #[tokio::test]
    async fn test_histogram_export() {
        let (_provider, exporter, meter) = test_meter("test");

        let histogram = meter
            .f64_histogram("duration")
            .with_boundaries(vec![1.0])
            .build();
        histogram.record(0.5, &[KeyValue::new("controller", "dex")]);
        histogram.record(1.5, &[KeyValue::new("controller", "dex")]);

        wait_for_export().await;

        let text = exporter.get_metrics().expect("metrics exported");
        assert!(text.contains(r#"test_duration_bucket{controller="dex",le="1"} 1"#));
        assert!(text.contains(r#"test_duration_bucket{controller="dex",le="+Inf"} 2"#));
        assert!(text.contains(r#"test_duration_count{controller="dex"} 2"#));
    }

    #[test]
    fn test_sanitize_name() {
        assert_eq!(
            sanitize_name("dex-operator_http.requests"),
            "dex_operator_http_requests"
        );
    }

    #[test]
    fn test_format_labels() {
        let attrs = [
            KeyValue::new("endpoint", "/api/v1/namespaces/{namespace}"),
            KeyValue::new("note", "a \"quoted\" value"),
        ];
        assert_eq!(
            format_labels(attrs.iter(), None),
            r#"{endpoint="/api/v1/namespaces/{namespace}",note="a \"quoted\" value"}"#
        );
        assert_eq!(format_labels(std::iter::empty(), Some(("le", "+Inf"))), r#"{le="+Inf"}"#);
        assert_eq!(format_labels(std::iter::empty(), None), "");
    }

    #[tokio::test]
    async fn test_global_exporter() {
        let (_provider, exporter, meter) = test_meter("global");
        set_global_exporter(exporter);
        meter.u64_counter("counter").build().add(1, &[]);

        wait_for_export().await;

        assert!(format_prometheus_metrics().is_ok());
    }
}
