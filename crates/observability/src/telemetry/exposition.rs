//! Prometheus text exposition (format 0.0.4) for collected OpenTelemetry metrics

use std::fmt::Write as _;

use opentelemetry::KeyValue;
use opentelemetry_sdk::{
    Resource,
    metrics::data::{AggregatedMetrics, Metric, MetricData, ResourceMetrics},
};

/// Content type of an exposition payload
pub const CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Numeric sample values as Prometheus spells them
trait SampleValue: Copy {
    fn render(self) -> String;
}

impl SampleValue for f64 {
    fn render(self) -> String {
        if self.is_nan() {
            "NaN".to_string()
        } else if self.is_infinite() {
            if self.is_sign_positive() { "+Inf" } else { "-Inf" }.to_string()
        } else {
            self.to_string()
        }
    }
}

impl SampleValue for u64 {
    fn render(self) -> String {
        self.to_string()
    }
}

impl SampleValue for i64 {
    fn render(self) -> String {
        self.to_string()
    }
}

/// Encode one collection cycle as exposition text
///
/// Resource attributes are exposed once through a `target_info` gauge.
/// Exponential histograms have no text representation and are skipped.
pub fn encode(metrics: &ResourceMetrics) -> String {
    let mut out = String::new();
    write_target_info(&mut out, metrics.resource());

    for scope in metrics.scope_metrics() {
        for metric in scope.metrics() {
            match metric.data() {
                AggregatedMetrics::F64(data) => write_metric(&mut out, metric, data),
                AggregatedMetrics::U64(data) => write_metric(&mut out, metric, data),
                AggregatedMetrics::I64(data) => write_metric(&mut out, metric, data),
            }
        }
    }
    out
}

fn write_target_info(out: &mut String, resource: &Resource) {
    let labels: Vec<(String, String)> = resource
        .iter()
        .map(|(key, value)| (sanitize_label(key.as_str()), value.as_str().into_owned()))
        .collect();
    if labels.is_empty() {
        return;
    }
    write_header(out, "target_info", "Target metadata", "gauge");
    write_sample(out, "target_info", &labels, None, "1");
}

fn write_metric<T: SampleValue>(out: &mut String, metric: &Metric, data: &MetricData<T>) {
    let name = sanitize_name(metric.name());
    let help = metric.description();

    match data {
        MetricData::Gauge(gauge) => {
            write_header(out, &name, help, "gauge");
            for point in gauge.data_points() {
                let labels = labels_of(point.attributes());
                write_sample(out, &name, &labels, None, &point.value().render());
            }
        },
        MetricData::Sum(sum) => {
            let (name, kind) = if sum.is_monotonic() {
                (counter_name(name), "counter")
            } else {
                (name, "gauge")
            };
            write_header(out, &name, help, kind);
            for point in sum.data_points() {
                let labels = labels_of(point.attributes());
                write_sample(out, &name, &labels, None, &point.value().render());
            }
        },
        MetricData::Histogram(histogram) => {
            write_header(out, &name, help, "histogram");
            let bucket = format!("{name}_bucket");
            for point in histogram.data_points() {
                let labels = labels_of(point.attributes());
                let mut cumulative = 0_u64;
                for (bound, count) in point.bounds().zip(point.bucket_counts()) {
                    cumulative += count;
                    let le = bound.render();
                    write_sample(out, &bucket, &labels, Some(&le), &cumulative.to_string());
                }
                write_sample(out, &bucket, &labels, Some("+Inf"), &point.count().to_string());
                write_sample(out, &format!("{name}_sum"), &labels, None, &point.sum().render());
                write_sample(
                    out,
                    &format!("{name}_count"),
                    &labels,
                    None,
                    &point.count().to_string(),
                );
            }
        },
        MetricData::ExponentialHistogram(_) => {},
    }
}

fn counter_name(name: String) -> String {
    if name.ends_with("_total") {
        name
    } else {
        format!("{name}_total")
    }
}

fn labels_of<'a>(attributes: impl Iterator<Item = &'a KeyValue>) -> Vec<(String, String)> {
    attributes
        .map(|kv| (sanitize_label(kv.key.as_str()), kv.value.as_str().into_owned()))
        .collect()
}

fn write_header(out: &mut String, name: &str, help: &str, kind: &str) {
    if !help.is_empty() {
        let _ = writeln!(out, "# HELP {name} {}", escape_help(help));
    }
    let _ = writeln!(out, "# TYPE {name} {kind}");
}

fn write_sample(
    out: &mut String,
    name: &str,
    labels: &[(String, String)],
    le: Option<&str>,
    value: &str,
) {
    out.push_str(name);
    if !labels.is_empty() || le.is_some() {
        let mut rendered: Vec<String> = labels
            .iter()
            .map(|(key, value)| format!("{key}=\"{}\"", escape_label_value(value)))
            .collect();
        if let Some(le) = le {
            rendered.push(format!("le=\"{le}\""));
        }
        let _ = write!(out, "{{{}}}", rendered.join(","));
    }
    let _ = writeln!(out, " {value}");
}

fn sanitize(raw: &str, allow_colon: bool) -> String {
    let mut name: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || (allow_colon && c == ':') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if name.is_empty() || name.starts_with(|c: char| c.is_ascii_digit()) {
        name.insert(0, '_');
    }
    name
}

fn sanitize_name(raw: &str) -> String {
    sanitize(raw, true)
}

fn sanitize_label(raw: &str) -> String {
    sanitize(raw, false)
}

fn escape_help(text: &str) -> String {
    text.replace('\\', "\\\\").replace('\n', "\\n")
}

fn escape_label_value(text: &str) -> String {
    text.replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}
