//! Trace and metrics pipelines
//!
//! [`TelemetryBootstrap::initialize`] builds the tracer provider, the meter
//! provider and the metric readers for the configured mode, and hands back a
//! [`TelemetryHandle`] plus the matching [`ShutdownHandle`]. Nothing is
//! installed globally unless the caller asks for it.

pub mod exposition;
mod pipeline;
mod shutdown;

use std::{borrow::Cow, net::SocketAddr, sync::Arc};

use opentelemetry::{
    Context, KeyValue, global,
    metrics::{Meter, MeterProvider as _},
    propagation::{Extractor, Injector, TextMapCompositePropagator, TextMapPropagator},
    trace::TracerProvider as _,
};
use opentelemetry_otlp::{Protocol, WithExportConfig};
use opentelemetry_sdk::{
    Resource,
    error::OTelSdkError,
    metrics::SdkMeterProvider,
    propagation::{BaggagePropagator, TraceContextPropagator},
    trace::{Sampler, SdkTracer, SdkTracerProvider, SpanExporter, TracerProviderBuilder},
};

pub use pipeline::{MetricsPipeline, PullEndpoint, PullReader, PushReader};
pub use shutdown::{ShutdownError, ShutdownHandle};

use crate::config::{ResolvedConfig, ServiceIdentity};

/// Error type for telemetry initialization
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    /// Failed to create the OTLP span exporter
    #[error("Failed to create OTLP span exporter: {0}")]
    SpanExporter(String),

    /// Failed to bind the metrics scrape listener
    #[error("Failed to bind metrics listener on {addr}: {source}")]
    MetricsListener {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

/// Process-wide telemetry capability
///
/// Created once by [`TelemetryBootstrap`] and shared as
/// `Arc<TelemetryHandle>`. All accessors are lookups; nothing here can be
/// reconfigured after construction.
pub struct TelemetryHandle {
    service: ServiceIdentity,
    tracer_provider: SdkTracerProvider,
    meter_provider: SdkMeterProvider,
    propagator: TextMapCompositePropagator,
    metrics: MetricsPipeline,
}

impl std::fmt::Debug for TelemetryHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryHandle")
            .field("service", &self.service.name)
            .field("metrics", &self.metrics)
            .finish_non_exhaustive()
    }
}

impl TelemetryHandle {
    pub const fn service(&self) -> &ServiceIdentity {
        &self.service
    }

    /// Named tracer backed by this handle's provider
    pub fn tracer(&self, name: impl Into<Cow<'static, str>>) -> SdkTracer {
        self.tracer_provider.tracer(name)
    }

    /// Named meter backed by this handle's provider
    pub fn meter(&self, name: &'static str) -> Meter {
        self.meter_provider.meter(name)
    }

    pub const fn tracer_provider(&self) -> &SdkTracerProvider {
        &self.tracer_provider
    }

    pub const fn meter_provider(&self) -> &SdkMeterProvider {
        &self.meter_provider
    }

    /// W3C trace-context plus baggage propagator
    pub const fn propagator(&self) -> &TextMapCompositePropagator {
        &self.propagator
    }

    /// Read upstream trace context from an inbound carrier
    pub fn extract(&self, carrier: &dyn Extractor) -> Context {
        self.propagator.extract(carrier)
    }

    /// Write `cx` into an outbound carrier
    pub fn inject(&self, cx: &Context, carrier: &mut dyn Injector) {
        self.propagator.inject_context(cx, carrier);
    }

    pub const fn metrics_pipeline(&self) -> &MetricsPipeline {
        &self.metrics
    }

    /// Scrape listener address, when a pull reader is active
    pub fn scrape_addr(&self) -> Option<SocketAddr> {
        self.metrics.pull().map(PullEndpoint::addr)
    }

    /// Current exposition text without going through HTTP
    pub fn scrape(&self) -> Option<Result<String, OTelSdkError>> {
        self.metrics.pull().map(|pull| pull.reader().collect_text())
    }

    /// Register the providers and propagator as `opentelemetry::global`
    /// defaults, for libraries that only look there
    pub fn install_global(&self) {
        global::set_tracer_provider(self.tracer_provider.clone());
        global::set_meter_provider(self.meter_provider.clone());
        global::set_text_map_propagator(composite_propagator());
    }
}

/// Builds the telemetry pipelines for one process
#[derive(Debug, Clone, Copy)]
pub struct TelemetryBootstrap;

impl TelemetryBootstrap {
    /// Build providers, readers and propagator from `config`
    ///
    /// Spans are batched and exported over OTLP/HTTP. A push reader that
    /// cannot be constructed degrades metrics to pull instead of failing.
    pub async fn initialize(
        config: &ResolvedConfig,
    ) -> Result<(Arc<TelemetryHandle>, ShutdownHandle), TelemetryError> {
        let endpoint = collector_url(&config.tracing.endpoint, config.tracing.insecure, "/v1/traces");
        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_http()
            .with_protocol(Protocol::HttpBinary)
            .with_endpoint(endpoint.clone())
            .with_timeout(config.tracing.export_timeout)
            .build()
            .map_err(|e| TelemetryError::SpanExporter(e.to_string()))?;

        let result = Self::assemble(config, |builder| builder.with_batch_exporter(exporter)).await?;
        tracing::info!(
            service = %config.service.name,
            endpoint = %endpoint,
            sampling = %config.tracing.sample_ratio,
            metrics_mode = %result.0.metrics.mode(),
            "Telemetry initialized with OTLP export"
        );
        Ok(result)
    }

    /// Like [`initialize`](Self::initialize), but spans go synchronously to
    /// `exporter` as they end. Meant for tests and local debugging.
    pub async fn initialize_with_exporter<E>(
        config: &ResolvedConfig,
        exporter: E,
    ) -> Result<(Arc<TelemetryHandle>, ShutdownHandle), TelemetryError>
    where
        E: SpanExporter + 'static,
    {
        Self::assemble(config, |builder| builder.with_simple_exporter(exporter)).await
    }

    async fn assemble(
        config: &ResolvedConfig,
        with_exporter: impl FnOnce(TracerProviderBuilder) -> TracerProviderBuilder,
    ) -> Result<(Arc<TelemetryHandle>, ShutdownHandle), TelemetryError> {
        let resource = service_resource(&config.service);

        let metrics =
            MetricsPipeline::select(&config.metrics, config.tracing.export_timeout).await?;

        let tracer_provider = with_exporter(SdkTracerProvider::builder())
            .with_sampler(sampler(config.tracing.sample_ratio))
            .with_resource(resource.clone())
            .build();
        let meter_provider = metrics
            .attach(SdkMeterProvider::builder().with_resource(resource))
            .build();
        metrics.start();

        if let Some(addr) = metrics.pull().map(PullEndpoint::addr) {
            tracing::debug!(%addr, path = %config.metrics.path, "Metrics scrape endpoint listening");
        }

        let handle = Arc::new(TelemetryHandle {
            service: config.service.clone(),
            tracer_provider,
            meter_provider,
            propagator: composite_propagator(),
            metrics,
        });
        let shutdown = ShutdownHandle::new(Arc::clone(&handle));
        Ok((handle, shutdown))
    }
}

fn service_resource(service: &ServiceIdentity) -> Resource {
    Resource::builder()
        .with_service_name(service.name.clone())
        .with_attribute(KeyValue::new("service.version", service.version.clone()))
        .with_attribute(KeyValue::new("service.build_time", service.build_time.clone()))
        .build()
}

fn composite_propagator() -> TextMapCompositePropagator {
    TextMapCompositePropagator::new(vec![
        Box::new(TraceContextPropagator::new()),
        Box::new(BaggagePropagator::new()),
    ])
}

/// Root sampling decision at `ratio`; children follow their parent
fn sampler(ratio: f64) -> Sampler {
    let root = if ratio >= 1.0 {
        Sampler::AlwaysOn
    } else if ratio <= 0.0 {
        Sampler::AlwaysOff
    } else {
        Sampler::TraceIdRatioBased(ratio)
    };
    Sampler::ParentBased(Box::new(root))
}

/// Full collector URL for one signal
///
/// Bare `host:port` endpoints get `http://` or `https://` depending on
/// `insecure`; explicit schemes are kept.
pub(crate) fn collector_url(endpoint: &str, insecure: bool, signal_path: &str) -> String {
    let endpoint = endpoint.trim().trim_end_matches('/');
    let base = if endpoint.contains("://") {
        endpoint.to_string()
    } else {
        let scheme = if insecure { "http" } else { "https" };
        format!("{scheme}://{endpoint}")
    };
    if base.ends_with(signal_path) {
        base
    } else {
        format!("{base}{signal_path}")
    }
}
