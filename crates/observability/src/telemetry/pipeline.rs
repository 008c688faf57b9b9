//! Metric readers and the delivery pipeline chosen per metrics mode

use std::{
    net::SocketAddr,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use axum::{
    Router,
    extract::State,
    http::{StatusCode, header::CONTENT_TYPE},
    response::{IntoResponse, Response},
    routing::get,
};
use opentelemetry_otlp::{MetricExporter, Protocol, WithExportConfig};
use opentelemetry_sdk::{
    error::{OTelSdkError, OTelSdkResult},
    metrics::{
        InstrumentKind, ManualReader, MeterProviderBuilder, PeriodicReader, Pipeline, Temporality,
        data::ResourceMetrics, reader::MetricReader,
    },
};
use parking_lot::Mutex;
use tokio::{net::TcpListener, sync::oneshot, task::JoinHandle};

use super::{TelemetryError, collector_url, exposition};
use crate::config::{MetricsConfig, MetricsMode, PushConfig, PushProtocol};

/// Reader that collects on demand, once per scrape
#[derive(Debug, Clone)]
pub struct PullReader(Arc<ManualReader>);

impl Default for PullReader {
    fn default() -> Self {
        Self::new()
    }
}

impl PullReader {
    pub fn new() -> Self {
        Self(Arc::new(ManualReader::builder().build()))
    }

    /// Collect current values and encode them as exposition text
    pub fn collect_text(&self) -> Result<String, OTelSdkError> {
        let mut metrics = ResourceMetrics::default();
        self.0.collect(&mut metrics)?;
        Ok(exposition::encode(&metrics))
    }
}

impl MetricReader for PullReader {
    fn register_pipeline(&self, pipeline: Weak<Pipeline>) {
        self.0.register_pipeline(pipeline);
    }

    fn collect(&self, rm: &mut ResourceMetrics) -> OTelSdkResult {
        self.0.collect(rm)
    }

    fn force_flush(&self) -> OTelSdkResult {
        self.0.force_flush()
    }

    fn shutdown_with_timeout(&self, timeout: Duration) -> OTelSdkResult {
        self.0.shutdown_with_timeout(timeout)
    }

    fn temporality(&self, kind: InstrumentKind) -> Temporality {
        self.0.temporality(kind)
    }
}

enum ServerState {
    Bound(TcpListener),
    Serving {
        stop: oneshot::Sender<()>,
        task: JoinHandle<()>,
    },
    Closed,
}

/// Scrape endpoint: a pull reader behind an HTTP listener
#[derive(Debug)]
pub struct PullEndpoint {
    reader: PullReader,
    addr: SocketAddr,
    path: String,
    server: Mutex<ServerState>,
}

impl std::fmt::Debug for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Bound(_) => "Bound",
            Self::Serving { .. } => "Serving",
            Self::Closed => "Closed",
        })
    }
}

impl PullEndpoint {
    /// Bind `0.0.0.0:{port}`. Scrapes are served once [`start`](Self::start) runs.
    pub(crate) async fn bind(config: &MetricsConfig) -> Result<Self, TelemetryError> {
        let requested = SocketAddr::from(([0, 0, 0, 0], config.port));
        let listener = TcpListener::bind(requested)
            .await
            .map_err(|source| TelemetryError::MetricsListener {
                addr: requested,
                source,
            })?;
        let addr = listener
            .local_addr()
            .map_err(|source| TelemetryError::MetricsListener {
                addr: requested,
                source,
            })?;

        let path = if config.path.starts_with('/') {
            config.path.clone()
        } else {
            format!("/{}", config.path)
        };

        Ok(Self {
            reader: PullReader::new(),
            addr,
            path,
            server: Mutex::new(ServerState::Bound(listener)),
        })
    }

    /// Address the listener is bound to
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub const fn reader(&self) -> &PullReader {
        &self.reader
    }

    /// Start answering scrapes on the bound listener
    pub(crate) fn start(&self) {
        let mut server = self.server.lock();
        let listener = match std::mem::replace(&mut *server, ServerState::Closed) {
            ServerState::Bound(listener) => listener,
            other => {
                *server = other;
                return;
            },
        };

        let app = Router::new()
            .route(&self.path, get(scrape))
            .with_state(self.reader.clone());
        let (stop, stopped) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let shutdown = async {
                let _ = stopped.await;
            };
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                tracing::error!(error = %e, "Metrics server error");
            }
        });

        *server = ServerState::Serving { stop, task };
    }

    /// Stop accepting scrapes and wait for in-flight ones to finish
    pub(crate) async fn close(&self) -> Result<(), String> {
        let state = std::mem::replace(&mut *self.server.lock(), ServerState::Closed);
        match state {
            ServerState::Serving { stop, task } => {
                let _ = stop.send(());
                task.await
                    .map_err(|e| format!("metrics listener task failed: {e}"))
            },
            ServerState::Bound(_) | ServerState::Closed => Ok(()),
        }
    }
}

async fn scrape(State(reader): State<PullReader>) -> Response {
    match reader.collect_text() {
        Ok(body) => ([(CONTENT_TYPE, exposition::CONTENT_TYPE)], body).into_response(),
        Err(e) => {
            tracing::warn!(error = %e, "Metrics collection failed");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        },
    }
}

/// Periodic exporter to a remote collector
///
/// Stopping it explicitly turns later flush and shutdown calls from the
/// meter provider into no-ops, so teardown never double-closes the exporter.
#[derive(Debug, Clone)]
pub struct PushReader {
    inner: PeriodicReader<MetricExporter>,
    endpoint: String,
    protocol: PushProtocol,
    stopped: Arc<AtomicBool>,
}

impl PushReader {
    pub(crate) fn build(config: &PushConfig, timeout: Duration) -> Result<Self, String> {
        let target = config
            .endpoint
            .as_deref()
            .ok_or_else(|| "no push endpoint configured".to_string())?;

        let (endpoint, exporter) = match config.protocol {
            PushProtocol::Http => {
                let endpoint = collector_url(target, config.insecure, "/v1/metrics");
                let exporter = MetricExporter::builder()
                    .with_http()
                    .with_protocol(Protocol::HttpBinary)
                    .with_endpoint(endpoint.clone())
                    .with_timeout(timeout)
                    .build();
                (endpoint, exporter)
            },
            PushProtocol::Grpc => {
                let endpoint = collector_url(target, config.insecure, "");
                let exporter = MetricExporter::builder()
                    .with_tonic()
                    .with_endpoint(endpoint.clone())
                    .with_timeout(timeout)
                    .build();
                (endpoint, exporter)
            },
        };
        let exporter = exporter.map_err(|e| e.to_string())?;

        Ok(Self {
            inner: PeriodicReader::builder(exporter)
                .with_interval(config.interval)
                .build(),
            endpoint,
            protocol: config.protocol,
            stopped: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Resolved collector URL
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub const fn protocol(&self) -> PushProtocol {
        self.protocol
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Run the final export and stop the background timer
    pub(crate) fn stop(&self, timeout: Duration) -> OTelSdkResult {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.shutdown_with_timeout(timeout)
    }
}

impl MetricReader for PushReader {
    fn register_pipeline(&self, pipeline: Weak<Pipeline>) {
        self.inner.register_pipeline(pipeline);
    }

    fn collect(&self, rm: &mut ResourceMetrics) -> OTelSdkResult {
        self.inner.collect(rm)
    }

    fn force_flush(&self) -> OTelSdkResult {
        if self.is_stopped() {
            return Ok(());
        }
        self.inner.force_flush()
    }

    fn shutdown_with_timeout(&self, timeout: Duration) -> OTelSdkResult {
        self.stop(timeout)
    }

    fn temporality(&self, kind: InstrumentKind) -> Temporality {
        self.inner.temporality(kind)
    }
}

/// Active metric readers, one variant per metrics mode
#[derive(Debug)]
pub enum MetricsPipeline {
    Pull(PullEndpoint),
    Push(PushReader),
    Hybrid { pull: PullEndpoint, push: PushReader },
}

impl MetricsPipeline {
    /// Build the readers for the configured mode
    ///
    /// A push reader that cannot be constructed degrades the pipeline to
    /// pull-only, so the process always stays locally inspectable.
    pub(crate) async fn select(
        config: &MetricsConfig,
        export_timeout: Duration,
    ) -> Result<Self, TelemetryError> {
        let push = match config.mode {
            MetricsMode::Pull => None,
            MetricsMode::Push | MetricsMode::Hybrid => {
                match PushReader::build(&config.push, export_timeout) {
                    Ok(reader) => Some(reader),
                    Err(error) => {
                        tracing::warn!(
                            mode = %config.mode,
                            error = %error,
                            "Push metrics unavailable, falling back to pull"
                        );
                        None
                    },
                }
            },
        };

        Ok(match (config.mode, push) {
            (MetricsMode::Push, Some(push)) => Self::Push(push),
            (MetricsMode::Hybrid, Some(push)) => Self::Hybrid {
                pull: PullEndpoint::bind(config).await?,
                push,
            },
            (_, _) => Self::Pull(PullEndpoint::bind(config).await?),
        })
    }

    /// Mode actually in effect, after any fallback
    pub const fn mode(&self) -> MetricsMode {
        match self {
            Self::Pull(_) => MetricsMode::Pull,
            Self::Push(_) => MetricsMode::Push,
            Self::Hybrid { .. } => MetricsMode::Hybrid,
        }
    }

    pub const fn pull(&self) -> Option<&PullEndpoint> {
        match self {
            Self::Pull(pull) | Self::Hybrid { pull, .. } => Some(pull),
            Self::Push(_) => None,
        }
    }

    pub const fn push(&self) -> Option<&PushReader> {
        match self {
            Self::Push(push) | Self::Hybrid { push, .. } => Some(push),
            Self::Pull(_) => None,
        }
    }

    pub(crate) fn attach(&self, mut builder: MeterProviderBuilder) -> MeterProviderBuilder {
        if let Some(pull) = self.pull() {
            builder = builder.with_reader(pull.reader().clone());
        }
        if let Some(push) = self.push() {
            builder = builder.with_reader(push.clone());
        }
        builder
    }

    pub(crate) fn start(&self) {
        if let Some(pull) = self.pull() {
            pull.start();
        }
    }
}
