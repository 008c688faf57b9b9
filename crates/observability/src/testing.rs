//! Fixtures for exercising the observability stack in tests
//!
//! Everything here runs in-process: spans land in an
//! [`InMemorySpanExporter`], log records in a memory [`LogSink`], and the
//! scrape listener binds an ephemeral port.
//!
//! # Example
//!
//! ```ignore
//! use observability::{chain::SkipPolicy, testing};
//!
//! #[tokio::test]
//! async fn logs_one_record() {
//!     let fixture = testing::instrumentation("svc", SkipPolicy::default()).await.unwrap();
//!     // drive a request through the layers built from fixture.instrumentation
//!     assert_eq!(fixture.records().len(), 1);
//! }
//! ```

use std::{sync::Arc, time::Duration};

use opentelemetry_sdk::trace::InMemorySpanExporter;
use serde_json::Value;

use crate::{
    chain::{Instrumentation, SkipPolicy},
    config::{LogLevel, ResolvedConfig},
    logger::{LogSink, StructuredLogger},
    telemetry::{ShutdownHandle, TelemetryBootstrap, TelemetryError, TelemetryHandle},
};

/// Defaults for `service`, with a debug log level, an ephemeral scrape
/// port and short export timeouts
pub fn test_config(service: &str) -> ResolvedConfig {
    let mut config = ResolvedConfig::with_service(service);
    config.log_level = LogLevel::Debug;
    config.metrics.port = 0;
    config.tracing.export_timeout = Duration::from_secs(1);
    config
}

/// Logger writing into memory
pub fn memory_logger(config: &ResolvedConfig) -> Arc<StructuredLogger> {
    Arc::new(
        StructuredLogger::builder(config)
            .sink(LogSink::memory())
            .build(),
    )
}

/// Records written so far, one JSON value per line
///
/// Returns nothing for loggers that do not write into memory.
pub fn captured_records(logger: &StructuredLogger) -> Vec<Value> {
    logger
        .sink()
        .contents()
        .unwrap_or_default()
        .lines()
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect()
}

/// Telemetry whose spans are kept in memory
pub async fn in_memory_telemetry(
    service: &str,
) -> Result<(Arc<TelemetryHandle>, ShutdownHandle, InMemorySpanExporter), TelemetryError> {
    let exporter = InMemorySpanExporter::default();
    let (telemetry, shutdown) =
        TelemetryBootstrap::initialize_with_exporter(&test_config(service), exporter.clone())
            .await?;
    Ok((telemetry, shutdown, exporter))
}

/// A ready [`Instrumentation`] and the places its output ends up
#[derive(Debug)]
pub struct InstrumentationFixture {
    pub instrumentation: Instrumentation,
    pub logger: Arc<StructuredLogger>,
    pub spans: InMemorySpanExporter,
    pub shutdown: ShutdownHandle,
}

impl InstrumentationFixture {
    pub fn records(&self) -> Vec<Value> {
        captured_records(&self.logger)
    }
}

pub async fn instrumentation(
    service: &str,
    skip: SkipPolicy,
) -> Result<InstrumentationFixture, TelemetryError> {
    let (telemetry, shutdown, spans) = in_memory_telemetry(service).await?;
    let logger = memory_logger(&test_config(service));
    Ok(InstrumentationFixture {
        instrumentation: Instrumentation::new(telemetry, Arc::clone(&logger))
            .with_skip_policy(skip),
        logger,
        spans,
        shutdown,
    })
}
