//! Structured JSON logger
//!
//! Every record is a single JSON line tagged with the service name and
//! version. The logger owns its own `tracing` dispatcher, so it can be
//! injected per component and per test without touching process globals;
//! [`StructuredLogger::install_global`] opts into the global default.

mod format;
mod sink;

use std::io;

use opentelemetry_sdk::trace::SdkTracer;
use tracing::{Dispatch, dispatcher::SetGlobalDefaultError};
use tracing_subscriber::{filter::LevelFilter, layer::SubscriberExt};

pub use format::JsonRecordFormat;
pub use sink::LogSink;

use crate::{
    config::{LogLevel, ResolvedConfig, ServiceIdentity},
    telemetry::TelemetryHandle,
};

/// Emit a record with structured fields at a runtime-selected level
///
/// Accepts the same field syntax as the `tracing` macros.
///
/// ```ignore
/// log_event!(logger, LogLevel::Warn, status = 404_u16, path = %path, "HTTP Client Error");
/// ```
#[macro_export]
macro_rules! log_event {
    ($logger:expr, $level:expr, $($rest:tt)+) => {{
        let level: $crate::config::LogLevel = $level;
        $logger.in_scope(|| match level {
            $crate::config::LogLevel::Debug => $crate::__private::tracing::debug!($($rest)+),
            $crate::config::LogLevel::Info => $crate::__private::tracing::info!($($rest)+),
            $crate::config::LogLevel::Warn => $crate::__private::tracing::warn!($($rest)+),
            $crate::config::LogLevel::Error => $crate::__private::tracing::error!($($rest)+),
        });
    }};
}

/// Leveled, service-tagged log facade
#[derive(Debug)]
pub struct StructuredLogger {
    dispatch: Dispatch,
    sink: LogSink,
    level: LogLevel,
    service: ServiceIdentity,
}

/// Builder for [`StructuredLogger`]
#[derive(Debug)]
pub struct LoggerBuilder<'a> {
    config: &'a ResolvedConfig,
    sink: Option<LogSink>,
    tracer: Option<SdkTracer>,
}

impl LoggerBuilder<'_> {
    /// Write records somewhere other than stdout
    #[must_use]
    pub fn sink(mut self, sink: LogSink) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Export `tracing` spans opened under this logger through the handle's
    /// tracer provider
    #[must_use]
    pub fn tracer(mut self, telemetry: &TelemetryHandle) -> Self {
        self.tracer = Some(telemetry.tracer("observability.logger"));
        self
    }

    pub fn build(self) -> StructuredLogger {
        let sink = self.sink.unwrap_or_else(LogSink::stdout);
        let level = self.config.log_level;

        let fmt_layer = tracing_subscriber::fmt::layer()
            .event_format(JsonRecordFormat::new(&self.config.service))
            .with_writer(sink.clone());
        let otel_layer = self
            .tracer
            .map(|tracer| tracing_opentelemetry::layer().with_tracer(tracer));

        let subscriber = tracing_subscriber::registry()
            .with(LevelFilter::from_level(level.as_tracing()))
            .with(otel_layer)
            .with(fmt_layer);

        StructuredLogger {
            dispatch: Dispatch::new(subscriber),
            sink,
            level,
            service: self.config.service.clone(),
        }
    }
}

impl StructuredLogger {
    /// Logger writing buffered JSON lines to stdout
    pub fn new(config: &ResolvedConfig) -> Self {
        Self::builder(config).build()
    }

    pub fn builder(config: &ResolvedConfig) -> LoggerBuilder<'_> {
        LoggerBuilder {
            config,
            sink: None,
            tracer: None,
        }
    }

    /// Minimum level that is written
    pub const fn level(&self) -> LogLevel {
        self.level
    }

    pub const fn service(&self) -> &ServiceIdentity {
        &self.service
    }

    /// The sink records are written to
    pub const fn sink(&self) -> &LogSink {
        &self.sink
    }

    /// Run `f` with this logger as the active `tracing` dispatcher
    pub fn in_scope<T>(&self, f: impl FnOnce() -> T) -> T {
        tracing::dispatcher::with_default(&self.dispatch, f)
    }

    pub fn debug(&self, msg: &str) {
        self.in_scope(|| tracing::debug!("{msg}"));
    }

    pub fn info(&self, msg: &str) {
        self.in_scope(|| tracing::info!("{msg}"));
    }

    pub fn warn(&self, msg: &str) {
        self.in_scope(|| tracing::warn!("{msg}"));
    }

    pub fn error(&self, msg: &str) {
        self.in_scope(|| tracing::error!("{msg}"));
    }

    /// Write a fatal record, flush and terminate the process with exit code 1
    pub fn fatal(&self, msg: &str) -> ! {
        self.in_scope(|| tracing::error!(fatal = true, "{msg}"));
        let _ = self.flush();
        std::process::exit(1)
    }

    /// Push buffered records out. Call before the process exits.
    pub fn flush(&self) -> io::Result<()> {
        self.sink.flush()
    }

    /// Route every `tracing` event in the process through this logger
    pub fn install_global(&self) -> Result<(), SetGlobalDefaultError> {
        tracing::dispatcher::set_global_default(self.dispatch.clone())
    }
}
