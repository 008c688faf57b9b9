//! Observability bootstrap for services
//!
//! Resolves layered configuration, starts the trace and metrics pipelines,
//! provides a structured JSON logger and the transport-neutral pieces of
//! the request instrumentation chain.
//!
//! # Example
//!
//! ```ignore
//! use observability::{ConfigResolver, StructuredLogger, TelemetryBootstrap, build_constants};
//!
//! let config = ConfigResolver::new()
//!     .with_build_constants(build_constants!())
//!     .resolve()?;
//! let logger = StructuredLogger::new(&config);
//! let (telemetry, shutdown) = TelemetryBootstrap::initialize(&config).await?;
//! // serve...
//! shutdown.shutdown(Duration::from_secs(5)).await?;
//! logger.flush()?;
//! ```

pub mod chain;
pub mod config;
pub mod logger;
pub mod telemetry;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

#[doc(hidden)]
pub mod __private {
    pub use tracing;
}

pub use chain::{HandlerFailure, Instrumentation, Outcome, RequestContext, SkipPolicy, TraceIds};
pub use config::{
    BuildConstants, ConfigError, ConfigResolver, ConfigViolation, LogLevel, MetricsMode,
    ResolvedConfig,
};
pub use logger::{LogSink, StructuredLogger};
pub use telemetry::{
    ShutdownError, ShutdownHandle, TelemetryBootstrap, TelemetryError, TelemetryHandle,
};
