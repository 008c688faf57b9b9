//! Instrumentation layers for axum/tower services
//!
//! The stages are independent layers; [`ObservabilityLayer`] stacks them in
//! the order they are meant to run: tracing outermost, then panic recovery,
//! then request logging next to the handler.

pub mod logging;
pub mod propagation;
pub mod recovery;
pub mod trace;

use observability::Instrumentation;
use tower::{Layer, ServiceBuilder};

pub use logging::{LoggingLayer, LoggingService};
pub use propagation::{HeaderExtractor, HeaderInjector};
pub use recovery::{RecoveryLayer, RecoveryService};
pub use trace::{TRACE_ID_HEADER, TracingLayer, TracingService};

/// Tracing, recovery and logging as one layer
#[derive(Debug, Clone)]
pub struct ObservabilityLayer {
    instrumentation: Instrumentation,
}

impl ObservabilityLayer {
    #[must_use]
    pub const fn new(instrumentation: Instrumentation) -> Self {
        Self { instrumentation }
    }
}

impl<S> Layer<S> for ObservabilityLayer {
    type Service = TracingService<RecoveryService<LoggingService<S>>>;

    fn layer(&self, inner: S) -> Self::Service {
        ServiceBuilder::new()
            .layer(TracingLayer::new(self.instrumentation.clone()))
            .layer(RecoveryLayer::new(self.instrumentation.clone()))
            .layer(LoggingLayer::new(self.instrumentation.clone()))
            .service(inner)
    }
}
