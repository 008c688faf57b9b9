//! HTTP transport adapter for the observability chain
//!
//! ```ignore
//! let app = Router::new()
//!     .route("/users/{id}", get(user))
//!     .layer(ObservabilityLayer::new(instrumentation));
//! ```

pub mod error;
pub mod middleware;

pub use error::{ErrorResponse, HandlerError};
pub use middleware::{
    LoggingLayer, ObservabilityLayer, RecoveryLayer, TRACE_ID_HEADER, TracingLayer,
};
