//! Converts handler panics into a generic 500 response

use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use axum::{
    extract::Request,
    response::{IntoResponse, Response},
};
use observability::{
    Instrumentation, LogLevel, RequestContext, TraceIds, chain::guarded, log_event,
};
use tower::{Layer, Service};

use crate::error::ErrorResponse;

/// Layer that keeps a panicking handler from taking the connection down
///
/// On skipped routes the panic is re-raised untouched.
#[derive(Debug, Clone)]
pub struct RecoveryLayer {
    instrumentation: Instrumentation,
}

impl RecoveryLayer {
    #[must_use]
    pub const fn new(instrumentation: Instrumentation) -> Self {
        Self { instrumentation }
    }
}

impl<S> Layer<S> for RecoveryLayer {
    type Service = RecoveryService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RecoveryService {
            inner,
            instrumentation: self.instrumentation.clone(),
        }
    }
}

/// Service that turns a panic in the inner handler into a logged 500
#[derive(Debug, Clone)]
pub struct RecoveryService<S> {
    inner: S,
    instrumentation: Instrumentation,
}

impl<S> Service<Request> for RecoveryService<S>
where
    S: Service<Request, Response = Response> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request) -> Self::Future {
        let mut inner = self.inner.clone();
        let instrumentation = self.instrumentation.clone();
        let path = request.uri().path().to_string();
        let method = request.method().as_str().to_string();
        let ids = request
            .extensions()
            .get::<RequestContext>()
            .map(RequestContext::trace_ids);

        Box::pin(async move {
            let caught = match guarded(async move { inner.call(request).await }).await {
                Ok(result) => return result,
                Err(caught) => caught,
            };
            if instrumentation.should_skip(&path) {
                caught.resume();
            }

            let failure = caught.into_failure();
            let trace_id = ids.unwrap_or_else(TraceIds::current).trace_id;
            log_event!(
                instrumentation.logger(),
                LogLevel::Error,
                error = %failure.message,
                trace_id = %trace_id.as_deref().unwrap_or_default(),
                path = %path,
                method = %method,
                stack = %failure.stack,
                "Panic recovered"
            );

            Ok(ErrorResponse::internal(path, trace_id).into_response())
        })
    }
}
