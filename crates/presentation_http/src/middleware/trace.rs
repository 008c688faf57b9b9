//! Server span per request
//!
//! Continues the caller's trace from `traceparent`/`baggage`, records the
//! request in a server-kind span and exposes the trace id to the client.

use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use axum::{extract::Request, http::HeaderValue, response::Response};
use observability::{Instrumentation, RequestContext, chain::attached};
use opentelemetry::KeyValue;
use tower::{Layer, Service};

use super::propagation::HeaderExtractor;

/// Response header carrying the trace id of the request
pub const TRACE_ID_HEADER: &str = "X-Trace-ID";

const HTTP_REQUEST_METHOD: &str = "http.request.method";
const URL_PATH: &str = "url.path";
const HTTP_RESPONSE_STATUS_CODE: &str = "http.response.status_code";

/// Layer that opens a server span around every non-skipped request
#[derive(Debug, Clone)]
pub struct TracingLayer {
    instrumentation: Instrumentation,
}

impl TracingLayer {
    #[must_use]
    pub const fn new(instrumentation: Instrumentation) -> Self {
        Self { instrumentation }
    }
}

impl<S> Layer<S> for TracingLayer {
    type Service = TracingService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TracingService {
            inner,
            instrumentation: self.instrumentation.clone(),
        }
    }
}

/// Service that runs each request inside a server span and tags the response
/// with its trace id
#[derive(Debug, Clone)]
pub struct TracingService<S> {
    inner: S,
    instrumentation: Instrumentation,
}

impl<S> Service<Request> for TracingService<S>
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

    fn call(&mut self, mut request: Request) -> Self::Future {
        let mut inner = self.inner.clone();
        let path = request.uri().path().to_string();
        if self.instrumentation.should_skip(&path) {
            return Box::pin(async move { inner.call(request).await });
        }

        let method = request.method().as_str().to_string();
        let parent = self
            .instrumentation
            .telemetry()
            .extract(&HeaderExtractor(request.headers()));
        let span = self.instrumentation.start_server_span(
            format!("{method} {path}"),
            &parent,
            vec![
                KeyValue::new(HTTP_REQUEST_METHOD, method.clone()),
                KeyValue::new(URL_PATH, path.clone()),
            ],
        );
        request
            .extensions_mut()
            .insert(RequestContext::new(method, path, span.context().clone()));

        Box::pin(async move {
            let mut response =
                attached(span.context().clone(), async move { inner.call(request).await }).await?;

            let status = response.status();
            span.set_attribute(KeyValue::new(
                HTTP_RESPONSE_STATUS_CODE,
                i64::from(status.as_u16()),
            ));
            if status.as_u16() >= 500 {
                span.set_error(status.to_string());
            }
            let trace_id = span.trace_ids().trace_id;
            if let Some(value) = trace_id.and_then(|id| HeaderValue::from_str(&id).ok()) {
                response.headers_mut().insert(TRACE_ID_HEADER, value);
            }
            Ok(response)
        })
    }
}
