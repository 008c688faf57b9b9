//! One structured record per completed request

use std::{
    future::Future,
    net::SocketAddr,
    pin::Pin,
    task::{Context, Poll},
    time::Instant,
};

use axum::{
    extract::{ConnectInfo, Request},
    http::{HeaderMap, StatusCode, header::USER_AGENT},
    response::Response,
};
use observability::{
    Instrumentation, Outcome, RequestContext, TraceIds, chain::latency_ms, log_event,
};
use tower::{Layer, Service};

use crate::error::HandlerError;

/// Layer that logs status, latency and caller details of each request
#[derive(Debug, Clone)]
pub struct LoggingLayer {
    instrumentation: Instrumentation,
}

impl LoggingLayer {
    #[must_use]
    pub const fn new(instrumentation: Instrumentation) -> Self {
        Self { instrumentation }
    }
}

impl<S> Layer<S> for LoggingLayer {
    type Service = LoggingService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        LoggingService {
            inner,
            instrumentation: self.instrumentation.clone(),
        }
    }
}

/// Service that times each request and writes one record when it completes
#[derive(Debug, Clone)]
pub struct LoggingService<S> {
    inner: S,
    instrumentation: Instrumentation,
}

impl<S> Service<Request> for LoggingService<S>
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
        let path = request.uri().path().to_string();
        if self.instrumentation.should_skip(&path) {
            return Box::pin(async move { inner.call(request).await });
        }

        let instrumentation = self.instrumentation.clone();
        let started_at = Instant::now();
        let method = request.method().as_str().to_string();
        let query = request.uri().query().unwrap_or_default().to_string();
        let ip = client_ip(&request);
        let user_agent = request
            .headers()
            .get(USER_AGENT)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let ids = request
            .extensions()
            .get::<RequestContext>()
            .map(RequestContext::trace_ids);

        Box::pin(async move {
            let response = inner.call(request).await?;

            let status = response.status();
            let ids = ids.unwrap_or_else(TraceIds::current);
            let error = response
                .extensions()
                .get::<HandlerError>()
                .map(HandlerError::message);
            let (outcome, message) = classify(status);
            log_event!(
                instrumentation.logger(),
                outcome.level(),
                status = status.as_u16(),
                method = %method,
                path = %path,
                query = %query,
                ip = %ip,
                latency_ms = latency_ms(started_at.elapsed()),
                user_agent = %user_agent,
                trace_id = ids.trace_id.as_deref(),
                span_id = ids.span_id.as_deref(),
                error,
                "{message}"
            );
            Ok(response)
        })
    }
}

fn classify(status: StatusCode) -> (Outcome, &'static str) {
    if status.as_u16() >= 500 {
        (Outcome::ServerFault, "HTTP Server Error")
    } else if status.is_client_error() {
        (Outcome::ClientFault, "HTTP Client Error")
    } else {
        (Outcome::Success, "HTTP Request")
    }
}

/// Original client address: first `X-Forwarded-For` hop, then
/// `X-Real-IP`, then the socket peer
fn client_ip(request: &Request) -> String {
    forwarded_ip(request.headers())
        .or_else(|| {
            request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(peer)| peer.ip().to_string())
        })
        .unwrap_or_default()
}

fn forwarded_ip(headers: &HeaderMap) -> Option<String> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
    };

    header("x-forwarded-for")
        .and_then(|chain| chain.split(',').next())
        .map(str::trim)
        .filter(|first| !first.is_empty())
        .or_else(|| header("x-real-ip"))
        .map(ToString::to_string)
}
