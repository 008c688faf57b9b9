//! Per-call state shared by the instrumentation stages

use std::time::{Duration, Instant};

use opentelemetry::{
    Context,
    trace::{SpanId, TraceContextExt, TraceId},
};

/// Trace and span id of a call, present only when both are non-zero
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraceIds {
    pub trace_id: Option<String>,
    pub span_id: Option<String>,
}

impl TraceIds {
    /// Ids of the span active in `cx`
    ///
    /// The all-zero ids mean "no span" and are reported as absent.
    pub fn from_context(cx: &Context) -> Self {
        let span = cx.span();
        let span_context = span.span_context();
        let (trace_id, span_id) = (span_context.trace_id(), span_context.span_id());
        if trace_id == TraceId::INVALID || span_id == SpanId::INVALID {
            return Self::default();
        }
        Self {
            trace_id: Some(trace_id.to_string()),
            span_id: Some(span_id.to_string()),
        }
    }

    /// Ids of the span in the current OpenTelemetry context
    pub fn current() -> Self {
        Self::from_context(&Context::current())
    }

    /// Trace id, or an empty string when there is none
    pub fn trace_id_or_empty(&self) -> &str {
        self.trace_id.as_deref().unwrap_or_default()
    }
}

/// Transport-neutral view of one inbound call
///
/// Created by the tracing stage; later stages read it from the request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    method: String,
    route: String,
    otel: Context,
    started_at: Instant,
}

impl RequestContext {
    pub fn new(method: impl Into<String>, route: impl Into<String>, otel: Context) -> Self {
        Self {
            method: method.into(),
            route: route.into(),
            otel,
            started_at: Instant::now(),
        }
    }

    /// HTTP method, or the full RPC method
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Route identifier the skip policy is evaluated against
    pub fn route(&self) -> &str {
        &self.route
    }

    /// OpenTelemetry context carrying the server span
    pub const fn otel_context(&self) -> &Context {
        &self.otel
    }

    pub const fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn trace_ids(&self) -> TraceIds {
        TraceIds::from_context(&self.otel)
    }
}

/// Drive `future` with `cx` as the current OpenTelemetry context on
/// every poll
pub async fn attached<F: Future>(cx: Context, future: F) -> F::Output {
    let mut future = std::pin::pin!(future);
    std::future::poll_fn(|task| {
        let _current = cx.clone().attach();
        future.as_mut().poll(task)
    })
    .await
}

/// Milliseconds with sub-millisecond precision, as logged in `latency_ms`
pub fn latency_ms(elapsed: Duration) -> f64 {
    elapsed.as_secs_f64() * 1000.0
}
