//! Instrumentation shared by every transport adapter
//!
//! A transport wraps each handler in three stages, outermost first:
//! tracing, panic recovery, request logging. This module holds the parts
//! that do not depend on the transport: the skip policy, the per-call
//! [`RequestContext`], the [`guarded`] panic boundary and the
//! [`Instrumentation`] bundle the stages are built from.

mod context;
mod recovery;
mod skip;

use std::{borrow::Cow, sync::Arc};

use opentelemetry::{
    Context, KeyValue,
    trace::{SpanKind, Status, TraceContextExt, Tracer},
};
use opentelemetry_sdk::trace::SdkTracer;

pub use context::{RequestContext, TraceIds, attached, latency_ms};
pub use recovery::{CaughtPanic, HandlerFailure, guarded, guarded_sync, payload_message};
pub use skip::SkipPolicy;

use crate::{config::LogLevel, logger::StructuredLogger, telemetry::TelemetryHandle};

/// Instrumentation scope name for server spans
pub const TRACER_NAME: &str = "observability.server";

/// How a completed call is judged when it is logged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// The caller sent something the handler rejected
    ClientFault,
    ServerFault,
}

impl Outcome {
    /// Severity of the request record
    pub const fn level(self) -> LogLevel {
        match self {
            Self::Success => LogLevel::Info,
            Self::ClientFault => LogLevel::Warn,
            Self::ServerFault => LogLevel::Error,
        }
    }
}

/// Everything a transport needs to build its stages
#[derive(Debug, Clone)]
pub struct Instrumentation {
    telemetry: Arc<TelemetryHandle>,
    logger: Arc<StructuredLogger>,
    skip: SkipPolicy,
    tracer: SdkTracer,
}

impl Instrumentation {
    pub fn new(telemetry: Arc<TelemetryHandle>, logger: Arc<StructuredLogger>) -> Self {
        let tracer = telemetry.tracer(TRACER_NAME);
        Self {
            telemetry,
            logger,
            skip: SkipPolicy::default(),
            tracer,
        }
    }

    #[must_use]
    pub fn with_skip_policy(mut self, skip: SkipPolicy) -> Self {
        self.skip = skip;
        self
    }

    pub fn telemetry(&self) -> &TelemetryHandle {
        &self.telemetry
    }

    pub fn logger(&self) -> &StructuredLogger {
        &self.logger
    }

    pub const fn skip_policy(&self) -> &SkipPolicy {
        &self.skip
    }

    pub fn should_skip(&self, route: &str) -> bool {
        self.skip.should_skip(route)
    }

    /// Start a server-kind span as a child of `parent`
    ///
    /// The span ends when the returned guard is dropped.
    pub fn start_server_span(
        &self,
        name: impl Into<Cow<'static, str>>,
        parent: &Context,
        attributes: Vec<KeyValue>,
    ) -> SpanGuard {
        let span = self
            .tracer
            .span_builder(name)
            .with_kind(SpanKind::Server)
            .with_attributes(attributes)
            .start_with_context(&self.tracer, parent);
        SpanGuard {
            cx: parent.with_span(span),
        }
    }
}

/// Owns a started span and ends it on drop
#[derive(Debug)]
pub struct SpanGuard {
    cx: Context,
}

impl SpanGuard {
    /// Context with this span active
    pub const fn context(&self) -> &Context {
        &self.cx
    }

    pub fn trace_ids(&self) -> TraceIds {
        TraceIds::from_context(&self.cx)
    }

    pub fn set_attribute(&self, attribute: KeyValue) {
        self.cx.span().set_attribute(attribute);
    }

    pub fn set_error(&self, description: impl Into<Cow<'static, str>>) {
        self.cx.span().set_status(Status::error(description));
    }
}

impl Drop for SpanGuard {
    fn drop(&mut self) {
        self.cx.span().end();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    #[test]
    fn outcome_levels() {
        assert_eq!(Outcome::Success.level(), LogLevel::Info);
        assert_eq!(Outcome::ClientFault.level(), LogLevel::Warn);
        assert_eq!(Outcome::ServerFault.level(), LogLevel::Error);
    }

    #[tokio::test]
    async fn server_span_ends_when_guard_drops() {
        let fixture = testing::instrumentation("chain-span", SkipPolicy::default())
            .await
            .unwrap();

        let guard = fixture.instrumentation.start_server_span(
            "GET /x",
            &Context::new(),
            vec![KeyValue::new("url.path", "/x")],
        );
        assert!(guard.trace_ids().trace_id.is_some());
        assert!(fixture.spans.get_finished_spans().unwrap().is_empty());

        guard.set_attribute(KeyValue::new("http.response.status_code", 500));
        guard.set_error("server error");
        drop(guard);

        let spans = fixture.spans.get_finished_spans().unwrap();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].name, "GET /x");
        assert_eq!(spans[0].span_kind, SpanKind::Server);
        assert!(matches!(spans[0].status, Status::Error { .. }));
    }

    #[tokio::test]
    async fn remote_parent_is_continued() {
        let fixture = testing::instrumentation("chain-parent", SkipPolicy::default())
            .await
            .unwrap();
        let carrier = std::collections::HashMap::from([(
            "traceparent".to_string(),
            "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01".to_string(),
        )]);
        let parent = fixture.instrumentation.telemetry().extract(&carrier);

        let guard = fixture
            .instrumentation
            .start_server_span("child", &parent, Vec::new());
        assert_eq!(
            guard.trace_ids().trace_id.as_deref(),
            Some("4bf92f3577b34da6a3ce929d0e0e4736")
        );
    }

    #[tokio::test]
    async fn skip_policy_is_consulted() {
        let fixture = testing::instrumentation("chain-skip", SkipPolicy::new().exclude("/health"))
            .await
            .unwrap();
        assert!(fixture.instrumentation.should_skip("/health"));
        assert!(!fixture.instrumentation.should_skip("/x"));
    }
}
