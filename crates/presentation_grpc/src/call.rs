//! Per-call bookkeeping shared by unary and streaming RPCs

use std::time::Instant;

use observability::{
    Instrumentation, LogLevel, Outcome, RequestContext, TraceIds,
    chain::{CaughtPanic, SpanGuard, latency_ms},
    log_event,
};
use opentelemetry::{Context, KeyValue};
use tonic::{
    Code, Request, Status,
    metadata::{AsciiMetadataValue, MetadataMap},
};

use crate::propagation::extract_context;

/// Status message returned in place of a panic
pub const INTERNAL_MESSAGE: &str = "Internal server error occurred";

/// Trailer carrying the trace id of a recovered call
pub const TRACE_ID_TRAILER: &str = "trace_id";

/// Shape of the method being served
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcInfo {
    /// `/package.Service/Method`
    pub full_method: String,
    pub is_client_stream: bool,
    pub is_server_stream: bool,
}

impl RpcInfo {
    fn new(full_method: impl Into<String>, is_client_stream: bool, is_server_stream: bool) -> Self {
        Self {
            full_method: full_method.into(),
            is_client_stream,
            is_server_stream,
        }
    }

    pub fn unary(full_method: impl Into<String>) -> Self {
        Self::new(full_method, false, false)
    }

    pub fn client_streaming(full_method: impl Into<String>) -> Self {
        Self::new(full_method, true, false)
    }

    pub fn server_streaming(full_method: impl Into<String>) -> Self {
        Self::new(full_method, false, true)
    }

    pub fn bidi_streaming(full_method: impl Into<String>) -> Self {
        Self::new(full_method, true, true)
    }

    pub const fn is_streaming(&self) -> bool {
        self.is_client_stream || self.is_server_stream
    }

    /// Service part of the full method, `package.Service`
    pub fn service(&self) -> &str {
        self.split().0
    }

    /// Bare method name
    pub fn method(&self) -> &str {
        self.split().1
    }

    fn split(&self) -> (&str, &str) {
        self.full_method
            .trim_start_matches('/')
            .rsplit_once('/')
            .unwrap_or(("", self.full_method.as_str()))
    }
}

/// Canonical name of a status code, as written in `grpc_code`
pub const fn code_name(code: Code) -> &'static str {
    match code {
        Code::Ok => "OK",
        Code::Cancelled => "Cancelled",
        Code::Unknown => "Unknown",
        Code::InvalidArgument => "InvalidArgument",
        Code::DeadlineExceeded => "DeadlineExceeded",
        Code::NotFound => "NotFound",
        Code::AlreadyExists => "AlreadyExists",
        Code::PermissionDenied => "PermissionDenied",
        Code::ResourceExhausted => "ResourceExhausted",
        Code::FailedPrecondition => "FailedPrecondition",
        Code::Aborted => "Aborted",
        Code::OutOfRange => "OutOfRange",
        Code::Unimplemented => "Unimplemented",
        Code::Internal => "Internal",
        Code::Unavailable => "Unavailable",
        Code::DataLoss => "DataLoss",
        Code::Unauthenticated => "Unauthenticated",
    }
}

/// Codes caused by the caller rather than the server
pub const fn classify(code: Code) -> Outcome {
    match code {
        Code::Ok => Outcome::Success,
        Code::Cancelled
        | Code::InvalidArgument
        | Code::NotFound
        | Code::AlreadyExists
        | Code::PermissionDenied
        | Code::Unauthenticated
        | Code::FailedPrecondition
        | Code::OutOfRange => Outcome::ClientFault,
        _ => Outcome::ServerFault,
    }
}

const fn record_message(outcome: Outcome, streaming: bool) -> &'static str {
    match (outcome, streaming) {
        (Outcome::Success, false) => "gRPC Request",
        (Outcome::ClientFault, false) => "gRPC Client Error",
        (Outcome::ServerFault, false) => "gRPC Server Error",
        (Outcome::Success, true) => "gRPC Stream Request",
        (Outcome::ClientFault, true) => "gRPC Stream Client Error",
        (Outcome::ServerFault, true) => "gRPC Stream Server Error",
    }
}

/// Span, timer and log state of one call
///
/// The call is logged exactly once: when it completes, when a panic is
/// recovered, or as `Cancelled` when the scope is dropped unfinished.
/// The span ends when the scope is dropped.
#[derive(Debug)]
pub(crate) struct CallScope {
    instrumentation: Instrumentation,
    info: RpcInfo,
    skip: bool,
    span: Option<SpanGuard>,
    started_at: Instant,
    finished: bool,
}

impl CallScope {
    pub(crate) fn start<T>(
        instrumentation: Instrumentation,
        info: RpcInfo,
        request: &mut Request<T>,
    ) -> Self {
        let skip = instrumentation.should_skip(&info.full_method);
        let span = (!skip).then(|| {
            let parent = extract_context(instrumentation.telemetry(), request.metadata());
            let span = instrumentation.start_server_span(
                info.full_method.clone(),
                &parent,
                vec![
                    KeyValue::new("rpc.system", "grpc"),
                    KeyValue::new("rpc.service", info.service().to_string()),
                    KeyValue::new("rpc.method", info.method().to_string()),
                ],
            );
            request.extensions_mut().insert(RequestContext::new(
                info.full_method.clone(),
                info.full_method.clone(),
                span.context().clone(),
            ));
            span
        });

        Self {
            instrumentation,
            info,
            skip,
            span,
            started_at: Instant::now(),
            finished: false,
        }
    }

    /// Context the handler runs under
    pub(crate) fn context(&self) -> Context {
        self.span
            .as_ref()
            .map_or_else(Context::current, |span| span.context().clone())
    }

    fn trace_ids(&self) -> TraceIds {
        self.span
            .as_ref()
            .map_or_else(TraceIds::current, SpanGuard::trace_ids)
    }

    pub(crate) const fn is_finished(&self) -> bool {
        self.finished
    }

    fn record_status(&self, code: Code) {
        if let Some(span) = &self.span {
            span.set_attribute(KeyValue::new("rpc.grpc.status_code", i64::from(i32::from(code))));
            if code != Code::Ok {
                span.set_error(code_name(code));
            }
        }
    }

    /// Log the completed call
    pub(crate) fn finish(&mut self, code: Code, error: Option<&str>) {
        if self.finished {
            return;
        }
        self.finished = true;
        if self.skip {
            return;
        }
        self.record_status(code);

        let ids = self.trace_ids();
        let outcome = classify(code);
        let message = record_message(outcome, self.info.is_streaming());
        let latency_ms = latency_ms(self.started_at.elapsed());
        let logger = self.instrumentation.logger();
        if self.info.is_streaming() {
            log_event!(
                logger,
                outcome.level(),
                method = %self.info.full_method,
                grpc_code = code_name(code),
                latency_ms,
                is_client_stream = self.info.is_client_stream,
                is_server_stream = self.info.is_server_stream,
                trace_id = ids.trace_id.as_deref(),
                span_id = ids.span_id.as_deref(),
                error,
                "{message}"
            );
        } else {
            log_event!(
                logger,
                outcome.level(),
                method = %self.info.full_method,
                grpc_code = code_name(code),
                latency_ms,
                trace_id = ids.trace_id.as_deref(),
                span_id = ids.span_id.as_deref(),
                error,
                "{message}"
            );
        }
    }

    /// Turn a caught panic into `Internal`, or re-raise it on skipped methods
    pub(crate) fn recover(&mut self, caught: CaughtPanic) -> Status {
        if self.skip {
            caught.resume();
        }
        self.finished = true;
        self.record_status(Code::Internal);

        let failure = caught.into_failure();
        let trace_id = self.trace_ids().trace_id.unwrap_or_default();
        let logger = self.instrumentation.logger();
        if self.info.is_streaming() {
            log_event!(
                logger,
                LogLevel::Error,
                error = %failure.message,
                trace_id = %trace_id,
                method = %self.info.full_method,
                is_client_stream = self.info.is_client_stream,
                is_server_stream = self.info.is_server_stream,
                stack = %failure.stack,
                "Panic recovered in gRPC stream handler"
            );
        } else {
            log_event!(
                logger,
                LogLevel::Error,
                error = %failure.message,
                trace_id = %trace_id,
                method = %self.info.full_method,
                stack = %failure.stack,
                "Panic recovered in gRPC handler"
            );
        }

        let mut trailers = MetadataMap::new();
        let value = Some(trace_id.as_str())
            .filter(|id| !id.is_empty())
            .and_then(|id| AsciiMetadataValue::try_from(id).ok());
        if let Some(value) = value {
            trailers.insert(TRACE_ID_TRAILER, value);
        }
        Status::with_metadata(Code::Internal, INTERNAL_MESSAGE, trailers)
    }
}

impl Drop for CallScope {
    fn drop(&mut self) {
        if !self.finished && !std::thread::panicking() {
            self.finish(Code::Cancelled, None);
        }
    }
}
