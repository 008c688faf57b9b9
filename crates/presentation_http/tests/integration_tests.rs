//! End-to-end tests for the HTTP instrumentation layers
#![allow(clippy::expect_used, clippy::unwrap_used)]

use axum::{
    Router,
    body::{Body, to_bytes},
    extract::Request,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};
use axum_test::TestServer;
use observability::{
    SkipPolicy,
    chain::guarded,
    testing::{self, InstrumentationFixture},
};
use opentelemetry::{Value as OtelValue, trace::Status};
use presentation_http::{HandlerError, LoggingLayer, ObservabilityLayer, TRACE_ID_HEADER};
use serde_json::Value;
use tower::ServiceExt;

async fn ok() -> &'static str {
    "hello"
}

async fn boom() -> &'static str {
    panic!("boom")
}

async fn upstream_failure() -> impl IntoResponse {
    (
        StatusCode::BAD_GATEWAY,
        HandlerError::new("upstream down"),
        "try again",
    )
}

async fn fixture(service: &str, skip: SkipPolicy) -> InstrumentationFixture {
    testing::instrumentation(service, skip)
        .await
        .expect("instrumentation fixture")
}

async fn nonstandard_status() -> StatusCode {
    StatusCode::from_u16(600).unwrap()
}

fn app(fixture: &InstrumentationFixture) -> Router {
    Router::new()
        .route("/ok", get(ok))
        .route("/x", get(boom))
        .route("/health", get(ok))
        .route("/probe", get(boom))
        .route("/upstream", get(upstream_failure))
        .route("/odd", get(nonstandard_status))
        .layer(ObservabilityLayer::new(fixture.instrumentation.clone()))
}

fn get_request(uri: &str) -> Request {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn has_attribute(attributes: &[opentelemetry::KeyValue], key: &str, value: &OtelValue) -> bool {
    attributes
        .iter()
        .any(|kv| kv.key.as_str() == key && &kv.value == value)
}

#[tokio::test]
async fn successful_request_produces_one_span_and_one_info_record() {
    let fixture = fixture("http-ok", SkipPolicy::default()).await;
    let server = TestServer::new(app(&fixture)).unwrap();

    let response = server.get("/ok").await;
    assert_eq!(response.status_code(), StatusCode::OK);
    assert_eq!(response.text(), "hello");

    let records = fixture.records();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record["level"], "info");
    assert_eq!(record["msg"], "HTTP Request");
    assert_eq!(record["service"], "http-ok");
    assert_eq!(record["status"], 200);
    assert_eq!(record["method"], "GET");
    assert_eq!(record["path"], "/ok");
    assert!(record["latency_ms"].as_f64().unwrap() >= 0.0);
    assert_eq!(record["trace_id"].as_str().unwrap().len(), 32);
    assert_eq!(record["span_id"].as_str().unwrap().len(), 16);

    let spans = fixture.spans.get_finished_spans().unwrap();
    assert_eq!(spans.len(), 1);
    let span = &spans[0];
    assert_eq!(span.name, "GET /ok");
    assert_eq!(
        record["trace_id"].as_str().unwrap(),
        span.span_context.trace_id().to_string()
    );
    assert!(has_attribute(
        &span.attributes,
        "http.request.method",
        &OtelValue::from("GET")
    ));
    assert!(has_attribute(&span.attributes, "url.path", &OtelValue::from("/ok")));
    assert!(has_attribute(
        &span.attributes,
        "http.response.status_code",
        &OtelValue::I64(200)
    ));

    let trace_header = response.header(TRACE_ID_HEADER);
    assert_eq!(trace_header.to_str().unwrap(), record["trace_id"].as_str().unwrap());
}

#[tokio::test]
async fn panic_returns_generic_500_and_logs_the_failure() {
    let fixture = fixture("http-panic", SkipPolicy::default()).await;
    let server = TestServer::new(app(&fixture)).unwrap();

    let response = server.get("/x").await;
    assert_eq!(response.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    let body: Value = response.json();
    assert_eq!(body["error"], "Internal Server Error");
    assert_eq!(
        body["message"],
        "An unexpected error occurred. Please try again later."
    );
    assert_eq!(body["path"], "/x");
    assert!(!response.text().contains("boom"));

    let records = fixture.records();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record["level"], "error");
    assert_eq!(record["msg"], "Panic recovered");
    assert_eq!(record["error"], "boom");
    assert_eq!(record["path"], "/x");
    assert_eq!(record["method"], "GET");
    assert!(!record["stack"].as_str().unwrap().is_empty());
    assert_eq!(record["trace_id"], body["trace_id"]);

    let spans = fixture.spans.get_finished_spans().unwrap();
    assert_eq!(spans.len(), 1);
    assert!(matches!(spans[0].status, Status::Error { .. }));
}

#[tokio::test]
async fn skipped_route_has_no_span_and_no_record() {
    let fixture = fixture("http-skip", SkipPolicy::new().exclude("/health")).await;

    let response = app(&fixture).oneshot(get_request("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get(TRACE_ID_HEADER).is_none());

    assert!(fixture.records().is_empty());
    assert!(fixture.spans.get_finished_spans().unwrap().is_empty());
}

#[tokio::test]
async fn panic_on_skipped_route_is_not_recovered() {
    let fixture = fixture("http-skip-panic", SkipPolicy::new().exclude("/probe")).await;

    let caught = guarded(app(&fixture).oneshot(get_request("/probe")))
        .await
        .expect_err("panic should propagate");
    assert_eq!(caught.failure().message, "boom");
    assert!(fixture.records().is_empty());
}

#[tokio::test]
async fn unknown_route_is_a_client_error() {
    let fixture = fixture("http-404", SkipPolicy::default()).await;
    let server = TestServer::new(app(&fixture)).unwrap();

    let response = server.get("/missing").await;
    assert_eq!(response.status_code(), StatusCode::NOT_FOUND);

    let records = fixture.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["level"], "warn");
    assert_eq!(records[0]["msg"], "HTTP Client Error");
    assert_eq!(records[0]["status"], 404);
}

#[tokio::test]
async fn handler_error_is_logged_and_marks_span() {
    let fixture = fixture("http-upstream", SkipPolicy::default()).await;

    let response = app(&fixture)
        .oneshot(get_request("/upstream"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&body[..], b"try again");

    let records = fixture.records();
    assert_eq!(records[0]["level"], "error");
    assert_eq!(records[0]["msg"], "HTTP Server Error");
    assert_eq!(records[0]["error"], "upstream down");

    let spans = fixture.spans.get_finished_spans().unwrap();
    assert!(matches!(spans[0].status, Status::Error { .. }));
}

#[tokio::test]
async fn status_above_599_is_a_server_error() {
    let fixture = fixture("http-odd", SkipPolicy::default()).await;

    let response = app(&fixture).oneshot(get_request("/odd")).await.unwrap();
    assert_eq!(response.status().as_u16(), 600);

    let records = fixture.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["level"], "error");
    assert_eq!(records[0]["msg"], "HTTP Server Error");
    assert_eq!(records[0]["status"], 600);

    let spans = fixture.spans.get_finished_spans().unwrap();
    assert!(matches!(spans[0].status, Status::Error { .. }));
}

#[tokio::test]
async fn incoming_trace_context_is_continued() {
    let fixture = fixture("http-parent", SkipPolicy::default()).await;
    let request = Request::builder()
        .uri("/ok?page=2")
        .header(
            "traceparent",
            "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01",
        )
        .header("x-forwarded-for", "203.0.113.7, 10.0.0.1")
        .header("user-agent", "probe/1.0")
        .body(Body::empty())
        .unwrap();

    let response = app(&fixture).oneshot(request).await.unwrap();
    assert_eq!(
        response.headers()[TRACE_ID_HEADER],
        "4bf92f3577b34da6a3ce929d0e0e4736"
    );

    let records = fixture.records();
    let record = &records[0];
    assert_eq!(record["trace_id"], "4bf92f3577b34da6a3ce929d0e0e4736");
    assert_eq!(record["query"], "page=2");
    assert_eq!(record["ip"], "203.0.113.7");
    assert_eq!(record["user_agent"], "probe/1.0");

    let spans = fixture.spans.get_finished_spans().unwrap();
    assert_eq!(spans[0].parent_span_id.to_string(), "00f067aa0ba902b7");
}

#[tokio::test]
async fn logging_without_tracing_omits_ids() {
    let fixture = fixture("http-no-trace", SkipPolicy::default()).await;
    let app = Router::new()
        .route("/ok", get(ok))
        .layer(LoggingLayer::new(fixture.instrumentation.clone()));

    let response = app.oneshot(get_request("/ok")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let records = fixture.records();
    assert_eq!(records.len(), 1);
    assert!(records[0].get("trace_id").is_none());
    assert!(records[0].get("span_id").is_none());
    assert_eq!(records[0]["ip"], "");
}
