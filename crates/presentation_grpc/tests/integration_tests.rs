//! End-to-end tests for the gRPC instrumentation wrappers
#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::time::Duration;

use futures::{StreamExt, stream};
use observability::{
    SkipPolicy,
    chain::guarded,
    testing::{self, InstrumentationFixture},
};
use opentelemetry::{Value as OtelValue, trace::Status as SpanStatus};
use presentation_grpc::{GrpcInstrumentation, INTERNAL_MESSAGE, RpcInfo, TRACE_ID_TRAILER};
use tonic::{Code, Request, Response, Status, metadata::AsciiMetadataValue};

const SAY_HELLO: &str = "/helloworld.Greeter/SayHello";
const LIST_FEATURES: &str = "/routeguide.RouteGuide/ListFeatures";

async fn fixture(service: &str, skip: SkipPolicy) -> (InstrumentationFixture, GrpcInstrumentation) {
    let fixture = testing::instrumentation(service, skip)
        .await
        .expect("instrumentation fixture");
    let grpc = GrpcInstrumentation::new(fixture.instrumentation.clone());
    (fixture, grpc)
}

#[tokio::test]
async fn successful_unary_call_is_traced_and_logged_once() {
    let (fixture, grpc) = fixture("grpc-ok", SkipPolicy::default()).await;

    let response = grpc
        .unary(RpcInfo::unary(SAY_HELLO), Request::new("world".to_string()), |request| async move {
            Ok(Response::new(format!("hello {}", request.into_inner())))
        })
        .await
        .unwrap();
    assert_eq!(response.into_inner(), "hello world");

    let records = fixture.records();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record["level"], "info");
    assert_eq!(record["msg"], "gRPC Request");
    assert_eq!(record["method"], SAY_HELLO);
    assert_eq!(record["grpc_code"], "OK");
    assert!(record["latency_ms"].as_f64().is_some());
    assert!(record.get("is_client_stream").is_none());
    assert!(record.get("error").is_none());

    let spans = fixture.spans.get_finished_spans().unwrap();
    assert_eq!(spans.len(), 1);
    let span = &spans[0];
    assert_eq!(span.name, SAY_HELLO);
    assert_eq!(
        record["trace_id"].as_str().unwrap(),
        span.span_context.trace_id().to_string()
    );
    let attribute = |key: &str| {
        span.attributes
            .iter()
            .find(|kv| kv.key.as_str() == key)
            .map(|kv| kv.value.clone())
    };
    assert_eq!(attribute("rpc.system"), Some(OtelValue::from("grpc")));
    assert_eq!(attribute("rpc.service"), Some(OtelValue::from("helloworld.Greeter")));
    assert_eq!(attribute("rpc.method"), Some(OtelValue::from("SayHello")));
    assert_eq!(attribute("rpc.grpc.status_code"), Some(OtelValue::I64(0)));
}

#[tokio::test]
async fn client_fault_is_a_warning_with_error_detail() {
    let (fixture, grpc) = fixture("grpc-not-found", SkipPolicy::default()).await;

    let status = grpc
        .unary(RpcInfo::unary(SAY_HELLO), Request::new(()), |_| async {
            Err::<Response<()>, _>(Status::not_found("no such greeter"))
        })
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::NotFound);

    let records = fixture.records();
    assert_eq!(records[0]["level"], "warn");
    assert_eq!(records[0]["msg"], "gRPC Client Error");
    assert_eq!(records[0]["grpc_code"], "NotFound");
    assert_eq!(records[0]["error"], "no such greeter");

    let spans = fixture.spans.get_finished_spans().unwrap();
    assert!(matches!(spans[0].status, SpanStatus::Error { .. }));
}

#[tokio::test]
async fn server_fault_is_an_error() {
    let (fixture, grpc) = fixture("grpc-unavailable", SkipPolicy::default()).await;

    let _ = grpc
        .unary(RpcInfo::client_streaming(SAY_HELLO), Request::new(()), |_| async {
            Err::<Response<()>, _>(Status::unavailable("backend down"))
        })
        .await;

    let records = fixture.records();
    assert_eq!(records[0]["level"], "error");
    assert_eq!(records[0]["msg"], "gRPC Stream Server Error");
    assert_eq!(records[0]["is_client_stream"], true);
    assert_eq!(records[0]["is_server_stream"], false);
}

#[tokio::test]
async fn panic_becomes_internal_with_trace_trailer() {
    let (fixture, grpc) = fixture("grpc-panic", SkipPolicy::default()).await;

    let status = grpc
        .unary(RpcInfo::unary(SAY_HELLO), Request::new(()), |_| async {
            if true {
                panic!("boom");
            }
            Ok(Response::new(()))
        })
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::Internal);
    assert_eq!(status.message(), INTERNAL_MESSAGE);

    let spans = fixture.spans.get_finished_spans().unwrap();
    assert_eq!(spans.len(), 1);
    let trace_id = spans[0].span_context.trace_id().to_string();
    assert_eq!(
        status.metadata().get(TRACE_ID_TRAILER).unwrap().to_str().unwrap(),
        trace_id
    );
    assert!(matches!(spans[0].status, SpanStatus::Error { .. }));

    let records = fixture.records();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record["level"], "error");
    assert_eq!(record["msg"], "Panic recovered in gRPC handler");
    assert_eq!(record["error"], "boom");
    assert_eq!(record["method"], SAY_HELLO);
    assert_eq!(record["trace_id"], trace_id);
    assert!(!record["stack"].as_str().unwrap().is_empty());
}

#[tokio::test]
async fn skipped_method_has_no_span_no_record_and_keeps_panics() {
    let (fixture, grpc) = fixture("grpc-skip", SkipPolicy::new().exclude(SAY_HELLO)).await;

    grpc.unary(RpcInfo::unary(SAY_HELLO), Request::new(()), |_| async {
        Ok(Response::new(()))
    })
    .await
    .unwrap();

    let caught = guarded(grpc.unary(RpcInfo::unary(SAY_HELLO), Request::new(()), |_| async {
        if true {
            panic!("health probe");
        }
        Ok(Response::new(()))
    }))
    .await
    .expect_err("panic should propagate");
    assert_eq!(caught.failure().message, "health probe");

    assert!(fixture.records().is_empty());
    assert!(fixture.spans.get_finished_spans().unwrap().is_empty());
}

#[tokio::test]
async fn dropped_call_is_logged_as_cancelled() {
    let (fixture, grpc) = fixture("grpc-cancel", SkipPolicy::default()).await;

    let call = grpc.unary(RpcInfo::unary(SAY_HELLO), Request::new(()), |_| async {
        std::future::pending::<Result<Response<()>, Status>>().await
    });
    assert!(tokio::time::timeout(Duration::from_millis(20), call).await.is_err());

    let records = fixture.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["level"], "warn");
    assert_eq!(records[0]["grpc_code"], "Cancelled");
    assert_eq!(fixture.spans.get_finished_spans().unwrap().len(), 1);
}

#[tokio::test]
async fn remote_parent_is_continued_from_metadata() {
    let (fixture, grpc) = fixture("grpc-parent", SkipPolicy::default()).await;
    let mut request = Request::new(());
    request.metadata_mut().insert(
        "traceparent",
        AsciiMetadataValue::from_static("00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01"),
    );

    grpc.unary(RpcInfo::unary(SAY_HELLO), request, |_| async { Ok(Response::new(())) })
        .await
        .unwrap();

    let records = fixture.records();
    assert_eq!(records[0]["trace_id"], "4bf92f3577b34da6a3ce929d0e0e4736");
    let spans = fixture.spans.get_finished_spans().unwrap();
    assert_eq!(spans[0].parent_span_id.to_string(), "00f067aa0ba902b7");
}

#[tokio::test]
async fn server_stream_is_logged_when_it_ends() {
    let (fixture, grpc) = fixture("grpc-stream", SkipPolicy::default()).await;

    let response = grpc
        .streaming(RpcInfo::server_streaming(LIST_FEATURES), Request::new(()), |_| async {
            Ok(Response::new(stream::iter(vec![Ok(1), Ok(2), Ok(3)])))
        })
        .await
        .unwrap();
    assert!(fixture.records().is_empty());

    let items: Vec<i32> = response
        .into_inner()
        .map(Result::unwrap)
        .collect()
        .await;
    assert_eq!(items, vec![1, 2, 3]);

    let records = fixture.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["level"], "info");
    assert_eq!(records[0]["msg"], "gRPC Stream Request");
    assert_eq!(records[0]["is_server_stream"], true);
    assert_eq!(fixture.spans.get_finished_spans().unwrap().len(), 1);
}

#[tokio::test]
async fn stream_error_item_sets_the_final_code() {
    let (fixture, grpc) = fixture("grpc-stream-error", SkipPolicy::default()).await;

    let response = grpc
        .streaming(RpcInfo::bidi_streaming(LIST_FEATURES), Request::new(()), |_| async {
            Ok(Response::new(stream::iter(vec![
                Ok(1),
                Err(Status::invalid_argument("bad rectangle")),
            ])))
        })
        .await
        .unwrap();
    let items: Vec<Result<i32, Status>> = response.into_inner().collect().await;
    assert_eq!(items.len(), 2);

    let records = fixture.records();
    assert_eq!(records[0]["level"], "warn");
    assert_eq!(records[0]["msg"], "gRPC Stream Client Error");
    assert_eq!(records[0]["grpc_code"], "InvalidArgument");
    assert_eq!(records[0]["error"], "bad rectangle");
}

#[tokio::test]
async fn panic_while_streaming_ends_with_internal() {
    let (fixture, grpc) = fixture("grpc-stream-panic", SkipPolicy::default()).await;

    let response = grpc
        .streaming(RpcInfo::server_streaming(LIST_FEATURES), Request::new(()), |_| async {
            let items = stream::iter(vec![1, 2, 3]).map(|n| {
                if n == 2 {
                    panic!("stream boom");
                }
                Ok::<_, Status>(n)
            });
            Ok(Response::new(items))
        })
        .await
        .unwrap();
    let items: Vec<Result<i32, Status>> = response.into_inner().collect().await;

    assert_eq!(items.len(), 2);
    assert_eq!(items[0].as_ref().unwrap(), &1);
    let status = items[1].as_ref().unwrap_err();
    assert_eq!(status.code(), Code::Internal);
    assert!(status.metadata().get(TRACE_ID_TRAILER).is_some());

    let records = fixture.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["msg"], "Panic recovered in gRPC stream handler");
    assert_eq!(records[0]["error"], "stream boom");
    assert_eq!(records[0]["is_server_stream"], true);
}

#[tokio::test]
async fn abandoned_stream_is_cancelled() {
    let (fixture, grpc) = fixture("grpc-stream-drop", SkipPolicy::default()).await;

    let response = grpc
        .streaming(RpcInfo::server_streaming(LIST_FEATURES), Request::new(()), |_| async {
            Ok(Response::new(stream::iter(vec![Ok(1), Ok(2)])))
        })
        .await
        .unwrap();
    let mut items = response.into_inner();
    assert_eq!(items.next().await.unwrap().unwrap(), 1);
    drop(items);

    let records = fixture.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["msg"], "gRPC Stream Client Error");
    assert_eq!(records[0]["grpc_code"], "Cancelled");
}
