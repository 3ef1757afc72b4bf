//! Joins platform spans from the Telemetry API with the function's own spans.

mod common;

use common::{RecorderFactory, push_events, wait_for_http_ready, wait_until};
use opentelemetry_lambda_collector::{
    BuildContext, ConfMap, Factories, HostContext, Notifier, Pipeline,
};
use opentelemetry_proto::tonic::collector::trace::v1::ExportTraceServiceRequest;
use opentelemetry_proto::tonic::common::v1::{AnyValue, KeyValue, any_value};
use opentelemetry_proto::tonic::trace::v1::{ResourceSpans, ScopeSpans, Span, span::SpanKind};
use prost::Message;
use serde_json::json;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const TIMEOUT: Duration = Duration::from_secs(5);

fn function_span(request_id: &str) -> ExportTraceServiceRequest {
    ExportTraceServiceRequest {
        resource_spans: vec![ResourceSpans {
            scope_spans: vec![ScopeSpans {
                spans: vec![Span {
                    name: "handler".to_string(),
                    kind: SpanKind::Server as i32,
                    trace_id: vec![0xab; 16],
                    span_id: vec![0xcd; 8],
                    attributes: vec![KeyValue {
                        key: "faas.invocation_id".to_string(),
                        value: Some(AnyValue {
                            value: Some(any_value::Value::StringValue(request_id.to_string())),
                        }),
                    }],
                    ..Default::default()
                }],
                ..Default::default()
            }],
            ..Default::default()
        }],
    }
}

fn spans(recorder: &common::Recorder) -> Vec<Span> {
    recorder
        .signals()
        .into_iter()
        .filter_map(|signal| match signal {
            opentelemetry_lambda_collector::Signal::Traces(req) => Some(req),
            _ => None,
        })
        .flat_map(|req| req.resource_spans)
        .flat_map(|rs| rs.scope_spans)
        .flat_map(|ss| ss.spans)
        .collect()
}

#[tokio::test]
async fn test_function_span_is_parented_by_platform_span() {
    let factory = RecorderFactory::default();
    let recorder = factory.recorder.clone();
    let conf = ConfMap::from_yaml(
        r#"
receivers:
  telemetryapi:
    port: 14532
  otlp:
    protocols:
      http:
        endpoint: 127.0.0.1:14533
processors:
  faas:
exporters:
  recorder:
service:
  pipelines:
    traces:
      receivers: [telemetryapi, otlp]
      processors: [faas]
      exporters: [recorder]
"#,
    )
    .expect("config");

    let ctx = BuildContext::new(Notifier::new()).with_host(HostContext {
        sam_local: true,
        ..Default::default()
    });
    let pipeline = Pipeline::build(&conf, &Factories::builtin().with_exporter(factory), &ctx)
        .expect("pipeline builds");
    pipeline.start(&CancellationToken::new()).await.expect("starts");
    wait_for_http_ready(14533, TIMEOUT).await.expect("otlp ready");

    let response = reqwest::Client::new()
        .post("http://127.0.0.1:14533/v1/traces")
        .header("Content-Type", "application/x-protobuf")
        .body(function_span("req-9").encode_to_vec())
        .send()
        .await
        .expect("send");
    assert!(response.status().is_success());
    assert!(recorder.signals().is_empty(), "function span waits for its partner");

    let events = json!([
        {"time": "2024-01-01T00:00:00.000Z", "type": "platform.start",
         "record": {"requestId": "req-9", "version": "$LATEST"}},
        {"time": "2024-01-01T00:00:00.120Z", "type": "platform.runtimeDone",
         "record": {"requestId": "req-9", "status": "success"}}
    ]);
    assert!(push_events("http://127.0.0.1:14532/", &events).await.is_success());

    assert!(wait_until(TIMEOUT, || spans(&recorder).len() == 2).await);
    pipeline.stop().await.expect("stops");

    let spans = spans(&recorder);
    let platform = spans
        .iter()
        .find(|s| s.name == "platform.invoke")
        .expect("platform span");
    let function = spans.iter().find(|s| s.name == "handler").expect("function span");
    assert_eq!(function.trace_id, platform.trace_id);
    assert_eq!(function.parent_span_id, platform.span_id);
}

#[tokio::test]
async fn test_unmatched_spans_are_flushed_on_shutdown() {
    let factory = RecorderFactory::default();
    let recorder = factory.recorder.clone();
    let conf = ConfMap::from_yaml(
        r#"
receivers:
  otlp:
    protocols:
      http:
        endpoint: 127.0.0.1:14534
processors:
  faas:
  coldstart:
exporters:
  recorder:
service:
  pipelines:
    traces:
      receivers: [otlp]
      processors: [faas, coldstart]
      exporters: [recorder]
"#,
    )
    .expect("config");

    let pipeline = Pipeline::build(
        &conf,
        &Factories::builtin().with_exporter(factory),
        &BuildContext::new(Notifier::new()),
    )
    .expect("pipeline builds");
    pipeline.start(&CancellationToken::new()).await.expect("starts");
    wait_for_http_ready(14534, TIMEOUT).await.expect("otlp ready");

    let response = reqwest::Client::new()
        .post("http://127.0.0.1:14534/v1/traces")
        .header("Content-Type", "application/x-protobuf")
        .body(function_span("req-orphan").encode_to_vec())
        .send()
        .await
        .expect("send");
    assert!(response.status().is_success());

    pipeline.stop().await.expect("stops");
    let spans = spans(&recorder);
    assert_eq!(spans.len(), 1);
    assert_eq!(spans[0].name, "handler");
    assert_eq!(spans[0].trace_id, vec![0xab; 16]);
}
