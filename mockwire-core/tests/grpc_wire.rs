//! Wire-level tests of the native gRPC adapter: real gRPC framing in and
//! out of the dynamic tower service, no sockets involved.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use http_body_util::{BodyExt, Full};
use prost::Message;
use prost_reflect::DynamicMessage;
use serde_json::json;
use tower::ServiceExt;

use mockwire_core::config::Settings;
use mockwire_core::handler::MockHandler;
use mockwire_core::metrics::Metrics;
use mockwire_core::rules;
use mockwire_core::schema::{self, SchemaSet};
use mockwire_core::server::grpc::GrpcMockService;
use mockwire_core::state::{EngineState, SharedState};
use mockwire_core::validation::ValidatorSet;
use mockwire_core::{format, Result};

const GREETER_PROTO: &str = r#"
syntax = "proto3";
package helloworld;

service Greeter {
  rpc SayHello (HelloRequest) returns (HelloReply);
}

message HelloRequest {
  string name = 1;
}

message HelloReply {
  string message = 1;
}
"#;

fn build_service(rule_files: &[(&str, &str)]) -> (GrpcMockService, SchemaSet) {
    let proto_dir = tempfile::tempdir().unwrap();
    std::fs::write(proto_dir.path().join("greeter.proto"), GREETER_PROTO).unwrap();
    let schema = schema::load_dir(proto_dir.path());

    let rule_dir = tempfile::tempdir().unwrap();
    for (name, content) in rule_files {
        std::fs::write(rule_dir.path().join(name), content).unwrap();
    }
    let rule_set = rules::load_dir(rule_dir.path());

    let settings = Settings::from_map(&HashMap::new());
    let validators = ValidatorSet::build(&schema, &settings.validation);

    let state = Arc::new(SharedState::new(EngineState {
        schema: schema.clone(),
        rules: rule_set,
        validators,
    }));
    let metrics = Arc::new(Metrics::new());
    let handler = MockHandler::new(metrics, settings.validation);

    (GrpcMockService::new(state, handler), schema)
}

fn grpc_frame(payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(5 + payload.len());
    buf.put_u8(0);
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    buf.freeze()
}

fn encode_request(schema: &SchemaSet, value: serde_json::Value) -> Result<Bytes> {
    let meta = schema
        .method_by_path("/helloworld.Greeter/SayHello")
        .expect("method");
    let msg = format::value_to_message(&meta.request, &value)?;
    Ok(grpc_frame(&msg.encode_to_vec()))
}

fn grpc_request(body: Bytes) -> http::Request<Full<Bytes>> {
    http::Request::builder()
        .method(http::Method::POST)
        .uri("/helloworld.Greeter/SayHello")
        .header("content-type", "application/grpc")
        .header("te", "trailers")
        .body(Full::new(body))
        .unwrap()
}

/// The grpc-status, whether it arrived in trailers or (for trailers-only
/// responses) in the headers.
fn status_of(
    headers: &http::HeaderMap,
    trailers: Option<&http::HeaderMap>,
) -> Option<i32> {
    trailers
        .and_then(|t| t.get("grpc-status"))
        .or_else(|| headers.get("grpc-status"))
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

#[tokio::test]
async fn unary_round_trip_over_grpc_framing() {
    let (service, schema) = build_service(&[(
        "helloworld.Greeter.SayHello.yaml",
        r#"
responses:
  - when:
      request.name: Tom
    body: {message: "Hi Tom"}
    priority: 10
  - body: {message: "Hello, stranger"}
"#,
    )]);

    let body = encode_request(&schema, json!({"name": "Tom"})).unwrap();
    let response = service.oneshot(grpc_request(body)).await.unwrap();
    assert_eq!(response.status(), http::StatusCode::OK);

    let headers = response.headers().clone();
    let collected = response.into_body().collect().await.unwrap();
    let trailers = collected.trailers().cloned();
    assert_eq!(status_of(&headers, trailers.as_ref()), Some(0));

    let bytes = collected.to_bytes();
    assert!(bytes.len() > 5, "expected a framed message");
    let payload = &bytes[5..];
    let meta = schema
        .method_by_path("/helloworld.Greeter/SayHello")
        .unwrap();
    let reply = DynamicMessage::decode(meta.response.clone(), payload).unwrap();
    let value = format::message_to_value(&reply).unwrap();
    assert_eq!(value["message"], "Hi Tom");
}

#[tokio::test]
async fn error_injection_maps_to_grpc_status() {
    let (service, schema) = build_service(&[(
        "helloworld.Greeter.SayHello.yaml",
        r#"
responses:
  - trailers:
      grpc-status: 7
      grpc-message: Underage
"#,
    )]);

    let body = encode_request(&schema, json!({"name": "any"})).unwrap();
    let response = service.oneshot(grpc_request(body)).await.unwrap();
    // gRPC errors still ride HTTP 200.
    assert_eq!(response.status(), http::StatusCode::OK);

    let headers = response.headers().clone();
    let collected = response.into_body().collect().await.unwrap();
    let trailers = collected.trailers().cloned();
    assert_eq!(status_of(&headers, trailers.as_ref()), Some(7));

    let message = trailers
        .as_ref()
        .and_then(|t| t.get("grpc-message"))
        .or_else(|| headers.get("grpc-message"))
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    assert_eq!(message, "Underage");
}

#[tokio::test]
async fn unknown_path_is_unimplemented() {
    let (service, _schema) = build_service(&[]);

    let request = http::Request::builder()
        .method(http::Method::POST)
        .uri("/no.such.Service/Method")
        .header("content-type", "application/grpc")
        .body(Full::new(grpc_frame(&[])))
        .unwrap();
    let response = service.oneshot(request).await.unwrap();

    assert_eq!(response.status(), http::StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("grpc-status")
            .and_then(|v| v.to_str().ok()),
        Some("12")
    );
}

#[tokio::test]
async fn missing_rule_is_unimplemented_with_description() {
    let (service, schema) = build_service(&[]);

    let body = encode_request(&schema, json!({"name": "x"})).unwrap();
    let response = service.oneshot(grpc_request(body)).await.unwrap();

    let headers = response.headers().clone();
    let collected = response.into_body().collect().await.unwrap();
    let trailers = collected.trailers().cloned();
    assert_eq!(status_of(&headers, trailers.as_ref()), Some(12));
}
