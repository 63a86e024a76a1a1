//! Reload atomicity: a call in flight keeps the generation it started
//! with, and a call after the swap sees the new one. No request ever
//! observes a mixed (schema, rules, IR) triple.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use serde_json::json;

use mockwire_core::config::Settings;
use mockwire_core::handler::{MockHandler, NormalizedRequest, StreamEvent};
use mockwire_core::metrics::Metrics;
use mockwire_core::rules;
use mockwire_core::schema;
use mockwire_core::state::{EngineState, SharedState};
use mockwire_core::validation::ValidatorSet;

const GREETER_PROTO: &str = r#"
syntax = "proto3";
package helloworld;

service Greeter {
  rpc SayHelloStream (HelloRequest) returns (stream HelloReply);
}

message HelloRequest {
  string name = 1;
}

message HelloReply {
  string message = 1;
}
"#;

fn load_generation(proto_dir: &Path, rule_body: &str) -> EngineState {
    let rule_dir = tempfile::tempdir().unwrap();
    std::fs::write(
        rule_dir
            .path()
            .join("helloworld.Greeter.SayHelloStream.yaml"),
        rule_body,
    )
    .unwrap();

    let schema = schema::load_dir(proto_dir);
    let settings = Settings::from_map(&HashMap::new());
    let validators = ValidatorSet::build(&schema, &settings.validation);
    EngineState {
        schema,
        rules: rules::load_dir(rule_dir.path()),
        validators,
    }
}

#[tokio::test(start_paused = true)]
async fn in_flight_stream_finishes_on_the_old_generation() {
    let proto_dir = tempfile::tempdir().unwrap();
    std::fs::write(proto_dir.path().join("greeter.proto"), GREETER_PROTO).unwrap();

    let generation_a = load_generation(
        proto_dir.path(),
        r#"
responses:
  - stream_items: [{message: old-1}, {message: old-2}, {message: old-3}]
    stream_delay_ms: 50
"#,
    );
    let shared = Arc::new(SharedState::new(generation_a));

    let settings = Settings::from_map(&HashMap::new());
    let handler = MockHandler::new(Arc::new(Metrics::new()), settings.validation);

    let request = NormalizedRequest {
        service: "helloworld.Greeter".to_string(),
        method: "SayHelloStream".to_string(),
        metadata: BTreeMap::new(),
        data: json!({"name": "x"}),
    };

    // Start the call against the current snapshot (what an adapter does at
    // dispatch time).
    let snapshot = shared.load();
    let meta = snapshot
        .schema
        .method_by_name("helloworld.Greeter", "SayHelloStream")
        .unwrap()
        .clone();
    let mut reply = handler
        .handle_server_stream(&snapshot, &meta, request.clone())
        .await
        .unwrap();

    // Consume the first item, then swap generations mid-stream.
    let first = match reply.rx.recv().await {
        Some(StreamEvent::Item(item)) => item,
        other => panic!("unexpected event: {other:?}"),
    };
    assert_eq!(first, json!({"message": "old-1"}));

    let generation_b = load_generation(
        proto_dir.path(),
        r#"
responses:
  - stream_items: [{message: new-1}]
    stream_delay_ms: 0
"#,
    );
    shared.publish(generation_b);

    // The in-flight stream still emits generation A's remaining items.
    let mut rest = Vec::new();
    while let Some(event) = reply.rx.recv().await {
        match event {
            StreamEvent::Item(item) => rest.push(item),
            StreamEvent::Error(err) => panic!("unexpected error: {err:?}"),
        }
    }
    assert_eq!(
        rest,
        vec![json!({"message": "old-2"}), json!({"message": "old-3"})]
    );

    // A fresh call takes a fresh snapshot and sees generation B.
    let snapshot = shared.load();
    let meta = snapshot
        .schema
        .method_by_name("helloworld.Greeter", "SayHelloStream")
        .unwrap()
        .clone();
    let mut reply = handler
        .handle_server_stream(&snapshot, &meta, request)
        .await
        .unwrap();
    let mut items = Vec::new();
    while let Some(event) = reply.rx.recv().await {
        if let StreamEvent::Item(item) = event {
            items.push(item);
        }
    }
    assert_eq!(items, vec![json!({"message": "new-1"})]);
}
