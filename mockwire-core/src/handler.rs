//! The shared, protocol-independent request pipeline.
//!
//! Every adapter decodes its transport into the same normalized shape, then
//! runs validate -> match -> select -> render -> emit through this module.
//! Streaming responses are produced by a single per-call producer task that
//! cooperates with cancellation: dropping the consumer stops the producer
//! within one delay quantum.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::debug;

use crate::config::{ValidationMode, ValidationSettings};
use crate::metrics::Metrics;
use crate::rules::{select, ResponseOption};
use crate::schema::HandlerMeta;
use crate::state::EngineState;
use crate::status;
use crate::template::{self, RenderCtx, StreamCtx};
use crate::validation::{ValidationCheck, Violation};

/// A decoded request, independent of the wire protocol it arrived on.
#[derive(Debug, Clone)]
pub struct NormalizedRequest {
    pub service: String,
    pub method: String,
    /// Lower-cased header name -> value.
    pub metadata: BTreeMap<String, String>,
    /// Decoded request body as a JSON tree.
    pub data: Value,
}

/// A successful mock response.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedResponse {
    pub body: Value,
    /// User trailers with the reserved `grpc-status`/`grpc-message` keys
    /// already filtered out.
    pub trailers: BTreeMap<String, String>,
}

/// A terminal error, already mapped to a canonical gRPC code.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedError {
    pub code: i32,
    pub message: String,
    pub trailers: BTreeMap<String, String>,
    /// Violation details for INVALID_ARGUMENT validation failures.
    pub violations: Vec<Violation>,
}

impl NormalizedError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        NormalizedError {
            code,
            message: message.into(),
            trailers: BTreeMap::new(),
            violations: Vec::new(),
        }
    }

    pub fn code_name(&self) -> &'static str {
        status::code_name(self.code)
    }

    pub fn into_status(self) -> tonic::Status {
        let mut message = self.message.clone();
        if !self.violations.is_empty() {
            let detail: Vec<String> = self
                .violations
                .iter()
                .map(|v| format!("{}: {} ({})", v.field, v.description, v.rule))
                .collect();
            message = format!("{message}: {}", detail.join("; "));
        }
        let mut st = tonic::Status::new(status::tonic_code(self.code), message);
        *st.metadata_mut() = crate::metadata::metadata_from_pairs(&self.trailers);
        st
    }
}

/// One event on a streamed response.
#[derive(Debug)]
pub enum StreamEvent {
    Item(Value),
    /// Terminal error; nothing follows.
    Error(NormalizedError),
}

/// A planned streaming response: the receiver yields rendered items, the
/// trailers apply when the stream closes without error.
pub struct StreamReply {
    pub rx: mpsc::Receiver<StreamEvent>,
    pub trailers: BTreeMap<String, String>,
}

/// The shared handler. Cheap to clone; adapters hold one each.
#[derive(Clone)]
pub struct MockHandler {
    metrics: Arc<Metrics>,
    validation: ValidationSettings,
}

impl MockHandler {
    pub fn new(metrics: Arc<Metrics>, validation: ValidationSettings) -> Self {
        MockHandler {
            metrics,
            validation,
        }
    }

    pub fn validation_mode(&self) -> ValidationMode {
        self.validation.mode
    }

    /// Validate one inbound message if validation is active and the type
    /// carries constraints. Constraint failures become INVALID_ARGUMENT;
    /// a validator that could not be built becomes INTERNAL.
    pub fn validate_inbound(
        &self,
        state: &EngineState,
        meta: &HandlerMeta,
        data: &Value,
    ) -> Result<(), NormalizedError> {
        if !self.validation.enabled {
            return Ok(());
        }
        let type_name = meta.request.full_name();
        let outcome = match state.validators.validate(type_name, data) {
            ValidationCheck::NoConstraints => return Ok(()),
            ValidationCheck::EngineError(message) => {
                tracing::error!(type_name, error = %message, "validator unavailable");
                return Err(NormalizedError::new(
                    13,
                    format!("validation engine error for {type_name}: {message}"),
                ));
            }
            ValidationCheck::Checked(outcome) => outcome,
        };
        self.metrics.record_validation_check();
        if outcome.ok() {
            debug!(type_name, "validation passed");
            return Ok(());
        }
        for violation in &outcome.violations {
            self.metrics.record_validation_failure(&violation.rule);
        }
        debug!(
            type_name,
            violations = outcome.violations.len(),
            "validation failed"
        );
        let mut err = NormalizedError::new(3, format!("invalid {type_name}"));
        err.violations = outcome.violations;
        Err(err)
    }

    /// Unary pipeline: validate, look up the rule, select, render, emit.
    pub async fn handle_unary(
        &self,
        state: &EngineState,
        meta: &HandlerMeta,
        request: NormalizedRequest,
    ) -> Result<NormalizedResponse, NormalizedError> {
        self.validate_inbound(state, meta, &request.data)?;
        let selection = self.select_option(state, meta, &request)?;

        let Some(option) = selection else {
            // Rule doc present but nothing selectable: default OK.
            return Ok(NormalizedResponse {
                body: json!({}),
                trailers: BTreeMap::new(),
            });
        };

        if option.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(option.delay_ms)).await;
        }

        if let Some(err) = error_from_trailers(&option) {
            return Err(err);
        }

        let ctx = RenderCtx::new(&request.data, &request.metadata);
        let body = option
            .body
            .as_ref()
            .map(|body| template::render(body, &ctx))
            .unwrap_or_else(|| json!({}));

        Ok(NormalizedResponse {
            body,
            trailers: option.user_trailers(),
        })
    }

    /// Server-streaming pipeline. Steps 1-4 run before the first item; the
    /// returned receiver then yields rendered items with the configured
    /// pacing.
    pub async fn handle_server_stream(
        &self,
        state: &EngineState,
        meta: &HandlerMeta,
        request: NormalizedRequest,
    ) -> Result<StreamReply, NormalizedError> {
        self.validate_inbound(state, meta, &request.data)?;
        let selection = self.select_option(state, meta, &request)?;

        let Some(option) = selection else {
            // Default OK: close immediately with zero items.
            let (_tx, rx) = mpsc::channel(1);
            return Ok(StreamReply {
                rx,
                trailers: BTreeMap::new(),
            });
        };

        let trailers = option.user_trailers();
        let plan = StreamPlan {
            items: option
                .stream_items
                .clone()
                .unwrap_or_else(|| option.body.clone().map(|b| vec![b]).unwrap_or_default()),
            initial_delay: Duration::from_millis(option.delay_ms),
            item_delay: Duration::from_millis(option.stream_delay_ms),
            looped: option.stream_loop,
            shuffle: option.stream_random_order,
            error: error_from_trailers(&option),
            request: request.data,
            metadata: request.metadata,
        };

        Ok(StreamReply {
            rx: spawn_producer(plan),
            trailers,
        })
    }

    /// Client-streaming pipeline, called after the input is drained (and,
    /// in per_message mode, already validated message by message). Runs
    /// aggregate validation when configured, then the unary rules against
    /// the aggregated request.
    pub async fn handle_client_stream(
        &self,
        state: &EngineState,
        meta: &HandlerMeta,
        items: Vec<Value>,
        metadata: BTreeMap<String, String>,
    ) -> Result<NormalizedResponse, NormalizedError> {
        if self.validation.mode == ValidationMode::Aggregate {
            for item in &items {
                self.validate_inbound(state, meta, item)?;
            }
        }
        let request = NormalizedRequest {
            service: meta.service.clone(),
            method: meta.method.clone(),
            metadata,
            data: aggregate_request(&items),
        };
        // Validation already ran per message or in the loop above.
        let selection = self.select_option(state, meta, &request)?;
        let Some(option) = selection else {
            return Ok(NormalizedResponse {
                body: json!({}),
                trailers: BTreeMap::new(),
            });
        };
        if option.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(option.delay_ms)).await;
        }
        if let Some(err) = error_from_trailers(&option) {
            return Err(err);
        }
        let ctx = RenderCtx::new(&request.data, &request.metadata);
        let body = option
            .body
            .as_ref()
            .map(|body| template::render(body, &ctx))
            .unwrap_or_else(|| json!({}));
        Ok(NormalizedResponse {
            body,
            trailers: option.user_trailers(),
        })
    }

    /// Bidi pipeline: identical input collection to client streaming, then
    /// a server stream of the selected sequence.
    pub async fn handle_bidi_stream(
        &self,
        state: &EngineState,
        meta: &HandlerMeta,
        items: Vec<Value>,
        metadata: BTreeMap<String, String>,
    ) -> Result<StreamReply, NormalizedError> {
        if self.validation.mode == ValidationMode::Aggregate {
            for item in &items {
                self.validate_inbound(state, meta, item)?;
            }
        }
        let request = NormalizedRequest {
            service: meta.service.clone(),
            method: meta.method.clone(),
            metadata: metadata.clone(),
            data: aggregate_request(&items),
        };
        let selection = self.select_option(state, meta, &request)?;
        let Some(option) = selection else {
            let (_tx, rx) = mpsc::channel(1);
            return Ok(StreamReply {
                rx,
                trailers: BTreeMap::new(),
            });
        };
        let trailers = option.user_trailers();
        let plan = StreamPlan {
            items: option
                .stream_items
                .clone()
                .unwrap_or_else(|| option.body.clone().map(|b| vec![b]).unwrap_or_default()),
            initial_delay: Duration::from_millis(option.delay_ms),
            item_delay: Duration::from_millis(option.stream_delay_ms),
            looped: option.stream_loop,
            shuffle: option.stream_random_order,
            error: error_from_trailers(&option),
            request: request.data,
            metadata,
        };
        Ok(StreamReply {
            rx: spawn_producer(plan),
            trailers,
        })
    }

    /// Steps 2-4 of the pipeline: rule lookup with metrics, then response
    /// selection. `Ok(None)` means "rule present, nothing selected" (the
    /// default-OK path); a missing rule is UNIMPLEMENTED.
    fn select_option(
        &self,
        state: &EngineState,
        meta: &HandlerMeta,
        request: &NormalizedRequest,
    ) -> Result<Option<ResponseOption>, NormalizedError> {
        self.metrics.record_rule_attempt();
        let Some(doc) = state.rules.get(&meta.rule_key) else {
            self.metrics.record_rule_miss();
            debug!(rule_key = %meta.rule_key, "no rule for method");
            return Err(NormalizedError::new(
                12,
                format!("No rule matched for {}/{}", meta.service, meta.method),
            ));
        };
        self.metrics.record_rule_match(&meta.rule_key);
        Ok(select::select(doc, &request.data, &request.metadata).cloned())
    }
}

/// The aggregated request shape fed to the matcher for client-stream and
/// bidi calls. `stream`, `items`, `first`, `last`, and `count` are
/// first-class paths for `when` conditions.
pub fn aggregate_request(items: &[Value]) -> Value {
    json!({
        "stream": true,
        "items": items,
        "first": items.first().cloned().unwrap_or(Value::Null),
        "last": items.last().cloned().unwrap_or(Value::Null),
        "count": items.len(),
    })
}

/// Map authored `grpc-status`/`grpc-message` trailers to a terminal error.
/// Status 0 is equivalent to absence: the success path.
fn error_from_trailers(option: &ResponseOption) -> Option<NormalizedError> {
    let code = option.grpc_status()?;
    if code == 0 {
        return None;
    }
    let code = i32::try_from(code).unwrap_or(2);
    Some(NormalizedError {
        code,
        message: option
            .grpc_message()
            .unwrap_or_else(|| "mock error".to_string()),
        trailers: option.user_trailers(),
        violations: Vec::new(),
    })
}

/// Everything the producer task needs for one streamed response.
struct StreamPlan {
    items: Vec<Value>,
    initial_delay: Duration,
    item_delay: Duration,
    looped: bool,
    shuffle: bool,
    error: Option<NormalizedError>,
    request: Value,
    metadata: BTreeMap<String, String>,
}

/// Spawn the single producer task for a streamed response.
///
/// The channel is bounded at one item so emission is backpressured by the
/// transport; when the consumer goes away (cancellation, disconnect) the
/// next send fails and the task stops, bounding overrun to one delay
/// quantum even under `stream_loop`.
fn spawn_producer(plan: StreamPlan) -> mpsc::Receiver<StreamEvent> {
    let (tx, rx) = mpsc::channel(1);

    tokio::spawn(async move {
        if !plan.initial_delay.is_zero() {
            tokio::time::sleep(plan.initial_delay).await;
        }

        if plan.items.is_empty() {
            // Zero items: close (or surface the authored error) right away.
            if let Some(err) = plan.error {
                let _ = tx.send(StreamEvent::Error(err)).await;
            }
            return;
        }

        let total = plan.items.len();
        let mut first_pass = true;
        loop {
            let mut items = plan.items.clone();
            if plan.shuffle {
                items.shuffle(&mut rand::thread_rng());
            }

            if !first_pass {
                // Pass separator when looping.
                tokio::time::sleep(plan.item_delay).await;
            }
            first_pass = false;

            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    tokio::time::sleep(plan.item_delay).await;
                }
                let ctx = RenderCtx::new(&plan.request, &plan.metadata)
                    .with_stream(StreamCtx::new(index, total));
                let rendered = template::render(item, &ctx);
                if tx.send(StreamEvent::Item(rendered)).await.is_err() {
                    // Consumer cancelled; stop producing.
                    return;
                }
            }

            if !plan.looped {
                break;
            }
        }

        if let Some(err) = plan.error {
            let _ = tx.send(StreamEvent::Error(err)).await;
        }
    });

    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ValidationSource;
    use crate::validation::ValidatorSet;
    use tokio::time::Instant;

    const GREETER_PROTO: &str = r#"
syntax = "proto3";
package helloworld;

service Greeter {
  rpc SayHello (HelloRequest) returns (HelloReply);
  rpc SayHelloStream (HelloRequest) returns (stream HelloReply);
}

message HelloRequest {
  string name = 1;
}

message HelloReply {
  string message = 1;
}
"#;

    fn validation_settings() -> ValidationSettings {
        ValidationSettings {
            enabled: true,
            source: ValidationSource::Auto,
            mode: ValidationMode::PerMessage,
            cel_message: false,
        }
    }

    fn state_with_rules(rule_files: &[(&str, &str)]) -> EngineState {
        let proto_dir = tempfile::tempdir().unwrap();
        std::fs::write(proto_dir.path().join("greeter.proto"), GREETER_PROTO).unwrap();
        let schema = crate::schema::load_dir(proto_dir.path());

        let rule_dir = tempfile::tempdir().unwrap();
        for (name, content) in rule_files {
            std::fs::write(rule_dir.path().join(name), content).unwrap();
        }
        let rules = crate::rules::load_dir(rule_dir.path());
        let validators = ValidatorSet::build(&schema, &validation_settings());

        EngineState {
            schema,
            rules,
            validators,
        }
    }

    fn handler() -> MockHandler {
        MockHandler::new(Arc::new(Metrics::new()), validation_settings())
    }

    fn request(data: Value) -> NormalizedRequest {
        NormalizedRequest {
            service: "helloworld.Greeter".to_string(),
            method: "SayHello".to_string(),
            metadata: BTreeMap::new(),
            data,
        }
    }

    fn meta(state: &EngineState, method: &str) -> HandlerMeta {
        state
            .schema
            .method_by_name("helloworld.Greeter", method)
            .unwrap()
            .clone()
    }

    #[tokio::test]
    async fn unary_literal_match() {
        let state = state_with_rules(&[(
            "helloworld.Greeter.SayHello.yaml",
            r#"
responses:
  - when:
      request.name: Tom
    body:
      message: Hi Tom
    priority: 10
  - body:
      message: Hello, stranger
"#,
        )]);
        let h = handler();
        let meta = meta(&state, "SayHello");

        let reply = h
            .handle_unary(&state, &meta, request(json!({"name": "Tom"})))
            .await
            .unwrap();
        assert_eq!(reply.body, json!({"message": "Hi Tom"}));

        let reply = h
            .handle_unary(&state, &meta, request(json!({"name": "Ann"})))
            .await
            .unwrap();
        assert_eq!(reply.body, json!({"message": "Hello, stranger"}));
    }

    #[tokio::test]
    async fn missing_rule_is_unimplemented() {
        let state = state_with_rules(&[]);
        let h = handler();
        let meta = meta(&state, "SayHello");

        let err = h
            .handle_unary(&state, &meta, request(json!({})))
            .await
            .unwrap_err();
        assert_eq!(err.code, 12);
        assert_eq!(
            err.message,
            "No rule matched for helloworld.Greeter/SayHello"
        );
    }

    #[tokio::test]
    async fn rule_with_no_candidates_is_default_ok() {
        let state = state_with_rules(&[(
            "helloworld.Greeter.SayHello.yaml",
            r#"
match:
  request:
    name: Expected
responses: []
"#,
        )]);
        let h = handler();
        let meta = meta(&state, "SayHello");

        let reply = h
            .handle_unary(&state, &meta, request(json!({"name": "Other"})))
            .await
            .unwrap();
        assert_eq!(reply.body, json!({}));
        assert!(reply.trailers.is_empty());
    }

    #[tokio::test]
    async fn error_injection_via_trailers() {
        let state = state_with_rules(&[(
            "helloworld.Greeter.SayHello.yaml",
            r#"
responses:
  - trailers:
      grpc-status: 7
      grpc-message: Underage
      x-reason: policy
"#,
        )]);
        let h = handler();
        let meta = meta(&state, "SayHello");

        let err = h
            .handle_unary(&state, &meta, request(json!({})))
            .await
            .unwrap_err();
        assert_eq!(err.code, 7);
        assert_eq!(err.code_name(), "PERMISSION_DENIED");
        assert_eq!(err.message, "Underage");
        assert_eq!(err.trailers["x-reason"], "policy");
    }

    #[tokio::test]
    async fn grpc_status_zero_is_success() {
        let state = state_with_rules(&[(
            "helloworld.Greeter.SayHello.yaml",
            r#"
responses:
  - body: {message: fine}
    trailers:
      grpc-status: 0
      grpc-message: ignored
"#,
        )]);
        let h = handler();
        let meta = meta(&state, "SayHello");

        let reply = h
            .handle_unary(&state, &meta, request(json!({})))
            .await
            .unwrap();
        assert_eq!(reply.body, json!({"message": "fine"}));
        // Reserved keys are filtered from the emitted trailers.
        assert!(reply.trailers.is_empty());
    }

    #[tokio::test]
    async fn templates_render_from_request_and_metadata() {
        let state = state_with_rules(&[(
            "helloworld.Greeter.SayHello.yaml",
            r#"
responses:
  - body:
      message: "Hello {{request.name}}, env {{metadata.x-env}}"
"#,
        )]);
        let h = handler();
        let meta = meta(&state, "SayHello");
        let mut req = request(json!({"name": "Tom"}));
        req.metadata.insert("x-env".to_string(), "prod".to_string());

        let reply = h.handle_unary(&state, &meta, req).await.unwrap();
        assert_eq!(reply.body, json!({"message": "Hello Tom, env prod"}));
    }

    #[tokio::test(start_paused = true)]
    async fn server_stream_pacing_and_order() {
        let state = state_with_rules(&[(
            "helloworld.Greeter.SayHelloStream.yaml",
            r#"
responses:
  - stream_items:
      - {n: 1}
      - {n: 2}
      - {n: 3}
    stream_delay_ms: 50
    delay_ms: 10
"#,
        )]);
        let h = handler();
        let meta = meta(&state, "SayHelloStream");

        let start = Instant::now();
        let mut reply = h
            .handle_server_stream(&state, &meta, request(json!({})))
            .await
            .unwrap();

        let mut items = Vec::new();
        while let Some(event) = reply.rx.recv().await {
            match event {
                StreamEvent::Item(item) => items.push(item),
                StreamEvent::Error(err) => panic!("unexpected error: {err:?}"),
            }
        }
        let elapsed = start.elapsed();

        assert_eq!(items, vec![json!({"n": 1}), json!({"n": 2}), json!({"n": 3})]);
        // 10ms initial + 2 * 50ms between items; no sleep after the last.
        assert!(elapsed >= Duration::from_millis(110), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_millis(200), "elapsed {elapsed:?}");
    }

    #[tokio::test]
    async fn empty_stream_items_closes_with_zero_messages() {
        let state = state_with_rules(&[(
            "helloworld.Greeter.SayHelloStream.yaml",
            "responses:\n  - stream_items: []\n",
        )]);
        let h = handler();
        let meta = meta(&state, "SayHelloStream");

        let mut reply = h
            .handle_server_stream(&state, &meta, request(json!({})))
            .await
            .unwrap();
        assert!(reply.rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn stream_loop_stops_on_cancellation() {
        let state = state_with_rules(&[(
            "helloworld.Greeter.SayHelloStream.yaml",
            r#"
responses:
  - stream_items: [{n: 1}, {n: 2}]
    stream_delay_ms: 20
    stream_loop: true
"#,
        )]);
        let h = handler();
        let meta = meta(&state, "SayHelloStream");

        let mut reply = h
            .handle_server_stream(&state, &meta, request(json!({})))
            .await
            .unwrap();

        // Looping stream keeps producing across passes.
        let mut seen = 0;
        for _ in 0..5 {
            match reply.rx.recv().await {
                Some(StreamEvent::Item(_)) => seen += 1,
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert_eq!(seen, 5);

        // Dropping the receiver cancels; the producer task notices on its
        // next send and stops without further effect.
        drop(reply);
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn stream_random_order_is_a_permutation() {
        let state = state_with_rules(&[(
            "helloworld.Greeter.SayHelloStream.yaml",
            r#"
responses:
  - stream_items: [{n: 1}, {n: 2}, {n: 3}, {n: 4}]
    stream_delay_ms: 0
    stream_random_order: true
"#,
        )]);
        let h = handler();
        let meta = meta(&state, "SayHelloStream");

        let mut reply = h
            .handle_server_stream(&state, &meta, request(json!({})))
            .await
            .unwrap();
        let mut ns = Vec::new();
        while let Some(event) = reply.rx.recv().await {
            match event {
                StreamEvent::Item(item) => ns.push(item["n"].as_i64().unwrap()),
                StreamEvent::Error(err) => panic!("unexpected error: {err:?}"),
            }
        }
        ns.sort_unstable();
        assert_eq!(ns, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn stream_templates_see_stream_context() {
        let state = state_with_rules(&[(
            "helloworld.Greeter.SayHelloStream.yaml",
            r#"
responses:
  - stream_items:
      - {idx: "{{stream.index}}", last: "{{stream.isLast}}"}
      - {idx: "{{stream.index}}", last: "{{stream.isLast}}"}
    stream_delay_ms: 0
"#,
        )]);
        let h = handler();
        let meta = meta(&state, "SayHelloStream");

        let mut reply = h
            .handle_server_stream(&state, &meta, request(json!({})))
            .await
            .unwrap();
        let mut items = Vec::new();
        while let Some(event) = reply.rx.recv().await {
            if let StreamEvent::Item(item) = event {
                items.push(item);
            }
        }
        assert_eq!(items[0], json!({"idx": 0, "last": false}));
        assert_eq!(items[1], json!({"idx": 1, "last": true}));
    }

    #[tokio::test]
    async fn client_stream_aggregated_request_paths() {
        let state = state_with_rules(&[(
            "helloworld.Greeter.SayHello.yaml",
            r#"
responses:
  - when:
      request.count: 3
      request.first.name: a
      request.last.name: c
    body: {message: "three"}
  - body: {message: "other"}
"#,
        )]);
        let h = handler();
        let meta = meta(&state, "SayHello");

        let items = vec![
            json!({"name": "a"}),
            json!({"name": "b"}),
            json!({"name": "c"}),
        ];
        let reply = h
            .handle_client_stream(&state, &meta, items, BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(reply.body, json!({"message": "three"}));
    }

    #[test]
    fn aggregate_request_shape() {
        let items = vec![json!({"a": 1}), json!({"a": 2})];
        let agg = aggregate_request(&items);
        assert_eq!(agg["stream"], json!(true));
        assert_eq!(agg["count"], json!(2));
        assert_eq!(agg["first"], json!({"a": 1}));
        assert_eq!(agg["last"], json!({"a": 2}));
        assert_eq!(agg["items"][1], json!({"a": 2}));

        let empty = aggregate_request(&[]);
        assert_eq!(empty["count"], json!(0));
        assert_eq!(empty["first"], Value::Null);
    }
}
