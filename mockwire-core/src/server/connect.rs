//! Connect / gRPC-Web adapter.
//!
//! One HTTP listener serves three content-type families on
//! `POST /<service>/<method>`:
//!
//! - `application/json` / `application/proto`: Connect unary, plus
//!   `application/connect+json|proto` for Connect streaming.
//! - `application/grpc-web+proto|json` and the `-text` variants: gRPC-Web
//!   framing.
//! - `application/grpc+proto` (and bare `application/grpc`): gRPC over
//!   HTTP/2, dispatched to the same dynamic gRPC service as the native
//!   listeners.
//!
//! Connect errors are JSON `{code, message, details?}` with the documented
//! HTTP status mapping; gRPC-Web errors ride the trailers frame.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::extract::State;
use axum::response::Response;
use axum::Router;
use base64::Engine as _;
use bytes::{BufMut, Bytes, BytesMut};
use http::header::CONTENT_TYPE;
use http::{HeaderValue, Method, StatusCode};
use prost::Message as _;
use prost_reflect::DynamicMessage;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tower::Service;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tracing::debug;

use crate::config::ConnectSettings;
use crate::format;
use crate::handler::{MockHandler, NormalizedError, NormalizedRequest, StreamEvent, StreamReply};
use crate::metadata::normalize_headers;
use crate::metrics::Metrics;
use crate::report::{StatusReport, StatusSource};
use crate::schema::HandlerMeta;
use crate::server::grpc::GrpcMockService;
use crate::state::SharedState;
use crate::status;

/// Shared context for the Connect router handlers.
#[derive(Clone)]
pub struct ConnectCtx {
    pub state: Arc<SharedState>,
    pub handler: MockHandler,
    pub metrics: Arc<Metrics>,
    pub status: StatusSource,
}

/// The service bound on the Connect port: routes native-gRPC content types
/// to the dynamic gRPC service and everything else to the axum router.
#[derive(Clone)]
pub struct ConnectService {
    grpc: GrpcMockService,
    router: Router,
    metrics: Arc<Metrics>,
}

impl ConnectService {
    pub fn new(ctx: ConnectCtx, settings: &ConnectSettings) -> Self {
        let grpc = GrpcMockService::new(Arc::clone(&ctx.state), ctx.handler.clone());
        let metrics = Arc::clone(&ctx.metrics);
        let router = build_router(ctx, settings);
        ConnectService {
            grpc,
            router,
            metrics,
        }
    }
}

impl Service<http::Request<hyper::body::Incoming>> for ConnectService {
    type Response = http::Response<axum::body::Body>;
    type Error = std::convert::Infallible;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<hyper::body::Incoming>) -> Self::Future {
        let content_type = req
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        if content_type.starts_with("application/grpc")
            && !content_type.starts_with("application/grpc-web")
        {
            self.metrics.record_grpc_over_http_request();
            let fut = self.grpc.call(req);
            return Box::pin(async move {
                let response = fut.await?;
                Ok(response.map(axum::body::Body::new))
            });
        }

        let mut router = self.router.clone();
        Box::pin(async move { router.call(req).await })
    }
}

/// Build the axum router: `GET /status` serves the admin status payload,
/// every `POST /<service>/<method>` lands in the fallback handler, and
/// CORS wraps the whole thing when enabled.
pub fn build_router(ctx: ConnectCtx, settings: &ConnectSettings) -> Router {
    let router = Router::new()
        .route("/status", axum::routing::get(handle_status))
        .fallback(handle)
        .with_state(ctx);
    if settings.cors_enabled {
        router.layer(build_cors(settings))
    } else {
        router
    }
}

async fn handle_status(State(ctx): State<ConnectCtx>) -> axum::Json<StatusReport> {
    axum::Json(ctx.status.report())
}

fn build_cors(settings: &ConnectSettings) -> CorsLayer {
    let origin = if settings.cors_origins.is_empty() {
        AllowOrigin::any()
    } else {
        AllowOrigin::list(
            settings
                .cors_origins
                .iter()
                .filter_map(|o| HeaderValue::from_str(o).ok()),
        )
    };
    let methods = if settings.cors_methods.is_empty() {
        AllowMethods::list([Method::GET, Method::POST, Method::OPTIONS])
    } else {
        AllowMethods::list(
            settings
                .cors_methods
                .iter()
                .filter_map(|m| m.parse::<Method>().ok()),
        )
    };
    let headers = if settings.cors_headers.is_empty() {
        AllowHeaders::mirror_request()
    } else {
        AllowHeaders::list(
            settings
                .cors_headers
                .iter()
                .filter_map(|h| h.parse::<http::HeaderName>().ok()),
        )
    };

    CorsLayer::new()
        .allow_origin(origin)
        .allow_methods(methods)
        .allow_headers(headers)
        .expose_headers([
            http::HeaderName::from_static("grpc-status"),
            http::HeaderName::from_static("grpc-message"),
            http::HeaderName::from_static("connect-protocol-version"),
            http::HeaderName::from_static("connect-timeout-ms"),
        ])
        .max_age(Duration::from_secs(86400))
}

/// Which wire protocol a request speaks, derived from its content type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WireProtocol {
    ConnectUnary(Payload),
    ConnectStream(Payload),
    GrpcWeb { payload: Payload, text: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Payload {
    Json,
    Proto,
}

fn parse_content_type(content_type: &str) -> Option<WireProtocol> {
    let base = content_type.split(';').next().unwrap_or("").trim();
    match base {
        "application/json" => Some(WireProtocol::ConnectUnary(Payload::Json)),
        "application/proto" => Some(WireProtocol::ConnectUnary(Payload::Proto)),
        "application/connect+json" => Some(WireProtocol::ConnectStream(Payload::Json)),
        "application/connect+proto" => Some(WireProtocol::ConnectStream(Payload::Proto)),
        "application/grpc-web" | "application/grpc-web+proto" => Some(WireProtocol::GrpcWeb {
            payload: Payload::Proto,
            text: false,
        }),
        "application/grpc-web+json" => Some(WireProtocol::GrpcWeb {
            payload: Payload::Json,
            text: false,
        }),
        "application/grpc-web-text" | "application/grpc-web-text+proto" => {
            Some(WireProtocol::GrpcWeb {
                payload: Payload::Proto,
                text: true,
            })
        }
        _ => None,
    }
}

async fn handle(State(ctx): State<ConnectCtx>, req: axum::extract::Request) -> Response {
    let (parts, body) = req.into_parts();

    let content_type = parts
        .headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let Some(protocol) = parse_content_type(content_type) else {
        return plain_status(
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "unsupported content type",
        );
    };
    if parts.method != Method::POST {
        return plain_status(StatusCode::METHOD_NOT_ALLOWED, "only POST is supported");
    }

    match protocol {
        WireProtocol::ConnectUnary(_) | WireProtocol::ConnectStream(_) => {
            ctx.metrics.record_connect_request()
        }
        WireProtocol::GrpcWeb { .. } => ctx.metrics.record_grpc_web_request(),
    }

    let state = ctx.state.load();
    let path = parts.uri.path().to_string();
    let Some(meta) = state.schema.method_by_path(&path).cloned() else {
        debug!(path = %path, "unknown method on connect listener");
        let err = NormalizedError::new(12, format!("unknown method {path}"));
        return error_response(&protocol, &err);
    };

    let metadata = normalize_headers(&parts.headers);

    let raw = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(raw) => raw,
        Err(err) => {
            let err = NormalizedError::new(13, format!("failed to read request body: {err}"));
            return error_response(&protocol, &err);
        }
    };

    // Decode the inbound message(s) per the request's framing.
    let messages = match decode_request_messages(&protocol, &meta, &raw) {
        Ok(messages) => messages,
        Err(err) => return error_response(&protocol, &err),
    };

    // A streaming method reached on the plain unary content type still
    // needs enveloped framing on the way out.
    let protocol = match protocol {
        WireProtocol::ConnectUnary(p) if meta.server_streaming => WireProtocol::ConnectStream(p),
        other => other,
    };

    dispatch(&ctx, &state, &protocol, &meta, metadata, messages).await
}

/// Decode request payload(s): bare body for Connect unary, enveloped
/// frames for Connect streaming and gRPC-Web (base64-wrapped for the text
/// variant).
fn decode_request_messages(
    protocol: &WireProtocol,
    meta: &HandlerMeta,
    raw: &[u8],
) -> Result<Vec<Value>, NormalizedError> {
    match protocol {
        WireProtocol::ConnectUnary(payload) => Ok(vec![decode_payload(meta, *payload, raw)?]),
        WireProtocol::ConnectStream(payload) => {
            let frames = parse_frames(raw)?;
            let mut messages = Vec::new();
            for (flag, chunk) in frames {
                match flag {
                    0x00 => messages.push(decode_payload(meta, *payload, chunk)?),
                    // Client end-stream marker carries no message.
                    0x02 => break,
                    other => {
                        return Err(NormalizedError::new(
                            12,
                            format!("unsupported frame flag {other:#04x}"),
                        ))
                    }
                }
            }
            Ok(messages)
        }
        WireProtocol::GrpcWeb { payload, text } => {
            let decoded;
            let bytes: &[u8] = if *text {
                decoded = base64::engine::general_purpose::STANDARD
                    .decode(raw)
                    .map_err(|e| {
                        NormalizedError::new(3, format!("invalid base64 body: {e}"))
                    })?;
                &decoded
            } else {
                raw
            };
            let frames = parse_frames(bytes)?;
            let mut messages = Vec::new();
            for (flag, chunk) in frames {
                match flag {
                    0x00 => messages.push(decode_payload(meta, *payload, chunk)?),
                    0x80 => break,
                    other => {
                        return Err(NormalizedError::new(
                            12,
                            format!("unsupported frame flag {other:#04x}"),
                        ))
                    }
                }
            }
            Ok(messages)
        }
    }
}

async fn dispatch(
    ctx: &ConnectCtx,
    state: &crate::state::EngineState,
    protocol: &WireProtocol,
    meta: &HandlerMeta,
    metadata: BTreeMap<String, String>,
    mut messages: Vec<Value>,
) -> Response {
    match (meta.client_streaming, meta.server_streaming) {
        (false, false) => {
            let data = messages.pop().unwrap_or_else(|| json!({}));
            let request = NormalizedRequest {
                service: meta.service.clone(),
                method: meta.method.clone(),
                metadata,
                data,
            };
            match ctx.handler.handle_unary(state, meta, request).await {
                Ok(reply) => unary_response(protocol, meta, &reply.body, &reply.trailers),
                Err(err) => error_response(protocol, &err),
            }
        }
        (false, true) => {
            let data = messages.pop().unwrap_or_else(|| json!({}));
            let request = NormalizedRequest {
                service: meta.service.clone(),
                method: meta.method.clone(),
                metadata,
                data,
            };
            match ctx.handler.handle_server_stream(state, meta, request).await {
                Ok(reply) => stream_response(protocol, meta, reply),
                Err(err) => error_response(protocol, &err),
            }
        }
        (true, false) => {
            if ctx.handler.validation_mode() == crate::config::ValidationMode::PerMessage {
                for message in &messages {
                    if let Err(err) = ctx.handler.validate_inbound(state, meta, message) {
                        return error_response(protocol, &err);
                    }
                }
            }
            match ctx
                .handler
                .handle_client_stream(state, meta, messages, metadata)
                .await
            {
                Ok(reply) => unary_response(protocol, meta, &reply.body, &reply.trailers),
                Err(err) => error_response(protocol, &err),
            }
        }
        (true, true) => {
            if ctx.handler.validation_mode() == crate::config::ValidationMode::PerMessage {
                for message in &messages {
                    if let Err(err) = ctx.handler.validate_inbound(state, meta, message) {
                        return error_response(protocol, &err);
                    }
                }
            }
            match ctx
                .handler
                .handle_bidi_stream(state, meta, messages, metadata)
                .await
            {
                Ok(reply) => stream_response(protocol, meta, reply),
                Err(err) => error_response(protocol, &err),
            }
        }
    }
}

// -- Payload encode/decode ----------------------------------------------------

fn decode_payload(
    meta: &HandlerMeta,
    payload: Payload,
    bytes: &[u8],
) -> Result<Value, NormalizedError> {
    let msg = match payload {
        Payload::Json => {
            let raw: Value = if bytes.is_empty() {
                json!({})
            } else {
                serde_json::from_slice(bytes)
                    .map_err(|e| NormalizedError::new(3, format!("invalid JSON body: {e}")))?
            };
            format::value_to_message(&meta.request, &raw)
                .map_err(|e| NormalizedError::new(3, e.to_string()))?
        }
        Payload::Proto => DynamicMessage::decode(meta.request.clone(), bytes)
            .map_err(|e| NormalizedError::new(3, format!("invalid protobuf body: {e}")))?,
    };
    format::message_to_value(&msg).map_err(|e| NormalizedError::new(13, e.to_string()))
}

fn encode_payload(
    meta: &HandlerMeta,
    payload: Payload,
    body: &Value,
) -> Result<Bytes, NormalizedError> {
    let msg = format::value_to_message(&meta.response, body)
        .map_err(|e| NormalizedError::new(13, e.to_string()))?;
    match payload {
        Payload::Json => {
            let value =
                format::message_to_value(&msg).map_err(|e| NormalizedError::new(13, e.to_string()))?;
            let bytes = serde_json::to_vec(&value)
                .map_err(|e| NormalizedError::new(13, e.to_string()))?;
            Ok(Bytes::from(bytes))
        }
        Payload::Proto => Ok(Bytes::from(msg.encode_to_vec())),
    }
}

// -- Framing ------------------------------------------------------------------

/// Split an enveloped body into `(flag, payload)` frames.
fn parse_frames(bytes: &[u8]) -> Result<Vec<(u8, &[u8])>, NormalizedError> {
    let mut frames = Vec::new();
    let mut rest = bytes;
    while !rest.is_empty() {
        if rest.len() < 5 {
            return Err(NormalizedError::new(3, "truncated frame header"));
        }
        let flag = rest[0];
        let len = u32::from_be_bytes([rest[1], rest[2], rest[3], rest[4]]) as usize;
        if rest.len() < 5 + len {
            return Err(NormalizedError::new(3, "truncated frame payload"));
        }
        frames.push((flag, &rest[5..5 + len]));
        rest = &rest[5 + len..];
    }
    Ok(frames)
}

fn frame(flag: u8, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(5 + payload.len());
    buf.put_u8(flag);
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    buf.freeze()
}

/// The gRPC-Web trailers frame body: HTTP/1-style `key: value` lines.
fn web_trailers(code: i32, message: &str, extra: &BTreeMap<String, String>) -> Bytes {
    let mut out = String::new();
    out.push_str(&format!("grpc-status: {code}\r\n"));
    if !message.is_empty() {
        out.push_str(&format!("grpc-message: {message}\r\n"));
    }
    for (key, value) in extra {
        out.push_str(&format!("{key}: {value}\r\n"));
    }
    Bytes::from(out)
}

// -- Response builders --------------------------------------------------------

fn content_type_for(protocol: &WireProtocol) -> &'static str {
    match protocol {
        WireProtocol::ConnectUnary(Payload::Json) => "application/json",
        WireProtocol::ConnectUnary(Payload::Proto) => "application/proto",
        WireProtocol::ConnectStream(Payload::Json) => "application/connect+json",
        WireProtocol::ConnectStream(Payload::Proto) => "application/connect+proto",
        WireProtocol::GrpcWeb { text: true, .. } => "application/grpc-web-text+proto",
        WireProtocol::GrpcWeb {
            payload: Payload::Json,
            ..
        } => "application/grpc-web+json",
        WireProtocol::GrpcWeb {
            payload: Payload::Proto,
            ..
        } => "application/grpc-web+proto",
    }
}

fn plain_status(status: StatusCode, message: &str) -> Response {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/plain")
        .body(axum::body::Body::from(message.to_string()))
        .unwrap()
}

/// Connect error JSON body.
fn connect_error_body(err: &NormalizedError) -> Value {
    let mut body = json!({
        "code": status::connect_code(err.code),
        "message": err.message,
    });
    if !err.violations.is_empty() {
        body["details"] = json!([{
            "type": "field_violations",
            "violations": err.violations,
        }]);
    }
    body
}

fn error_response(protocol: &WireProtocol, err: &NormalizedError) -> Response {
    match protocol {
        WireProtocol::ConnectUnary(_) => {
            let body = connect_error_body(err);
            let mut builder = Response::builder()
                .status(status::connect_http_status(err.code))
                .header(CONTENT_TYPE, "application/json");
            for (key, value) in &err.trailers {
                if let (Ok(name), Ok(val)) = (
                    http::HeaderName::try_from(format!("trailer-{key}")),
                    HeaderValue::from_str(value),
                ) {
                    builder = builder.header(name, val);
                }
            }
            builder
                .body(axum::body::Body::from(body.to_string()))
                .unwrap()
        }
        WireProtocol::ConnectStream(_) => {
            // Streaming errors ride the end-stream frame with HTTP 200.
            let end = json!({
                "error": connect_error_body(err),
                "metadata": err.trailers,
            });
            let payload = frame(0x02, end.to_string().as_bytes());
            Response::builder()
                .status(StatusCode::OK)
                .header(CONTENT_TYPE, content_type_for(protocol))
                .body(axum::body::Body::from(payload))
                .unwrap()
        }
        WireProtocol::GrpcWeb { text, .. } => {
            let trailers = frame(0x80, &web_trailers(err.code, &err.message, &err.trailers));
            let body = maybe_text(*text, trailers);
            Response::builder()
                .status(StatusCode::OK)
                .header(CONTENT_TYPE, content_type_for(protocol))
                .body(axum::body::Body::from(body))
                .unwrap()
        }
    }
}

fn maybe_text(text: bool, bytes: Bytes) -> Bytes {
    if text {
        Bytes::from(base64::engine::general_purpose::STANDARD.encode(&bytes))
    } else {
        bytes
    }
}

fn unary_response(
    protocol: &WireProtocol,
    meta: &HandlerMeta,
    body: &Value,
    trailers: &BTreeMap<String, String>,
) -> Response {
    let payload = match protocol {
        WireProtocol::ConnectUnary(p) | WireProtocol::ConnectStream(p) => *p,
        WireProtocol::GrpcWeb { payload, .. } => *payload,
    };
    let encoded = match encode_payload(meta, payload, body) {
        Ok(encoded) => encoded,
        Err(err) => return error_response(protocol, &err),
    };

    match protocol {
        WireProtocol::ConnectUnary(_) => {
            let mut builder = Response::builder()
                .status(StatusCode::OK)
                .header(CONTENT_TYPE, content_type_for(protocol));
            // Unary Connect trailers become Trailer- prefixed headers.
            for (key, value) in trailers {
                if let (Ok(name), Ok(val)) = (
                    http::HeaderName::try_from(format!("trailer-{key}")),
                    HeaderValue::from_str(value),
                ) {
                    builder = builder.header(name, val);
                }
            }
            builder.body(axum::body::Body::from(encoded)).unwrap()
        }
        WireProtocol::ConnectStream(_) => {
            let mut buf = BytesMut::new();
            buf.extend_from_slice(&frame(0x00, &encoded));
            let end = json!({ "metadata": trailers });
            buf.extend_from_slice(&frame(0x02, end.to_string().as_bytes()));
            Response::builder()
                .status(StatusCode::OK)
                .header(CONTENT_TYPE, content_type_for(protocol))
                .body(axum::body::Body::from(buf.freeze()))
                .unwrap()
        }
        WireProtocol::GrpcWeb { text, .. } => {
            let mut buf = BytesMut::new();
            buf.extend_from_slice(&maybe_text(*text, frame(0x00, &encoded)));
            buf.extend_from_slice(&maybe_text(
                *text,
                frame(0x80, &web_trailers(0, "", trailers)),
            ));
            Response::builder()
                .status(StatusCode::OK)
                .header(CONTENT_TYPE, content_type_for(protocol))
                .body(axum::body::Body::from(buf.freeze()))
                .unwrap()
        }
    }
}

/// Build a streaming response body that forwards rendered items as frames
/// and closes with the protocol's terminal frame. A small writer task
/// bridges the handler's producer channel to the HTTP body; client
/// disconnect drops the body, which drops the channel, which stops the
/// producer.
fn stream_response(protocol: &WireProtocol, meta: &HandlerMeta, reply: StreamReply) -> Response {
    let payload = match protocol {
        WireProtocol::ConnectUnary(p) | WireProtocol::ConnectStream(p) => *p,
        WireProtocol::GrpcWeb { payload, .. } => *payload,
    };
    let (kind, text) = match protocol {
        WireProtocol::GrpcWeb { text, .. } => (FrameKind::GrpcWeb, *text),
        _ => (FrameKind::Connect, false),
    };

    let (tx, rx) = mpsc::channel::<Result<Bytes, std::convert::Infallible>>(1);
    let meta = meta.clone();
    let trailers = reply.trailers.clone();
    let mut events = reply.rx;

    tokio::spawn(async move {
        let mut terminal: Option<NormalizedError> = None;
        while let Some(event) = events.recv().await {
            match event {
                StreamEvent::Item(value) => {
                    let encoded = match encode_payload(&meta, payload, &value) {
                        Ok(encoded) => encoded,
                        Err(err) => {
                            terminal = Some(err);
                            break;
                        }
                    };
                    let chunk = maybe_text(text, frame(0x00, &encoded));
                    if tx.send(Ok(chunk)).await.is_err() {
                        return;
                    }
                }
                StreamEvent::Error(err) => {
                    terminal = Some(err);
                    break;
                }
            }
        }

        let end = match (&kind, &terminal) {
            (FrameKind::Connect, None) => {
                let end = json!({ "metadata": trailers });
                frame(0x02, end.to_string().as_bytes())
            }
            (FrameKind::Connect, Some(err)) => {
                let end = json!({
                    "error": connect_error_body(err),
                    "metadata": err.trailers,
                });
                frame(0x02, end.to_string().as_bytes())
            }
            (FrameKind::GrpcWeb, None) => frame(0x80, &web_trailers(0, "", &trailers)),
            (FrameKind::GrpcWeb, Some(err)) => {
                frame(0x80, &web_trailers(err.code, &err.message, &err.trailers))
            }
        };
        let _ = tx.send(Ok(maybe_text(text, end))).await;
    });

    let body = axum::body::Body::from_stream(tokio_stream::wrappers::ReceiverStream::new(rx));
    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, content_type_for(protocol))
        .body(body)
        .unwrap()
}

enum FrameKind {
    Connect,
    GrpcWeb,
}
