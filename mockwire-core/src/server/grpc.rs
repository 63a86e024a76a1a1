//! Native gRPC adapter: a tower service that resolves
//! `/package.Service/Method` against the current schema snapshot and
//! dispatches through tonic's server machinery with a dynamic codec, so no
//! generated service stubs are involved.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use prost_reflect::DynamicMessage;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tonic::metadata::MetadataMap;
use tonic::Status;

use crate::codec::DynamicCodec;
use crate::format;
use crate::handler::{MockHandler, NormalizedRequest, StreamEvent, StreamReply};
use crate::metadata::{metadata_from_pairs, normalize_metadata};
use crate::schema::HandlerMeta;
use crate::state::{EngineState, SharedState};

type BoxFuture<T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'static>>;
type DynamicStream = Pin<Box<dyn Stream<Item = Result<DynamicMessage, Status>> + Send + 'static>>;

/// The dynamic gRPC service. Clone-cheap; one instance serves both the
/// plaintext and TLS listeners.
#[derive(Clone)]
pub struct GrpcMockService {
    state: Arc<SharedState>,
    handler: MockHandler,
}

impl GrpcMockService {
    pub fn new(state: Arc<SharedState>, handler: MockHandler) -> Self {
        GrpcMockService { state, handler }
    }
}

impl<B> tower::Service<http::Request<B>> for GrpcMockService
where
    B: http_body::Body<Data = bytes::Bytes> + Send + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>> + Send,
{
    type Response = http::Response<tonic::body::Body>;
    type Error = std::convert::Infallible;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<B>) -> Self::Future {
        // Snapshot the state generation once for the whole call.
        let state = self.state.load();
        let handler = self.handler.clone();

        let Some(meta) = state.schema.method_by_path(req.uri().path()).cloned() else {
            let path = req.uri().path().to_string();
            return Box::pin(async move { Ok(unimplemented_response(&path)) });
        };

        let codec = DynamicCodec::new(meta.request.clone(), meta.response.clone());
        let mut grpc = tonic::server::Grpc::new(codec);

        Box::pin(async move {
            let res = match (meta.client_streaming, meta.server_streaming) {
                (false, false) => {
                    grpc.unary(UnaryMock { handler, state, meta }, req).await
                }
                (false, true) => {
                    grpc.server_streaming(ServerStreamMock { handler, state, meta }, req)
                        .await
                }
                (true, false) => {
                    grpc.client_streaming(ClientStreamMock { handler, state, meta }, req)
                        .await
                }
                (true, true) => {
                    grpc.streaming(BidiMock { handler, state, meta }, req).await
                }
            };
            Ok(res)
        })
    }
}

/// 404-equivalent for gRPC: UNIMPLEMENTED in the headers frame, mirroring
/// what tonic's generated routers emit for unknown paths.
fn unimplemented_response(path: &str) -> http::Response<tonic::body::Body> {
    http::Response::builder()
        .status(200)
        .header("grpc-status", "12")
        .header("grpc-message", format!("unknown method {path}"))
        .header("content-type", "application/grpc")
        .body(tonic::body::Body::empty())
        .unwrap()
}

fn decode_request(
    msg: &DynamicMessage,
    md: &MetadataMap,
    meta: &HandlerMeta,
) -> Result<NormalizedRequest, Status> {
    let data = format::message_to_value(msg)
        .map_err(|e| Status::internal(format!("failed to decode request: {e}")))?;
    Ok(NormalizedRequest {
        service: meta.service.clone(),
        method: meta.method.clone(),
        metadata: normalize_metadata(md),
        data,
    })
}

fn encode_response(
    meta: &HandlerMeta,
    body: &serde_json::Value,
) -> Result<DynamicMessage, Status> {
    format::value_to_message(&meta.response, body)
        .map_err(|e| Status::internal(format!("failed to encode response: {e}")))
}

/// Adapt a handler stream reply into the tonic response stream type.
fn into_dynamic_stream(meta: &HandlerMeta, reply: StreamReply) -> DynamicStream {
    let response_desc = meta.response.clone();
    let stream = ReceiverStream::new(reply.rx).map(move |event| match event {
        StreamEvent::Item(value) => format::value_to_message(&response_desc, &value)
            .map_err(|e| Status::internal(format!("failed to encode stream item: {e}"))),
        StreamEvent::Error(err) => Err(err.into_status()),
    });
    Box::pin(stream)
}

// -- Per-shape service adapters ----------------------------------------------

struct UnaryMock {
    handler: MockHandler,
    state: Arc<EngineState>,
    meta: HandlerMeta,
}

impl tonic::server::UnaryService<DynamicMessage> for UnaryMock {
    type Response = DynamicMessage;
    type Future = BoxFuture<tonic::Response<DynamicMessage>, Status>;

    fn call(&mut self, request: tonic::Request<DynamicMessage>) -> Self::Future {
        let handler = self.handler.clone();
        let state = Arc::clone(&self.state);
        let meta = self.meta.clone();
        Box::pin(async move {
            let (md, _, msg) = request.into_parts();
            let normalized = decode_request(&msg, &md, &meta)?;
            let reply = handler
                .handle_unary(&state, &meta, normalized)
                .await
                .map_err(|err| err.into_status())?;
            let msg = encode_response(&meta, &reply.body)?;
            let mut response = tonic::Response::new(msg);
            *response.metadata_mut() = metadata_from_pairs(&reply.trailers);
            Ok(response)
        })
    }
}

struct ServerStreamMock {
    handler: MockHandler,
    state: Arc<EngineState>,
    meta: HandlerMeta,
}

impl tonic::server::ServerStreamingService<DynamicMessage> for ServerStreamMock {
    type Response = DynamicMessage;
    type ResponseStream = DynamicStream;
    type Future = BoxFuture<tonic::Response<Self::ResponseStream>, Status>;

    fn call(&mut self, request: tonic::Request<DynamicMessage>) -> Self::Future {
        let handler = self.handler.clone();
        let state = Arc::clone(&self.state);
        let meta = self.meta.clone();
        Box::pin(async move {
            let (md, _, msg) = request.into_parts();
            let normalized = decode_request(&msg, &md, &meta)?;
            let reply = handler
                .handle_server_stream(&state, &meta, normalized)
                .await
                .map_err(|err| err.into_status())?;
            let trailers = metadata_from_pairs(&reply.trailers);
            let mut response = tonic::Response::new(into_dynamic_stream(&meta, reply));
            *response.metadata_mut() = trailers;
            Ok(response)
        })
    }
}

struct ClientStreamMock {
    handler: MockHandler,
    state: Arc<EngineState>,
    meta: HandlerMeta,
}

impl tonic::server::ClientStreamingService<DynamicMessage> for ClientStreamMock {
    type Response = DynamicMessage;
    type Future = BoxFuture<tonic::Response<DynamicMessage>, Status>;

    fn call(
        &mut self,
        request: tonic::Request<tonic::Streaming<DynamicMessage>>,
    ) -> Self::Future {
        let handler = self.handler.clone();
        let state = Arc::clone(&self.state);
        let meta = self.meta.clone();
        Box::pin(async move {
            let (md, _, mut stream) = request.into_parts();
            let metadata = normalize_metadata(&md);
            let items = drain_input(&handler, &state, &meta, &mut stream).await?;
            let reply = handler
                .handle_client_stream(&state, &meta, items, metadata)
                .await
                .map_err(|err| err.into_status())?;
            let msg = encode_response(&meta, &reply.body)?;
            let mut response = tonic::Response::new(msg);
            *response.metadata_mut() = metadata_from_pairs(&reply.trailers);
            Ok(response)
        })
    }
}

struct BidiMock {
    handler: MockHandler,
    state: Arc<EngineState>,
    meta: HandlerMeta,
}

impl tonic::server::StreamingService<DynamicMessage> for BidiMock {
    type Response = DynamicMessage;
    type ResponseStream = DynamicStream;
    type Future = BoxFuture<tonic::Response<Self::ResponseStream>, Status>;

    fn call(
        &mut self,
        request: tonic::Request<tonic::Streaming<DynamicMessage>>,
    ) -> Self::Future {
        let handler = self.handler.clone();
        let state = Arc::clone(&self.state);
        let meta = self.meta.clone();
        Box::pin(async move {
            let (md, _, mut stream) = request.into_parts();
            let metadata = normalize_metadata(&md);
            let items = drain_input(&handler, &state, &meta, &mut stream).await?;
            let reply = handler
                .handle_bidi_stream(&state, &meta, items, metadata)
                .await
                .map_err(|err| err.into_status())?;
            let trailers = metadata_from_pairs(&reply.trailers);
            let mut response = tonic::Response::new(into_dynamic_stream(&meta, reply));
            *response.metadata_mut() = trailers;
            Ok(response)
        })
    }
}

/// Drain a client stream, validating each message as it arrives when the
/// runtime is in per_message mode (aggregate-mode validation happens in the
/// handler after collection).
async fn drain_input(
    handler: &MockHandler,
    state: &EngineState,
    meta: &HandlerMeta,
    stream: &mut tonic::Streaming<DynamicMessage>,
) -> Result<Vec<serde_json::Value>, Status> {
    let per_message = handler.validation_mode() == crate::config::ValidationMode::PerMessage;
    let mut items = Vec::new();
    while let Some(msg) = stream.message().await? {
        let value = format::message_to_value(&msg)
            .map_err(|e| Status::internal(format!("failed to decode stream message: {e}")))?;
        if per_message {
            handler
                .validate_inbound(state, meta, &value)
                .map_err(|err| err.into_status())?;
        }
        items.push(value);
    }
    Ok(items)
}
