use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Json;
use axum::body::{Body, to_bytes};
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, warn};

use crate::error::ApiError;
use crate::metrics::{
    INVALID_REQUESTS, RATE_LIMITED, REQUEST_LATENCY, REQUEST_TOTAL, STREAM_CHUNKS,
};
use crate::models::StreamChunk;
use crate::rate_limit::client_key;
use crate::sse::{EVENT_STREAM, encode_frame};
use crate::state::AppState;
use crate::validation::parse_request;

const MAX_BODY_BYTES: usize = 1024 * 1024;

// Sent if a chunk cannot be encoded; still a well-formed terminal frame
const ENCODE_FAILURE_FRAME: &str =
    "data: {\"error\":\"AI streaming failed: could not encode chunk\",\"done\":true}\n\n";

pub async fn generate_handler(
    State(state): State<Arc<AppState>>,
    request: Request,
) -> Result<Response, ApiError> {
    REQUEST_TOTAL.inc();

    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let (parts, body) = request.into_parts();

    // validation runs before admission so malformed requests never count
    let body = to_bytes(body, MAX_BODY_BYTES).await.map_err(|_| {
        INVALID_REQUESTS.inc();
        ApiError::InvalidJson
    })?;
    let value: serde_json::Value = serde_json::from_slice(&body).map_err(|_| {
        INVALID_REQUESTS.inc();
        ApiError::InvalidJson
    })?;
    let payload = parse_request(value).map_err(|e| {
        INVALID_REQUESTS.inc();
        debug!("Rejected request: {}", e);
        ApiError::InvalidRequest(e)
    })?;

    let key = client_key(&parts.headers, peer);
    if !state.admission.admit(&key) {
        RATE_LIMITED.inc();
        warn!(client = %key, "Rate limit exceeded");
        return Err(ApiError::RateLimited {
            limit: state.admission.limit(),
            window: state.admission.window(),
        });
    }

    if wants_stream(&parts.headers) {
        debug!(client = %key, mode = %payload.mode, "Streaming generation");
        let chunks = ReceiverStream::new(state.service.stream(&payload)).map(frame);
        let headers = [
            (header::CONTENT_TYPE, EVENT_STREAM),
            (header::CACHE_CONTROL, "no-cache"),
        ];
        return Ok((headers, Body::from_stream(chunks)).into_response());
    }

    let start_time = Instant::now();
    let response = state.service.generate(&payload).await.map_err(|e| {
        ApiError::internal(format!("AI service failed: {e}"), state.expose_error_details)
    })?;
    REQUEST_LATENCY.observe(start_time.elapsed().as_secs_f64());

    Ok(Json(response).into_response())
}

pub async fn method_not_allowed() -> ApiError {
    ApiError::MethodNotAllowed
}

fn wants_stream(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains(EVENT_STREAM))
}

fn frame(chunk: StreamChunk) -> Result<Bytes, Infallible> {
    STREAM_CHUNKS.inc();
    Ok(encode_frame(&chunk).unwrap_or_else(|e| {
        error!("Failed to encode stream chunk: {}", e);
        Bytes::from_static(ENCODE_FAILURE_FRAME.as_bytes())
    }))
}
