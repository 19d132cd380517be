//! Client side of a generation exchange.
//!
//! A [`ResponseConsumer`] drives one request at a time through
//! `Idle → Loading → (Streaming) → Done | Errored`, retrying transient
//! failures with linear backoff under a single overall deadline. Every state
//! change is published on a `watch` channel for whatever front-end renders it.
//!
//! All transitions for a request go through the current in-flight handle: a
//! request that has been cancelled, timed out, reset or superseded can no
//! longer touch the published state.

mod transport;

pub use transport::{ChunkStream, HttpTransport, Reply, Transport};

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{Notify, watch};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::error::ErrorCode;
use crate::models::{ErrorBody, GenerationRequest, GenerationResponse};
use crate::upstream::DEFAULT_MODEL;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ClientError {
    #[error("{message}")]
    Api {
        status: u16,
        code: Option<ErrorCode>,
        message: String,
        details: Option<Value>,
    },
    #[error("Transport error: {0}")]
    Transport(String),
    // error chunk sent by the server mid-stream
    #[error("{0}")]
    Stream(String),
    #[error("Request timeout")]
    Timeout,
    #[error("Request cancelled")]
    Cancelled,
}

impl ClientError {
    pub fn from_body(status: u16, body: ErrorBody) -> Self {
        ClientError::Api {
            status,
            code: body.code.as_deref().and_then(|c| c.parse().ok()),
            message: body.error,
            details: body.details,
        }
    }

    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            ClientError::Api { code, .. } => *code,
            ClientError::Timeout => Some(ErrorCode::Timeout),
            ClientError::Cancelled => Some(ErrorCode::Cancelled),
            ClientError::Transport(_) | ClientError::Stream(_) => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Transport(_) => true,
            ClientError::Api { code, .. } => !code.is_some_and(ErrorCode::is_terminal),
            ClientError::Stream(_) | ClientError::Timeout | ClientError::Cancelled => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    pub enable_streaming: bool,
    pub retry_count: u32,
    pub retry_delay: Duration, // multiplied by the retry number
    pub timeout: Duration,     // whole request, retries included
    pub default_model: String,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            enable_streaming: false,
            retry_count: 3,
            retry_delay: Duration::from_millis(1000),
            timeout: Duration::from_millis(30_000),
            default_model: DEFAULT_MODEL.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Idle,
    Loading,
    Streaming,
    Done,
    Errored,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConsumerState {
    pub phase: Phase,
    pub response: Option<GenerationResponse>,
    pub error: Option<ClientError>,
    pub stream_content: String,
    pub confidence: f64,
    pub summary: String,
}

impl ConsumerState {
    pub fn is_loading(&self) -> bool {
        matches!(self.phase, Phase::Loading | Phase::Streaming)
    }

    pub fn is_streaming(&self) -> bool {
        self.phase == Phase::Streaming
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.phase, Phase::Done | Phase::Errored)
    }
}

struct InFlight {
    id: u64,
    abort: Arc<Notify>,
}

pub struct ResponseConsumer {
    transport: Arc<dyn Transport>,
    options: ConsumerOptions,
    state: watch::Sender<ConsumerState>,
    in_flight: Mutex<Option<InFlight>>,
    next_id: AtomicU64,
}

impl ResponseConsumer {
    pub fn new(transport: Arc<dyn Transport>, options: ConsumerOptions) -> Self {
        let (state, _) = watch::channel(ConsumerState::default());
        Self {
            transport,
            options,
            state,
            in_flight: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn options(&self) -> &ConsumerOptions {
        &self.options
    }

    pub fn subscribe(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> ConsumerState {
        self.state.borrow().clone()
    }

    /// Run `request` to completion, replacing whatever was in flight.
    ///
    /// The outcome is published on the state channel and also returned. A
    /// request that loses its slot to `cancel`, `reset` or a newer `generate`
    /// returns [`ClientError::Cancelled`].
    pub async fn generate(
        &self,
        request: GenerationRequest,
    ) -> Result<GenerationResponse, ClientError> {
        let (id, abort) = self.begin();

        let outcome = tokio::select! {
            biased;
            _ = abort.notified() => Err(ClientError::Cancelled),
            _ = sleep(self.options.timeout) => {
                warn!(timeout = ?self.options.timeout, "Generation request timed out");
                Err(ClientError::Timeout)
            }
            result = self.run(id, &request) => result,
        };

        self.finish(id, outcome)
    }

    /// Abort the in-flight request, if any, and mark the state cancelled.
    pub fn cancel(&self) {
        let mut in_flight = self.in_flight.lock();
        if let Some(active) = in_flight.take() {
            active.abort.notify_one();
            info!("Generation request cancelled");
        }
        self.state.send_modify(|s| {
            s.phase = Phase::Errored;
            s.error = Some(ClientError::Cancelled);
        });
    }

    /// Abort the in-flight request, if any, and return to `Idle`.
    pub fn reset(&self) {
        let mut in_flight = self.in_flight.lock();
        if let Some(active) = in_flight.take() {
            active.abort.notify_one();
        }
        self.state.send_replace(ConsumerState::default());
    }

    fn begin(&self) -> (u64, Arc<Notify>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let abort = Arc::new(Notify::new());

        let mut in_flight = self.in_flight.lock();
        if let Some(previous) = in_flight.replace(InFlight {
            id,
            abort: Arc::clone(&abort),
        }) {
            debug!(superseded = previous.id, "Replacing in-flight request");
            previous.abort.notify_one();
        }
        self.state.send_replace(ConsumerState::default());
        self.state.send_modify(|s| s.phase = Phase::Loading);

        (id, abort)
    }

    // Apply `f` only while request `id` still owns the slot
    fn update(&self, id: u64, f: impl FnOnce(&mut ConsumerState)) -> bool {
        let in_flight = self.in_flight.lock();
        if in_flight.as_ref().is_some_and(|active| active.id == id) {
            self.state.send_modify(f);
            return true;
        }
        false
    }

    fn finish(
        &self,
        id: u64,
        outcome: Result<GenerationResponse, ClientError>,
    ) -> Result<GenerationResponse, ClientError> {
        let mut in_flight = self.in_flight.lock();
        if !in_flight.as_ref().is_some_and(|active| active.id == id) {
            return Err(ClientError::Cancelled);
        }
        *in_flight = None;

        match &outcome {
            Ok(response) => self.state.send_modify(|s| {
                s.phase = Phase::Done;
                s.stream_content = response.content.clone();
                s.confidence = response.confidence;
                s.summary = response.summary.clone();
                s.response = Some(response.clone());
                s.error = None;
            }),
            Err(e) => self.state.send_modify(|s| {
                s.phase = Phase::Errored;
                s.error = Some(e.clone());
            }),
        }
        outcome
    }

    async fn run(
        &self,
        id: u64,
        request: &GenerationRequest,
    ) -> Result<GenerationResponse, ClientError> {
        let mut retry: u32 = 0;
        loop {
            match self.attempt(id, request).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() && retry < self.options.retry_count => {
                    retry += 1;
                    let delay = self.options.retry_delay * retry;
                    warn!(retry, delay_ms = delay.as_millis() as u64, "Generation attempt failed, retrying: {}", e);

                    self.update(id, |s| {
                        s.phase = Phase::Loading;
                        s.stream_content.clear();
                        s.confidence = 0.0;
                        s.summary.clear();
                    });
                    sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn attempt(
        &self,
        id: u64,
        request: &GenerationRequest,
    ) -> Result<GenerationResponse, ClientError> {
        match self
            .transport
            .send(request, self.options.enable_streaming)
            .await?
        {
            Reply::Complete(response) => Ok(response),
            Reply::Stream(chunks) => self.consume(id, request, chunks).await,
        }
    }

    async fn consume(
        &self,
        id: u64,
        request: &GenerationRequest,
        mut chunks: ChunkStream,
    ) -> Result<GenerationResponse, ClientError> {
        self.update(id, |s| s.phase = Phase::Streaming);

        let mut content = String::new();
        let mut confidence = None;
        let mut summary = None;

        while let Some(chunk) = chunks.next().await {
            let chunk = chunk?;

            if let Some(error) = chunk.error {
                return Err(ClientError::Stream(error));
            }
            if let Some(fragment) = chunk.content.filter(|c| !c.is_empty()) {
                content.push_str(&fragment);
                let visible = content.clone();
                self.update(id, move |s| s.stream_content = visible);
            }
            if let Some(value) = chunk.confidence {
                confidence = Some(value);
                self.update(id, |s| s.confidence = value);
            }
            if let Some(text) = chunk.summary.filter(|t| !t.is_empty()) {
                summary = Some(text.clone());
                self.update(id, move |s| s.summary = text);
            }

            if chunk.done {
                return Ok(GenerationResponse {
                    content,
                    confidence: confidence.unwrap_or(0.0),
                    summary: summary.unwrap_or_default(),
                    usage: None,
                    model: request
                        .model()
                        .unwrap_or(&self.options.default_model)
                        .to_string(),
                    timestamp: Utc::now(),
                });
            }
        }

        Err(ClientError::Transport(
            "stream ended before completion".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Mode, StreamChunk};
    use async_trait::async_trait;
    use futures::stream;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    enum Step {
        Pending,
        Fail(ClientError),
        Complete(GenerationResponse),
        Stream(Vec<StreamChunk>),
    }

    struct ScriptedTransport {
        steps: Mutex<VecDeque<Step>>,
        calls: AtomicUsize,
    }

    impl ScriptedTransport {
        fn new(steps: Vec<Step>) -> Arc<Self> {
            Arc::new(Self {
                steps: Mutex::new(steps.into()),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(
            &self,
            _request: &GenerationRequest,
            _stream: bool,
        ) -> Result<Reply, ClientError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let step = self.steps.lock().pop_front().unwrap_or(Step::Pending);
            match step {
                Step::Pending => futures::future::pending().await,
                Step::Fail(e) => Err(e),
                Step::Complete(response) => Ok(Reply::Complete(response)),
                Step::Stream(chunks) => Ok(Reply::Stream(
                    stream::iter(chunks.into_iter().map(Ok)).boxed(),
                )),
            }
        }
    }

    fn response(content: &str) -> GenerationResponse {
        GenerationResponse {
            content: content.to_string(),
            confidence: 0.7,
            summary: content.to_string(),
            usage: None,
            model: DEFAULT_MODEL.to_string(),
            timestamp: Utc::now(),
        }
    }

    fn api_error(status: u16, code: ErrorCode) -> ClientError {
        ClientError::Api {
            status,
            code: Some(code),
            message: "rejected".to_string(),
            details: None,
        }
    }

    fn consumer(transport: Arc<ScriptedTransport>, options: ConsumerOptions) -> ResponseConsumer {
        ResponseConsumer::new(transport, options)
    }

    fn question() -> GenerationRequest {
        GenerationRequest::new(Mode::Chat, "Stream test")
    }

    #[tokio::test]
    async fn test_stream_accumulates_into_response() {
        let transport = ScriptedTransport::new(vec![Step::Stream(vec![
            StreamChunk::content("Hello"),
            StreamChunk::content(" world"),
            StreamChunk::finished("Hello world", 0.9),
        ])]);
        let consumer = consumer(
            transport,
            ConsumerOptions {
                enable_streaming: true,
                ..Default::default()
            },
        );

        let response = consumer.generate(question()).await.unwrap();
        assert_eq!(response.content, "Hello world");
        assert_eq!(response.confidence, 0.9);
        assert_eq!(response.summary, "Hello world");
        assert_eq!(response.model, DEFAULT_MODEL);

        let state = consumer.state();
        assert_eq!(state.phase, Phase::Done);
        assert!(!state.is_loading());
        assert_eq!(state.stream_content, "Hello world");
        assert_eq!(state.response, Some(response));
        assert!(state.error.is_none());
    }

    #[tokio::test]
    async fn test_stream_model_comes_from_request_settings() {
        let transport = ScriptedTransport::new(vec![Step::Stream(vec![
            StreamChunk::content("x"),
            StreamChunk::finished("x", 0.5),
        ])]);
        let consumer = consumer(transport, ConsumerOptions::default());

        let request = question().with_settings(crate::models::GenerationSettings {
            model: Some("custom-model".to_string()),
            ..Default::default()
        });
        let response = consumer.generate(request).await.unwrap();
        assert_eq!(response.model, "custom-model");
    }

    #[tokio::test]
    async fn test_error_chunk_is_terminal() {
        let transport = ScriptedTransport::new(vec![Step::Stream(vec![
            StreamChunk::content("partial"),
            StreamChunk::failed("AI streaming failed: upstream reset"),
            StreamChunk::content("never read"),
        ])]);
        let consumer = consumer(transport.clone(), ConsumerOptions::default());

        let err = consumer.generate(question()).await.unwrap_err();
        assert_eq!(err, ClientError::Stream("AI streaming failed: upstream reset".to_string()));
        assert_eq!(transport.calls(), 1);

        let state = consumer.state();
        assert_eq!(state.phase, Phase::Errored);
        assert_eq!(state.stream_content, "partial");
        assert!(state.response.is_none());
    }

    #[tokio::test]
    async fn test_complete_reply_fills_visible_state() {
        let transport = ScriptedTransport::new(vec![Step::Complete(response("One. Two."))]);
        let consumer = consumer(transport, ConsumerOptions::default());

        consumer.generate(question()).await.unwrap();
        let state = consumer.state();
        assert_eq!(state.phase, Phase::Done);
        assert_eq!(state.stream_content, "One. Two.");
        assert_eq!(state.summary, "One. Two.");
        assert_eq!(state.confidence, 0.7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_failures_retry_with_linear_backoff() {
        let transport = ScriptedTransport::new(vec![
            Step::Fail(ClientError::Transport("connection refused".to_string())),
            Step::Stream(vec![StreamChunk::content("cut off")]),
            Step::Complete(response("third time lucky")),
        ]);
        let consumer = consumer(transport.clone(), ConsumerOptions::default());

        let started = tokio::time::Instant::now();
        let response = consumer.generate(question()).await.unwrap();

        assert_eq!(response.content, "third time lucky");
        assert_eq!(transport.calls(), 3);
        assert!(started.elapsed() >= Duration::from_millis(1000 + 2000));
        assert_eq!(consumer.state().stream_content, "third time lucky");
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_are_bounded() {
        let transport = ScriptedTransport::new(
            (0..10)
                .map(|_| Step::Fail(api_error(500, ErrorCode::InternalError)))
                .collect(),
        );
        let consumer = consumer(transport.clone(), ConsumerOptions::default());

        let err = consumer.generate(question()).await.unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::InternalError));
        assert_eq!(transport.calls(), 4);
        assert_eq!(consumer.state().phase, Phase::Errored);
    }

    #[tokio::test(start_paused = true)]
    async fn test_caller_faults_are_not_retried() {
        for code in [ErrorCode::InvalidRequest, ErrorCode::RateLimitExceeded] {
            let transport = ScriptedTransport::new(vec![
                Step::Fail(api_error(400, code)),
                Step::Complete(response("should not be reached")),
            ]);
            let consumer = consumer(transport.clone(), ConsumerOptions::default());

            let started = tokio::time::Instant::now();
            let err = consumer.generate(question()).await.unwrap_err();
            assert_eq!(err.code(), Some(code));
            assert_eq!(transport.calls(), 1);
            assert_eq!(started.elapsed(), Duration::ZERO);
            assert_eq!(consumer.state().error.and_then(|e| e.code()), Some(code));
        }
    }

    #[tokio::test]
    async fn test_new_generate_supersedes_in_flight_request() {
        let transport = ScriptedTransport::new(vec![
            Step::Pending,
            Step::Complete(response("second answer")),
        ]);
        let consumer = Arc::new(consumer(transport.clone(), ConsumerOptions::default()));

        let mut rx = consumer.subscribe();
        let first = tokio::spawn({
            let consumer = Arc::clone(&consumer);
            async move { consumer.generate(question()).await }
        });
        rx.wait_for(|s| s.phase == Phase::Loading).await.unwrap();

        let second = consumer
            .generate(GenerationRequest::new(Mode::Chat, "replacement"))
            .await
            .unwrap();
        assert_eq!(second.content, "second answer");
        assert_eq!(first.await.unwrap(), Err(ClientError::Cancelled));
        assert_eq!(transport.calls(), 2);

        // the superseded request left the newer outcome untouched
        let state = consumer.state();
        assert_eq!(state.phase, Phase::Done);
        assert!(state.error.is_none());
        assert_eq!(state.stream_content, "second answer");
        assert_eq!(state.response, Some(second));
    }

    #[tokio::test]
    async fn test_cancel_while_loading_then_start_clean() {
        let transport = ScriptedTransport::new(vec![
            Step::Pending,
            Step::Complete(response("fresh")),
        ]);
        let consumer = Arc::new(consumer(transport, ConsumerOptions::default()));

        let mut rx = consumer.subscribe();
        let pending = tokio::spawn({
            let consumer = Arc::clone(&consumer);
            async move { consumer.generate(question()).await }
        });
        rx.wait_for(|s| s.phase == Phase::Loading).await.unwrap();

        consumer.cancel();
        let state = consumer.state();
        assert_eq!(state.phase, Phase::Errored);
        assert!(!state.is_loading());
        assert_eq!(state.error.as_ref().unwrap().to_string(), "Request cancelled");
        assert_eq!(pending.await.unwrap(), Err(ClientError::Cancelled));

        // cancelling again is harmless
        consumer.cancel();
        assert_eq!(consumer.state().error, Some(ClientError::Cancelled));

        let response = consumer.generate(question()).await.unwrap();
        assert_eq!(response.content, "fresh");
        let state = consumer.state();
        assert_eq!(state.phase, Phase::Done);
        assert!(state.error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_aborts_in_flight_request() {
        let transport = ScriptedTransport::new(vec![Step::Pending]);
        let consumer = consumer(
            transport,
            ConsumerOptions {
                timeout: Duration::from_secs(5),
                ..Default::default()
            },
        );

        let started = tokio::time::Instant::now();
        let err = consumer.generate(question()).await.unwrap_err();
        assert_eq!(err, ClientError::Timeout);
        assert_eq!(started.elapsed(), Duration::from_secs(5));

        let state = consumer.state();
        assert_eq!(state.phase, Phase::Errored);
        assert_eq!(state.error.unwrap().code(), Some(ErrorCode::Timeout));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_covers_backoff() {
        let transport = ScriptedTransport::new(
            (0..4)
                .map(|_| Step::Fail(ClientError::Transport("down".to_string())))
                .collect(),
        );
        let consumer = consumer(
            transport.clone(),
            ConsumerOptions {
                timeout: Duration::from_millis(2500),
                ..Default::default()
            },
        );

        // fails at 0ms and 1000ms, then the 2000ms backoff outlives the deadline
        let err = consumer.generate(question()).await.unwrap_err();
        assert_eq!(err, ClientError::Timeout);
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn test_reset_returns_to_idle() {
        let transport = ScriptedTransport::new(vec![Step::Pending]);
        let consumer = Arc::new(consumer(transport, ConsumerOptions::default()));

        let mut rx = consumer.subscribe();
        let pending = tokio::spawn({
            let consumer = Arc::clone(&consumer);
            async move { consumer.generate(question()).await }
        });
        rx.wait_for(|s| s.is_loading()).await.unwrap();

        consumer.reset();
        assert_eq!(consumer.state(), ConsumerState::default());
        assert_eq!(pending.await.unwrap(), Err(ClientError::Cancelled));
    }

    #[test]
    fn test_cancel_with_nothing_in_flight() {
        let consumer = consumer(ScriptedTransport::new(vec![]), ConsumerOptions::default());
        consumer.cancel();
        consumer.cancel();

        let state = consumer.state();
        assert_eq!(state.phase, Phase::Errored);
        assert_eq!(state.error, Some(ClientError::Cancelled));
    }

    #[test]
    fn test_retry_classification() {
        assert!(ClientError::Transport("reset".into()).is_retryable());
        assert!(api_error(500, ErrorCode::InternalError).is_retryable());
        assert!(
            ClientError::Api {
                status: 502,
                code: None,
                message: "HTTP 502".into(),
                details: None
            }
            .is_retryable()
        );
        assert!(!api_error(400, ErrorCode::InvalidJson).is_retryable());
        assert!(!api_error(400, ErrorCode::InvalidRequest).is_retryable());
        assert!(!api_error(429, ErrorCode::RateLimitExceeded).is_retryable());
        assert!(!api_error(405, ErrorCode::MethodNotAllowed).is_retryable());
        assert!(!ClientError::Stream("boom".into()).is_retryable());
        assert!(!ClientError::Timeout.is_retryable());
        assert!(!ClientError::Cancelled.is_retryable());
    }

    #[test]
    fn test_error_from_body_parses_known_codes() {
        let err = ClientError::from_body(
            429,
            ErrorBody {
                error: "Rate limit exceeded".to_string(),
                code: Some("RATE_LIMIT_EXCEEDED".to_string()),
                details: Some(serde_json::json!({ "limit": 10, "windowMs": 60000 })),
            },
        );
        assert_eq!(err.code(), Some(ErrorCode::RateLimitExceeded));
        assert_eq!(err.to_string(), "Rate limit exceeded");

        let unknown = ClientError::from_body(
            418,
            ErrorBody {
                error: "teapot".to_string(),
                code: Some("TEAPOT".to_string()),
                details: None,
            },
        );
        assert_eq!(unknown.code(), None);
    }
}
