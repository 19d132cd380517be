//! Upstream text-generation providers.
//!
//! The gateway talks to one provider through the [`Provider`] trait; the
//! production implementation speaks the OpenAI-compatible chat-completions
//! protocol that OpenRouter exposes.

use std::pin::Pin;
use std::time::Duration;

use async_stream::stream;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::time::timeout;
use tracing::debug;

use crate::models::Usage;
use crate::sse::{SseDecoder, SseError};

pub const DEFAULT_MODEL: &str = "deepseek/deepseek-chat";
pub const DEFAULT_TEMPERATURE: f32 = 0.7;
pub const DEFAULT_MAX_TOKENS: u32 = 1000;

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionParams {
    pub model: String,
    pub prompt: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub content: String,
    pub model: String,
    pub usage: Option<Usage>,
}

pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String, UpstreamError>> + Send>>;

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("{0}")]
    Http(#[from] reqwest::Error),
    #[error("upstream returned {status}: {message}")]
    Status { status: u16, message: String },
    #[error("{0}")]
    Provider(String),
    #[error("malformed upstream payload: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("malformed upstream stream: {0}")]
    Sse(#[from] SseError),
    #[error("upstream did not answer within {0:?}")]
    Timeout(Duration),
}

#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    /// Single completion.
    async fn complete(&self, params: CompletionParams) -> Result<Completion, UpstreamError>;

    /// Incremental text fragments, in the order the provider produced them.
    async fn complete_stream(
        &self,
        params: CompletionParams,
    ) -> Result<FragmentStream, UpstreamError>;
}

#[derive(Debug, Clone)]
pub struct OpenRouterConfig {
    pub base_url: String,
    pub api_key: String,
    // sent as HTTP-Referer / X-Title for attribution
    pub app_url: String,
    pub app_name: String,
    pub connect_timeout: Duration,
    // whole non-streaming call, body included
    pub request_timeout: Duration,
}

pub struct OpenRouterProvider {
    client: Client,
    config: OpenRouterConfig,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 1],
    temperature: f32,
    max_tokens: u32,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Deserialize)]
struct WireMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct WireChoice {
    #[serde(default)]
    message: Option<WireMessage>,
    #[serde(default)]
    delta: Option<WireMessage>,
}

#[derive(Deserialize)]
struct WireUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

#[derive(Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<WireChoice>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct StreamFrame {
    #[serde(default)]
    choices: Vec<WireChoice>,
    #[serde(default)]
    error: Option<Value>,
}

impl OpenRouterProvider {
    pub fn new(config: OpenRouterConfig) -> Result<Self, UpstreamError> {
        // no overall timeout: streams stay open as long as the model writes
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()?;

        Ok(Self { client, config })
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        )
    }

    async fn send(
        &self,
        params: &CompletionParams,
        stream: bool,
    ) -> Result<reqwest::Response, UpstreamError> {
        let body = ChatCompletionRequest {
            model: &params.model,
            messages: [ChatMessage {
                role: "user",
                content: &params.prompt,
            }],
            temperature: params.temperature,
            max_tokens: params.max_tokens,
            stream,
        };

        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.config.api_key)
            .header("HTTP-Referer", &self.config.app_url)
            .header("X-Title", &self.config.app_name)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_else(|e| {
                debug!("Failed to read upstream error body: {}", e);
                String::new()
            });
            return Err(UpstreamError::Status {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl Provider for OpenRouterProvider {
    fn name(&self) -> &str {
        "openrouter"
    }

    async fn complete(&self, params: CompletionParams) -> Result<Completion, UpstreamError> {
        let exchange = async {
            let body: ChatCompletion = self.send(&params, false).await?.json().await?;
            Ok::<_, UpstreamError>(body)
        };
        let body = timeout(self.config.request_timeout, exchange)
            .await
            .map_err(|_| UpstreamError::Timeout(self.config.request_timeout))??;

        let content = body
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message)
            .and_then(|m| m.content)
            .unwrap_or_default();

        Ok(Completion {
            content,
            model: body.model.unwrap_or(params.model),
            usage: body.usage.map(|u| Usage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
            }),
        })
    }

    async fn complete_stream(
        &self,
        params: CompletionParams,
    ) -> Result<FragmentStream, UpstreamError> {
        let mut reads = Box::pin(self.send(&params, true).await?.bytes_stream());
        debug!(model = %params.model, "Upstream stream opened");

        let fragments = stream! {
            let mut decoder = SseDecoder::new();
            loop {
                let (payloads, finished) = match reads.next().await {
                    Some(Ok(read)) => match decoder.push(&read) {
                        Ok(payloads) => (payloads, false),
                        Err(e) => {
                            yield Err(UpstreamError::Sse(e));
                            return;
                        }
                    },
                    Some(Err(e)) => {
                        yield Err(UpstreamError::Http(e));
                        return;
                    }
                    None => (decoder.finish().into_iter().collect(), true),
                };

                for payload in payloads {
                    if payload == "[DONE]" {
                        return;
                    }
                    match fragment_from_frame(&payload) {
                        Ok(Some(text)) => yield Ok(text),
                        Ok(None) => {}
                        Err(e) => {
                            yield Err(e);
                            return;
                        }
                    }
                }

                if finished {
                    return;
                }
            }
        };

        Ok(Box::pin(fragments))
    }
}

// Text carried by one upstream stream frame, if any
fn fragment_from_frame(payload: &str) -> Result<Option<String>, UpstreamError> {
    let frame: StreamFrame = serde_json::from_str(payload)?;

    if let Some(error) = frame.error {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        return Err(UpstreamError::Provider(message));
    }

    Ok(frame
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta)
        .and_then(|d| d.content)
        .filter(|text| !text.is_empty()))
}
