use async_stream::stream;
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use reqwest::Client;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use tracing::{debug, warn};

use super::ClientError;
use crate::models::{ErrorBody, GenerationRequest, GenerationResponse, StreamChunk};
use crate::sse::{EVENT_STREAM, SseDecoder};

pub type ChunkStream = BoxStream<'static, Result<StreamChunk, ClientError>>;

pub enum Reply {
    Complete(GenerationResponse),
    Stream(ChunkStream),
}

/// One round trip to the generation endpoint.
///
/// Dropping the returned future (or the chunk stream) aborts the exchange.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &GenerationRequest, stream: bool) -> Result<Reply, ClientError>;
}

pub struct HttpTransport {
    client: Client,
    endpoint: String,
}

impl HttpTransport {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self::with_client(Client::new(), endpoint)
    }

    pub fn with_client(client: Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: &GenerationRequest, stream: bool) -> Result<Reply, ClientError> {
        let mut builder = self.client.post(&self.endpoint).json(request);
        if stream {
            builder = builder.header(ACCEPT, EVENT_STREAM);
        }

        let response = builder.send().await.map_err(transport_error)?;
        let status = response.status();

        if !status.is_success() {
            let text = response.text().await.unwrap_or_else(|e| {
                debug!("Failed to read error body: {}", e);
                String::new()
            });
            return Err(match serde_json::from_str::<ErrorBody>(&text) {
                Ok(body) => ClientError::from_body(status.as_u16(), body),
                Err(_) => ClientError::Api {
                    status: status.as_u16(),
                    code: None,
                    message: format!("HTTP {status}"),
                    details: None,
                },
            });
        }

        let is_event_stream = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.contains(EVENT_STREAM));

        if stream && is_event_stream {
            return Ok(Reply::Stream(decode_chunks(response)));
        }

        let body = response
            .json::<GenerationResponse>()
            .await
            .map_err(transport_error)?;
        Ok(Reply::Complete(body))
    }
}

fn transport_error(e: reqwest::Error) -> ClientError {
    ClientError::Transport(e.to_string())
}

fn decode_chunks(response: reqwest::Response) -> ChunkStream {
    let mut reads = Box::pin(response.bytes_stream());

    let chunks = stream! {
        let mut decoder = SseDecoder::new();
        loop {
            let (payloads, finished) = match reads.next().await {
                Some(Ok(read)) => match decoder.push(&read) {
                    Ok(payloads) => (payloads, false),
                    Err(e) => {
                        yield Err(ClientError::Transport(e.to_string()));
                        return;
                    }
                },
                Some(Err(e)) => {
                    yield Err(transport_error(e));
                    return;
                }
                None => (decoder.finish().into_iter().collect(), true),
            };

            for payload in payloads {
                match serde_json::from_str::<StreamChunk>(&payload) {
                    Ok(chunk) => yield Ok(chunk),
                    Err(e) => warn!("Skipping unparseable stream chunk: {}", e),
                }
            }

            if finished {
                return;
            }
        }
    };
    chunks.boxed()
}
