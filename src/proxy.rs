//! Request → upstream → reply, in whole-response or streamed form.

use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::metrics::UPSTREAM_ERRORS;
use crate::models::{GenerationRequest, GenerationResponse, Mode, StreamChunk};
use crate::prompt::compose_prompt;
use crate::scoring::{confidence, summarize};
use crate::upstream::{
    CompletionParams, DEFAULT_MAX_TOKENS, DEFAULT_TEMPERATURE, Provider, UpstreamError,
};

pub struct GenerationService {
    provider: Arc<dyn Provider>,
    default_model: String,
}

impl GenerationService {
    pub fn new(provider: Arc<dyn Provider>, default_model: impl Into<String>) -> Self {
        Self {
            provider,
            default_model: default_model.into(),
        }
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    // Sampling parameters: request settings first, then defaults
    pub fn params(&self, request: &GenerationRequest) -> CompletionParams {
        let settings = request.settings.clone().unwrap_or_default();
        CompletionParams {
            model: settings.model.unwrap_or_else(|| self.default_model.clone()),
            prompt: compose_prompt(request),
            temperature: settings.temperature.unwrap_or(DEFAULT_TEMPERATURE),
            max_tokens: settings.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        }
    }

    pub async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationResponse, UpstreamError> {
        let completion = self
            .provider
            .complete(self.params(request))
            .await
            .inspect_err(|e| {
                UPSTREAM_ERRORS.inc();
                error!("Upstream completion failed: {}", e);
            })?;

        Ok(GenerationResponse {
            summary: summarize(&completion.content),
            confidence: confidence(&completion.content, request.mode),
            content: completion.content,
            usage: completion.usage,
            model: completion.model,
            timestamp: Utc::now(),
        })
    }

    /// Start a streamed generation.
    ///
    /// The relay runs on its own task and hands chunks over a channel that
    /// holds at most one, so each upstream fragment is written out before the
    /// next one is read. The receiver always ends with exactly one
    /// `done = true` chunk unless it is dropped first.
    pub fn stream(&self, request: &GenerationRequest) -> mpsc::Receiver<StreamChunk> {
        let (tx, rx) = mpsc::channel(1);
        let provider = Arc::clone(&self.provider);
        let params = self.params(request);
        let mode = request.mode;

        tokio::spawn(relay(provider, params, mode, tx));
        rx
    }
}

async fn relay(
    provider: Arc<dyn Provider>,
    params: CompletionParams,
    mode: Mode,
    tx: mpsc::Sender<StreamChunk>,
) {
    debug!(model = %params.model, "Stream relay started");

    let mut fragments = match provider.complete_stream(params).await {
        Ok(fragments) => fragments,
        Err(e) => {
            fail(&tx, e).await;
            return;
        }
    };

    let mut full = String::new();
    while let Some(fragment) = fragments.next().await {
        match fragment {
            Ok(text) if text.is_empty() => {}
            Ok(text) => {
                full.push_str(&text);
                if tx.send(StreamChunk::content(text)).await.is_err() {
                    debug!("Client went away, stopping relay");
                    return;
                }
            }
            Err(e) => {
                fail(&tx, e).await;
                return;
            }
        }
    }

    let terminal = StreamChunk::finished(summarize(&full), confidence(&full, mode));
    let _ = tx.send(terminal).await;
    debug!(chars = full.len(), "Stream relay finished");
}

async fn fail(tx: &mpsc::Sender<StreamChunk>, e: UpstreamError) {
    UPSTREAM_ERRORS.inc();
    error!("Upstream stream failed: {}", e);
    let _ = tx
        .send(StreamChunk::failed(format!("AI streaming failed: {e}")))
        .await;
}
