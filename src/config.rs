use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::consumer::ConsumerOptions;
use crate::models::{GenerationRequest, GenerationSettings, Mode};
use crate::upstream::{DEFAULT_MODEL, OpenRouterConfig};

// CLI argument structure
#[derive(Parser, Debug, Clone)]
#[command(name = "generation-gateway")]
#[command(about = "Rate-limited streaming proxy for hosted text generation")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run the generation proxy
    Serve(ServeArgs),
    /// Send one question to a running proxy and print the answer
    Ask(AskArgs),
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    Development,
    #[default]
    Production,
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    // Port to run the server on
    #[arg(short, long, env = "PORT", default_value_t = 8080)]
    pub port: u16,

    // OpenAI-compatible base URL, without the /chat/completions suffix
    #[arg(long, env = "OPENROUTER_BASE_URL", default_value = "https://openrouter.ai/api/v1")]
    pub upstream_url: String,

    #[arg(long, env = "OPENROUTER_API_KEY", hide_env_values = true)]
    pub api_key: String,

    #[arg(long, env = "DEFAULT_MODEL", default_value = DEFAULT_MODEL)]
    pub default_model: String,

    // Attribution headers sent upstream
    #[arg(long, env = "APP_URL", default_value = "http://localhost:3000")]
    pub app_url: String,

    #[arg(long, env = "APP_NAME", default_value = "AI Service App")]
    pub app_name: String,

    // Rate limit max requests per window
    #[arg(long, env = "RATE_LIMIT", default_value_t = 10)]
    pub rate_limit: u32,

    // Rate limit window in seconds
    #[arg(long, env = "RATE_WINDOW", default_value_t = 60)]
    pub rate_window: u64,

    // Expired record sweep interval in seconds
    #[arg(long, env = "RATE_SWEEP_INTERVAL", default_value_t = 30)]
    pub sweep_interval: u64,

    // Upstream connect timeout in seconds
    #[arg(long, env = "UPSTREAM_CONNECT_TIMEOUT", default_value_t = 10)]
    pub connect_timeout: u64,

    // Whole non-streaming upstream call, in seconds
    #[arg(long, env = "UPSTREAM_REQUEST_TIMEOUT", default_value_t = 60)]
    pub request_timeout: u64,

    #[arg(long, env = "APP_ENV", value_enum, default_value_t = Environment::Production)]
    pub environment: Environment,
}

impl ServeArgs {
    pub fn openrouter_config(&self) -> OpenRouterConfig {
        OpenRouterConfig {
            base_url: self.upstream_url.clone(),
            api_key: self.api_key.clone(),
            app_url: self.app_url.clone(),
            app_name: self.app_name.clone(),
            connect_timeout: Duration::from_secs(self.connect_timeout),
            request_timeout: Duration::from_secs(self.request_timeout),
        }
    }

    pub fn rate_window(&self) -> Duration {
        Duration::from_secs(self.rate_window)
    }

    pub fn sweep_interval(&self) -> Duration {
        // tokio's interval panics on zero
        Duration::from_secs(self.sweep_interval.max(1))
    }

    pub fn exposes_error_details(&self) -> bool {
        self.environment == Environment::Development
    }
}

#[derive(Args, Debug, Clone)]
pub struct AskArgs {
    /// The question to send
    pub question: String,

    #[arg(long, default_value = "http://localhost:8080/api/ai")]
    pub endpoint: String,

    #[arg(short, long, default_value_t = Mode::Chat)]
    pub mode: Mode,

    #[arg(short, long)]
    pub context: Option<String>,

    // Ask for a text/event-stream reply
    #[arg(short, long)]
    pub stream: bool,

    #[arg(long, default_value_t = 3)]
    pub retries: u32,

    #[arg(long, default_value_t = 1000)]
    pub retry_delay_ms: u64,

    #[arg(long, default_value_t = 30_000)]
    pub timeout_ms: u64,

    #[arg(long)]
    pub temperature: Option<f32>,

    #[arg(long)]
    pub max_tokens: Option<u32>,

    #[arg(long)]
    pub model: Option<String>,
}

impl AskArgs {
    pub fn consumer_options(&self) -> ConsumerOptions {
        ConsumerOptions {
            enable_streaming: self.stream,
            retry_count: self.retries,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            timeout: Duration::from_millis(self.timeout_ms),
            ..Default::default()
        }
    }

    pub fn request(&self) -> GenerationRequest {
        let mut request = GenerationRequest::new(self.mode, self.question.clone());
        if let Some(context) = self.context.as_deref().filter(|c| !c.is_empty()) {
            request = request.with_context(context);
        }

        let settings = GenerationSettings {
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            model: self.model.clone(),
        };
        if settings != GenerationSettings::default() {
            request = request.with_settings(settings);
        }
        request
    }
}
