use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use generation_gateway::config::{AskArgs, Cli, Command, ServeArgs};
use generation_gateway::consumer::{ClientError, ConsumerState, HttpTransport, ResponseConsumer};
use generation_gateway::proxy::GenerationService;
use generation_gateway::rate_limit::{AdmissionController, sweeper};
use generation_gateway::router;
use generation_gateway::state::AppState;
use generation_gateway::upstream::OpenRouterProvider;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("generation_gateway=debug".parse()?)
                .add_directive("info".parse()?),
        )
        .init();

    match Cli::parse().command {
        Command::Serve(args) => serve(args).await,
        Command::Ask(args) => ask(args).await,
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    if args.api_key.trim().is_empty() {
        bail!("OPENROUTER_API_KEY is empty");
    }

    let provider = OpenRouterProvider::new(args.openrouter_config())
        .context("failed to build upstream HTTP client")?;
    let service = GenerationService::new(Arc::new(provider), args.default_model.clone());

    let admission = Arc::new(AdmissionController::new(args.rate_limit, args.rate_window()));
    tokio::spawn(sweeper(Arc::clone(&admission), args.sweep_interval()));

    let state = Arc::new(AppState::new(
        service,
        admission,
        args.exposes_error_details(),
    ));
    let app = router(state);

    let addr = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    info!("Generation gateway running on http://{}", addr);
    info!("  Upstream: {}", args.upstream_url);
    info!("  Default model: {}", args.default_model);
    info!(
        "  Rate limit: {} requests per {} seconds",
        args.rate_limit, args.rate_window
    );
    info!("  Environment: {:?}", args.environment);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("server error")?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}

async fn ask(args: AskArgs) -> Result<()> {
    let transport = Arc::new(HttpTransport::new(args.endpoint.clone()));
    let consumer = ResponseConsumer::new(transport, args.consumer_options());

    let printer = tokio::spawn(print_partial(consumer.subscribe()));

    let outcome = tokio::select! {
        outcome = consumer.generate(args.request()) => outcome,
        _ = tokio::signal::ctrl_c() => {
            consumer.cancel();
            Err(ClientError::Cancelled)
        }
    };
    let _ = printer.await;
    println!();

    match outcome {
        Ok(response) => {
            println!("summary:    {}", response.summary);
            println!("confidence: {:.1}", response.confidence);
            println!("model:      {}", response.model);
            if let Some(usage) = response.usage {
                println!("tokens:     {}", usage.total_tokens);
            }
            Ok(())
        }
        Err(e) => match e.code() {
            Some(code) => bail!("{} [{}]", e, code),
            None => bail!("{}", e),
        },
    }
}

// Echo visible text as it grows; a retry restarts it on a new line
async fn print_partial(mut rx: watch::Receiver<ConsumerState>) {
    let mut shown = String::new();
    let mut stdout = std::io::stdout();

    while rx.changed().await.is_ok() {
        let (text, finished) = {
            let state = rx.borrow_and_update();
            (state.stream_content.clone(), state.is_terminal())
        };

        if !text.starts_with(shown.as_str()) {
            println!();
            shown.clear();
        }
        print!("{}", &text[shown.len()..]);
        let _ = stdout.flush();
        shown = text;

        if finished {
            break;
        }
    }
}
