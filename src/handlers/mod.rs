mod generate;
mod health;
mod metrics;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub use generate::{generate_handler, method_not_allowed};
pub use health::health_handler;
pub use metrics::metrics_handler;

pub const GENERATE_PATH: &str = "/api/ai";

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(
            GENERATE_PATH,
            post(generate_handler).fallback(method_not_allowed),
        )
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
