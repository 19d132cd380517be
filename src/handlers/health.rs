use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::response::IntoResponse;

use crate::state::AppState;

pub async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "provider": state.service.provider_name(),
        "trackedClients": state.admission.tracked_keys(),
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}
