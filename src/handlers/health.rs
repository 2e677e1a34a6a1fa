//! Liveness and readiness probes

use axum::{extract::State, http::StatusCode, response::Json};
use serde_json::json;
use std::sync::Arc;
use tracing::error;

use super::AppState;

pub async fn healthz_handler() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

/// Ready once the registry answers. A registry storage failure makes the
/// process not-ready rather than crashing it.
pub async fn readyz_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    match state.registry.list_all_endpoints() {
        Ok(endpoints) => Ok(Json(json!({
            "status": "ready",
            "llms": endpoints.len(),
        }))),
        Err(e) => {
            error!("Readiness check failed: {}", e);
            Err(StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}
