use crate::server::GatewayState;
use axum::routing::get;
use axum::{Extension, Json};
use chrono::Utc;
use std::sync::Arc;

pub fn router() -> axum::Router {
    axum::Router::new().route("/health", get(get_health))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn get_health(Extension(state): Extension<Arc<GatewayState>>) -> Json<serde_json::Value> {
    let mut channels: Vec<String> = state.gateway.adapters().keys().cloned().collect();
    channels.sort();

    Json(serde_json::json!({
        "status": "ok",
        "instance": state.instance_name,
        "environment_mode": state.environment_mode,
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "channels": channels,
        "pending_challenges": state.gateway.binder().pending_challenges(),
        "checked_at": Utc::now(),
    }))
}
