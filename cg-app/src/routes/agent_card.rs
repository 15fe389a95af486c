use crate::server::GatewayState;
use axum::routing::get;
use axum::{Extension, Json};
use std::sync::Arc;

pub fn router() -> axum::Router {
    axum::Router::new().route("/.well-known/agent-card", get(get_agent_card))
}

/// Capability discovery: gateway identity plus the info block for each
/// active channel adapter.
#[tracing::instrument(level = "debug", skip_all)]
async fn get_agent_card(Extension(state): Extension<Arc<GatewayState>>) -> Json<serde_json::Value> {
    let mut channels: Vec<serde_json::Value> = state
        .gateway
        .adapters()
        .values()
        .map(|adapter| {
            serde_json::json!({
                "name": adapter.channel_name(),
                "webhook_path": adapter.webhook_path(),
                "max_classification": adapter.max_classification(),
            })
        })
        .collect();
    channels.sort_by(|left, right| {
        left["name"]
            .as_str()
            .unwrap_or_default()
            .cmp(right["name"].as_str().unwrap_or_default())
    });

    Json(serde_json::json!({
        "name": state.instance_name,
        "kind": "remote-command-gateway",
        "version": env!("CARGO_PKG_VERSION"),
        "environment_mode": state.environment_mode,
        "channels": channels,
    }))
}

#[cfg(test)]
mod tests {
    use crate::routes::test_support;
    use axum::Extension;
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode};
    use tower::util::ServiceExt;

    #[tokio::test]
    async fn agent_card_lists_adapter_info_blocks() {
        let router = super::router().layer(Extension(test_support::state()));
        let response = router
            .oneshot(
                Request::builder()
                    .uri("/.well-known/agent-card")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        let json: serde_json::Value = serde_json::from_slice(&body).expect("json");
        assert_eq!(json["kind"], "remote-command-gateway");
        let channels = json["channels"].as_array().expect("channels");
        assert_eq!(channels.len(), 1);
        assert_eq!(channels[0]["name"], "internal");
        assert_eq!(channels[0]["webhook_path"], "/internal-webhook");
        assert_eq!(channels[0]["max_classification"], "restricted");
    }
}
