use crate::binder::BindError;
use crate::server::GatewayState;
use crate::store::{BindingRecord, BindingStatus};
use axum::extract::{Path, Query};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json};
use serde::Deserialize;
use std::sync::Arc;

pub fn router() -> axum::Router {
    axum::Router::new()
        .route("/gateway/bind", post(post_bind))
        .route("/gateway/bindings", get(list_bindings))
        .route("/gateway/bindings/{id}/revoke", post(revoke_binding))
}

#[derive(Debug, Deserialize)]
struct BindRequest {
    action: String,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    channel_user_id: Option<String>,
    #[serde(default)]
    ttl_minutes: Option<i64>,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    tenant_id: Option<String>,
}

#[tracing::instrument(level = "debug", skip_all, fields(action = %request.action))]
async fn post_bind(
    Extension(state): Extension<Arc<GatewayState>>,
    Json(request): Json<BindRequest>,
) -> Response {
    let binder = state.gateway.binder();
    match request.action.as_str() {
        "initiate" => {
            let (Some(channel), Some(channel_user_id)) =
                (request.channel.as_deref(), request.channel_user_id.as_deref())
            else {
                return bad_request("initiate requires channel and channel_user_id");
            };
            let ttl = request
                .ttl_minutes
                .unwrap_or(state.challenge_ttl_minutes)
                .clamp(1, 120);
            match binder.create_challenge(channel, channel_user_id, ttl) {
                Ok(challenge) => Json(serde_json::json!({
                    "challenge_code": challenge.code,
                    "ttl_minutes": ttl,
                    "expires_at": challenge.expires_at,
                }))
                .into_response(),
                Err(error) => bind_failure(&error),
            }
        }
        "verify" => {
            let (Some(code), Some(user_id)) = (request.code.as_deref(), request.user_id.as_deref())
            else {
                return bad_request("verify requires code and user_id");
            };
            match binder.verify_challenge(code, user_id, request.tenant_id.as_deref()) {
                Ok(binding_id) => Json(serde_json::json!({
                    "success": true,
                    "binding_id": binding_id,
                }))
                .into_response(),
                Err(error) => bind_failure(&error),
            }
        }
        "provision" => {
            let (Some(channel), Some(channel_user_id), Some(user_id)) = (
                request.channel.as_deref(),
                request.channel_user_id.as_deref(),
                request.user_id.as_deref(),
            ) else {
                return bad_request("provision requires channel, channel_user_id and user_id");
            };
            match binder.provision_binding(
                channel,
                channel_user_id,
                user_id,
                request.tenant_id.as_deref(),
            ) {
                Ok(binding_id) => Json(serde_json::json!({
                    "success": true,
                    "binding_id": binding_id,
                }))
                .into_response(),
                Err(error) => bind_failure(&error),
            }
        }
        other => bad_request(&format!("unknown bind action: {other}")),
    }
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

#[tracing::instrument(level = "debug", skip_all)]
async fn list_bindings(
    Extension(state): Extension<Arc<GatewayState>>,
    Query(query): Query<ListQuery>,
) -> Response {
    let status = match query.status.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(raw) => match BindingStatus::parse(raw) {
            Some(status) => Some(status),
            None => return bad_request(&format!("unknown status filter: {raw}")),
        },
    };
    match state
        .gateway
        .binder()
        .list_bindings(query.channel.as_deref(), status)
    {
        Ok(bindings) => {
            let rows: Vec<serde_json::Value> = bindings.iter().map(binding_json).collect();
            Json(serde_json::json!({ "bindings": rows })).into_response()
        }
        Err(error) => {
            tracing::error!(%error, "binding listing failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "success": false, "error": "listing failed" })),
            )
                .into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
struct RevokeRequest {
    #[serde(default)]
    reason: String,
}

#[tracing::instrument(level = "debug", skip_all, fields(binding_id = %id))]
async fn revoke_binding(
    Extension(state): Extension<Arc<GatewayState>>,
    Path(id): Path<String>,
    Json(request): Json<RevokeRequest>,
) -> Response {
    match state.gateway.binder().revoke_binding(&id, &request.reason) {
        Ok(revoked) => Json(serde_json::json!({ "success": revoked })).into_response(),
        Err(error) => bind_failure(&error),
    }
}

fn binding_json(record: &BindingRecord) -> serde_json::Value {
    serde_json::json!({
        "id": record.id,
        "channel": record.channel,
        "channel_user_id": record.channel_user_id,
        "user_id": record.user_id,
        "tenant_id": record.tenant_id,
        "status": record.status.as_str(),
        "created_at": record.created_at,
        "bound_at": record.bound_at,
        "revoked_at": record.revoked_at,
        "revoke_reason": record.revoke_reason,
    })
}

fn bad_request(message: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({ "success": false, "error": message })),
    )
        .into_response()
}

fn bind_failure(error: &BindError) -> Response {
    tracing::warn!(%error, "bind operation failed");
    Json(serde_json::json!({
        "success": false,
        "error": error.to_string(),
    }))
    .into_response()
}
