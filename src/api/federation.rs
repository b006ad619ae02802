use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};

use super::{ApiError, ApiResult, ApiState};
use crate::federation::{CreateHubRequest, CreateTokenRequest, HubHeartbeat};

// ── Tokens ──────────────────────────────────────────────────────────────

pub(super) async fn create_token(
    State(state): State<ApiState>,
    Json(request): Json<CreateTokenRequest>,
) -> ApiResult<impl IntoResponse> {
    let created = state.hub.tokens().create_token(request).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

pub(super) async fn list_tokens(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.hub.tokens().list_tokens().await)
}

pub(super) async fn revoke_token(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let (token, disconnected) = state.hub.revoke_token(&id).await?;
    Ok(Json(serde_json::json!({
        "token": token,
        "disconnectedWorkers": disconnected,
    })))
}

pub(super) async fn token_registrations(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let tokens = state.hub.tokens();
    if tokens.get_token(&id).await.is_none() {
        return Err(ApiError::not_found(format!("Token {id} not found")));
    }
    Ok(Json(tokens.registrations_for_token(&id).await?))
}

// ── Hubs ────────────────────────────────────────────────────────────────

pub(super) async fn create_hub(
    State(state): State<ApiState>,
    Json(request): Json<CreateHubRequest>,
) -> ApiResult<impl IntoResponse> {
    let hub = state.hubs.create(request).await?;
    Ok((StatusCode::CREATED, Json(hub)))
}

pub(super) async fn list_hubs(State(state): State<ApiState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.hubs.list().await?))
}

pub(super) async fn delete_hub(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    state.hubs.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub(super) async fn hub_heartbeat(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(report): Json<HubHeartbeat>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.hubs.record_heartbeat(&id, report).await?))
}

pub(super) async fn hub_registrations(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    if state.hubs.get(&id).await?.is_none() {
        return Err(ApiError::not_found(format!("Hub {id} not found")));
    }
    Ok(Json(state.hub.tokens().registrations_for_hub(&id).await?))
}
