use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};

use super::{ApiResult, ApiState};
use crate::hub::TerminationDecision;
use crate::process::SpawnConfig;

/// Connected workers, local and remote.
pub(super) async fn list(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.hub.snapshot().await)
}

pub(super) async fn list_spawned(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.processes.list().await)
}

pub(super) async fn available(State(state): State<ApiState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "available": state.processes.can_spawn_workers().await,
        "active": state.processes.active_count().await,
    }))
}

pub(super) async fn spawn(
    State(state): State<ApiState>,
    Json(request): Json<SpawnConfig>,
) -> ApiResult<impl IntoResponse> {
    let process = state.processes.spawn(request).await?;
    Ok((StatusCode::CREATED, Json(process)))
}

pub(super) async fn terminate(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let decision = match state.processes.terminate(&id).await? {
        TerminationDecision::Immediate => "stopping",
        TerminationDecision::Deferred => "deferred",
        TerminationDecision::AlreadyTerminating => "already_stopping",
    };
    Ok(Json(serde_json::json!({ "id": id, "termination": decision })))
}
