use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;

use super::{ApiError, ApiResult, ApiState};
use crate::dispatcher::{TaskRequest, TaskStatus};

#[derive(Debug, Deserialize)]
pub(super) struct ListQuery {
    status: Option<String>,
}

pub(super) async fn submit(
    State(state): State<ApiState>,
    Json(request): Json<TaskRequest>,
) -> ApiResult<impl IntoResponse> {
    let task = state.dispatcher.submit(request).await?;
    Ok((StatusCode::CREATED, Json(task)))
}

pub(super) async fn list(
    State(state): State<ApiState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<impl IntoResponse> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<TaskStatus>)
        .transpose()
        .map_err(ApiError::bad_request)?;
    Ok(Json(state.dispatcher.list(status).await?))
}

pub(super) async fn stats(State(state): State<ApiState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.dispatcher.stats().await?))
}

pub(super) async fn get(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let task = state
        .dispatcher
        .get(&id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("Task {id} not found")))?;
    Ok(Json(task))
}

pub(super) async fn retry(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.dispatcher.retry(&id).await?))
}

pub(super) async fn cancel(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.dispatcher.cancel(&id).await?))
}
