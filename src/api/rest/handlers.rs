//! Handlers for the client protocol (submit/poll/cancel a query) and the
//! task protocol (create/poll/abort a task, page through its output
//! buffers). Each returns `ApiResult<T>` so `?` on an `EngineError` turns
//! straight into the right HTTP status via [`ApiErrorResponse`].
//!
//! Result-page streaming is exercised directly against the task protocol;
//! which stage's output buffer ultimately feeds a client is a scheduling
//! decision this crate leaves to the external planner/scheduler, so the
//! client-protocol poll surfaces query lifecycle state only.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;

use crate::engine::query::QueryState;
use crate::engine::task::{TaskId, TaskState};

use super::server::AppState;
use super::types::*;

/// `POST /v1/query`.
#[utoipa::path(
    post,
    path = "/v1/query",
    request_body = QueryRequest,
    responses((status = 200, description = "Query accepted", body = QueryResponse), (status = 400, body = ApiError))
)]
pub async fn submit_query(State(state): State<Arc<AppState>>, Json(request): Json<QueryRequest>) -> ApiResult<Json<QueryResponse>> {
    let session = crate::session::Session::new(state.session_properties.clone());
    for (name, value) in &request.session {
        session.set(name, value)?;
    }

    let query = state.query_manager.submit(request.sql)?;
    Ok(Json(QueryResponse {
        query_id: query.id.to_string(),
        state: query_state_label(query.state()).to_string(),
        columns: None,
        data: None,
        next_uri: Some(format!("/v1/query/{}/0", query.id)),
        error: None,
    }))
}

/// `GET /v1/query/{queryId}/{token}`: polling is a no-op beyond touching the
/// client-idle clock; `token` exists for protocol-shape parity with the
/// task-results endpoint and is otherwise unused since there's no
/// per-response pagination cursor at the query level.
#[utoipa::path(
    get,
    path = "/v1/query/{queryId}/{token}",
    responses((status = 200, body = QueryResponse), (status = 404, body = ApiError))
)]
pub async fn poll_query(State(state): State<Arc<AppState>>, Path((query_id, _token)): Path<(String, u64)>) -> ApiResult<Json<QueryResponse>> {
    let query = state.query_manager.get(&crate::engine::task::QueryId(query_id))?;
    query.touch();
    let next_uri = if query.state().is_terminal() { None } else { Some(format!("/v1/query/{}/0", query.id)) };
    Ok(Json(QueryResponse {
        query_id: query.id.to_string(),
        state: query_state_label(query.state()).to_string(),
        columns: None,
        data: None,
        next_uri,
        error: if query.state() == QueryState::Failed { query.error().map(|message| ApiError { error_kind: "Failed".into(), error_code: 0, message }) } else { None },
    }))
}

/// `DELETE /v1/query/{queryId}`.
#[utoipa::path(delete, path = "/v1/query/{queryId}", responses((status = 204), (status = 404, body = ApiError)))]
pub async fn cancel_query(State(state): State<Arc<AppState>>, Path(query_id): Path<String>) -> ApiResult<StatusCode> {
    let query = state.query_manager.get(&crate::engine::task::QueryId(query_id))?;
    query.cancel();
    Ok(StatusCode::NO_CONTENT)
}

/// `PUT /v1/task/{taskId}`.
#[utoipa::path(
    put,
    path = "/v1/task/{taskId}",
    request_body = TaskUpdateRequest,
    responses((status = 200, body = TaskInfoResponse))
)]
pub async fn put_task(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
    Json(request): Json<TaskUpdateRequest>,
) -> ApiResult<Json<TaskInfoResponse>> {
    let source_updates = request.sources.into_iter().map(|s| (s.plan_node_id, Vec::new(), s.no_more_splits)).collect();
    let task = state.task_manager.update_task(TaskId(task_id), request.fragment, source_updates, request.output_buffers);
    task.try_finish();
    Ok(Json(TaskInfoResponse { task_id: task.id.to_string(), state: task_state_label(task.state()).to_string(), error: task.error() }))
}

#[derive(serde::Deserialize)]
pub struct TaskPollQuery {
    #[serde(rename = "currentState")]
    pub current_state: Option<String>,
    #[serde(rename = "maxWaitMillis")]
    pub max_wait_millis: Option<u64>,
}

fn parse_task_state(label: &str) -> Option<TaskState> {
    match label {
        "RUNNING" => Some(TaskState::Running),
        "FINISHED" => Some(TaskState::Finished),
        "CANCELED" => Some(TaskState::Canceled),
        "ABORTED" => Some(TaskState::Aborted),
        "FAILED" => Some(TaskState::Failed),
        _ => None,
    }
}

/// `GET /v1/task/{taskId}`: long-polls up to `maxWaitMillis` (default 1s) if
/// `currentState` names the client's last-observed state.
#[utoipa::path(get, path = "/v1/task/{taskId}", responses((status = 200, body = TaskInfoResponse), (status = 404, body = ApiError)))]
pub async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
    Query(params): Query<TaskPollQuery>,
) -> ApiResult<Json<TaskInfoResponse>> {
    let task = state.task_manager.get_task(&TaskId(task_id))?;
    if let Some(current_state) = params.current_state.as_deref().and_then(parse_task_state) {
        let wait = Duration::from_millis(params.max_wait_millis.unwrap_or(1000));
        task.wait_for_state_change(current_state, wait).await;
    }
    Ok(Json(TaskInfoResponse { task_id: task.id.to_string(), state: task_state_label(task.state()).to_string(), error: task.error() }))
}

/// `DELETE /v1/task/{taskId}`.
#[utoipa::path(delete, path = "/v1/task/{taskId}", responses((status = 204), (status = 404, body = ApiError)))]
pub async fn abort_task(State(state): State<Arc<AppState>>, Path(task_id): Path<String>) -> ApiResult<StatusCode> {
    state.task_manager.abort_task(&TaskId(task_id))?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(serde::Deserialize)]
pub struct ResultsQuery {
    #[serde(rename = "maxBytes")]
    pub max_bytes: Option<usize>,
}

/// `GET /v1/task/{taskId}/results/{bufferId}/{token}`.
#[utoipa::path(
    get,
    path = "/v1/task/{taskId}/results/{bufferId}/{token}",
    responses((status = 200, body = TaskResultsResponse), (status = 404, body = ApiError))
)]
pub async fn get_task_results(
    State(state): State<Arc<AppState>>,
    Path((task_id, buffer_id, token)): Path<(String, String, u64)>,
    Query(params): Query<ResultsQuery>,
) -> ApiResult<Json<TaskResultsResponse>> {
    let max_bytes = params.max_bytes.unwrap_or(32 * 1024 * 1024);
    let (pages, next_token) = state.task_manager.get_task_results(&TaskId(task_id), &buffer_id, token, max_bytes)?;
    Ok(Json(TaskResultsResponse { next_token, pages: pages.iter().map(|p| PageEnvelope::from(p.as_ref())).collect() }))
}

/// `DELETE /v1/task/{taskId}/results/{bufferId}`.
#[utoipa::path(delete, path = "/v1/task/{taskId}/results/{bufferId}", responses((status = 204), (status = 404, body = ApiError)))]
pub async fn abort_task_results(State(state): State<Arc<AppState>>, Path((task_id, buffer_id)): Path<(String, String)>) -> ApiResult<StatusCode> {
    state.task_manager.abort_task_results(&TaskId(task_id), &buffer_id)?;
    Ok(StatusCode::NO_CONTENT)
}
