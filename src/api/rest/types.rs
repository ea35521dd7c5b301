//! Request/response DTOs for the client and task protocols, and the
//! `ApiError` wire envelope every failed request returns. Every response
//! struct derives `ToSchema` for the OpenAPI document and serializes its
//! fields as camelCase. `ApiError` carries the engine's own `ErrorKind` as
//! a stable machine-readable code, so the wire code and the internal
//! taxonomy never drift apart.

use std::collections::HashMap;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::engine::exchange::Page;
use crate::engine::query::QueryState;
use crate::engine::task::TaskState;
use crate::engine::types::Value;
use crate::error::{EngineError, ErrorCategory};

/// `POST /v1/query` request body.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    pub sql: String,
    #[serde(default)]
    pub session: HashMap<String, String>,
}

/// `POST /v1/query` / `GET /v1/query/{queryId}/{token}` response body:
/// columns and data are present once available, and `nextUri` is set until
/// there is nothing left to poll for.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct QueryResponse {
    pub query_id: String,
    pub state: String,
    pub columns: Option<Vec<String>>,
    pub data: Option<Vec<Vec<serde_json::Value>>>,
    pub next_uri: Option<String>,
    pub error: Option<ApiError>,
}

pub fn value_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Boolean(b) => serde_json::Value::Bool(*b),
        Value::Int64(i) => serde_json::Value::Number((*i).into()),
        Value::Float64(f) => serde_json::Number::from_f64(*f).map(serde_json::Value::Number).unwrap_or(serde_json::Value::Null),
        Value::Slice(bytes) => serde_json::Value::String(String::from_utf8_lossy(bytes).into_owned()),
        Value::Array(values) => serde_json::Value::Array(values.iter().map(value_to_json).collect()),
        Value::Map(entries) => serde_json::Value::Array(
            entries.iter().map(|(k, v)| serde_json::json!({"key": value_to_json(k), "value": value_to_json(v)})).collect(),
        ),
        Value::Row(fields) => serde_json::Value::Array(fields.iter().map(value_to_json).collect()),
    }
}

pub fn query_state_label(state: QueryState) -> &'static str {
    match state {
        QueryState::Queued => "QUEUED",
        QueryState::Planning => "PLANNING",
        QueryState::Starting => "STARTING",
        QueryState::Running => "RUNNING",
        QueryState::Finished => "FINISHED",
        QueryState::Failed => "FAILED",
        QueryState::Canceled => "CANCELED",
    }
}

/// `PUT /v1/task/{taskId}` request body.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TaskUpdateRequest {
    pub fragment: String,
    #[serde(default)]
    pub sources: Vec<SourceUpdate>,
    #[serde(default)]
    pub output_buffers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SourceUpdate {
    pub plan_node_id: String,
    pub no_more_splits: bool,
}

/// `GET`/`PUT /v1/task/{taskId}` response body.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TaskInfoResponse {
    pub task_id: String,
    pub state: String,
    pub error: Option<String>,
}

pub fn task_state_label(state: TaskState) -> &'static str {
    match state {
        TaskState::Running => "RUNNING",
        TaskState::Finished => "FINISHED",
        TaskState::Canceled => "CANCELED",
        TaskState::Aborted => "ABORTED",
        TaskState::Failed => "FAILED",
    }
}

/// `GET /v1/task/{taskId}/results/{bufferId}/{token}` response body: pages
/// are wire-encoded through each block's own `encode()`, concatenated, with
/// the row count per page alongside for the client to slice without
/// re-parsing the block envelope.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TaskResultsResponse {
    pub next_token: u64,
    pub pages: Vec<PageEnvelope>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PageEnvelope {
    pub position_count: usize,
    #[serde(with = "base64_blocks")]
    pub blocks: Vec<Vec<u8>>,
}

impl From<&Page> for PageEnvelope {
    fn from(page: &Page) -> Self {
        Self { position_count: page.position_count(), blocks: page.blocks.iter().map(|b| b.encode().to_vec()).collect() }
    }
}

mod base64_blocks {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(blocks: &[Vec<u8>], serializer: S) -> Result<S::Ok, S::Error> {
        let encoded: Vec<String> = blocks.iter().map(|b| STANDARD.encode(b)).collect();
        encoded.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Vec<u8>>, D::Error> {
        let encoded: Vec<String> = Vec::deserialize(deserializer)?;
        encoded.into_iter().map(|s| STANDARD.decode(s).map_err(serde::de::Error::custom)).collect()
    }
}

/// The wire envelope every failed request returns: the engine's own
/// `ErrorKind` name, its stable numeric code, and a human-readable message.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApiError {
    pub error_kind: String,
    pub error_code: u32,
    pub message: String,
}

impl From<&EngineError> for ApiError {
    fn from(err: &EngineError) -> Self {
        Self { error_kind: format!("{:?}", err.kind), error_code: err.kind.code(), message: err.message.clone() }
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        Self::from(&err)
    }
}

fn status_for_category(category: ErrorCategory) -> StatusCode {
    match category {
        ErrorCategory::User => StatusCode::BAD_REQUEST,
        ErrorCategory::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        ErrorCategory::InsufficientResources => StatusCode::SERVICE_UNAVAILABLE,
        ErrorCategory::External => StatusCode::BAD_GATEWAY,
    }
}

/// Maps an `EngineError` straight to an axum response: handlers return
/// `Result<T, EngineError>` and `?` does the rest.
pub struct ApiErrorResponse(pub EngineError);

impl From<EngineError> for ApiErrorResponse {
    fn from(err: EngineError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiErrorResponse {
    fn into_response(self) -> Response {
        let status = status_for_category(self.0.kind.category());
        (status, Json(ApiError::from(&self.0))).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiErrorResponse>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base64_blocks_round_trip() {
        let input = vec![0u8, 1, 2, 250, 251, 252, 253, 254, 255];
        let encoded = base64_blocks::serialize(&[input.clone()], serde_json::value::Serializer).unwrap();
        let decoded: Vec<Vec<u8>> = base64_blocks::deserialize(encoded).unwrap();
        assert_eq!(decoded[0], input);
    }

    #[test]
    fn api_error_carries_the_engine_error_kind_and_code() {
        let err = EngineError::not_found("missing");
        let api_error = ApiError::from(&err);
        assert_eq!(api_error.error_kind, "NotFound");
        assert_eq!(api_error.error_code, err.kind.code());
    }
}
