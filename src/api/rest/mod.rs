//! REST surface implementation: DTOs, handlers, and router assembly.

pub mod handlers;
pub mod server;
pub mod types;

pub use server::{AppState, RustyEngineServer, ServerConfig};
pub use types::{ApiError, ApiErrorResponse, ApiResult, QueryRequest, QueryResponse, TaskInfoResponse, TaskResultsResponse, TaskUpdateRequest};
