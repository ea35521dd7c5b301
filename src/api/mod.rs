//! REST surface: the client protocol (submit/poll/cancel a query) and the
//! task protocol (create/poll/abort a task, page through its output
//! buffers), both mounted on one `axum::Router`.

pub mod rest;

pub use rest::{ApiError, RustyEngineServer, ServerConfig};
