//! Router assembly: `RustyEngineServer` wires the client and task protocol
//! handlers onto one `axum::Router`, behind a CORS/timeout/trace
//! `tower-http` layer stack, with an OpenAPI document served at `/docs`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::{delete, get, post, put};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::engine::query::QueryManager;
use crate::engine::task::SqlTaskManager;
use crate::session::SessionPropertyManager;
use crate::EngineConfig;

use super::handlers;

/// Shared, read-mostly state every handler is given through axum's `State`
/// extractor — constructor-injected, not pulled from a global.
pub struct AppState {
    pub query_manager: Arc<QueryManager>,
    pub task_manager: Arc<SqlTaskManager>,
    pub session_properties: Arc<SessionPropertyManager>,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub port: u16,
    pub request_timeout: Duration,
}

impl From<&EngineConfig> for ServerConfig {
    fn from(config: &EngineConfig) -> Self {
        Self { listen_addr: config.listen_addr.clone(), port: config.port, request_timeout: Duration::from_secs(30) }
    }
}

#[derive(OpenApi)]
#[openapi(paths(
    handlers::submit_query,
    handlers::poll_query,
    handlers::cancel_query,
    handlers::put_task,
    handlers::get_task,
    handlers::abort_task,
    handlers::get_task_results,
    handlers::abort_task_results,
))]
struct ApiDoc;

pub struct RustyEngineServer {
    config: ServerConfig,
    state: Arc<AppState>,
}

impl RustyEngineServer {
    pub fn new(config: ServerConfig, state: Arc<AppState>) -> Self {
        Self { config, state }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/v1/query", post(handlers::submit_query))
            .route("/v1/query/{queryId}/{token}", get(handlers::poll_query))
            .route("/v1/query/{queryId}", delete(handlers::cancel_query))
            .route("/v1/task/{taskId}", put(handlers::put_task).get(handlers::get_task).delete(handlers::abort_task))
            .route("/v1/task/{taskId}/results/{bufferId}/{token}", get(handlers::get_task_results))
            .route("/v1/task/{taskId}/results/{bufferId}", delete(handlers::abort_task_results))
            .merge(SwaggerUi::new("/docs").url("/docs/openapi.json", ApiDoc::openapi()))
            .layer(TraceLayer::new_for_http())
            .layer(TimeoutLayer::new(self.config.request_timeout))
            .layer(CorsLayer::permissive())
            .with_state(self.state.clone())
    }

    pub async fn serve(&self) -> crate::error::Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.listen_addr, self.config.port)
            .parse()
            .map_err(|e| crate::error::EngineError::internal(format!("invalid listen address: {e}")))?;
        tracing::info!(%addr, "rusty-engine coordinator listening");
        let listener = tokio::net::TcpListener::bind(addr).await.map_err(crate::error::EngineError::from)?;
        axum::serve(listener, self.router()).await.map_err(|e| crate::error::EngineError::internal(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::task::SqlTaskManager as Tasks;

    fn state() -> Arc<AppState> {
        let task_manager = Arc::new(Tasks::new(4 * 1024 * 1024));
        let query_manager = Arc::new(QueryManager::new(
            task_manager.clone(),
            100,
            1000,
            Duration::from_secs(900),
            100,
            Duration::from_secs(300),
        ));
        Arc::new(AppState { query_manager, task_manager, session_properties: Arc::new(SessionPropertyManager::new()) })
    }

    #[test]
    fn router_builds_without_panicking() {
        let server = RustyEngineServer::new(
            ServerConfig { listen_addr: "127.0.0.1".into(), port: 0, request_timeout: Duration::from_secs(5) },
            state(),
        );
        let _router = server.router();
    }
}
