//! `rusty-engine-coordinator`: the process hosting the client protocol, the
//! `QueryManager`, and the shard/catalog metadata store.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use rusty_engine::api::rest::{AppState, RustyEngineServer, ServerConfig};
use rusty_engine::engine::query::QueryManager;
use rusty_engine::engine::task::SqlTaskManager;
use rusty_engine::session::SessionPropertyManager;
use rusty_engine::{EngineConfig, VERSION};

fn main() -> ExitCode {
    tracing_subscriber::fmt().with_target(false).with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    // §5: "within a worker, a bounded executor runs task stages
    // cooperatively" — the coordinator's own tokio runtime is sized the
    // same way, one worker thread per core, rather than tokio's default.
    let worker_threads = num_cpus::get().max(1);
    tracing::info!(worker_threads, "sizing coordinator runtime");
    let runtime = match tokio::runtime::Builder::new_multi_thread().worker_threads(worker_threads).enable_all().build() {
        Ok(rt) => rt,
        Err(err) => {
            tracing::error!(%err, "failed to start coordinator runtime");
            return ExitCode::FAILURE;
        }
    };
    runtime.block_on(run())
}

async fn run() -> ExitCode {
    let config = EngineConfig::from_env();
    tracing::info!(version = VERSION, listen_addr = %config.listen_addr, port = config.port, "rusty-engine coordinator starting");
    tracing::debug!(?config, "resolved configuration");

    let task_manager = Arc::new(SqlTaskManager::new(config.exchange_max_buffer_size));
    let query_manager = Arc::new(QueryManager::new(
        task_manager.clone(),
        config.query_max_concurrent_queries,
        config.query_max_queued_queries,
        config.query_max_age,
        config.query_max_history,
        config.query_client_timeout,
    ));
    let session_properties = Arc::new(SessionPropertyManager::new());
    let state = Arc::new(AppState { query_manager: query_manager.clone(), task_manager: task_manager.clone(), session_properties });

    spawn_sweepers(query_manager, task_manager, config.query_max_age);

    let server = RustyEngineServer::new(ServerConfig::from(&config), state);
    match server.serve().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(%err, "coordinator exited with an error");
            ExitCode::FAILURE
        }
    }
}

/// Background admission/idle-timeout/garbage-collection sweep, run on a
/// fixed interval rather than on every request.
fn spawn_sweepers(query_manager: Arc<QueryManager>, task_manager: Arc<SqlTaskManager>, max_age: Duration) {
    use tokio_stream::StreamExt;

    tokio::spawn(async move {
        let mut ticks = tokio_stream::wrappers::IntervalStream::new(tokio::time::interval(Duration::from_secs(30)));
        while ticks.next().await.is_some() {
            let canceled = query_manager.cancel_idle_clients();
            let swept = query_manager.sweep();
            let tasks_swept = task_manager.sweep_old_tasks(max_age);
            if canceled > 0 || swept > 0 || tasks_swept > 0 {
                tracing::debug!(canceled, swept, tasks_swept, "maintenance sweep");
            }
        }
    });
}
