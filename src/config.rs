//! Engine-wide configuration.
//!
//! Mirrors the keys named in the external-interfaces section of the design
//! doc (`query.*`, `exchange.*`) as a single `serde`-derived struct with a
//! `Default` impl. Values can be overridden from the environment with
//! [`EngineConfig::from_env`].

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    /// `query.max-age`: upper bound after which a terminal query is purged.
    pub query_max_age: Duration,
    /// `query.max-history`: cap of terminal queries retained.
    pub query_max_history: usize,
    /// `query.client.timeout`: idle-client kill (minimum 5s).
    pub query_client_timeout: Duration,
    /// `query.schedule-split-batch-size`: max splits per `next_batch`.
    pub query_schedule_split_batch_size: usize,
    /// `query.max-concurrent-queries`: admission bound.
    pub query_max_concurrent_queries: usize,
    /// `query.max-queued-queries`: admission bound.
    pub query_max_queued_queries: usize,
    /// `query.initial-hash-partitions`: default stage fanout.
    pub query_initial_hash_partitions: usize,
    /// `query.manager-executor-pool-size`: coordinator bookkeeping pool.
    pub query_manager_executor_pool_size: usize,
    /// `query.remote-task.max-consecutive-error-count`.
    pub remote_task_max_consecutive_error_count: u32,
    /// `query.remote-task.min-error-duration`.
    pub remote_task_min_error_duration: Duration,
    /// `exchange.max-buffer-size`: per-buffer byte capacity.
    pub exchange_max_buffer_size: usize,
    /// `exchange.concurrent-request-multiplier`.
    pub exchange_concurrent_request_multiplier: u32,
    /// `exchange.min-error-duration`.
    pub exchange_min_error_duration: Duration,
    /// `exchange.max-response-size`.
    pub exchange_max_response_size: usize,
    /// `exchange.client-threads`.
    pub exchange_client_threads: usize,
    /// Per-query aggregate memory budget enforced across buffers + aggregation state.
    pub query_max_memory_bytes: u64,
    /// Per-aggregation-state soft cap.
    pub aggregation_state_soft_cap_bytes: u64,
    /// Open Question: whether table sampling must be reproducible across workers.
    pub deterministic_sampling: bool,
    /// HTTP listen address for the client + task protocols.
    pub listen_addr: String,
    pub port: u16,
    /// `query.queue-config-file`: path to a declarative queue policy; `None`
    /// means the flat `query_max_concurrent_queries`/`query_max_queued_queries`
    /// bounds above apply uniformly.
    pub queue_config_file: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            query_max_age: Duration::from_secs(15 * 60),
            query_max_history: 100,
            query_client_timeout: Duration::from_secs(5 * 60),
            query_schedule_split_batch_size: 1000,
            query_max_concurrent_queries: 1000,
            query_max_queued_queries: 5000,
            query_initial_hash_partitions: 8,
            query_manager_executor_pool_size: 5,
            remote_task_max_consecutive_error_count: 10,
            remote_task_min_error_duration: Duration::from_secs(2 * 60),
            exchange_max_buffer_size: 32 * 1024 * 1024,
            exchange_concurrent_request_multiplier: 3,
            exchange_min_error_duration: Duration::from_secs(60),
            exchange_max_response_size: 16 * 1024 * 1024,
            exchange_client_threads: 25,
            query_max_memory_bytes: 4u64 * 1024 * 1024 * 1024,
            aggregation_state_soft_cap_bytes: 4 * 1024 * 1024,
            deterministic_sampling: false,
            listen_addr: "0.0.0.0".to_string(),
            port: 8080,
            queue_config_file: None,
        }
    }
}

/// A named admission-control rule from a `query.queue-config-file`: queries
/// whose declared queue name matches `name` are bounded by `max_concurrent`
/// and `max_queued` instead of the engine-wide defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QueueRule {
    pub name: String,
    pub max_concurrent: usize,
    pub max_queued: usize,
}

/// A declarative queue policy: an ordered list of rules, first match wins,
/// with a required fallback rule named `"default"`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct QueuePolicy {
    pub rules: Vec<QueueRule>,
}

impl QueuePolicy {
    pub fn rule_for(&self, queue_name: &str) -> Option<&QueueRule> {
        self.rules.iter().find(|r| r.name == queue_name).or_else(|| self.rules.iter().find(|r| r.name == "default"))
    }
}

/// Loads the JSON-encoded queue policy named by
/// `EngineConfig::queue_config_file`, if set.
pub fn load_queue_policy(path: &str) -> crate::Result<QueuePolicy> {
    let contents = std::fs::read_to_string(path)
        .map_err(|err| crate::EngineError::new(crate::ErrorKind::SemanticError, format!("failed to read queue config file '{path}': {err}")))?;
    serde_json::from_str(&contents)
        .map_err(|err| crate::EngineError::new(crate::ErrorKind::SemanticError, format!("invalid queue config file '{path}': {err}")))
}

impl EngineConfig {
    /// Overlays `RUSTY_ENGINE_*` environment variables onto the defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(v) = std::env::var("RUSTY_ENGINE_PORT") {
            if let Ok(port) = v.parse() {
                config.port = port;
            }
        }
        if let Ok(v) = std::env::var("RUSTY_ENGINE_LISTEN_ADDR") {
            config.listen_addr = v;
        }
        if let Ok(v) = std::env::var("RUSTY_ENGINE_QUERY_CLIENT_TIMEOUT_SECS") {
            if let Ok(secs) = v.parse() {
                config.query_client_timeout = Duration::from_secs(secs);
            }
        }
        if let Ok(v) = std::env::var("RUSTY_ENGINE_DETERMINISTIC_SAMPLING") {
            config.deterministic_sampling = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Ok(v) = std::env::var("RUSTY_ENGINE_QUEUE_CONFIG_FILE") {
            config.queue_config_file = Some(v);
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = EngineConfig::default();
        assert_eq!(config.query_max_age, Duration::from_secs(900));
        assert_eq!(config.query_max_history, 100);
        assert_eq!(config.query_initial_hash_partitions, 8);
        assert_eq!(config.remote_task_max_consecutive_error_count, 10);
        assert_eq!(config.remote_task_min_error_duration, Duration::from_secs(120));
        assert_eq!(config.exchange_max_buffer_size, 32 * 1024 * 1024);
    }

    #[test]
    fn env_override_applies() {
        std::env::set_var("RUSTY_ENGINE_PORT", "9999");
        let config = EngineConfig::from_env();
        assert_eq!(config.port, 9999);
        std::env::remove_var("RUSTY_ENGINE_PORT");
    }

    #[test]
    fn queue_policy_loads_from_file_and_falls_back_to_default_rule() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        use std::io::Write;
        write!(
            file,
            r#"{{"rules": [
                {{"name": "etl", "maxConcurrent": 2, "maxQueued": 10}},
                {{"name": "default", "maxConcurrent": 50, "maxQueued": 500}}
            ]}}"#
        )
        .unwrap();

        let policy = load_queue_policy(file.path().to_str().unwrap()).unwrap();
        assert_eq!(policy.rule_for("etl").unwrap().max_concurrent, 2);
        assert_eq!(policy.rule_for("adhoc").unwrap().name, "default");
    }

    #[test]
    fn missing_queue_config_file_is_a_semantic_error() {
        let err = load_queue_policy("/nonexistent/path/to/queues.json").unwrap_err();
        assert_eq!(err.kind, crate::ErrorKind::SemanticError);
    }
}
