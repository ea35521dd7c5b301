//! Query lifecycle (C7, coordinator side): the top-level state machine a
//! submitted SQL statement moves through, and the `QueryManager` that
//! admits, tracks, garbage-collects, and client-timeout-cancels every
//! query on the coordinator.
//!
//! The same state-machine-by-enum shape as [`super::task`] and
//! [`super::stage`], one level up: QUEUED → PLANNING → STARTING → RUNNING →
//! a terminal state, with admission bounds and a client-idle timeout
//! enforced by a bounded registry plus a periodic sweeper.

use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::error::{EngineError, ErrorKind, Result};

use super::stage::Stage;
use super::task::{QueryId, SqlTaskManager, StageId};

/// QUEUED → PLANNING → STARTING → RUNNING → one of the three terminal
/// states. Terminal states are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryState {
    Queued,
    Planning,
    Starting,
    Running,
    Finished,
    Failed,
    Canceled,
}

impl QueryState {
    pub fn is_terminal(self) -> bool {
        matches!(self, QueryState::Finished | QueryState::Failed | QueryState::Canceled)
    }

    /// Whether `next` is a legal successor of `self` in the forward
    /// sequence, or any state's move into a terminal state.
    fn can_transition_to(self, next: QueryState) -> bool {
        if next.is_terminal() {
            return !self.is_terminal();
        }
        matches!(
            (self, next),
            (QueryState::Queued, QueryState::Planning)
                | (QueryState::Planning, QueryState::Starting)
                | (QueryState::Starting, QueryState::Running)
        )
    }
}

/// One submitted SQL statement: its stages, lifecycle state, and the
/// bookkeeping the coordinator needs for garbage collection and
/// client-idle cancellation.
pub struct Query {
    pub id: QueryId,
    pub sql: String,
    state: Mutex<QueryState>,
    stages: DashMap<StageId, Arc<Stage>>,
    created_at: Instant,
    end_time: Mutex<Option<Instant>>,
    last_client_access: Mutex<Instant>,
    error: Mutex<Option<String>>,
}

impl Query {
    fn new(id: QueryId, sql: String) -> Self {
        let now = Instant::now();
        Self {
            id,
            sql,
            state: Mutex::new(QueryState::Queued),
            stages: DashMap::new(),
            created_at: now,
            end_time: Mutex::new(None),
            last_client_access: Mutex::new(now),
            error: Mutex::new(None),
        }
    }

    pub fn state(&self) -> QueryState {
        *self.state.lock()
    }

    pub fn error(&self) -> Option<String> {
        self.error.lock().clone()
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn end_time(&self) -> Option<Instant> {
        *self.end_time.lock()
    }

    /// Records client activity; resets the idle-timeout clock.
    pub fn touch(&self) {
        *self.last_client_access.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_client_access.lock().elapsed()
    }

    pub fn transition(&self, next: QueryState) -> Result<()> {
        let mut state = self.state.lock();
        if !state.can_transition_to(next) {
            return Err(EngineError::new(
                ErrorKind::InternalError,
                format!("illegal query state transition {state:?} -> {next:?}"),
            ));
        }
        *state = next;
        if next.is_terminal() {
            drop(state);
            let mut end_time = self.end_time.lock();
            if end_time.is_none() {
                *end_time = Some(Instant::now());
            }
        }
        Ok(())
    }

    pub fn fail(&self, message: impl Into<String>) {
        if self.transition(QueryState::Failed).is_ok() {
            *self.error.lock() = Some(message.into());
        }
    }

    /// Best-effort: cancels the query and every stage/task it owns.
    pub fn cancel(&self) {
        if self.transition(QueryState::Canceled).is_ok() {
            for entry in self.stages.iter() {
                entry.value().cancel();
            }
        }
    }

    pub fn add_stage(&self, stage: Arc<Stage>) {
        self.stages.insert(stage.id.clone(), stage);
    }

    pub fn stages(&self) -> Vec<Arc<Stage>> {
        self.stages.iter().map(|e| e.value().clone()).collect()
    }
}

/// Admission bounds, garbage collection, and client-idle cancellation for
/// every query on the coordinator. One coordinator process owns exactly
/// one `QueryManager`.
pub struct QueryManager {
    queries: DashMap<QueryId, Arc<Query>>,
    task_manager: Arc<SqlTaskManager>,
    next_sequence: AtomicU64,
    max_concurrent_queries: usize,
    max_queued_queries: usize,
    max_age: Duration,
    max_history: usize,
    client_timeout: Duration,
}

impl QueryManager {
    pub fn new(
        task_manager: Arc<SqlTaskManager>,
        max_concurrent_queries: usize,
        max_queued_queries: usize,
        max_age: Duration,
        max_history: usize,
        client_timeout: Duration,
    ) -> Self {
        Self {
            queries: DashMap::new(),
            task_manager,
            next_sequence: AtomicU64::new(1),
            max_concurrent_queries,
            max_queued_queries,
            max_age,
            max_history,
            client_timeout,
        }
    }

    pub fn task_manager(&self) -> &Arc<SqlTaskManager> {
        &self.task_manager
    }

    /// Admits a new query, or rejects it if the cluster is over its
    /// concurrency/queue admission bounds. Reuses `NoNodesAvailable`
    /// (insufficient-resources category) for admission-bound rejection,
    /// since the taxonomy has no dedicated "queue full" kind.
    pub fn submit(&self, sql: impl Into<String>) -> Result<Arc<Query>> {
        let running = self.queries.iter().filter(|e| matches!(e.value().state(), QueryState::Running | QueryState::Starting | QueryState::Planning)).count();
        let queued = self.queries.iter().filter(|e| e.value().state() == QueryState::Queued).count();
        if running >= self.max_concurrent_queries {
            return Err(EngineError::no_nodes_available("max-concurrent-queries admission bound reached"));
        }
        if queued >= self.max_queued_queries {
            return Err(EngineError::no_nodes_available("max-queued-queries admission bound reached"));
        }

        let id = QueryId::new(self.next_sequence.fetch_add(1, AtomicOrdering::Relaxed));
        let query = Arc::new(Query::new(id.clone(), sql.into()));
        self.queries.insert(id, query.clone());
        Ok(query)
    }

    pub fn get(&self, id: &QueryId) -> Result<Arc<Query>> {
        self.queries.get(id).map(|e| e.clone()).ok_or_else(|| EngineError::not_found(format!("query {id} not found")))
    }

    /// A client that has not polled within `client_timeout` causes the
    /// query to be canceled.
    pub fn cancel_idle_clients(&self) -> usize {
        let mut canceled = 0;
        for entry in self.queries.iter() {
            let query = entry.value();
            if !query.state().is_terminal() && query.idle_for() > self.client_timeout {
                query.cancel();
                canceled += 1;
            }
        }
        canceled
    }

    /// Purges terminal queries older than `max_age`, then trims any excess
    /// over `max_history` by age (oldest first).
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        self.queries.retain(|_, query| {
            let keep = match query.end_time() {
                Some(end) if now.duration_since(end) > self.max_age => false,
                _ => true,
            };
            if !keep {
                removed += 1;
            }
            keep
        });

        let mut terminal: Vec<(QueryId, Instant)> =
            self.queries.iter().filter(|e| e.value().state().is_terminal()).map(|e| (e.key().clone(), e.value().created_at())).collect();
        if terminal.len() > self.max_history {
            terminal.sort_by_key(|(_, created)| *created);
            let excess = terminal.len() - self.max_history;
            for (id, _) in terminal.into_iter().take(excess) {
                self.queries.remove(&id);
                removed += 1;
            }
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.queries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> QueryManager {
        QueryManager::new(
            Arc::new(SqlTaskManager::new(1024 * 1024)),
            10,
            10,
            Duration::from_secs(900),
            100,
            Duration::from_secs(300),
        )
    }

    #[test]
    fn queries_are_assigned_sequential_ids() {
        let manager = manager();
        let a = manager.submit("select 1").unwrap();
        let b = manager.submit("select 2").unwrap();
        assert_eq!(a.id.to_string(), "query_1");
        assert_eq!(b.id.to_string(), "query_2");
    }

    #[test]
    fn state_transitions_follow_the_forward_sequence() {
        let manager = manager();
        let query = manager.submit("select 1").unwrap();
        query.transition(QueryState::Planning).unwrap();
        query.transition(QueryState::Starting).unwrap();
        query.transition(QueryState::Running).unwrap();
        assert_eq!(query.state(), QueryState::Running);
        assert!(query.transition(QueryState::Planning).is_err());
    }

    #[test]
    fn state_never_leaves_a_terminal_state() {
        let manager = manager();
        let query = manager.submit("select 1").unwrap();
        query.fail("boom");
        assert!(query.transition(QueryState::Running).is_err());
        assert_eq!(query.state(), QueryState::Failed);
    }

    #[test]
    fn admission_bound_rejects_once_max_concurrent_is_reached() {
        let manager = QueryManager::new(Arc::new(SqlTaskManager::new(1024)), 1, 10, Duration::from_secs(1), 10, Duration::from_secs(1));
        let first = manager.submit("select 1").unwrap();
        first.transition(QueryState::Planning).unwrap();
        first.transition(QueryState::Starting).unwrap();
        first.transition(QueryState::Running).unwrap();
        let err = manager.submit("select 2").unwrap_err();
        assert_eq!(err.kind, ErrorKind::NoNodesAvailable);
    }

    #[test]
    fn idle_client_past_timeout_is_canceled() {
        let manager = QueryManager::new(
            Arc::new(SqlTaskManager::new(1024)),
            10,
            10,
            Duration::from_secs(900),
            100,
            Duration::from_millis(1),
        );
        let query = manager.submit("select 1").unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(manager.cancel_idle_clients(), 1);
        assert_eq!(query.state(), QueryState::Canceled);
    }

    #[test]
    fn sweep_removes_terminal_queries_past_max_age() {
        let manager = QueryManager::new(Arc::new(SqlTaskManager::new(1024)), 10, 10, Duration::from_millis(1), 100, Duration::from_secs(900));
        let query = manager.submit("select 1").unwrap();
        query.fail("boom");
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(manager.sweep(), 1);
        assert!(manager.get(&query.id).is_err());
    }
}
