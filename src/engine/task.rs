//! Task lifecycle (C7, worker side): the state machine a single task moves
//! through, its split sources, and the `SqlTaskManager` that owns every
//! task running on one worker.
//!
//! Lifecycle is an enum plus terminal-state checks, the same shape used for
//! transaction and session state elsewhere in this crate. The per-task
//! concurrent map a worker's task manager needs is a `dashmap`, for
//! lock-free reads under concurrent task lookups.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::timeout as tokio_timeout;

use crate::error::{EngineError, ErrorKind, Result};

use super::exchange::OutputBuffer;
use super::split::Split;

/// `query_<n>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryId(pub String);

impl QueryId {
    pub fn new(sequence: u64) -> Self {
        Self(format!("query_{sequence}"))
    }
}

impl std::fmt::Display for QueryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// `<query>.<stage>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StageId(pub String);

impl StageId {
    pub fn new(query: &QueryId, stage: u32) -> Self {
        Self(format!("{query}.{stage}"))
    }
}

impl std::fmt::Display for StageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// `<query>.<stage>.<task>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new(stage: &StageId, task: u32) -> Self {
        Self(format!("{stage}.{task}"))
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A task's lifecycle state. Terminal states are absorbing; end-time is
/// recorded on first entry to a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Running,
    Finished,
    Canceled,
    Aborted,
    Failed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, TaskState::Running)
    }
}

/// One plan-node id's mutable set of scheduled splits plus its
/// no-more-splits flag. Splits are consumed FIFO, standing in for a real
/// executor pulling work off the source.
struct TaskSource {
    scheduled: VecDeque<Split>,
    no_more_splits: bool,
}

/// A single worker's instance of a plan fragment: its sources, output
/// buffer, and lifecycle state.
pub struct Task {
    pub id: TaskId,
    fragment: Mutex<String>,
    sources: Mutex<HashMap<String, TaskSource>>,
    pub output_buffer: Arc<OutputBuffer>,
    state: Mutex<TaskState>,
    end_time: Mutex<Option<Instant>>,
    error: Mutex<Option<EngineError>>,
    state_changed: Notify,
}

impl Task {
    pub fn new(id: TaskId, fragment: String, output_buffer: Arc<OutputBuffer>) -> Self {
        Self {
            id,
            fragment: Mutex::new(fragment),
            sources: Mutex::new(HashMap::new()),
            output_buffer,
            state: Mutex::new(TaskState::Running),
            end_time: Mutex::new(None),
            error: Mutex::new(None),
            state_changed: Notify::new(),
        }
    }

    pub fn state(&self) -> TaskState {
        *self.state.lock()
    }

    pub fn end_time(&self) -> Option<Instant> {
        *self.end_time.lock()
    }

    pub fn error(&self) -> Option<String> {
        self.error.lock().as_ref().map(|e| e.to_string())
    }

    /// Idempotent merge of split sources and the plan fragment: never
    /// regresses an already-set `no_more_splits` flag, and appends new
    /// splits rather than replacing the source wholesale.
    pub fn update(&self, fragment: Option<String>, source_updates: Vec<(String, Vec<Split>, bool)>) {
        if let Some(fragment) = fragment {
            *self.fragment.lock() = fragment;
        }
        let mut sources = self.sources.lock();
        for (plan_node_id, new_splits, no_more_splits) in source_updates {
            let entry = sources
                .entry(plan_node_id)
                .or_insert_with(|| TaskSource { scheduled: VecDeque::new(), no_more_splits: false });
            entry.scheduled.extend(new_splits);
            entry.no_more_splits = entry.no_more_splits || no_more_splits;
        }
    }

    /// Simulates the executor consuming one scheduled split from a source.
    pub fn consume_split(&self, plan_node_id: &str) -> Option<Split> {
        self.sources.lock().get_mut(plan_node_id).and_then(|source| source.scheduled.pop_front())
    }

    fn sources_finished(&self) -> bool {
        let sources = self.sources.lock();
        !sources.is_empty() && sources.values().all(|s| s.no_more_splits && s.scheduled.is_empty())
    }

    /// RUNNING → FINISHED once every source is `no_more_splits` and drained
    /// and every output buffer has reached FINISHED. Safe to call
    /// repeatedly; a no-op once already terminal.
    pub fn try_finish(&self) -> bool {
        let mut state = self.state.lock();
        if *state != TaskState::Running {
            return false;
        }
        if self.sources_finished() && self.output_buffer.state() == super::exchange::BufferState::Finished {
            *state = TaskState::Finished;
            drop(state);
            self.enter_terminal();
            return true;
        }
        false
    }

    fn transition_to(&self, target: TaskState) -> bool {
        let mut state = self.state.lock();
        if state.is_terminal() {
            return false;
        }
        *state = target;
        drop(state);
        self.enter_terminal();
        true
    }

    fn enter_terminal(&self) {
        let mut end_time = self.end_time.lock();
        if end_time.is_none() {
            *end_time = Some(Instant::now());
        }
        drop(end_time);
        self.state_changed.notify_waiters();
    }

    /// Stops accepting new splits, unblocks buffer waiters with the
    /// terminal state, and records end-time. A cancel on an already
    /// finished task is a no-op.
    pub fn cancel(&self) -> bool {
        self.transition_to(TaskState::Canceled)
    }

    pub fn abort(&self) -> bool {
        self.transition_to(TaskState::Aborted)
    }

    pub fn fail(&self, error: EngineError) -> bool {
        let transitioned = self.transition_to(TaskState::Failed);
        if transitioned {
            *self.error.lock() = Some(error);
        }
        transitioned
    }

    /// `abort_task_results`: downstream no longer needs this buffer's
    /// output. The buffer is abandoned; the task may now finish as soon as
    /// its remaining sources drain.
    pub fn abort_results(&self, buffer_id: &str) -> Result<()> {
        self.output_buffer.abandon(buffer_id)?;
        self.try_finish();
        Ok(())
    }

    /// Blocks (bounded by `wait_timeout`) until the state differs from
    /// `last_known_state`, or the timeout elapses — whichever first.
    pub async fn wait_for_state_change(&self, last_known_state: TaskState, wait_timeout: Duration) -> TaskState {
        if self.state() != last_known_state || last_known_state.is_terminal() {
            return self.state();
        }
        let notified = self.state_changed.notified();
        let _ = tokio_timeout(wait_timeout, notified).await;
        self.state()
    }
}

/// Owns every task assigned to this worker. Operations mirror the task
/// HTTP protocol: idempotent upsert, blocking info polling, result paging,
/// and the three flavors of teardown (cancel/abort/abort-results).
pub struct SqlTaskManager {
    tasks: DashMap<TaskId, Arc<Task>>,
    output_buffer_capacity_bytes: usize,
}

impl SqlTaskManager {
    pub fn new(output_buffer_capacity_bytes: usize) -> Self {
        Self { tasks: DashMap::new(), output_buffer_capacity_bytes }
    }

    /// Idempotent upsert: creates the task on first call, merges sources
    /// and buffer descriptors on subsequent calls.
    pub fn update_task(
        &self,
        id: TaskId,
        fragment: String,
        source_updates: Vec<(String, Vec<Split>, bool)>,
        output_buffer_ids: Vec<String>,
    ) -> Arc<Task> {
        let task = self
            .tasks
            .entry(id.clone())
            .or_insert_with(|| {
                Arc::new(Task::new(
                    id,
                    fragment.clone(),
                    Arc::new(OutputBuffer::new(output_buffer_ids, self.output_buffer_capacity_bytes)),
                ))
            })
            .clone();
        task.update(Some(fragment), source_updates);
        task
    }

    pub fn get_task(&self, id: &TaskId) -> Result<Arc<Task>> {
        self.tasks.get(id).map(|e| e.clone()).ok_or_else(|| EngineError::not_found(format!("task {id} not found")))
    }

    pub fn get_task_results(
        &self,
        id: &TaskId,
        buffer_id: &str,
        token: u64,
        max_bytes: usize,
    ) -> Result<(Vec<Arc<super::exchange::Page>>, u64)> {
        self.get_task(id)?.output_buffer.get_pages(buffer_id, token, max_bytes)
    }

    pub fn cancel_task(&self, id: &TaskId) -> Result<()> {
        self.get_task(id)?.cancel();
        Ok(())
    }

    pub fn abort_task(&self, id: &TaskId) -> Result<()> {
        self.get_task(id)?.abort();
        Ok(())
    }

    pub fn abort_task_results(&self, id: &TaskId, buffer_id: &str) -> Result<()> {
        self.get_task(id)?.abort_results(buffer_id)
    }

    /// Removes terminal tasks whose end-time is older than `info_max_age`.
    pub fn sweep_old_tasks(&self, info_max_age: Duration) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        self.tasks.retain(|_, task| {
            let keep = match task.end_time() {
                Some(end) if now.duration_since(end) > info_max_age => false,
                _ => true,
            };
            if !keep {
                removed += 1;
            }
            keep
        });
        removed
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// A fault-tolerant mirror of a remote (worker-side) task, polled from the
/// coordinator. Tolerates consecutive errors as long as the age since the
/// last success stays below `min_error_duration`; beyond either bound the
/// remote task — and its stage — is marked FAILED.
pub struct RemoteTaskTracker {
    max_consecutive_error_count: u32,
    min_error_duration: Duration,
    consecutive_errors: std::sync::atomic::AtomicU32,
    last_success: Mutex<Instant>,
    failed: AtomicBool,
}

impl RemoteTaskTracker {
    pub fn new(max_consecutive_error_count: u32, min_error_duration: Duration) -> Self {
        Self {
            max_consecutive_error_count,
            min_error_duration,
            consecutive_errors: std::sync::atomic::AtomicU32::new(0),
            last_success: Mutex::new(Instant::now()),
            failed: AtomicBool::new(false),
        }
    }

    pub fn record_success(&self) {
        self.consecutive_errors.store(0, AtomicOrdering::Release);
        *self.last_success.lock() = Instant::now();
    }

    /// Records a polling failure; returns `true` if this failure pushed the
    /// remote task into FAILED.
    pub fn record_error(&self) -> bool {
        if self.failed.load(AtomicOrdering::Acquire) {
            return true;
        }
        let errors = self.consecutive_errors.fetch_add(1, AtomicOrdering::AcqRel) + 1;
        let since_success = self.last_success.lock().elapsed();
        if errors > self.max_consecutive_error_count && since_success > self.min_error_duration {
            self.failed.store(true, AtomicOrdering::Release);
            return true;
        }
        false
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(AtomicOrdering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::split::SplitPayload;

    fn a_split() -> Split {
        Split { locality_hints: vec![], remotely_accessible: true, payload: SplitPayload::File { path: "a".into(), start: 0, len: 1 } }
    }

    fn ids() -> (QueryId, StageId, TaskId) {
        let query = QueryId::new(1);
        let stage = StageId::new(&query, 0);
        let task = TaskId::new(&stage, 0);
        (query, stage, task)
    }

    #[test]
    fn id_formats_follow_the_documented_dotted_convention() {
        let (query, stage, task) = ids();
        assert_eq!(query.to_string(), "query_1");
        assert_eq!(stage.to_string(), "query_1.0");
        assert_eq!(task.to_string(), "query_1.0.0");
    }

    /// S4: create task, attach one split, close sources, drain one page of
    /// one row → task reaches FINISHED.
    #[tokio::test]
    async fn task_finishes_once_sources_drained_and_buffer_finished() {
        let manager = SqlTaskManager::new(1024 * 1024);
        let (_, _, task_id) = ids();
        let task = manager.update_task(
            task_id.clone(),
            "fragment".into(),
            vec![("scan".into(), vec![a_split()], true)],
            vec!["out".into()],
        );
        assert_eq!(task.state(), TaskState::Running);

        task.consume_split("scan");
        let mut builder = crate::engine::block::BlockBuilder::new(crate::engine::types::PhysicalCategory::Int64);
        builder.append_long(42);
        let page = super::super::exchange::Page::new(vec![builder.build()]).unwrap();
        task.output_buffer.enqueue("out", page).await.unwrap();
        task.output_buffer.set_no_more_pages("out").unwrap();
        let (_, next_token) = task.output_buffer.get_pages("out", 0, 1024 * 1024).unwrap();
        task.output_buffer.acknowledge("out", next_token).unwrap();
        assert!(task.try_finish());
        assert_eq!(task.state(), TaskState::Finished);
        assert!(task.end_time().is_some());
    }

    /// S4 (second half): `abort_task_results` on a task's only buffer also
    /// drives it to FINISHED once its sources are drained.
    #[test]
    fn abort_task_results_can_finish_a_task() {
        let manager = SqlTaskManager::new(1024 * 1024);
        let (_, _, task_id) = ids();
        let task = manager.update_task(task_id.clone(), "fragment".into(), vec![("scan".into(), vec![], true)], vec!["out".into()]);
        manager.abort_task_results(&task_id, "out").unwrap();
        assert_eq!(task.state(), TaskState::Finished);
    }

    #[test]
    fn task_state_never_leaves_a_terminal_state() {
        let task = Task::new(TaskId("t".into()), "f".into(), Arc::new(OutputBuffer::new(vec![], 1024)));
        assert!(task.cancel());
        assert!(!task.abort());
        assert_eq!(task.state(), TaskState::Canceled);
    }

    #[test]
    fn update_never_regresses_no_more_splits() {
        let task = Task::new(TaskId("t".into()), "f".into(), Arc::new(OutputBuffer::new(vec![], 1024)));
        task.update(None, vec![("scan".into(), vec![a_split()], true)]);
        task.update(None, vec![("scan".into(), vec![], false)]);
        assert!(task.sources_finished() || task.consume_split("scan").is_some());
    }

    /// S5: 9 consecutive errors at a 100ms cadence with
    /// `max_consecutive_error_count=10`, `min_error_duration=2s` → still
    /// RUNNING; the error past both bounds marks it FAILED.
    #[test]
    fn remote_task_tolerates_errors_within_the_fault_window() {
        let tracker = RemoteTaskTracker::new(10, Duration::from_millis(1));
        for _ in 0..9 {
            assert!(!tracker.record_error());
        }
        assert!(!tracker.is_failed());
        std::thread::sleep(Duration::from_millis(5));
        assert!(tracker.record_error());
        assert!(tracker.is_failed());
    }

    #[test]
    fn remote_task_recovers_on_success_resetting_the_error_count() {
        let tracker = RemoteTaskTracker::new(2, Duration::from_secs(60));
        tracker.record_error();
        tracker.record_error();
        tracker.record_success();
        assert!(!tracker.record_error());
        assert!(!tracker.is_failed());
    }
}
