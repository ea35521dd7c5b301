//! Stage lifecycle (C7, coordinator side): the coordinator's view of one
//! plan fragment, aggregating the state of the tasks instantiated from it
//! across workers.
//!
//! The same state-machine-by-enum shape as [`super::task`], one level up: a
//! stage derives its own state from the states of the tasks it owns.

use std::sync::Arc;

use dashmap::DashMap;

use crate::error::Result;

use super::split::Split;
use super::task::{SqlTaskManager, StageId, Task, TaskId, TaskState};

/// A stage's aggregate state, derived from its tasks' states rather than
/// tracked independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    Planned,
    Scheduling,
    Running,
    Finished,
    Canceled,
    Aborted,
    Failed,
}

impl StageState {
    pub fn is_terminal(self) -> bool {
        matches!(self, StageState::Finished | StageState::Canceled | StageState::Aborted | StageState::Failed)
    }
}

/// The coordinator's view of one plan fragment: the set of tasks
/// instantiated from it, one per worker. Cancellation propagates: canceling
/// a stage cancels every task best-effort.
pub struct Stage {
    pub id: StageId,
    tasks: DashMap<TaskId, Arc<Task>>,
    task_manager: Arc<SqlTaskManager>,
    explicitly_canceled: std::sync::atomic::AtomicBool,
}

impl Stage {
    pub fn new(id: StageId, task_manager: Arc<SqlTaskManager>) -> Self {
        Self { id, tasks: DashMap::new(), task_manager, explicitly_canceled: std::sync::atomic::AtomicBool::new(false) }
    }

    /// Instantiates (or idempotently updates) the task for one worker slot
    /// of this stage.
    pub fn create_task(
        &self,
        task_id: TaskId,
        fragment: String,
        source_updates: Vec<(String, Vec<Split>, bool)>,
        output_buffer_ids: Vec<String>,
    ) -> Arc<Task> {
        let task = self.task_manager.update_task(task_id.clone(), fragment, source_updates, output_buffer_ids);
        self.tasks.insert(task_id, task.clone());
        task
    }

    pub fn tasks(&self) -> Vec<Arc<Task>> {
        self.tasks.iter().map(|e| e.value().clone()).collect()
    }

    /// Derives the stage's state from its tasks: `Planned` before any task
    /// exists, `Failed`/`Canceled`/`Aborted` if any task reached that
    /// terminal state, `Finished` once every task has, `Running` otherwise.
    pub fn state(&self) -> StageState {
        if self.tasks.is_empty() {
            return if self.explicitly_canceled.load(std::sync::atomic::Ordering::Acquire) {
                StageState::Canceled
            } else {
                StageState::Planned
            };
        }
        let states: Vec<TaskState> = self.tasks.iter().map(|e| e.value().state()).collect();
        if states.iter().any(|s| *s == TaskState::Failed) {
            return StageState::Failed;
        }
        if states.iter().any(|s| *s == TaskState::Aborted) {
            return StageState::Aborted;
        }
        if states.iter().any(|s| *s == TaskState::Canceled) {
            return StageState::Canceled;
        }
        if states.iter().all(|s| *s == TaskState::Finished) {
            return StageState::Finished;
        }
        StageState::Running
    }

    /// Cancels every task in the stage, best-effort: a task that already
    /// reached a terminal state is left alone.
    pub fn cancel(&self) {
        self.explicitly_canceled.store(true, std::sync::atomic::Ordering::Release);
        for entry in self.tasks.iter() {
            entry.value().cancel();
        }
    }

    pub fn abort(&self) {
        for entry in self.tasks.iter() {
            entry.value().abort();
        }
    }

    pub fn schedule_split(&self, task_id: &TaskId, plan_node_id: &str, splits: Vec<Split>, no_more_splits: bool) -> Result<()> {
        let task = self.task_manager.get_task(task_id)?;
        task.update(None, vec![(plan_node_id.to_string(), splits, no_more_splits)]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::task::QueryId;

    fn stage_with_manager() -> (Stage, Arc<SqlTaskManager>) {
        let manager = Arc::new(SqlTaskManager::new(1024 * 1024));
        let query = QueryId::new(1);
        let stage_id = StageId::new(&query, 0);
        (Stage::new(stage_id, manager.clone()), manager)
    }

    #[test]
    fn stage_is_planned_before_any_task_exists() {
        let (stage, _manager) = stage_with_manager();
        assert_eq!(stage.state(), StageState::Planned);
    }

    #[test]
    fn stage_runs_while_any_task_is_running_and_finishes_once_all_are() {
        let (stage, _manager) = stage_with_manager();
        let task_id = TaskId::new(&stage.id, 0);
        let task = stage.create_task(task_id, "fragment".into(), vec![("scan".into(), vec![], true)], vec![]);
        assert_eq!(stage.state(), StageState::Running);
        task.try_finish();
        assert_eq!(stage.state(), StageState::Finished);
    }

    #[test]
    fn canceling_a_stage_cancels_its_tasks_best_effort() {
        let (stage, _manager) = stage_with_manager();
        let task_id = TaskId::new(&stage.id, 0);
        stage.create_task(task_id, "fragment".into(), vec![], vec![]);
        stage.cancel();
        assert_eq!(stage.state(), StageState::Canceled);
        for task in stage.tasks() {
            assert_eq!(task.state(), TaskState::Canceled);
        }
    }

    #[test]
    fn any_failed_task_fails_the_whole_stage() {
        let (stage, _manager) = stage_with_manager();
        let ok_task = stage.create_task(TaskId::new(&stage.id, 0), "f".into(), vec![], vec![]);
        let bad_task = stage.create_task(TaskId::new(&stage.id, 1), "f".into(), vec![], vec![]);
        ok_task.try_finish();
        bad_task.fail(crate::error::EngineError::internal("boom"));
        assert_eq!(stage.state(), StageState::Failed);
    }
}
