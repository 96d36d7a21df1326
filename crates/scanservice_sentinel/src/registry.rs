//! Registry of top-level scan tasks.
//!
//! Finished entries stay queryable for a grace period, then remove
//! themselves.

use crate::task::ScanTask;
use chrono::{DateTime, Utc};
use scanservice_protocol::defaults::{CANCELLED_MESSAGE, DEFAULT_GRACE_SECS};
use scanservice_protocol::{TaskId, TaskState, TaskStatusResponse};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::task::AbortHandle;
use tracing::{debug, info};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("UUID not found")]
    NotFound(TaskId),
}

/// Terminal result of a task run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Done,
    Failed(String),
}

struct Entry {
    task: ScanTask,
    state: TaskState,
    error: Option<String>,
    abort: Option<AbortHandle>,
    finished_at: Option<DateTime<Utc>>,
}

/// Shared task table. Clones see the same entries.
#[derive(Clone)]
pub struct TaskRegistry {
    entries: Arc<Mutex<HashMap<TaskId, Entry>>>,
    grace: Duration,
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new(Duration::from_secs(DEFAULT_GRACE_SECS))
    }
}

impl TaskRegistry {
    pub fn new(grace: Duration) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            grace,
        }
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<TaskId, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Track a newly started task as pending.
    pub fn register(&self, task: ScanTask, abort: AbortHandle) {
        debug!(task_id = %task.id, root = %task.root.display(), "Registered scan task");
        self.lock().insert(
            task.id,
            Entry {
                task,
                state: TaskState::Pending,
                error: None,
                abort: Some(abort),
                finished_at: None,
            },
        );
    }

    /// Record the terminal state and schedule removal after the grace
    /// period. Returns false when the task is unknown or already finished.
    /// Must be called inside a tokio runtime.
    pub fn complete(&self, id: TaskId, outcome: TaskOutcome) -> bool {
        {
            let mut entries = self.lock();
            let Some(entry) = entries.get_mut(&id) else {
                return false;
            };
            if entry.state.is_finished() {
                return false;
            }
            let (state, error) = match outcome {
                TaskOutcome::Done => (TaskState::Done, None),
                TaskOutcome::Failed(message) => (TaskState::Failed, Some(message)),
            };
            entry.state = state;
            entry.error = error;
            entry.abort = None;
            entry.finished_at = Some(Utc::now());
            info!(task_id = %id, status = %state, "Scan task finished");
        }
        self.schedule_removal(id);
        true
    }

    fn schedule_removal(&self, id: TaskId) {
        let registry = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(registry.grace).await;
            if registry.expire(id) {
                debug!(task_id = %id, "Expired finished scan task");
            }
        });
    }

    pub fn status(&self, id: TaskId) -> Result<TaskStatusResponse, RegistryError> {
        let entries = self.lock();
        let entry = entries.get(&id).ok_or(RegistryError::NotFound(id))?;
        Ok(TaskStatusResponse {
            uuid: id,
            status: entry.state,
            error: entry.error.clone(),
        })
    }

    /// When the task finished, if it has.
    pub fn finished_at(&self, id: TaskId) -> Option<DateTime<Utc>> {
        self.lock().get(&id).and_then(|entry| entry.finished_at)
    }

    /// Every tracked id, oldest first.
    pub fn list(&self) -> Vec<TaskId> {
        let entries = self.lock();
        let mut tracked: Vec<(DateTime<Utc>, TaskId)> = entries
            .values()
            .map(|entry| (entry.task.created_at, entry.task.id))
            .collect();
        tracked.sort();
        tracked.into_iter().map(|(_, id)| id).collect()
    }

    pub fn pending(&self) -> usize {
        self.lock()
            .values()
            .filter(|entry| entry.state == TaskState::Pending)
            .count()
    }

    /// Remove an entry now. Returns whether it existed.
    pub fn expire(&self, id: TaskId) -> bool {
        self.lock().remove(&id).is_some()
    }

    /// Abort a pending task's run and mark it failed. Finished tasks are
    /// left as they are. Returns the resulting state.
    ///
    /// A write already queued on the output writer is dropped once the run
    /// is gone; the destination is only replaced if the rename had started.
    pub fn cancel(&self, id: TaskId) -> Result<TaskState, RegistryError> {
        {
            let mut entries = self.lock();
            let entry = entries.get_mut(&id).ok_or(RegistryError::NotFound(id))?;
            if entry.state.is_finished() {
                return Ok(entry.state);
            }
            if let Some(abort) = entry.abort.take() {
                abort.abort();
            }
            entry.state = TaskState::Failed;
            entry.error = Some(CANCELLED_MESSAGE.to_string());
            entry.finished_at = Some(Utc::now());
        }
        info!(task_id = %id, "Scan task cancelled");
        self.schedule_removal(id);
        Ok(TaskState::Failed)
    }

    /// Cancel every pending task. Returns how many were cancelled.
    pub fn cancel_all(&self) -> usize {
        let pending: Vec<TaskId> = self
            .lock()
            .iter()
            .filter(|(_, entry)| entry.state == TaskState::Pending)
            .map(|(id, _)| *id)
            .collect();
        pending
            .into_iter()
            .filter(|id| self.cancel(*id).is_ok())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn task(temp: &TempDir) -> ScanTask {
        ScanTask::new(temp.path(), temp.path().join("out.json")).unwrap()
    }

    fn idle_abort_handle() -> (tokio::task::JoinHandle<()>, AbortHandle) {
        let handle = tokio::spawn(std::future::pending::<()>());
        let abort = handle.abort_handle();
        (handle, abort)
    }

    #[tokio::test]
    async fn test_register_and_complete() {
        let temp = TempDir::new().unwrap();
        let registry = TaskRegistry::new(Duration::from_secs(60));
        let task = task(&temp);
        let (_handle, abort) = idle_abort_handle();
        registry.register(task.clone(), abort);

        assert_eq!(registry.status(task.id).unwrap().status, TaskState::Pending);
        assert_eq!(registry.list(), vec![task.id]);
        assert_eq!(registry.pending(), 1);

        assert!(registry.complete(task.id, TaskOutcome::Done));
        assert!(!registry.complete(task.id, TaskOutcome::Failed("late".to_string())));
        let status = registry.status(task.id).unwrap();
        assert_eq!(status.status, TaskState::Done);
        assert_eq!(status.error, None);
        assert!(registry.finished_at(task.id).is_some());
    }

    #[tokio::test]
    async fn test_unknown_task() {
        let registry = TaskRegistry::default();
        let id = TaskId::new();
        assert_eq!(registry.status(id).unwrap_err(), RegistryError::NotFound(id));
        assert_eq!(registry.status(id).unwrap_err().to_string(), "UUID not found");
        assert!(!registry.complete(id, TaskOutcome::Done));
        assert!(registry.cancel(id).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_finished_task_expires_after_grace() {
        let temp = TempDir::new().unwrap();
        let registry = TaskRegistry::new(Duration::from_secs(30));
        let task = task(&temp);
        let (_handle, abort) = idle_abort_handle();
        registry.register(task.clone(), abort);
        registry.complete(task.id, TaskOutcome::Failed("boom".to_string()));

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert_eq!(registry.status(task.id).unwrap().error.as_deref(), Some("boom"));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(registry.status(task.id).is_err());
        assert!(registry.list().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_aborts_run() {
        let temp = TempDir::new().unwrap();
        let registry = TaskRegistry::new(Duration::from_secs(60));
        let task = task(&temp);
        let (handle, abort) = idle_abort_handle();
        registry.register(task.clone(), abort);

        assert_eq!(registry.cancel(task.id).unwrap(), TaskState::Failed);
        assert!(handle.await.unwrap_err().is_cancelled());

        let status = registry.status(task.id).unwrap();
        assert_eq!(status.status, TaskState::Failed);
        assert_eq!(status.error.as_deref(), Some("cancelled"));
        assert!(!registry.complete(task.id, TaskOutcome::Done));
    }

    #[tokio::test]
    async fn test_cancel_finished_task_is_noop() {
        let temp = TempDir::new().unwrap();
        let registry = TaskRegistry::new(Duration::from_secs(60));
        let task = task(&temp);
        let (_handle, abort) = idle_abort_handle();
        registry.register(task.clone(), abort);
        registry.complete(task.id, TaskOutcome::Done);
        assert_eq!(registry.cancel(task.id).unwrap(), TaskState::Done);
    }

    #[tokio::test]
    async fn test_expire_and_cancel_all() {
        let temp = TempDir::new().unwrap();
        let registry = TaskRegistry::new(Duration::from_secs(60));
        let first = task(&temp);
        let second = task(&temp);
        let (_h1, a1) = idle_abort_handle();
        let (_h2, a2) = idle_abort_handle();
        registry.register(first.clone(), a1);
        registry.register(second.clone(), a2);

        assert!(registry.expire(first.id));
        assert!(!registry.expire(first.id));
        assert_eq!(registry.cancel_all(), 1);
        assert_eq!(registry.pending(), 0);
    }
}
