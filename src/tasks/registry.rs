//! The explicitly-owned registry of active tasks.
//!
//! One registry per server process, passed to handlers rather than living
//! in ambient global state. At most one matching task runs at a time;
//! finished tasks stay observable until the process exits so progress
//! queries keep answering after completion.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;

use crate::error::LinkageError;
use crate::tasks::progress::{ProgressReport, TaskState, TaskStatus};

/// Shared view of one task: its state and its cooperative cancel flag.
#[derive(Clone, Debug)]
pub struct TaskHandle {
    pub state: Arc<Mutex<TaskState>>,
    pub cancel: Arc<AtomicBool>,
}

impl TaskHandle {
    pub fn new(state: TaskState) -> Self {
        Self {
            state: Arc::new(Mutex::new(state)),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }
}

#[derive(Default)]
pub struct TaskRegistry {
    tasks: Mutex<HashMap<String, TaskHandle>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new running task. Refuses while any other task is still
    /// running: the concurrency budget is one matching task per source.
    pub async fn try_begin(&self, state: TaskState) -> Result<TaskHandle, LinkageError> {
        let mut tasks = self.tasks.lock().await;
        for handle in tasks.values() {
            if handle.state.lock().await.status == TaskStatus::Running {
                return Err(LinkageError::TaskAlreadyRunning);
            }
        }
        let task_id = state.task_id.clone();
        let handle = TaskHandle::new(state);
        tasks.insert(task_id, handle.clone());
        Ok(handle)
    }

    pub async fn get(&self, task_id: &str) -> Option<TaskHandle> {
        self.tasks.lock().await.get(task_id).cloned()
    }

    pub async fn progress(&self, task_id: &str) -> Result<ProgressReport, LinkageError> {
        let handle = self
            .get(task_id)
            .await
            .ok_or_else(|| LinkageError::UnknownTask(task_id.to_string()))?;
        let state = handle.state.lock().await;
        Ok(state.report(Utc::now()))
    }

    /// Raise the cooperative cancel flag. The task transitions to stopped
    /// at its next check point, after flushing the in-flight page.
    pub async fn request_stop(&self, task_id: &str) -> Result<(), LinkageError> {
        let handle = self
            .get(task_id)
            .await
            .ok_or_else(|| LinkageError::UnknownTask(task_id.to_string()))?;
        let status = handle.state.lock().await.status;
        if status != TaskStatus::Running {
            return Err(LinkageError::TaskNotRunning(task_id.to_string()));
        }
        handle.cancel.store(true, Ordering::Relaxed);
        Ok(())
    }

    /// True when some task is still running.
    pub async fn any_running(&self) -> bool {
        let tasks = self.tasks.lock().await;
        for handle in tasks.values() {
            if handle.state.lock().await.status == TaskStatus::Running {
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::progress::TaskMode;

    fn state(id: &str) -> TaskState {
        TaskState::new(id.into(), TaskMode::Incremental, 10, Utc::now())
    }

    #[tokio::test]
    async fn second_task_is_refused_while_first_runs() {
        let registry = TaskRegistry::new();
        registry.try_begin(state("t1")).await.unwrap();
        let err = registry.try_begin(state("t2")).await.unwrap_err();
        assert!(matches!(err, LinkageError::TaskAlreadyRunning));
    }

    #[tokio::test]
    async fn finished_task_frees_the_slot_but_stays_observable() {
        let registry = TaskRegistry::new();
        let handle = registry.try_begin(state("t1")).await.unwrap();
        handle.state.lock().await.status = TaskStatus::Completed;
        registry.try_begin(state("t2")).await.unwrap();
        assert!(registry.progress("t1").await.is_ok());
    }

    #[tokio::test]
    async fn stop_requires_running_task() {
        let registry = TaskRegistry::new();
        let err = registry.request_stop("missing").await.unwrap_err();
        assert!(matches!(err, LinkageError::UnknownTask(_)));

        let handle = registry.try_begin(state("t1")).await.unwrap();
        handle.state.lock().await.status = TaskStatus::Completed;
        let err = registry.request_stop("t1").await.unwrap_err();
        assert!(matches!(err, LinkageError::TaskNotRunning(_)));
    }

    #[tokio::test]
    async fn stop_sets_the_cancel_flag() {
        let registry = TaskRegistry::new();
        let handle = registry.try_begin(state("t1")).await.unwrap();
        registry.request_stop("t1").await.unwrap();
        assert!(handle.is_cancelled());
    }
}
