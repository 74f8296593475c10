//! Background task tracking and cancellation.
//!
//! The manager owns every live unit of work (its `JoinHandle`) and its
//! cancellation token, plus the handles callers query. Bookkeeping is
//! dropped by `cleanup_task`; handles stay for later status queries.

use std::collections::HashMap;
use std::future::Future;

use serde_json::json;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::bus::{Message, MessageBus, MessageType};
use crate::error::TaskError;
use crate::worker::state::{TaskHandle, TaskHandleRef, TaskStatus};

/// Live bookkeeping for a running unit of work.
#[derive(Debug)]
struct TrackedTask {
    join: JoinHandle<()>,
    cancel: CancellationToken,
}

/// Starts, tracks and cancels background units of work.
pub struct TaskManager {
    bus: MessageBus,
    /// Sender id used for cancel notices.
    manager_id: String,
    /// Running units of work, until cleaned up.
    tasks: RwLock<HashMap<String, TrackedTask>>,
    /// Every handle ever created, retained after completion.
    handles: RwLock<HashMap<String, TaskHandleRef>>,
}

impl TaskManager {
    /// Create a task manager that sends cancel notices over `bus`.
    pub fn new(bus: MessageBus, manager_id: impl Into<String>) -> Self {
        Self {
            bus,
            manager_id: manager_id.into(),
            tasks: RwLock::new(HashMap::new()),
            handles: RwLock::new(HashMap::new()),
        }
    }

    /// The bus this manager sends on.
    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    /// Start `unit` in the background and track it under the handle's task id.
    ///
    /// The handle is marked running before the unit is spawned. `unit`
    /// receives the shared handle and the cancellation token, and is
    /// responsible for recording its own terminal state.
    pub async fn create_task<F, Fut>(
        &self,
        handle: TaskHandle,
        unit: F,
    ) -> Result<TaskHandleRef, TaskError>
    where
        F: FnOnce(TaskHandleRef, CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let task_id = handle.task_id.clone();
        let mut handles = self.handles.write().await;
        if handles.contains_key(&task_id) {
            return Err(TaskError::AlreadyExists { task_id });
        }

        let mut handle = handle;
        handle.start().map_err(|_| TaskError::InvalidState {
            task_id: task_id.clone(),
            status: handle.status.to_string(),
            expected: TaskStatus::Pending.to_string(),
        })?;
        let shared = TaskHandleRef::new(handle);
        let cancel = CancellationToken::new();

        // Hold the task map across spawn so a fast unit cannot clean up
        // before it is tracked.
        let mut tasks = self.tasks.write().await;
        let join = tokio::spawn(unit(shared.clone(), cancel.clone()));
        tasks.insert(task_id.clone(), TrackedTask { join, cancel });
        handles.insert(task_id.clone(), shared.clone());
        drop(tasks);
        drop(handles);

        info!(task_id = %task_id, "Background task started");
        Ok(shared)
    }

    /// Get the handle for a task.
    pub async fn get_handle(&self, task_id: &str) -> Option<TaskHandleRef> {
        self.handles.read().await.get(task_id).cloned()
    }

    /// Copy of a task's current state.
    pub async fn snapshot(&self, task_id: &str) -> Result<TaskHandle, TaskError> {
        match self.get_handle(task_id).await {
            Some(handle) => Ok(handle.snapshot().await),
            None => Err(TaskError::NotFound {
                task_id: task_id.to_string(),
            }),
        }
    }

    /// The cooperative cancellation signal of a tracked task.
    pub async fn cancel_token(&self, task_id: &str) -> Option<CancellationToken> {
        self.tasks
            .read()
            .await
            .get(task_id)
            .map(|tracked| tracked.cancel.clone())
    }

    /// Request cooperative cancellation.
    ///
    /// Sets the task's cancellation signal and sends a `cancel_request` to
    /// the worker's mailbox if it still has one. The handle is left alone;
    /// the worker reports `cancelled` itself. Returns `false` only for a
    /// task this manager has never seen.
    pub async fn soft_cancel(&self, task_id: &str) -> bool {
        let handle = self.get_handle(task_id).await;
        let token = self.cancel_token(task_id).await;

        if handle.is_none() && token.is_none() {
            return false;
        }

        if let Some(token) = token {
            token.cancel();
        }

        if let Some(handle) = handle {
            let mailbox_id = handle.snapshot().await.mailbox_id;
            let notice = Message::new(
                MessageType::CancelRequest,
                self.manager_id.clone(),
                mailbox_id,
                json!({ "reason": "soft_cancel" }),
                task_id,
            );
            if let Err(e) = self.bus.send(notice).await {
                debug!(task_id = %task_id, error = %e, "Cancel request not delivered");
            }
        }

        info!(task_id = %task_id, "Soft cancel requested");
        true
    }

    /// Forcibly stop a task.
    ///
    /// Aborts the unit of work if it is still running and marks the handle
    /// `cancelled` unless it already holds a terminal status. Returns
    /// `true` for any known task, including one that already finished.
    pub async fn hard_cancel(&self, task_id: &str) -> bool {
        let handle = self.get_handle(task_id).await;
        // The aborted unit never reaches its own cleanup, so drop its bookkeeping here.
        let tracked = self.tasks.write().await.remove(task_id);

        if handle.is_none() && tracked.is_none() {
            return false;
        }

        if let Some(tracked) = tracked {
            tracked.cancel.cancel();
            if !tracked.join.is_finished() {
                tracked.join.abort();
            }
        }

        if let Some(handle) = handle {
            let cancelled = handle
                .update(|h| {
                    if h.status.is_terminal() {
                        false
                    } else {
                        h.cancel("cancelled").is_ok()
                    }
                })
                .await;

            if cancelled {
                info!(task_id = %task_id, "Task hard-cancelled");
            } else {
                debug!(task_id = %task_id, "Hard cancel on finished task, status kept");
            }
        }

        true
    }

    /// Drop a task's live bookkeeping. The handle is kept.
    pub async fn cleanup_task(&self, task_id: &str) {
        if self.tasks.write().await.remove(task_id).is_some() {
            debug!(task_id = %task_id, "Cleaned up task bookkeeping");
        }
    }

    /// Ids of tasks whose unit of work has not finished.
    pub async fn list_active_tasks(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .tasks
            .read()
            .await
            .iter()
            .filter(|(_, tracked)| !tracked.join.is_finished())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Check if a task id has ever been used.
    pub async fn contains(&self, task_id: &str) -> bool {
        self.handles.read().await.contains_key(task_id)
    }

    /// Answer the question a task is blocked on.
    ///
    /// Fails with `InvalidState` unless the task is `waiting_for_answer`.
    /// The handle goes back to `running` and the answer is forwarded on
    /// the bus against the recorded question.
    pub async fn answer(
        &self,
        task_id: &str,
        payload: serde_json::Value,
    ) -> Result<(), TaskError> {
        let handle = self
            .get_handle(task_id)
            .await
            .ok_or_else(|| TaskError::NotFound {
                task_id: task_id.to_string(),
            })?;

        let question = handle
            .update(|h| {
                if h.status != TaskStatus::WaitingForAnswer {
                    return Err(h.status);
                }
                Ok(h.resume())
            })
            .await
            .map_err(|status| TaskError::InvalidState {
                task_id: task_id.to_string(),
                status: status.to_string(),
                expected: TaskStatus::WaitingForAnswer.to_string(),
            })?;

        let question = question.ok_or_else(|| TaskError::InvalidState {
            task_id: task_id.to_string(),
            status: TaskStatus::WaitingForAnswer.to_string(),
            expected: "a recorded question".to_string(),
        })?;

        let route = self.bus.answer(&question, payload).await?;
        debug!(task_id = %task_id, route = ?route, "Answer forwarded");
        Ok(())
    }

    /// Counts per status across all known tasks.
    pub async fn summary(&self) -> TaskSummary {
        let handles: Vec<TaskHandleRef> = self.handles.read().await.values().cloned().collect();

        let mut summary = TaskSummary::default();
        for handle in handles {
            match handle.status().await {
                TaskStatus::Pending => summary.pending += 1,
                TaskStatus::Running => summary.running += 1,
                TaskStatus::WaitingForAnswer => summary.waiting_for_answer += 1,
                TaskStatus::Completed => summary.completed += 1,
                TaskStatus::Failed => summary.failed += 1,
                TaskStatus::Cancelled => summary.cancelled += 1,
            }
            summary.total += 1;
        }
        summary
    }

    /// Hard-cancel everything still tracked.
    pub async fn hard_cancel_all(&self) {
        let task_ids: Vec<String> = self.tasks.read().await.keys().cloned().collect();
        for task_id in task_ids {
            self.hard_cancel(&task_id).await;
        }
    }
}

/// Summary of all known tasks.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TaskSummary {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub waiting_for_answer: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}
