//! Task state machine and the shared task handle.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::bus::Message;

/// Status of a delegated task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Task is created but not started.
    Pending,
    /// Task is currently executing.
    Running,
    /// Task is blocked on an answer from its parent.
    WaitingForAnswer,
    /// Task finished successfully.
    Completed,
    /// Task failed with an error.
    Failed,
    /// Task was cancelled.
    Cancelled,
}

impl TaskStatus {
    /// Check if this status allows transitioning to another status.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        matches!(
            (self, target),
            // From Pending
            (Pending, Running) | (Pending, Cancelled) |
            // From Running
            (Running, WaitingForAnswer) | (Running, Completed) |
            (Running, Failed) | (Running, Cancelled) |
            // From WaitingForAnswer
            (WaitingForAnswer, Running) | (WaitingForAnswer, Failed) |
            (WaitingForAnswer, Cancelled)
        )
    }

    /// Check if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Check if the task is active (not terminal).
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::WaitingForAnswer => "waiting_for_answer",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Priority of a background task. Recorded only; it does not reorder execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl std::fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Critical => "critical",
        };
        write!(f, "{s}")
    }
}

/// A status transition event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    /// Previous status.
    pub from: TaskStatus,
    /// New status.
    pub to: TaskStatus,
    /// When the transition occurred.
    pub timestamp: DateTime<Utc>,
    /// Reason for the transition.
    pub reason: Option<String>,
}

/// Status record for one delegated task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskHandle {
    /// Unique task ID.
    pub task_id: String,
    /// Name of the worker executing the task.
    pub worker_name: String,
    /// Mailbox id of the worker instance (receives cancel requests).
    pub mailbox_id: String,
    /// Task description.
    pub description: String,
    /// Current status.
    pub status: TaskStatus,
    /// Recorded priority.
    pub priority: TaskPriority,
    /// When the task was created.
    pub created_at: DateTime<Utc>,
    /// When execution started.
    pub started_at: Option<DateTime<Utc>>,
    /// When execution finished.
    pub completed_at: Option<DateTime<Utc>>,
    /// Output, once completed.
    pub result: Option<String>,
    /// Error text, once failed or cancelled.
    pub error: Option<String>,
    /// Question text while waiting for an answer.
    pub pending_question: Option<String>,
    /// The question message awaiting an answer, if any.
    #[serde(skip)]
    pub question_message: Option<Message>,
    /// Status transition history.
    pub transitions: Vec<StateTransition>,
}

impl TaskHandle {
    /// Create a pending handle. The mailbox id defaults to the worker name.
    pub fn new(
        task_id: impl Into<String>,
        worker_name: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        let worker_name = worker_name.into();
        Self {
            task_id: task_id.into(),
            mailbox_id: worker_name.clone(),
            worker_name,
            description: description.into(),
            status: TaskStatus::Pending,
            priority: TaskPriority::Normal,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            pending_question: None,
            question_message: None,
            transitions: Vec::new(),
        }
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_mailbox(mut self, mailbox_id: impl Into<String>) -> Self {
        self.mailbox_id = mailbox_id.into();
        self
    }

    /// Transition to a new status.
    pub fn transition_to(
        &mut self,
        new_status: TaskStatus,
        reason: Option<String>,
    ) -> Result<(), String> {
        if !self.status.can_transition_to(new_status) {
            return Err(format!(
                "Cannot transition from {} to {}",
                self.status, new_status
            ));
        }

        self.transitions.push(StateTransition {
            from: self.status,
            to: new_status,
            timestamp: Utc::now(),
            reason,
        });

        // Questions can bounce a task between running and waiting many times
        const MAX_TRANSITIONS: usize = 200;
        if self.transitions.len() > MAX_TRANSITIONS {
            let drain_count = self.transitions.len() - MAX_TRANSITIONS;
            self.transitions.drain(..drain_count);
        }

        self.status = new_status;

        match new_status {
            TaskStatus::Running if self.started_at.is_none() => {
                self.started_at = Some(Utc::now());
            }
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled => {
                self.completed_at = Some(Utc::now());
                self.pending_question = None;
                self.question_message = None;
            }
            _ => {}
        }

        Ok(())
    }

    /// Mark the task running.
    pub fn start(&mut self) -> Result<(), String> {
        self.transition_to(TaskStatus::Running, None)
    }

    /// Record a successful result.
    pub fn complete(&mut self, result: impl Into<String>) -> Result<(), String> {
        self.transition_to(TaskStatus::Completed, None)?;
        self.result = Some(result.into());
        Ok(())
    }

    /// Record a failure.
    pub fn fail(&mut self, error: impl Into<String>) -> Result<(), String> {
        let error = error.into();
        self.transition_to(TaskStatus::Failed, Some(error.clone()))?;
        self.error = Some(error);
        Ok(())
    }

    /// Record cancellation.
    pub fn cancel(&mut self, reason: impl Into<String>) -> Result<(), String> {
        let reason = reason.into();
        self.transition_to(TaskStatus::Cancelled, Some(reason.clone()))?;
        self.error = Some(reason);
        Ok(())
    }

    /// Block on a question to the parent.
    pub fn await_answer(&mut self, question: &Message) -> Result<(), String> {
        self.transition_to(TaskStatus::WaitingForAnswer, Some("Asked parent".to_string()))?;
        self.pending_question = Some(question.payload_text());
        self.question_message = Some(question.clone());
        Ok(())
    }

    /// Leave the waiting state. Returns the question that was outstanding.
    pub fn resume(&mut self) -> Option<Message> {
        if self.status != TaskStatus::WaitingForAnswer {
            return None;
        }
        // WaitingForAnswer -> Running is always allowed
        let _ = self.transition_to(TaskStatus::Running, Some("Answer received".to_string()));
        self.pending_question = None;
        self.question_message.take()
    }

    /// Time since the task started, up to completion if finished.
    pub fn elapsed(&self) -> Option<Duration> {
        self.started_at.map(|start| {
            let end = self.completed_at.unwrap_or_else(Utc::now);
            end.signed_duration_since(start)
                .to_std()
                .unwrap_or(Duration::ZERO)
        })
    }

    /// Human-readable status block.
    pub fn status_report(&self) -> String {
        let mut lines = vec![
            format!("Task: {}", self.task_id),
            format!("Worker: {}", self.worker_name),
            format!("Status: {}", self.status),
            format!("Description: {}", self.description),
        ];

        match self.status {
            TaskStatus::Completed => {
                lines.push(format!("Result: {}", self.result.as_deref().unwrap_or("")));
            }
            TaskStatus::Failed | TaskStatus::Cancelled => {
                lines.push(format!("Error: {}", self.error.as_deref().unwrap_or("")));
            }
            TaskStatus::WaitingForAnswer => {
                lines.push(format!(
                    "Question: {}",
                    self.pending_question.as_deref().unwrap_or("")
                ));
            }
            TaskStatus::Running | TaskStatus::Pending => {
                if let Some(elapsed) = self.elapsed() {
                    lines.push(format!("Running for: {:.1}s", elapsed.as_secs_f64()));
                }
            }
        }

        lines.join("\n")
    }
}

/// Shared reference to a [`TaskHandle`].
///
/// Callers read through it; only the task's own unit of work and the task
/// manager's cancel operations write.
#[derive(Debug, Clone)]
pub struct TaskHandleRef(Arc<RwLock<TaskHandle>>);

impl TaskHandleRef {
    pub fn new(handle: TaskHandle) -> Self {
        Self(Arc::new(RwLock::new(handle)))
    }

    /// Copy of the current state.
    pub async fn snapshot(&self) -> TaskHandle {
        self.0.read().await.clone()
    }

    pub async fn status(&self) -> TaskStatus {
        self.0.read().await.status
    }

    /// Apply a mutation under the write lock.
    pub async fn update<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut TaskHandle) -> R,
    {
        let mut handle = self.0.write().await;
        f(&mut handle)
    }
}
