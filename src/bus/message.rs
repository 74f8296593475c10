//! Message envelope exchanged on the bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of a bus message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// A new task has been assigned to a worker.
    TaskAssigned,
    /// Progress update from a running task.
    TaskUpdate,
    /// Task finished successfully.
    TaskCompleted,
    /// Task failed with an error.
    TaskFailed,
    /// Worker is asking its parent a question.
    Question,
    /// Response to a question.
    Answer,
    /// Cooperative cancellation request.
    CancelRequest,
    /// Forced cancellation notice.
    CancelForced,
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::TaskAssigned => "task_assigned",
            Self::TaskUpdate => "task_update",
            Self::TaskCompleted => "task_completed",
            Self::TaskFailed => "task_failed",
            Self::Question => "question",
            Self::Answer => "answer",
            Self::CancelRequest => "cancel_request",
            Self::CancelForced => "cancel_forced",
        };
        write!(f, "{s}")
    }
}

/// Immutable envelope delivered to a worker's mailbox.
///
/// Fields are fixed at construction; the only builder step is attaching a
/// correlation id, which consumes the message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    id: Uuid,
    kind: MessageType,
    sender: String,
    receiver: String,
    payload: serde_json::Value,
    task_id: String,
    timestamp: DateTime<Utc>,
    correlation_id: Option<Uuid>,
}

impl Message {
    /// Create a fire-and-forget message with a fresh id and timestamp.
    pub fn new(
        kind: MessageType,
        sender: impl Into<String>,
        receiver: impl Into<String>,
        payload: serde_json::Value,
        task_id: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            sender: sender.into(),
            receiver: receiver.into(),
            payload,
            task_id: task_id.into(),
            timestamp: Utc::now(),
            correlation_id: None,
        }
    }

    /// Attach a correlation id linking a question to its answer.
    pub fn with_correlation(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Build the answer to `original`: addressed back to its sender, same
    /// task and correlation.
    pub fn answer_to(original: &Message, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: MessageType::Answer,
            sender: original.receiver.clone(),
            receiver: original.sender.clone(),
            payload,
            task_id: original.task_id.clone(),
            timestamp: Utc::now(),
            correlation_id: original.correlation_id,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> MessageType {
        self.kind
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    pub fn receiver(&self) -> &str {
        &self.receiver
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn correlation_id(&self) -> Option<Uuid> {
        self.correlation_id
    }

    /// Payload rendered as plain text: strings verbatim, anything else as JSON.
    pub fn payload_text(&self) -> String {
        match &self.payload {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}
