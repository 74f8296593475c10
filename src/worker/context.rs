//! Execution context handed to a running worker.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::state::TaskHandleRef;
use crate::bus::{Mailbox, MessageBus};
use crate::error::WorkerError;

/// Route back to the coordinating caller.
#[derive(Clone)]
struct ParentLink {
    bus: MessageBus,
    parent_id: String,
    timeout: Duration,
}

/// What a worker can see and do while it runs: its identity, the
/// cooperative cancellation signal, its inbox, and the ask-parent channel.
#[derive(Clone)]
pub struct WorkerContext {
    task_id: String,
    agent_id: String,
    cancel: CancellationToken,
    handle: Option<TaskHandleRef>,
    parent: Option<ParentLink>,
    inbox: Option<Mailbox>,
    /// Shared by clones: the handle tracks one outstanding question.
    ask_turn: Arc<Mutex<()>>,
}

impl WorkerContext {
    /// A context with no route to the parent and its own cancellation token.
    pub fn detached(task_id: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self::new(task_id, agent_id, CancellationToken::new())
    }

    pub fn new(
        task_id: impl Into<String>,
        agent_id: impl Into<String>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            agent_id: agent_id.into(),
            cancel,
            handle: None,
            parent: None,
            inbox: None,
            ask_turn: Arc::new(Mutex::new(())),
        }
    }

    /// Track questions on `handle` (waiting_for_answer while blocked).
    pub fn with_handle(mut self, handle: TaskHandleRef) -> Self {
        self.handle = Some(handle);
        self
    }

    /// Enable [`WorkerContext::ask_parent`] over `bus`.
    pub fn with_parent(
        mut self,
        bus: MessageBus,
        parent_id: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        self.parent = Some(ParentLink {
            bus,
            parent_id: parent_id.into(),
            timeout,
        });
        self
    }

    pub fn with_inbox(mut self, inbox: Mailbox) -> Self {
        self.inbox = Some(inbox);
        self
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Mailbox id of this worker instance.
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Messages addressed to this worker (cancel requests, late answers).
    pub fn inbox(&self) -> Option<&Mailbox> {
        self.inbox.as_ref()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once cancellation has been requested.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// `Err(Cancelled)` once cancellation has been requested.
    pub fn checkpoint(&self) -> Result<(), WorkerError> {
        if self.cancel.is_cancelled() {
            Err(WorkerError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Ask the parent a question and wait for the answer text.
    ///
    /// While blocked the task handle reads `waiting_for_answer`. A soft
    /// cancel interrupts the wait. Concurrent asks from clones of the same
    /// context are sent one at a time, in call order.
    pub async fn ask_parent(&self, question: impl Into<String>) -> Result<String, WorkerError> {
        let link = self.parent.as_ref().ok_or(WorkerError::NoParentChannel)?;
        self.checkpoint()?;

        let _turn = tokio::select! {
            turn = self.ask_turn.lock() => turn,
            _ = self.cancel.cancelled() => return Err(WorkerError::Cancelled),
        };

        let pending = link.bus.prepare_question(
            &self.agent_id,
            &link.parent_id,
            serde_json::Value::String(question.into()),
            &self.task_id,
        )?;

        if let Some(handle) = &self.handle {
            let message = pending.message().clone();
            if let Err(e) = handle.update(|h| h.await_answer(&message)).await {
                debug!(task_id = %self.task_id, error = %e, "Handle not updated for question");
            }
        }

        let outcome = tokio::select! {
            answer = link.bus.ask_with(pending, link.timeout) => answer.map_err(WorkerError::from),
            _ = self.cancel.cancelled() => Err(WorkerError::Cancelled),
        };

        if let Some(handle) = &self.handle {
            handle
                .update(|h| {
                    h.resume();
                })
                .await;
        }

        outcome.map(|answer| answer.payload_text())
    }
}

impl std::fmt::Debug for WorkerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerContext")
            .field("task_id", &self.task_id)
            .field("agent_id", &self.agent_id)
            .field("cancelled", &self.cancel.is_cancelled())
            .field("can_ask", &self.parent.is_some())
            .finish()
    }
}
