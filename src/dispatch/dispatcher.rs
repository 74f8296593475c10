//! Dispatch layer — runs a task against a named worker, blocking or in the background.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::{Mailbox, Message, MessageBus};
use crate::config::DelegationConfig;
use crate::dispatch::mode::{
    Complexity, ExecutionMode, ResolvedMode, TaskCharacteristics, WorkerPreference, decide,
};
use crate::error::{BusError, DispatchError, TaskError, WorkerError};
use crate::worker::{
    TaskHandle, TaskHandleRef, TaskManager, TaskPriority, WorkerContext, WorkerRequest,
    WorkerRunner,
};

/// Length of generated task ids.
const TASK_ID_LEN: usize = 8;

/// Characters of a description shown in task listings.
const DESCRIPTION_PREVIEW: usize = 50;

/// A worker that tasks can be dispatched to.
pub struct WorkerSpec {
    pub name: String,
    pub description: String,
    pub preference: WorkerPreference,
    /// Whether background runs get a route to ask the parent.
    pub can_ask_questions: bool,
    pub runner: Arc<dyn WorkerRunner>,
}

impl WorkerSpec {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        runner: Arc<dyn WorkerRunner>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            preference: WorkerPreference::default(),
            can_ask_questions: true,
            runner,
        }
    }

    pub fn with_preference(mut self, preference: WorkerPreference) -> Self {
        self.preference = preference;
        self
    }

    pub fn with_questions(mut self, can_ask_questions: bool) -> Self {
        self.can_ask_questions = can_ask_questions;
        self
    }
}

impl std::fmt::Debug for WorkerSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerSpec")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("preference", &self.preference)
            .field("can_ask_questions", &self.can_ask_questions)
            .finish()
    }
}

/// A request to run a task.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub worker: String,
    pub description: String,
    /// `None` uses the configured default mode.
    pub mode: Option<ExecutionMode>,
    pub priority: TaskPriority,
    /// Overrides the worker's typical complexity.
    pub complexity: Option<Complexity>,
    pub requires_user_context: bool,
    pub may_need_clarification: bool,
}

impl DispatchRequest {
    pub fn new(worker: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            worker: worker.into(),
            description: description.into(),
            mode: None,
            priority: TaskPriority::Normal,
            complexity: None,
            requires_user_context: false,
            may_need_clarification: false,
        }
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_complexity(mut self, complexity: Complexity) -> Self {
        self.complexity = Some(complexity);
        self
    }

    pub fn requiring_user_context(mut self) -> Self {
        self.requires_user_context = true;
        self
    }

    pub fn needing_clarification(mut self) -> Self {
        self.may_need_clarification = true;
        self
    }

    /// Characteristics for the decision engine: request hints first, then
    /// the worker's typical values.
    pub fn characteristics(&self, preference: &WorkerPreference) -> TaskCharacteristics {
        TaskCharacteristics {
            estimated_complexity: self
                .complexity
                .or(preference.typical_complexity)
                .unwrap_or_default(),
            requires_user_context: self.requires_user_context
                || preference.typically_needs_context,
            may_need_clarification: self.may_need_clarification,
            ..TaskCharacteristics::default()
        }
    }
}

/// Result of a dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Ran synchronously to completion.
    Completed {
        task_id: String,
        worker: String,
        output: String,
    },
    /// Started in the background.
    Started {
        task_id: String,
        worker: String,
        mailbox_id: String,
    },
}

impl DispatchOutcome {
    pub fn task_id(&self) -> &str {
        match self {
            Self::Completed { task_id, .. } | Self::Started { task_id, .. } => task_id,
        }
    }

    pub fn mode(&self) -> ResolvedMode {
        match self {
            Self::Completed { .. } => ResolvedMode::Sync,
            Self::Started { .. } => ResolvedMode::Async,
        }
    }
}

impl std::fmt::Display for DispatchOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Completed { output, .. } => write!(f, "{output}"),
            Self::Started { task_id, worker, .. } => write!(
                f,
                "Task started in background.\nTask ID: {task_id}\nWorker: {worker}\nCheck status with task id '{task_id}'."
            ),
        }
    }
}

/// Unregisters a worker's mailbox when the unit of work ends or is aborted.
struct MailboxLease {
    bus: MessageBus,
    agent_id: String,
}

impl Drop for MailboxLease {
    fn drop(&mut self) {
        self.bus.unregister(&self.agent_id);
    }
}

/// Application root for delegation: owns the bus, the task manager, and
/// the workers tasks can be sent to.
pub struct Dispatcher {
    config: DelegationConfig,
    bus: MessageBus,
    tasks: Arc<TaskManager>,
    workers: RwLock<HashMap<String, Arc<WorkerSpec>>>,
    parent_inbox: Mailbox,
}

impl Dispatcher {
    /// Create a dispatcher with a fresh bus and register the parent mailbox.
    pub fn new(config: DelegationConfig) -> Result<Self, BusError> {
        Self::with_bus(config, MessageBus::new())
    }

    /// Create a dispatcher on an existing bus.
    pub fn with_bus(config: DelegationConfig, bus: MessageBus) -> Result<Self, BusError> {
        let parent_inbox = bus.register(config.parent_id.clone())?;
        let tasks = Arc::new(TaskManager::new(bus.clone(), config.manager_id.clone()));
        Ok(Self {
            config,
            bus,
            tasks,
            workers: RwLock::new(HashMap::new()),
            parent_inbox,
        })
    }

    pub fn config(&self) -> &DelegationConfig {
        &self.config
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub fn tasks(&self) -> &Arc<TaskManager> {
        &self.tasks
    }

    /// Make a worker available. Replaces any worker with the same name.
    pub async fn register_worker(&self, spec: WorkerSpec) {
        let name = spec.name.clone();
        if self
            .workers
            .write()
            .await
            .insert(name.clone(), Arc::new(spec))
            .is_some()
        {
            warn!(worker = %name, "Replaced existing worker");
        } else {
            debug!(worker = %name, "Registered worker");
        }
    }

    /// Names of all workers, sorted.
    pub async fn worker_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.workers.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Run a task against a worker.
    ///
    /// Sync runs return the worker's output; async runs return the task id
    /// immediately and record the outcome on the task handle.
    pub async fn dispatch(&self, request: DispatchRequest) -> Result<DispatchOutcome, DispatchError> {
        let spec = self.workers.read().await.get(&request.worker).cloned();
        let Some(spec) = spec else {
            return Err(DispatchError::UnknownWorker {
                name: request.worker.clone(),
                available: self.worker_names().await.join(", "),
            });
        };

        let mode = request.mode.unwrap_or(self.config.default_mode);
        let characteristics = request.characteristics(&spec.preference);
        let resolved = decide(&characteristics, Some(&spec.preference), Some(mode));
        let task_id = self.next_task_id().await;

        debug!(
            task_id = %task_id,
            worker = %spec.name,
            requested = %mode,
            resolved = %resolved,
            "Resolved execution mode"
        );

        match resolved {
            ResolvedMode::Sync => self.run_sync(spec, request, task_id).await,
            ResolvedMode::Async => self.run_async(spec, request, task_id).await,
        }
    }

    async fn run_sync(
        &self,
        spec: Arc<WorkerSpec>,
        request: DispatchRequest,
        task_id: String,
    ) -> Result<DispatchOutcome, DispatchError> {
        info!(task_id = %task_id, worker = %spec.name, "Running task synchronously");

        let ctx = WorkerContext::detached(task_id.clone(), spec.name.clone());
        let worker_request = WorkerRequest {
            task_id: task_id.clone(),
            worker_name: spec.name.clone(),
            description: request.description,
        };

        match AssertUnwindSafe(spec.runner.run(worker_request, ctx))
            .catch_unwind()
            .await
        {
            Ok(Ok(output)) => Ok(DispatchOutcome::Completed {
                task_id,
                worker: spec.name.clone(),
                output,
            }),
            Ok(Err(e)) => Err(DispatchError::WorkerFailed {
                worker: spec.name.clone(),
                reason: format!("{e:#}"),
            }),
            Err(panic) => Err(DispatchError::WorkerFailed {
                worker: spec.name.clone(),
                reason: format!("worker panicked: {}", panic_message(panic.as_ref())),
            }),
        }
    }

    async fn run_async(
        &self,
        spec: Arc<WorkerSpec>,
        request: DispatchRequest,
        task_id: String,
    ) -> Result<DispatchOutcome, DispatchError> {
        let agent_id = format!("{}{}", self.config.mailbox_prefix, task_id);
        let inbox = match self.bus.register(agent_id.clone()) {
            Ok(inbox) => inbox,
            Err(e) => self.bus.mailbox(&agent_id).ok_or(e)?,
        };

        let handle = TaskHandle::new(task_id.clone(), spec.name.clone(), request.description.clone())
            .with_priority(request.priority)
            .with_mailbox(agent_id.clone());

        let worker_request = WorkerRequest {
            task_id: task_id.clone(),
            worker_name: spec.name.clone(),
            description: request.description,
        };

        // Owned by the unit's future from creation, so an abort before the
        // first poll still releases the mailbox.
        let lease = MailboxLease {
            bus: self.bus.clone(),
            agent_id: agent_id.clone(),
        };

        let bus = self.bus.clone();
        let tasks = Arc::clone(&self.tasks);
        let parent_id = self.config.parent_id.clone();
        let ask_timeout = self.config.ask_timeout;
        let unit_spec = Arc::clone(&spec);
        let unit_task_id = task_id.clone();
        let unit_agent_id = agent_id.clone();

        self.tasks
            .create_task(handle, move |handle, cancel| async move {
                let _lease = lease;

                let mut ctx = WorkerContext::new(unit_task_id.clone(), unit_agent_id, cancel)
                    .with_handle(handle.clone())
                    .with_inbox(inbox);
                if unit_spec.can_ask_questions {
                    ctx = ctx.with_parent(bus, parent_id, ask_timeout);
                }

                let outcome = AssertUnwindSafe(unit_spec.runner.run(worker_request, ctx))
                    .catch_unwind()
                    .await;
                record_outcome(&handle, &unit_task_id, outcome).await;
                tasks.cleanup_task(&unit_task_id).await;
            })
            .await?;

        Ok(DispatchOutcome::Started {
            task_id,
            worker: spec.name.clone(),
            mailbox_id: agent_id,
        })
    }

    async fn next_task_id(&self) -> String {
        loop {
            let id: String = Uuid::new_v4()
                .simple()
                .to_string()
                .chars()
                .take(TASK_ID_LEN)
                .collect();
            if !self.tasks.contains(&id).await {
                return id;
            }
        }
    }

    /// Current state of a task.
    pub async fn task_status(&self, task_id: &str) -> Result<TaskHandle, TaskError> {
        self.tasks.snapshot(task_id).await
    }

    /// Shared handle of a task, for callers that want to watch it.
    pub async fn task_handle(&self, task_id: &str) -> Option<TaskHandleRef> {
        self.tasks.get_handle(task_id).await
    }

    /// Human-readable status of a task.
    pub async fn check_task(&self, task_id: &str) -> Result<String, TaskError> {
        Ok(self.task_status(task_id).await?.status_report())
    }

    /// Answer the question a background task is waiting on.
    pub async fn answer_task(&self, task_id: &str, answer: impl Into<String>) -> Result<(), TaskError> {
        self.tasks
            .answer(task_id, serde_json::Value::String(answer.into()))
            .await?;
        info!(task_id = %task_id, "Answered task question");
        Ok(())
    }

    /// Handles of tasks still running in the background.
    pub async fn list_active_tasks(&self) -> Vec<TaskHandle> {
        let mut active = Vec::new();
        for task_id in self.tasks.list_active_tasks().await {
            if let Ok(handle) = self.tasks.snapshot(&task_id).await {
                active.push(handle);
            }
        }
        active
    }

    /// One line per active task.
    pub async fn describe_active_tasks(&self) -> String {
        let active = self.list_active_tasks().await;
        if active.is_empty() {
            return "No active background tasks.".to_string();
        }

        let mut lines = vec!["Active background tasks:".to_string()];
        for handle in active {
            let preview: String = handle.description.chars().take(DESCRIPTION_PREVIEW).collect();
            lines.push(format!(
                "- {}: {} ({}) - {}...",
                handle.task_id, handle.worker_name, handle.status, preview
            ));
        }
        lines.join("\n")
    }

    /// Request cooperative cancellation. `false` if the task is unknown.
    pub async fn soft_cancel_task(&self, task_id: &str) -> bool {
        self.tasks.soft_cancel(task_id).await
    }

    /// Forcibly cancel. `false` if the task is unknown.
    pub async fn hard_cancel_task(&self, task_id: &str) -> bool {
        self.tasks.hard_cancel(task_id).await
    }

    /// Drain the parent mailbox (worker questions, late answers), waiting up
    /// to `timeout` for a first message.
    pub async fn parent_messages(&self, timeout: Duration) -> Vec<Message> {
        self.parent_inbox.collect(timeout).await
    }

    /// Hard-cancel every background task.
    pub async fn shutdown(&self) {
        self.tasks.hard_cancel_all().await;
        info!("Dispatcher shut down");
    }
}

/// Write the single terminal state for a finished unit of work.
async fn record_outcome(
    handle: &TaskHandleRef,
    task_id: &str,
    outcome: Result<anyhow::Result<String>, Box<dyn Any + Send>>,
) {
    let recorded = handle
        .update(|h| match outcome {
            Ok(Ok(output)) => h.complete(output),
            Ok(Err(e)) if is_cancellation(&e) => h.cancel("cancelled"),
            Ok(Err(e)) => h.fail(format!("{e:#}")),
            Err(panic) => h.fail(format!("worker panicked: {}", panic_message(panic.as_ref()))),
        })
        .await;

    match recorded {
        Ok(()) => {
            let status = handle.status().await;
            info!(task_id = %task_id, status = %status, "Background task finished");
        }
        Err(e) => {
            debug!(task_id = %task_id, error = %e, "Outcome not recorded, task already final");
        }
    }
}

fn is_cancellation(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| matches!(cause.downcast_ref::<WorkerError>(), Some(WorkerError::Cancelled)))
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
