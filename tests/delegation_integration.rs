//! End-to-end tests for delegation: bus correlation, background tasks,
//! cancellation, and dispatch.
//!
//! Everything runs in-process against the public API.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::time::timeout;

use subagents::bus::{Message, MessageBus, MessageType};
use subagents::config::DelegationConfig;
use subagents::dispatch::{DispatchOutcome, DispatchRequest, Dispatcher, ExecutionMode, WorkerSpec};
use subagents::error::{TaskError, WorkerError};
use subagents::worker::{
    FnRunner, TaskHandle, TaskHandleRef, TaskManager, TaskStatus, WorkerContext, WorkerRequest,
};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Poll a handle until it reaches `status`.
async fn wait_for(handle: &TaskHandleRef, status: TaskStatus) {
    timeout(TEST_TIMEOUT, async {
        while handle.status().await != status {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("task never reached {status}"));
}

#[tokio::test]
async fn question_round_trip_completes_task() {
    timeout(TEST_TIMEOUT, async {
        let bus = MessageBus::new();
        let parent = bus.register("parent").unwrap();
        bus.register("w1").unwrap();
        let manager = TaskManager::new(bus.clone(), "task_manager");

        let ctx_bus = bus.clone();
        let handle = manager
            .create_task(
                TaskHandle::new("T1", "w1", "look something up"),
                move |handle, cancel| async move {
                    let ctx = WorkerContext::new("T1", "w1", cancel)
                        .with_handle(handle.clone())
                        .with_parent(ctx_bus, "parent", Duration::from_secs(5));
                    let outcome = ctx.ask_parent("need info").await;
                    let _ = handle
                        .update(|h| match outcome {
                            Ok(answer) if answer == "here it is" => h.complete("done"),
                            Ok(answer) => h.fail(format!("unexpected answer {answer}")),
                            Err(e) => h.fail(e.to_string()),
                        })
                        .await;
                },
            )
            .await
            .unwrap();

        let question = parent.recv().await.unwrap();
        assert_eq!(question.kind(), MessageType::Question);
        assert_eq!(question.sender(), "w1");
        assert_eq!(question.task_id(), "T1");
        assert_eq!(question.payload_text(), "need info");
        assert!(question.correlation_id().is_some());

        let waiting = handle.snapshot().await;
        assert_eq!(waiting.status, TaskStatus::WaitingForAnswer);
        assert_eq!(waiting.pending_question.as_deref(), Some("need info"));

        manager.answer("T1", json!("here it is")).await.unwrap();
        wait_for(&handle, TaskStatus::Completed).await;

        let done = handle.snapshot().await;
        assert_eq!(done.result.as_deref(), Some("done"));
        assert!(done.completed_at.is_some());
        assert!(done.pending_question.is_none());

        let path: Vec<(TaskStatus, TaskStatus)> =
            done.transitions.iter().map(|t| (t.from, t.to)).collect();
        assert_eq!(
            path,
            vec![
                (TaskStatus::Pending, TaskStatus::Running),
                (TaskStatus::Running, TaskStatus::WaitingForAnswer),
                (TaskStatus::WaitingForAnswer, TaskStatus::Running),
                (TaskStatus::Running, TaskStatus::Completed),
            ]
        );

        // Answer was delivered through the correlation slot, not the mailbox
        assert_eq!(bus.pending_questions(), 0);
        assert!(parent.try_recv().await.is_none());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn hard_cancel_is_final() {
    timeout(TEST_TIMEOUT, async {
        let bus = MessageBus::new();
        let manager = TaskManager::new(bus, "task_manager");

        let handle = manager
            .create_task(TaskHandle::new("T2", "w1", "spin"), |handle, _cancel| async move {
                // Ignores cooperative cancellation entirely
                tokio::time::sleep(Duration::from_secs(60)).await;
                let _ = handle.update(|h| h.complete("too late")).await;
            })
            .await
            .unwrap();

        assert!(manager.hard_cancel("T2").await);

        let cancelled = handle.snapshot().await;
        assert_eq!(cancelled.status, TaskStatus::Cancelled);
        assert!(cancelled.completed_at.is_some());
        assert!(manager.list_active_tasks().await.is_empty());

        tokio::time::sleep(Duration::from_millis(50)).await;
        let later = handle.snapshot().await;
        assert_eq!(later.status, TaskStatus::Cancelled);
        assert!(later.result.is_none());
        assert_eq!(later.completed_at, cancelled.completed_at);

        // Still known, so repeated cancels are accepted no-ops
        assert!(manager.hard_cancel("T2").await);
        assert!(manager.soft_cancel("T2").await);
        assert!(!manager.hard_cancel("missing").await);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn mailbox_preserves_fifo_per_sender() {
    timeout(TEST_TIMEOUT, async {
        let bus = MessageBus::new();
        let inbox = bus.register("sink").unwrap();

        let mut senders = Vec::new();
        for sender in ["a", "b", "c"] {
            let bus = bus.clone();
            senders.push(tokio::spawn(async move {
                for seq in 0..50 {
                    bus.send(subagents::bus::Message::new(
                        MessageType::TaskUpdate,
                        sender,
                        "sink",
                        json!(seq),
                        "T",
                    ))
                    .await
                    .unwrap();
                }
            }));
        }
        for sender in senders {
            sender.await.unwrap();
        }

        let messages = bus.get_messages("sink", Duration::ZERO).await.unwrap();
        assert_eq!(messages.len(), 150);
        for sender in ["a", "b", "c"] {
            let seqs: Vec<i64> = messages
                .iter()
                .filter(|m| m.sender() == sender)
                .map(|m| m.payload().as_i64().unwrap())
                .collect();
            assert_eq!(seqs, (0..50).collect::<Vec<_>>());
        }
        assert!(inbox.try_recv().await.is_none());
    })
    .await
    .expect("test timed out");
}

fn clarifying_worker() -> WorkerSpec {
    WorkerSpec::new(
        "researcher",
        "asks before answering",
        Arc::new(FnRunner::new(|request: WorkerRequest, ctx: WorkerContext| async move {
            let scope = ctx.ask_parent("which scope?").await?;
            Ok::<_, anyhow::Error>(format!("{} within {}", request.description, scope))
        })),
    )
}

#[tokio::test]
async fn dispatcher_async_flow_with_question() {
    timeout(TEST_TIMEOUT, async {
        let dispatcher = Dispatcher::new(DelegationConfig::default()).unwrap();
        dispatcher.register_worker(clarifying_worker()).await;

        let outcome = dispatcher
            .dispatch(DispatchRequest::new("researcher", "survey").with_mode(ExecutionMode::Async))
            .await
            .unwrap();
        let DispatchOutcome::Started { task_id, .. } = outcome else {
            panic!("expected a background task");
        };

        let questions = dispatcher.parent_messages(TEST_TIMEOUT).await;
        assert_eq!(questions.len(), 1);
        assert_eq!(questions[0].task_id(), task_id);

        let report = dispatcher.check_task(&task_id).await.unwrap();
        assert!(report.contains("Status: waiting_for_answer"));
        assert!(report.contains("Question: which scope?"));

        dispatcher.answer_task(&task_id, "europe").await.unwrap();

        let handle = dispatcher.task_handle(&task_id).await.unwrap();
        wait_for(&handle, TaskStatus::Completed).await;
        assert_eq!(
            handle.snapshot().await.result.as_deref(),
            Some("survey within europe")
        );

        // A second answer is rejected: the task is no longer waiting
        let err = dispatcher.answer_task(&task_id, "again").await.unwrap_err();
        assert!(matches!(err, TaskError::InvalidState { .. }));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn soft_cancel_interrupts_pending_question() {
    timeout(TEST_TIMEOUT, async {
        let dispatcher = Dispatcher::new(DelegationConfig::default()).unwrap();
        dispatcher.register_worker(clarifying_worker()).await;

        let outcome = dispatcher
            .dispatch(DispatchRequest::new("researcher", "survey").with_mode(ExecutionMode::Async))
            .await
            .unwrap();
        let task_id = outcome.task_id().to_string();
        let handle = dispatcher.task_handle(&task_id).await.unwrap();
        wait_for(&handle, TaskStatus::WaitingForAnswer).await;

        assert!(dispatcher.soft_cancel_task(&task_id).await);
        wait_for(&handle, TaskStatus::Cancelled).await;

        let cancelled = handle.snapshot().await;
        assert_eq!(cancelled.error.as_deref(), Some("cancelled"));
        assert_eq!(dispatcher.bus().pending_questions(), 0);

        while !dispatcher.list_active_tasks().await.is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn unanswered_question_fails_task_after_timeout() {
    timeout(TEST_TIMEOUT, async {
        let config = DelegationConfig {
            ask_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let dispatcher = Dispatcher::new(config).unwrap();
        dispatcher.register_worker(clarifying_worker()).await;

        let outcome = dispatcher
            .dispatch(DispatchRequest::new("researcher", "survey").with_mode(ExecutionMode::Async))
            .await
            .unwrap();
        let handle = dispatcher.task_handle(outcome.task_id()).await.unwrap();
        wait_for(&handle, TaskStatus::Failed).await;

        let failed = handle.snapshot().await;
        assert_eq!(
            failed.error.as_deref(),
            Some(
                WorkerError::ParentTimeout {
                    timeout: Duration::from_millis(50)
                }
                .to_string()
                .as_str()
            )
        );
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn dispatcher_sync_and_shutdown() {
    timeout(TEST_TIMEOUT, async {
        let dispatcher = Dispatcher::new(DelegationConfig::default()).unwrap();
        dispatcher
            .register_worker(WorkerSpec::new(
                "echo",
                "echoes",
                Arc::new(FnRunner::new(|request: WorkerRequest, ctx: WorkerContext| async move {
                    if request.description == "wait" {
                        ctx.cancelled().await;
                    }
                    Ok::<_, anyhow::Error>(request.description)
                })),
            ))
            .await;

        let outcome = dispatcher
            .dispatch(DispatchRequest::new("echo", "now"))
            .await
            .unwrap();
        assert_eq!(outcome.to_string(), "now");

        let started = dispatcher
            .dispatch(DispatchRequest::new("echo", "wait").with_mode(ExecutionMode::Async))
            .await
            .unwrap();
        assert_eq!(dispatcher.list_active_tasks().await.len(), 1);

        dispatcher.shutdown().await;
        let status = dispatcher.task_status(started.task_id()).await.unwrap();
        assert_eq!(status.status, TaskStatus::Cancelled);
        assert!(dispatcher.list_active_tasks().await.is_empty());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn hard_cancel_right_after_dispatch_releases_mailbox() {
    timeout(TEST_TIMEOUT, async {
        let dispatcher = Dispatcher::new(DelegationConfig::default()).unwrap();
        dispatcher
            .register_worker(WorkerSpec::new(
                "sleeper",
                "sleeps",
                Arc::new(FnRunner::new(|_req: WorkerRequest, _ctx: WorkerContext| async move {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok::<_, anyhow::Error>("woke".to_string())
                })),
            ))
            .await;

        let outcome = dispatcher
            .dispatch(DispatchRequest::new("sleeper", "nap").with_mode(ExecutionMode::Async))
            .await
            .unwrap();
        let DispatchOutcome::Started { task_id, mailbox_id, .. } = outcome else {
            panic!("expected a background task");
        };

        // Cancelled before the unit of work is ever polled
        assert!(dispatcher.hard_cancel_task(&task_id).await);
        assert_eq!(
            dispatcher.task_status(&task_id).await.unwrap().status,
            TaskStatus::Cancelled
        );

        while dispatcher.bus().is_registered(&mailbox_id) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(dispatcher.bus().registered_workers(), vec!["parent".to_string()]);
        assert!(dispatcher.list_active_tasks().await.is_empty());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn concurrent_questions_are_answered_in_turn() {
    timeout(TEST_TIMEOUT, async {
        let bus = MessageBus::new();
        let parent = bus.register("parent").unwrap();
        let manager = TaskManager::new(bus.clone(), "task_manager");

        let ctx_bus = bus.clone();
        let handle = manager
            .create_task(
                TaskHandle::new("T3", "w1", "parallel lookups"),
                move |handle, cancel| async move {
                    let ctx = WorkerContext::new("T3", "w1", cancel)
                        .with_handle(handle.clone())
                        .with_parent(ctx_bus, "parent", Duration::from_secs(5));
                    let other = ctx.clone();
                    let (a, b) = tokio::join!(ctx.ask_parent("q1"), other.ask_parent("q2"));
                    let _ = handle
                        .update(|h| match (a, b) {
                            (Ok(a), Ok(b)) => h.complete(format!("{a} / {b}")),
                            (a, b) => h.fail(format!("{a:?} / {b:?}")),
                        })
                        .await;
                },
            )
            .await
            .unwrap();

        for _ in 0..2 {
            let question = parent.recv().await.unwrap();
            assert_eq!(handle.status().await, TaskStatus::WaitingForAnswer);
            let reply = format!("re: {}", question.payload_text());
            manager.answer("T3", json!(reply)).await.unwrap();
        }

        wait_for(&handle, TaskStatus::Completed).await;
        assert_eq!(
            handle.snapshot().await.result.as_deref(),
            Some("re: q1 / re: q2")
        );
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn worker_receives_cancel_request_in_inbox() {
    timeout(TEST_TIMEOUT, async {
        let config = DelegationConfig {
            manager_id: "supervisor".to_string(),
            ..Default::default()
        };
        let dispatcher = Dispatcher::new(config.clone()).unwrap();

        let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel::<Message>();
        dispatcher
            .register_worker(WorkerSpec::new(
                "listener",
                "waits for a cancel notice",
                Arc::new(FnRunner::new(move |_req: WorkerRequest, ctx: WorkerContext| {
                    let seen_tx = seen_tx.clone();
                    async move {
                        let inbox = ctx.inbox().cloned().expect("background runs have an inbox");
                        while let Some(message) = inbox.recv().await {
                            if message.kind() == MessageType::CancelRequest {
                                let _ = seen_tx.send(message);
                                return Err::<String, _>(anyhow::Error::from(WorkerError::Cancelled));
                            }
                        }
                        Ok("inbox closed".to_string())
                    }
                })),
            ))
            .await;

        let outcome = dispatcher
            .dispatch(DispatchRequest::new("listener", "idle").with_mode(ExecutionMode::Async))
            .await
            .unwrap();
        let DispatchOutcome::Started { task_id, mailbox_id, .. } = outcome else {
            panic!("expected a background task");
        };

        assert!(dispatcher.soft_cancel_task(&task_id).await);

        let notice = seen_rx.recv().await.unwrap();
        assert_eq!(notice.kind(), MessageType::CancelRequest);
        assert_eq!(notice.sender(), config.manager_id);
        assert_eq!(notice.receiver(), mailbox_id);
        assert_eq!(notice.task_id(), task_id);
        assert_eq!(notice.payload()["reason"], "soft_cancel");

        let handle = dispatcher.task_handle(&task_id).await.unwrap();
        wait_for(&handle, TaskStatus::Cancelled).await;
    })
    .await
    .expect("test timed out");
}
