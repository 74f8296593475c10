use std::sync::Arc;
use std::time::Duration;

use subagents::bus::{LogObserver, MessageType};
use subagents::config::DelegationConfig;
use subagents::dispatch::{
    Complexity, DispatchRequest, Dispatcher, ExecutionMode, WorkerPreference, WorkerSpec,
};
use subagents::error::Result;
use subagents::worker::{FnRunner, WorkerContext, WorkerRequest};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = DelegationConfig::from_env()?;

    eprintln!("Subagents demo v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Parent mailbox: {}", config.parent_id);
    eprintln!("   Ask timeout: {}s", config.ask_timeout.as_secs());
    eprintln!("   Default mode: {}\n", config.default_mode);

    let dispatcher = Dispatcher::new(config)?;
    dispatcher.bus().add_observer(Arc::new(LogObserver));

    // ── Workers ──────────────────────────────────────────────────────────
    dispatcher
        .register_worker(
            WorkerSpec::new(
                "echo",
                "Repeats the task description",
                Arc::new(FnRunner::new(|request: WorkerRequest, _ctx: WorkerContext| async move {
                    Ok::<_, anyhow::Error>(format!("echo: {}", request.description))
                })),
            )
            .with_preference(WorkerPreference {
                typical_complexity: Some(Complexity::Simple),
                ..Default::default()
            }),
        )
        .await;

    dispatcher
        .register_worker(
            WorkerSpec::new(
                "researcher",
                "Asks for scope, then reports",
                Arc::new(FnRunner::new(|request: WorkerRequest, ctx: WorkerContext| async move {
                    let scope = ctx
                        .ask_parent(format!("What scope should I use for '{}'?", request.description))
                        .await?;
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    ctx.checkpoint()?;
                    Ok::<_, anyhow::Error>(format!("Report on '{}' limited to {}", request.description, scope))
                })),
            )
            .with_preference(WorkerPreference {
                typical_complexity: Some(Complexity::Complex),
                ..Default::default()
            }),
        )
        .await;

    // ── Sync run ─────────────────────────────────────────────────────────
    let outcome = dispatcher
        .dispatch(DispatchRequest::new("echo", "hello there").with_mode(ExecutionMode::Auto))
        .await?;
    eprintln!("[{}] {}\n", outcome.mode(), outcome);

    // ── Background run with a clarifying question ───────────────────────
    let outcome = dispatcher
        .dispatch(DispatchRequest::new("researcher", "rust async runtimes").with_mode(ExecutionMode::Auto))
        .await?;
    eprintln!("[{}] {}\n", outcome.mode(), outcome);
    let task_id = outcome.task_id().to_string();

    eprintln!("{}\n", dispatcher.describe_active_tasks().await);

    loop {
        for message in dispatcher.parent_messages(Duration::from_millis(100)).await {
            if message.kind() != MessageType::Question {
                continue;
            }
            eprintln!("Question from {}: {}", message.sender(), message.payload_text());
            if let Err(e) = dispatcher.answer_task(message.task_id(), "tokio and smol only").await {
                eprintln!("Could not answer {}: {e}", message.task_id());
            }
        }

        let handle = dispatcher.task_status(&task_id).await?;
        if handle.status.is_terminal() {
            eprintln!("\n{}", handle.status_report());
            break;
        }
    }

    let summary = dispatcher.tasks().summary().await;
    eprintln!(
        "\nTasks: {} total, {} completed, {} failed, {} cancelled",
        summary.total, summary.completed, summary.failed, summary.cancelled
    );

    dispatcher.shutdown().await;
    Ok(())
}
