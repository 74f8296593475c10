//! Worker side — task state, background execution, worker invocation.
//!
//! Core components:
//! - `state` — Task status machine (Pending → Running ⇄ WaitingForAnswer → terminal)
//! - `manager` — TaskManager: spawn, track, soft/hard cancel, cleanup
//! - `context` — WorkerContext: cancellation signal and ask-parent channel
//! - `runner` — WorkerRunner collaborator contract

pub mod context;
pub mod manager;
pub mod runner;
pub mod state;

pub use context::WorkerContext;
pub use manager::{TaskManager, TaskSummary};
pub use runner::{FnRunner, WorkerRequest, WorkerRunner};
pub use state::{StateTransition, TaskHandle, TaskHandleRef, TaskPriority, TaskStatus};
