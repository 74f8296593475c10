//! Subagents — message bus, task lifecycle, and dispatch for delegated workers.

pub mod bus;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod worker;
