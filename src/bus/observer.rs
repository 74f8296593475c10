//! Best-effort message observers.

use async_trait::async_trait;

use super::message::Message;

/// Observer invoked for every message the bus enqueues.
///
/// Observation never affects delivery: errors and panics are logged and
/// swallowed by the bus.
#[async_trait]
pub trait MessageObserver: Send + Sync {
    /// Name used in log output.
    fn name(&self) -> &str;

    /// Called after `message` has been enqueued for its receiver.
    async fn on_message(&self, message: &Message) -> anyhow::Result<()>;
}

/// Identifier returned by [`MessageBus::add_observer`](super::MessageBus::add_observer).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(pub(crate) u64);

/// Observer that traces each delivered message.
#[derive(Debug, Default)]
pub struct LogObserver;

#[async_trait]
impl MessageObserver for LogObserver {
    fn name(&self) -> &str {
        "log"
    }

    async fn on_message(&self, message: &Message) -> anyhow::Result<()> {
        tracing::debug!(
            message_id = %message.id(),
            kind = %message.kind(),
            sender = %message.sender(),
            receiver = %message.receiver(),
            task_id = %message.task_id(),
            correlation_id = ?message.correlation_id(),
            "Bus message delivered"
        );
        Ok(())
    }
}
